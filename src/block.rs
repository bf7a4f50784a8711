use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::block_storage::StorageCore;
use crate::file_layer::FileLayer;
use crate::BurrowError;

/// Number of low-index header fields mirrored in the in-memory cache.
pub(crate) const CACHED_HEADER_FIELDS: usize = 5;

/// Chunk size for content writes that fall beyond the sector buffer.
const WRITE_CHUNK: usize = 4096;

struct BlockState {
    /// First `sector_size` bytes of the block: the full header plus the
    /// leading content bytes. Flushed as one aligned write on release.
    sector: Vec<u8>,
    dirty: bool,
    disposed: bool,
    /// Lazily decoded copies of header fields 0..CACHED_HEADER_FIELDS.
    cached: [Option<i64>; CACHED_HEADER_FIELDS],
}

/// Shared in-memory state of one borrowed block. All handles for the same id
/// point at the same core while any of them is alive.
pub(crate) struct BlockCore<F: FileLayer> {
    id: u32,
    storage: Arc<StorageCore<F>>,
    state: Mutex<BlockState>,
}

impl<F: FileLayer> BlockCore<F> {
    pub(crate) fn new(id: u32, storage: Arc<StorageCore<F>>, sector: Vec<u8>) -> Arc<Self> {
        Arc::new(BlockCore {
            id,
            storage,
            state: Mutex::new(BlockState {
                sector,
                dirty: false,
                disposed: false,
                cached: [None; CACHED_HEADER_FIELDS],
            }),
        })
    }

    /// Absolute stream offset of this block.
    fn offset(&self) -> u64 {
        self.id as u64 * self.storage.block_size() as u64
    }

    fn release(&self) -> Result<(), BurrowError> {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Ok(());
        }
        if state.dirty {
            self.storage.file().write(self.offset(), &state.sector)?;
            self.storage.file().flush()?;
            state.dirty = false;
        }
        state.disposed = true;
        drop(state);
        self.storage.unregister(self.id);
        Ok(())
    }
}

/// A borrowed fixed-size block of the underlying stream.
///
/// A block is a header area of little-endian i64 fields followed by an opaque
/// content area. Header edits and writes to the leading content bytes land in
/// a sector-sized buffer and only reach the stream when the block is
/// released; content past the sector is written through immediately. Handles
/// are cheap clones of the shared in-memory block, so every borrower of the
/// same id observes the same unflushed state.
pub struct Block<F: FileLayer> {
    core: Arc<BlockCore<F>>,
}

impl<F: FileLayer> Clone for Block<F> {
    fn clone(&self) -> Self {
        Block {
            core: Arc::clone(&self.core),
        }
    }
}

impl<F: FileLayer> Block<F> {
    pub(crate) fn from_core(core: Arc<BlockCore<F>>) -> Self {
        Block { core }
    }

    /// Block id: the block's stream offset divided by the block size.
    pub fn id(&self) -> u32 {
        self.core.id
    }

    fn check_field(&self, field: usize) -> Result<(), BurrowError> {
        let fields = (self.core.storage.header_size() / 8) as usize;
        if field >= fields {
            return Err(BurrowError::BadField(format!(
                "header field {} out of range: block has {} fields",
                field, fields
            )));
        }
        Ok(())
    }

    fn check_live(&self, state: &BlockState) -> Result<(), BurrowError> {
        if state.disposed {
            return Err(BurrowError::Disposed(format!(
                "block {} has been released",
                self.core.id
            )));
        }
        Ok(())
    }

    /// Read one header field.
    pub fn header(&self, field: usize) -> Result<i64, BurrowError> {
        let mut state = self.core.state.lock().unwrap();
        self.check_live(&state)?;
        self.check_field(field)?;
        if field < CACHED_HEADER_FIELDS {
            if let Some(value) = state.cached[field] {
                return Ok(value);
            }
        }
        let offset = field * 8;
        let value = LittleEndian::read_i64(&state.sector[offset..offset + 8]);
        if field < CACHED_HEADER_FIELDS {
            state.cached[field] = Some(value);
        }
        Ok(value)
    }

    /// Write one header field into the sector buffer. The change is visible
    /// to every handle immediately but reaches the stream only on release.
    pub fn set_header(&self, field: usize, value: i64) -> Result<(), BurrowError> {
        let mut state = self.core.state.lock().unwrap();
        self.check_live(&state)?;
        self.check_field(field)?;
        let offset = field * 8;
        LittleEndian::write_i64(&mut state.sector[offset..offset + 8], value);
        if field < CACHED_HEADER_FIELDS {
            state.cached[field] = Some(value);
        }
        state.dirty = true;
        Ok(())
    }

    /// Read `count` content bytes starting at content offset `src_offset`
    /// into `dest[dest_offset..]`.
    pub fn read(
        &self,
        dest: &mut [u8],
        dest_offset: usize,
        src_offset: usize,
        count: usize,
    ) -> Result<(), BurrowError> {
        let storage = &self.core.storage;
        let header_size = storage.header_size() as usize;
        let sector_size = storage.sector_size() as usize;
        let content_size = storage.content_size() as usize;

        let state = self.core.state.lock().unwrap();
        self.check_live(&state)?;
        if src_offset + count > content_size {
            return Err(BurrowError::OutOfBounds(format!(
                "read of {} bytes at content offset {} exceeds content size {}",
                count, src_offset, content_size
            )));
        }
        if dest_offset + count > dest.len() {
            return Err(BurrowError::OutOfBounds(format!(
                "read of {} bytes at buffer offset {} exceeds buffer of {} bytes",
                count,
                dest_offset,
                dest.len()
            )));
        }

        // Leading portion held by the sector buffer, which may be newer than
        // the stream.
        let sector_span = sector_size - header_size;
        let mut done = 0;
        if src_offset < sector_span {
            let n = count.min(sector_span - src_offset);
            let from = header_size + src_offset;
            dest[dest_offset..dest_offset + n].copy_from_slice(&state.sector[from..from + n]);
            done = n;
        }

        // Remainder straight from the stream, in sector-sized chunks.
        let base = self.core.offset() + header_size as u64;
        while done < count {
            let chunk = (count - done).min(sector_size);
            let at = base + (src_offset + done) as u64;
            let n = storage
                .file()
                .read(at, &mut dest[dest_offset + done..dest_offset + done + chunk])?;
            if n < chunk {
                return Err(BurrowError::ShortRead(format!(
                    "block {}: expected {} bytes at stream offset {}, got {}",
                    self.core.id, chunk, at, n
                )));
            }
            done += chunk;
        }
        Ok(())
    }

    /// Write `count` bytes from `src[src_offset..]` at content offset
    /// `dst_offset`. The portion covered by the sector buffer is held back
    /// until release; anything beyond it is written through immediately.
    pub fn write(
        &self,
        src: &[u8],
        src_offset: usize,
        dst_offset: usize,
        count: usize,
    ) -> Result<(), BurrowError> {
        let storage = &self.core.storage;
        let header_size = storage.header_size() as usize;
        let sector_size = storage.sector_size() as usize;
        let content_size = storage.content_size() as usize;

        let mut state = self.core.state.lock().unwrap();
        self.check_live(&state)?;
        if dst_offset + count > content_size {
            return Err(BurrowError::OutOfBounds(format!(
                "write of {} bytes at content offset {} exceeds content size {}",
                count, dst_offset, content_size
            )));
        }
        if src_offset + count > src.len() {
            return Err(BurrowError::OutOfBounds(format!(
                "write of {} bytes at buffer offset {} exceeds buffer of {} bytes",
                count,
                src_offset,
                src.len()
            )));
        }

        let sector_span = sector_size - header_size;
        let mut done = 0;
        if dst_offset < sector_span {
            let n = count.min(sector_span - dst_offset);
            let to = header_size + dst_offset;
            state.sector[to..to + n].copy_from_slice(&src[src_offset..src_offset + n]);
            state.dirty = true;
            done = n;
        }

        // Write-through for the tail, flushed per chunk.
        let base = self.core.offset() + header_size as u64;
        while done < count {
            let chunk = (count - done).min(WRITE_CHUNK);
            let at = base + (dst_offset + done) as u64;
            storage
                .file()
                .write(at, &src[src_offset + done..src_offset + done + chunk])?;
            storage.file().flush()?;
            done += chunk;
        }
        Ok(())
    }

    /// Release this block: flush the sector buffer when dirty and drop the
    /// block from the live table. Idempotent; any later operation through any
    /// handle fails with `Disposed`.
    pub fn release(&self) -> Result<(), BurrowError> {
        self.core.release()
    }
}

impl<F: FileLayer> Drop for Block<F> {
    fn drop(&mut self) {
        // Safety net for error paths. Success paths call release() so flush
        // failures surface to the caller.
        if Arc::strong_count(&self.core) == 1 {
            let _ = self.core.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_storage::{BlockStorage, StoreOptions};
    use crate::FileInMemory;

    // block 512 → sector 128, so 80 content bytes live in the sector and the
    // remaining 384 are written through.
    fn small_store() -> BlockStorage<FileInMemory> {
        BlockStorage::with_options(
            FileInMemory::new(),
            StoreOptions {
                block_size: 512,
                header_size: 48,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_header_roundtrip_and_bounds() {
        let storage = small_store();
        let block = storage.create_new().unwrap();

        for field in 0..6 {
            block.set_header(field, -(field as i64) - 1).unwrap();
            assert_eq!(block.header(field).unwrap(), -(field as i64) - 1);
        }
        assert!(matches!(block.header(6), Err(BurrowError::BadField(_))));
        assert!(matches!(
            block.set_header(6, 0),
            Err(BurrowError::BadField(_))
        ));
        block.release().unwrap();
    }

    #[test]
    fn test_release_disposes_every_handle() {
        let storage = small_store();
        let block = storage.create_new().unwrap();
        let other = storage.get(block.id()).unwrap().unwrap();

        block.release().unwrap();
        block.release().unwrap(); // idempotent
        assert!(matches!(other.header(0), Err(BurrowError::Disposed(_))));
        assert!(matches!(
            other.write(&[1], 0, 0, 1),
            Err(BurrowError::Disposed(_))
        ));
    }

    #[test]
    fn test_content_within_sector() {
        let storage = small_store();
        let block = storage.create_new().unwrap();

        let data = [7u8; 50];
        block.write(&data, 0, 10, 50).unwrap();

        // Nothing reaches the stream until release.
        let writes = storage_writes(&storage);
        assert_eq!(writes, 0);

        let mut out = [0u8; 50];
        block.read(&mut out, 0, 10, 50).unwrap();
        assert_eq!(out, data);
        block.release().unwrap();
        assert_eq!(storage_writes(&storage), 1);
    }

    #[test]
    fn test_content_across_sector_boundary() {
        let storage = small_store();
        let block = storage.create_new().unwrap();

        let data: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        block.write(&data, 0, 40, 300).unwrap();

        let mut out = vec![0u8; 300];
        block.read(&mut out, 0, 40, 300).unwrap();
        assert_eq!(out, data);

        // Survives a release/re-borrow cycle: sector part and written-through
        // part must stitch back together.
        let id = block.id();
        block.release().unwrap();
        let again = storage.get(id).unwrap().unwrap();
        let mut out = vec![0u8; 300];
        again.read(&mut out, 0, 40, 300).unwrap();
        assert_eq!(out, data);
        again.release().unwrap();
    }

    #[test]
    fn test_content_entirely_past_sector() {
        let storage = small_store();
        let block = storage.create_new().unwrap();

        // content bytes [80..464) are beyond the 128-byte sector
        let data = [0x5Au8; 100];
        block.write(&data, 0, 200, 100).unwrap();
        assert_eq!(storage_writes(&storage), 1); // written through immediately

        let mut out = [0u8; 100];
        block.read(&mut out, 0, 200, 100).unwrap();
        assert_eq!(out, data);
        block.release().unwrap();
    }

    #[test]
    fn test_read_write_bounds() {
        let storage = small_store();
        let block = storage.create_new().unwrap();
        let content = storage.content_size() as usize;

        let mut buf = vec![0u8; content + 1];
        assert!(matches!(
            block.read(&mut buf, 0, 1, content),
            Err(BurrowError::OutOfBounds(_))
        ));
        assert!(matches!(
            block.write(&buf, 0, content, 1),
            Err(BurrowError::OutOfBounds(_))
        ));
        // buffer too small for the requested span
        let mut tiny = [0u8; 4];
        assert!(matches!(
            block.read(&mut tiny, 2, 0, 4),
            Err(BurrowError::OutOfBounds(_))
        ));
        assert!(matches!(
            block.write(&tiny, 2, 0, 4),
            Err(BurrowError::OutOfBounds(_))
        ));

        // the full content span is fine
        block.write(&buf, 0, 0, content).unwrap();
        block.read(&mut buf, 1, 0, content).unwrap();
        block.release().unwrap();
    }

    #[test]
    fn test_dropped_handle_flushes_dirty_sector() {
        let storage = small_store();
        let id = {
            let block = storage.create_new().unwrap();
            block.set_header(1, 4242).unwrap();
            block.id()
            // dropped without an explicit release
        };
        let again = storage.get(id).unwrap().unwrap();
        assert_eq!(again.header(1).unwrap(), 4242);
        again.release().unwrap();
    }

    fn storage_writes(storage: &BlockStorage<FileInMemory>) -> u64 {
        storage.file().write_count()
    }
}
