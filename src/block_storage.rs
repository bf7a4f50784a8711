use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::block::{Block, BlockCore};
use crate::file_layer::FileLayer;
use crate::BurrowError;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 40_960;

/// Default header area size in bytes: room for six i64 fields.
pub const DEFAULT_HEADER_SIZE: u32 = 48;

/// Smallest supported block size.
const MIN_BLOCK_SIZE: u32 = 128;

/// Sector size for blocks large enough for disk-aligned header I/O.
const LARGE_SECTOR_SIZE: u32 = 4096;

/// Sector size fallback for small blocks.
const SMALL_SECTOR_SIZE: u32 = 128;

/// Geometry of a block store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Size of every block in bytes. Must be at least 128.
    pub block_size: u32,
    /// Bytes reserved at the start of every block for i64 header fields.
    /// Must be a non-zero multiple of 8, smaller than the block size and no
    /// larger than the sector size.
    pub header_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            header_size: DEFAULT_HEADER_SIZE,
        }
    }
}

/// Shared core of a block store: the stream, its geometry and the live-block
/// table. Blocks hold an `Arc` to this so they can reach the stream and
/// unregister themselves on release.
pub(crate) struct StorageCore<F: FileLayer> {
    file: F,
    block_size: u32,
    header_size: u32,
    sector_size: u32,
    live: Mutex<HashMap<u32, Weak<BlockCore<F>>>>,
}

impl<F: FileLayer> StorageCore<F> {
    pub(crate) fn file(&self) -> &F {
        &self.file
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.block_size
    }

    pub(crate) fn header_size(&self) -> u32 {
        self.header_size
    }

    pub(crate) fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub(crate) fn content_size(&self) -> u32 {
        self.block_size - self.header_size
    }

    pub(crate) fn unregister(&self, id: u32) {
        self.live.lock().unwrap().remove(&id);
    }
}

/// Block layer: partitions the underlying stream into fixed-size blocks and
/// hands out shared in-memory handles to them.
///
/// The live-block table guarantees that every `get` for an id during one
/// block's lifetime returns the same in-memory block, so header edits made
/// through one handle are visible through every other before anything is
/// flushed. Released blocks drop out of the table and are re-read from the
/// stream on the next `get`.
pub struct BlockStorage<F: FileLayer> {
    core: Arc<StorageCore<F>>,
}

impl<F: FileLayer> BlockStorage<F> {
    /// Wrap a stream with the default geometry.
    pub fn new(file: F) -> Result<Self, BurrowError> {
        Self::with_options(file, StoreOptions::default())
    }

    /// Wrap a stream with explicit geometry.
    pub fn with_options(file: F, options: StoreOptions) -> Result<Self, BurrowError> {
        if options.block_size < MIN_BLOCK_SIZE {
            return Err(BurrowError::BadArgument(format!(
                "block size {} is below the minimum of {}",
                options.block_size, MIN_BLOCK_SIZE
            )));
        }
        let sector_size = if options.block_size >= LARGE_SECTOR_SIZE {
            LARGE_SECTOR_SIZE
        } else {
            SMALL_SECTOR_SIZE
        };
        if options.header_size == 0 || options.header_size % 8 != 0 {
            return Err(BurrowError::BadArgument(format!(
                "header size {} is not a non-zero multiple of 8",
                options.header_size
            )));
        }
        if options.header_size >= options.block_size || options.header_size > sector_size {
            return Err(BurrowError::BadArgument(format!(
                "header size {} does not fit a block of {} bytes with a {} byte sector",
                options.header_size, options.block_size, sector_size
            )));
        }
        Ok(BlockStorage {
            core: Arc::new(StorageCore {
                file,
                block_size: options.block_size,
                header_size: options.header_size,
                sector_size,
                live: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.core.block_size
    }

    pub fn header_size(&self) -> u32 {
        self.core.header_size
    }

    /// Payload bytes available in each block.
    pub fn content_size(&self) -> u32 {
        self.core.content_size()
    }

    /// I/O unit for header write-behind: 4096 bytes, or 128 for small blocks.
    pub fn sector_size(&self) -> u32 {
        self.core.sector_size
    }

    /// Current length of the underlying stream in bytes.
    pub fn stream_length(&self) -> Result<u64, BurrowError> {
        self.core.file.len()
    }

    /// Borrow the block with the given id.
    ///
    /// Returns the already-live in-memory block when one exists, otherwise
    /// reads the block's sector from the stream and registers it. Absent when
    /// the block lies past the end of the stream.
    pub fn get(&self, id: u32) -> Result<Option<Block<F>>, BurrowError> {
        let mut live = self.core.live.lock().unwrap();
        if let Some(weak) = live.get(&id) {
            if let Some(existing) = weak.upgrade() {
                return Ok(Some(Block::from_core(existing)));
            }
        }

        let block_size = self.core.block_size as u64;
        if (id as u64 + 1) * block_size > self.core.file.len()? {
            return Ok(None);
        }

        let mut sector = vec![0u8; self.core.sector_size as usize];
        let n = self.core.file.read(id as u64 * block_size, &mut sector)?;
        if n < sector.len() {
            return Err(BurrowError::ShortRead(format!(
                "sector of block {}: expected {} bytes, got {}",
                id,
                sector.len(),
                n
            )));
        }

        let core = BlockCore::new(id, Arc::clone(&self.core), sector);
        live.insert(id, Arc::downgrade(&core));
        Ok(Some(Block::from_core(core)))
    }

    #[cfg(test)]
    pub(crate) fn file(&self) -> &F {
        self.core.file()
    }

    /// Append a fresh zeroed block to the end of the stream and borrow it.
    pub fn create_new(&self) -> Result<Block<F>, BurrowError> {
        let block_size = self.core.block_size as u64;
        let len = self.core.file.len()?;
        if len % block_size != 0 {
            return Err(BurrowError::MisalignedStorage(format!(
                "stream length {} is not a multiple of block size {}",
                len, block_size
            )));
        }
        let id = len / block_size;
        if id > u32::MAX as u64 {
            return Err(BurrowError::AllocationFailed(format!(
                "block id space exhausted at stream length {}",
                len
            )));
        }

        self.core.file.set_len(len + block_size)?;
        self.core.file.flush()?;

        let sector = vec![0u8; self.core.sector_size as usize];
        let core = BlockCore::new(id as u32, Arc::clone(&self.core), sector);
        self.core
            .live
            .lock()
            .unwrap()
            .insert(id as u32, Arc::downgrade(&core));
        tracing::trace!(block = id, "grew stream by one block");
        Ok(Block::from_core(core))
    }
}
