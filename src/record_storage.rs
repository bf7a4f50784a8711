use byteorder::{ByteOrder, LittleEndian};

use crate::block::Block;
use crate::block_storage::{BlockStorage, StoreOptions};
use crate::file_in_memory::FileInMemory;
use crate::file_layer::FileLayer;
use crate::file_on_disk::FileOnDisk;
use crate::{BurrowError, OpenMode};

/// Largest payload a single record may carry: 4 MiB.
pub const MAX_RECORD_SIZE: u64 = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Reserved header fields
// ---------------------------------------------------------------------------

/// Next block of the chain; 0 terminates it.
const HEADER_NEXT_BLOCK: usize = 0;
/// Total payload bytes of the record. Meaningful on the head block only.
const HEADER_RECORD_LENGTH: usize = 1;
/// Payload bytes actually stored in this block.
const HEADER_CONTENT_LENGTH: usize = 2;
/// Previous block of the chain; 0 marks the head.
const HEADER_PREVIOUS_BLOCK: usize = 3;
/// 1 once the block has been pushed onto the free queue.
const HEADER_DELETED: usize = 4;

/// Fields 0..RESERVED_HEADER_FIELDS are owned by the record layer and zeroed
/// whenever a block is recycled.
const RESERVED_HEADER_FIELDS: usize = 5;

/// Record id of the sentinel whose payload is the free-block queue.
const FREE_LIST_RECORD: u32 = 0;

/// Bytes per free-queue entry: one little-endian u32 block id.
const FREE_ENTRY_SIZE: i64 = 4;

/// Header bytes the record layer needs: six i64 fields.
const MIN_HEADER_SIZE: u32 = 48;

/// Record layer: composes blocks into linked chains holding variable-length
/// records addressed by stable numeric ids.
///
/// A record id is the id of its head block. Block 0 is reserved as a sentinel
/// record whose payload is a queue of freed block ids; deleted blocks are
/// pushed there and handed back out by later allocations instead of growing
/// the stream. The sentinel is created lazily by the first allocation, so an
/// empty store is just a zero-length stream.
///
/// Access is single-operation-at-a-time; callers needing concurrency must
/// serialize externally.
pub struct RecordStorage<F: FileLayer> {
    storage: BlockStorage<F>,
}

impl RecordStorage<FileOnDisk> {
    /// Create a new store file at `path`.
    pub fn create_store(path: &str, options: StoreOptions) -> Result<Self, BurrowError> {
        Self::new(BlockStorage::with_options(
            FileOnDisk::create(path)?,
            options,
        )?)
    }

    /// Open an existing store file.
    pub fn open_store(path: &str, mode: OpenMode) -> Result<Self, BurrowError> {
        Self::new(BlockStorage::with_options(
            FileOnDisk::open(path, mode)?,
            StoreOptions::default(),
        )?)
    }
}

impl RecordStorage<FileInMemory> {
    /// Fresh store over an in-memory stream (debugging/testing tool).
    pub fn in_memory(options: StoreOptions) -> Result<Self, BurrowError> {
        Self::new(BlockStorage::with_options(FileInMemory::new(), options)?)
    }
}

impl<F: FileLayer> RecordStorage<F> {
    /// Build the record layer on top of a block store.
    pub fn new(storage: BlockStorage<F>) -> Result<Self, BurrowError> {
        if storage.header_size() < MIN_HEADER_SIZE {
            return Err(BurrowError::BadArgument(format!(
                "record layer needs a header of at least {} bytes, got {}",
                MIN_HEADER_SIZE,
                storage.header_size()
            )));
        }
        Ok(RecordStorage { storage })
    }

    /// Current length of the underlying stream in bytes.
    pub fn stream_length(&self) -> Result<u64, BurrowError> {
        self.storage.stream_length()
    }

    // -----------------------------------------------------------------------
    // Public record operations
    // -----------------------------------------------------------------------

    /// Create an empty record and return its id.
    pub fn create(&self) -> Result<u32, BurrowError> {
        let block = self.allocate_block()?;
        let id = block.id();
        block.release()?;
        tracing::debug!(record = id, "created empty record");
        Ok(id)
    }

    /// Create a record holding a copy of `data` and return its id.
    pub fn create_from(&self, data: &[u8]) -> Result<u32, BurrowError> {
        check_record_size(data.len())?;
        let head = self.allocate_block()?;
        let id = head.id();
        self.write_record(head, data)?;
        tracing::debug!(record = id, bytes = data.len(), "created record");
        Ok(id)
    }

    /// Create a record whose payload is produced by `generator`, which is
    /// handed the id the record will have. Useful when the payload embeds its
    /// own id.
    pub fn create_with<G>(&self, generator: G) -> Result<u32, BurrowError>
    where
        G: FnOnce(u32) -> Vec<u8>,
    {
        let head = self.allocate_block()?;
        let id = head.id();
        let data = generator(id);
        if let Err(oversized) = check_record_size(data.len()) {
            // Hand the unused head straight back to the free queue.
            self.mark_as_free(id)?;
            head.set_header(HEADER_DELETED, 1)?;
            head.release()?;
            return Err(oversized);
        }
        self.write_record(head, &data)?;
        tracing::debug!(record = id, bytes = data.len(), "created record");
        Ok(id)
    }

    /// Read a whole record. Absent when no live record has this id.
    pub fn get(&self, record_id: u32) -> Result<Option<Vec<u8>>, BurrowError> {
        let head = match self.storage.get(record_id)? {
            Some(block) => block,
            None => return Ok(None),
        };
        if head.header(HEADER_DELETED)? != 0 || head.header(HEADER_PREVIOUS_BLOCK)? != 0 {
            head.release()?;
            return Ok(None);
        }

        let length = head.header(HEADER_RECORD_LENGTH)?;
        if length < 0 || length as u64 > MAX_RECORD_SIZE {
            return Err(BurrowError::OversizedRecord(format!(
                "record {} claims {} bytes",
                record_id, length
            )));
        }

        let content_size = self.storage.content_size() as i64;
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0usize;
        let mut current = head;
        loop {
            let stored = current.header(HEADER_CONTENT_LENGTH)?;
            if stored < 0 || stored > content_size {
                return Err(BurrowError::OutOfBounds(format!(
                    "block {} claims {} content bytes of a possible {}",
                    current.id(),
                    stored,
                    content_size
                )));
            }
            current.read(&mut buf, filled, 0, stored as usize)?;
            filled += stored as usize;

            let next = current.header(HEADER_NEXT_BLOCK)?;
            current.release()?;
            if next == 0 {
                break;
            }
            current = self.fetch_chain_block(next)?;
        }
        Ok(Some(buf))
    }

    /// Replace a record's payload in place, reusing its chain. Blocks the new
    /// payload no longer needs are pushed onto the free queue; blocks it
    /// additionally needs come from the allocator.
    pub fn update(&self, record_id: u32, data: &[u8]) -> Result<(), BurrowError> {
        if record_id == FREE_LIST_RECORD {
            return Err(BurrowError::BadArgument(
                "record 0 is reserved for the free-block queue".to_string(),
            ));
        }
        check_record_size(data.len())?;

        let mut blocks = self.record_chain(record_id)?;
        let content_size = self.storage.content_size() as usize;
        let slices = data.len().div_ceil(content_size).max(1);

        let mut previous: Option<Block<F>> = None;
        for index in 0..slices {
            let block = if index < blocks.len() {
                blocks[index].clone()
            } else {
                let fresh = self.allocate_block()?;
                blocks.push(fresh.clone());
                fresh
            };
            if let Some(ref prev) = previous {
                prev.set_header(HEADER_NEXT_BLOCK, block.id() as i64)?;
                block.set_header(HEADER_PREVIOUS_BLOCK, prev.id() as i64)?;
            }

            let start = index * content_size;
            let chunk = (data.len() - start).min(content_size);
            block.write(data, start, 0, chunk)?;
            block.set_header(HEADER_CONTENT_LENGTH, chunk as i64)?;
            // Terminates the chain here; the next iteration relinks it.
            block.set_header(HEADER_NEXT_BLOCK, 0)?;
            if index == 0 {
                block.set_header(HEADER_RECORD_LENGTH, data.len() as i64)?;
            }
            previous = Some(block);
        }
        drop(previous);

        // Old chain blocks past the rewritten prefix go back to the queue.
        for stale in &blocks[slices..] {
            self.mark_as_free(stale.id())?;
        }
        for block in blocks {
            block.release()?;
        }
        Ok(())
    }

    /// Delete a record: every block of its chain is flagged deleted and
    /// pushed onto the free queue.
    pub fn delete(&self, record_id: u32) -> Result<(), BurrowError> {
        if record_id == FREE_LIST_RECORD {
            return Err(BurrowError::BadArgument(
                "record 0 is reserved for the free-block queue".to_string(),
            ));
        }
        let head = self.storage.get(record_id)?.ok_or_else(|| {
            BurrowError::BrokenChain(format!("record {} has no head block", record_id))
        })?;
        if head.header(HEADER_DELETED)? != 0 {
            return Err(BurrowError::BrokenChain(format!(
                "record {} is already freed",
                record_id
            )));
        }
        if head.header(HEADER_PREVIOUS_BLOCK)? != 0 {
            return Err(BurrowError::BrokenChain(format!(
                "block {} is not a record head",
                record_id
            )));
        }

        let mut freed = 0u32;
        let mut current = head;
        loop {
            let next = current.header(HEADER_NEXT_BLOCK)?;
            // Enqueue and flag under the same live borrow so the two edits
            // hit the stream together when the block is released.
            self.mark_as_free(current.id())?;
            current.set_header(HEADER_DELETED, 1)?;
            current.release()?;
            freed += 1;
            if next == 0 {
                break;
            }
            current = self.fetch_chain_block(next)?;
        }
        tracing::debug!(record = record_id, blocks = freed, "deleted record");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chain plumbing
    // -----------------------------------------------------------------------

    /// Write `data` into `head` and however many further blocks it takes,
    /// linking them as it goes. Releases every block it touches.
    fn write_record(&self, head: Block<F>, data: &[u8]) -> Result<(), BurrowError> {
        let content_size = self.storage.content_size() as usize;
        head.set_header(HEADER_RECORD_LENGTH, data.len() as i64)?;
        if data.is_empty() {
            return head.release();
        }

        let mut current = head;
        let mut offset = 0usize;
        loop {
            let chunk = (data.len() - offset).min(content_size);
            current.write(data, offset, 0, chunk)?;
            current.set_header(HEADER_CONTENT_LENGTH, chunk as i64)?;
            offset += chunk;
            if offset == data.len() {
                return current.release();
            }
            let next = self.allocate_block()?;
            current.set_header(HEADER_NEXT_BLOCK, next.id() as i64)?;
            next.set_header(HEADER_PREVIOUS_BLOCK, current.id() as i64)?;
            current.release()?;
            current = next;
        }
    }

    /// Follow a next-pointer to a block that must exist and must not be
    /// freed.
    fn fetch_chain_block(&self, id: i64) -> Result<Block<F>, BurrowError> {
        if id < 0 || id > u32::MAX as i64 {
            return Err(BurrowError::BrokenChain(format!(
                "next pointer {} is not a valid block id",
                id
            )));
        }
        let block = self.storage.get(id as u32)?.ok_or_else(|| {
            BurrowError::BrokenChain(format!("chain points at missing block {}", id))
        })?;
        if block.header(HEADER_DELETED)? != 0 {
            return Err(BurrowError::BrokenChain(format!(
                "chain points at freed block {}",
                id
            )));
        }
        Ok(block)
    }

    /// Collect a record's whole chain, head first. For record 0 a missing
    /// head bootstraps the free-queue sentinel instead of failing.
    fn record_chain(&self, record_id: u32) -> Result<Vec<Block<F>>, BurrowError> {
        let head = match self.storage.get(record_id)? {
            Some(block) => block,
            None if record_id == FREE_LIST_RECORD => self.storage.create_new()?,
            None => {
                return Err(BurrowError::BrokenChain(format!(
                    "record {} has no head block",
                    record_id
                )))
            }
        };
        if head.header(HEADER_DELETED)? != 0 {
            return Err(BurrowError::BrokenChain(format!(
                "record {} head block is freed",
                record_id
            )));
        }

        let mut chain = vec![head];
        loop {
            let next = chain.last().unwrap().header(HEADER_NEXT_BLOCK)?;
            if next == 0 {
                return Ok(chain);
            }
            chain.push(self.fetch_chain_block(next)?);
        }
    }

    // -----------------------------------------------------------------------
    // Free-block queue (the payload of record 0)
    // -----------------------------------------------------------------------

    /// Produce a block for a new chain link: the most recently freed block
    /// when the queue has one, a fresh block from the stream otherwise.
    fn allocate_block(&self) -> Result<Block<F>, BurrowError> {
        if let Some(id) = self.try_pop_free()? {
            let block = self.storage.get(id)?.ok_or_else(|| {
                BurrowError::AllocationFailed(format!(
                    "free queue entry {} points past the stream",
                    id
                ))
            })?;
            for field in 0..RESERVED_HEADER_FIELDS {
                block.set_header(field, 0)?;
            }
            tracing::trace!(block = id, "reused freed block");
            return Ok(block);
        }
        self.storage.create_new()
    }

    /// The queue's tail block and, when the chain is longer than one block,
    /// the one before it. Intermediate blocks are released on the way.
    fn space_tracking_blocks(&self) -> Result<(Block<F>, Option<Block<F>>), BurrowError> {
        let mut chain = self.record_chain(FREE_LIST_RECORD)?;
        let last = chain.pop().unwrap();
        let second_last = chain.pop();
        for block in chain {
            block.release()?;
        }
        Ok((last, second_last))
    }

    /// Content length of a free-queue block, validated to be entry-aligned.
    fn free_queue_fill(&self, block: &Block<F>) -> Result<i64, BurrowError> {
        let fill = block.header(HEADER_CONTENT_LENGTH)?;
        if fill < 0 || fill % FREE_ENTRY_SIZE != 0 {
            return Err(BurrowError::MisalignedFreeList(format!(
                "free-queue block {} holds {} content bytes",
                block.id(),
                fill
            )));
        }
        Ok(fill)
    }

    /// Pop the most recently freed block id, if any.
    fn try_pop_free(&self) -> Result<Option<u32>, BurrowError> {
        let (last, second_last) = self.space_tracking_blocks()?;

        let last_fill = self.free_queue_fill(&last)?;
        if last_fill > 0 {
            let id = read_free_entry(&last, last_fill - FREE_ENTRY_SIZE)?;
            last.set_header(HEADER_CONTENT_LENGTH, last_fill - FREE_ENTRY_SIZE)?;
            last.release()?;
            if let Some(block) = second_last {
                block.release()?;
            }
            return Ok(Some(id));
        }

        // Tail block drained. With a single-block queue that simply means
        // empty; otherwise pop from the block before it and detach the tail.
        let second_last = match second_last {
            Some(block) => block,
            None => {
                last.release()?;
                return Ok(None);
            }
        };
        let fill = self.free_queue_fill(&second_last)?;
        if fill == 0 {
            return Err(BurrowError::EmptyFreeList(format!(
                "free-queue block {} is empty behind drained tail {}",
                second_last.id(),
                last.id()
            )));
        }
        let id = read_free_entry(&second_last, fill - FREE_ENTRY_SIZE)?;
        // The detached tail replaces the entry it satisfied, so the block
        // itself becomes reusable through the queue.
        write_free_entry(&second_last, fill - FREE_ENTRY_SIZE, last.id())?;
        second_last.set_header(HEADER_NEXT_BLOCK, 0)?;
        last.set_header(HEADER_PREVIOUS_BLOCK, 0)?;
        second_last.release()?;
        last.release()?;
        Ok(Some(id))
    }

    /// Append a freed block id at the queue's tail, growing the queue by a
    /// fresh block when the tail is full.
    fn mark_as_free(&self, block_id: u32) -> Result<(), BurrowError> {
        let (last, second_last) = self.space_tracking_blocks()?;
        if let Some(block) = second_last {
            block.release()?;
        }

        let fill = self.free_queue_fill(&last)?;
        if fill + FREE_ENTRY_SIZE <= self.storage.content_size() as i64 {
            write_free_entry(&last, fill, block_id)?;
            last.set_header(HEADER_CONTENT_LENGTH, fill + FREE_ENTRY_SIZE)?;
            return last.release();
        }

        // The tail is full. The extension must be a fresh block: taking one
        // from the queue here would drop entries.
        let fresh = self.storage.create_new()?;
        fresh.set_header(HEADER_PREVIOUS_BLOCK, last.id() as i64)?;
        last.set_header(HEADER_NEXT_BLOCK, fresh.id() as i64)?;
        write_free_entry(&fresh, 0, block_id)?;
        fresh.set_header(HEADER_CONTENT_LENGTH, FREE_ENTRY_SIZE)?;
        tracing::debug!(block = fresh.id(), "free queue grew by one block");
        last.release()?;
        fresh.release()
    }
}

fn check_record_size(len: usize) -> Result<(), BurrowError> {
    if len as u64 > MAX_RECORD_SIZE {
        return Err(BurrowError::OversizedRecord(format!(
            "{} bytes exceeds the {} byte record limit",
            len, MAX_RECORD_SIZE
        )));
    }
    Ok(())
}

fn read_free_entry<F: FileLayer>(block: &Block<F>, offset: i64) -> Result<u32, BurrowError> {
    let mut buf = [0u8; FREE_ENTRY_SIZE as usize];
    let len = buf.len();
    block.read(&mut buf, 0, offset as usize, len)?;
    Ok(LittleEndian::read_u32(&buf))
}

fn write_free_entry<F: FileLayer>(
    block: &Block<F>,
    offset: i64,
    id: u32,
) -> Result<(), BurrowError> {
    let mut buf = [0u8; FREE_ENTRY_SIZE as usize];
    LittleEndian::write_u32(&mut buf, id);
    block.write(&buf, 0, offset as usize, buf.len())
}
