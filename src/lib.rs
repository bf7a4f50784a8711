use std::fmt;

mod block;
mod block_storage;
mod file_in_memory;
mod file_layer;
mod file_on_disk;
mod record_storage;

pub use block::Block;
pub use block_storage::{BlockStorage, StoreOptions, DEFAULT_BLOCK_SIZE, DEFAULT_HEADER_SIZE};
pub use file_in_memory::FileInMemory;
pub use file_layer::FileLayer;
pub use file_on_disk::FileOnDisk;
pub use record_storage::{RecordStorage, MAX_RECORD_SIZE};

/// Default Burrow configuration: record storage over a file on disk.
pub type DiskRecordStorage = RecordStorage<FileOnDisk>;

/// Memory-backed record storage (debugging/testing tool).
pub type MemoryRecordStorage = RecordStorage<FileInMemory>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Errors surfaced by the block and record layers.
///
/// Every operation fails fast; there is no internal retry or recovery.
#[derive(Debug)]
pub enum BurrowError {
    /// A caller-supplied parameter is invalid.
    BadArgument(String),
    /// Operation on a block that has already been released.
    Disposed(String),
    /// Header field index out of range for the configured header size.
    BadField(String),
    /// Content read/write range exceeds the block content or the buffer.
    OutOfBounds(String),
    /// Stream length is not a whole multiple of the block size.
    MisalignedStorage(String),
    /// A free-list block's content length is not a multiple of 4.
    MisalignedFreeList(String),
    /// A free-list block that must hold entries is empty.
    EmptyFreeList(String),
    /// A record header claims a length beyond the 4 MiB limit.
    OversizedRecord(String),
    /// Dangling next pointer, or a freed block on a live chain.
    BrokenChain(String),
    /// The block layer could not produce a new block.
    AllocationFailed(String),
    /// The underlying stream hit end-of-stream mid-read.
    ShortRead(String),
    /// Failure reported by the underlying stream.
    IoError(String),
}

impl fmt::Display for BurrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BurrowError::BadArgument(msg) => write!(f, "bad argument: {}", msg),
            BurrowError::Disposed(msg) => write!(f, "disposed: {}", msg),
            BurrowError::BadField(msg) => write!(f, "bad header field: {}", msg),
            BurrowError::OutOfBounds(msg) => write!(f, "out of bounds: {}", msg),
            BurrowError::MisalignedStorage(msg) => write!(f, "misaligned storage: {}", msg),
            BurrowError::MisalignedFreeList(msg) => write!(f, "misaligned free list: {}", msg),
            BurrowError::EmptyFreeList(msg) => write!(f, "empty free list: {}", msg),
            BurrowError::OversizedRecord(msg) => write!(f, "oversized record: {}", msg),
            BurrowError::BrokenChain(msg) => write!(f, "broken chain: {}", msg),
            BurrowError::AllocationFailed(msg) => write!(f, "allocation failed: {}", msg),
            BurrowError::ShortRead(msg) => write!(f, "short read: {}", msg),
            BurrowError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for BurrowError {}

impl From<std::io::Error> for BurrowError {
    fn from(e: std::io::Error) -> Self {
        BurrowError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_record_of_empty_store() {
        let store = MemoryRecordStorage::in_memory(StoreOptions::default()).unwrap();

        // Block 0 is claimed lazily by the free-block queue, so the first
        // record lands on block 1 and the stream holds two blocks.
        let id = store.create().unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.stream_length().unwrap(), 2 * 40_960);
        assert_eq!(store.get(id).unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.burrow");
        let path_str = path.to_str().unwrap();

        let small = b"short payload".to_vec();
        let big: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();

        // Create and write
        let (id_small, id_big) = {
            let store = DiskRecordStorage::create_store(path_str, StoreOptions::default()).unwrap();
            let a = store.create_from(&small).unwrap();
            let b = store.create_from(&big).unwrap();
            (a, b)
        };

        // Reopen and verify both records round-trip exactly
        {
            let store = DiskRecordStorage::open_store(path_str, OpenMode::Write).unwrap();
            assert_eq!(store.get(id_small).unwrap().unwrap(), small);
            assert_eq!(store.get(id_big).unwrap().unwrap(), big);

            store.update(id_small, &big).unwrap();
        }

        // Updates persist across another reopen as well
        {
            let store = DiskRecordStorage::open_store(path_str, OpenMode::Read).unwrap();
            assert_eq!(store.get(id_small).unwrap().unwrap(), big);
        }
    }

    #[test]
    fn test_churn_keeps_records_intact() {
        // Small blocks so every record spans several of them.
        let opts = StoreOptions {
            block_size: 512,
            header_size: 48,
        };
        let store = MemoryRecordStorage::in_memory(opts).unwrap();

        let payload = |seed: usize, len: usize| -> Vec<u8> {
            (0..len).map(|i| ((seed * 31 + i) % 256) as u8).collect()
        };

        let mut live: Vec<(u32, Vec<u8>)> = Vec::new();
        for round in 0..6 {
            for i in 0..8 {
                let data = payload(round * 8 + i, 100 + 300 * i);
                let id = store.create_from(&data).unwrap();
                live.push((id, data));
            }
            // Delete every other record, then grow and shrink the survivors.
            let mut kept = Vec::new();
            for (index, (id, data)) in live.drain(..).enumerate() {
                if index % 2 == 0 {
                    store.delete(id).unwrap();
                } else {
                    kept.push((id, data));
                }
            }
            for (id, data) in &mut kept {
                let len = (data.len() * 3 + round) % 2_000;
                *data = payload(*id as usize, len);
                store.update(*id, data).unwrap();
            }
            live = kept;
        }

        for (id, data) in &live {
            assert_eq!(store.get(*id).unwrap().as_ref(), Some(data), "record {}", id);
        }
    }
}
