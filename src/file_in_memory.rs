use std::sync::Mutex;

use crate::file_layer::FileLayer;
use crate::BurrowError;

struct FileInMemoryState {
    bytes: Vec<u8>,
    writes: u64,
}

/// File layer backed by a growable in-memory buffer (debugging/testing tool).
///
/// Tracks the number of write calls so tests can observe the block layer's
/// write-behind behaviour.
pub struct FileInMemory {
    state: Mutex<FileInMemoryState>,
}

impl FileInMemory {
    pub fn new() -> Self {
        FileInMemory {
            state: Mutex::new(FileInMemoryState {
                bytes: Vec::new(),
                writes: 0,
            }),
        }
    }

    /// Number of `write` calls issued against this stream so far.
    pub fn write_count(&self) -> u64 {
        self.state.lock().unwrap().writes
    }
}

impl Default for FileInMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLayer for FileInMemory {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BurrowError> {
        let state = self.state.lock().unwrap();
        let offset = offset as usize;
        if offset >= state.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(state.bytes.len() - offset);
        buf[..n].copy_from_slice(&state.bytes[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), BurrowError> {
        let mut state = self.state.lock().unwrap();
        let end = offset as usize + data.len();
        if end > state.bytes.len() {
            state.bytes.resize(end, 0);
        }
        state.bytes[offset as usize..end].copy_from_slice(data);
        state.writes += 1;
        Ok(())
    }

    fn len(&self) -> Result<u64, BurrowError> {
        Ok(self.state.lock().unwrap().bytes.len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<(), BurrowError> {
        let mut state = self.state.lock().unwrap();
        state.bytes.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&self) -> Result<(), BurrowError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let file = FileInMemory::new();
        file.write(8, b"burrow").unwrap();
        assert_eq!(file.len().unwrap(), 14);

        let mut buf = [0u8; 6];
        assert_eq!(file.read(8, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"burrow");
        assert_eq!(file.write_count(), 1);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let file = FileInMemory::new();
        file.set_len(10).unwrap();

        let mut buf = [0xFFu8; 8];
        assert_eq!(file.read(6, &mut buf).unwrap(), 4);
        assert_eq!(file.read(10, &mut buf).unwrap(), 0);
        assert_eq!(file.read(999, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_set_len_zero_fills() {
        let file = FileInMemory::new();
        file.write(0, &[0xAA; 4]).unwrap();
        file.set_len(2).unwrap();
        file.set_len(6).unwrap();

        let mut buf = [0xFFu8; 6];
        assert_eq!(file.read(0, &mut buf).unwrap(), 6);
        assert_eq!(buf, [0xAA, 0xAA, 0, 0, 0, 0]);
    }
}
