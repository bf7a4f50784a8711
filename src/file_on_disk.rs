use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use fs2::FileExt;

use crate::file_layer::FileLayer;
use crate::{BurrowError, OpenMode};

/// File layer over a real file on disk.
///
/// Creates or opens a single file and acquires a process-level lock: shared
/// for readers, exclusive for writers. All I/O goes through an internal
/// mutex.
pub struct FileOnDisk {
    state: Mutex<fs::File>,
}

impl FileOnDisk {
    /// Create a new store file at the given path. Fails if the path already
    /// exists.
    pub fn create(path: &str) -> Result<Self, BurrowError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| BurrowError::IoError(format!("failed to create store file: {}", e)))?;

        // Exclusive process lock as we're about to write to this file
        file.try_lock_exclusive().map_err(|e| {
            BurrowError::IoError(format!("store file is locked by another process: {}", e))
        })?;

        tracing::debug!(path, "created store file");
        Ok(FileOnDisk {
            state: Mutex::new(file),
        })
    }

    /// Open an existing store file.
    ///
    /// Acquires a shared process lock for `Read` mode or an exclusive lock
    /// for `Write` mode.
    pub fn open(path: &str, mode: OpenMode) -> Result<Self, BurrowError> {
        let file = match mode {
            OpenMode::Read => fs::OpenOptions::new().read(true).open(path),
            OpenMode::Write => fs::OpenOptions::new().read(true).write(true).open(path),
        }
        .map_err(|e| BurrowError::IoError(format!("failed to open store file: {}", e)))?;

        match mode {
            OpenMode::Read => fs2::FileExt::try_lock_shared(&file),
            OpenMode::Write => fs2::FileExt::try_lock_exclusive(&file),
        }
        .map_err(|e| {
            BurrowError::IoError(format!("store file is locked by another process: {}", e))
        })?;

        tracing::debug!(path, ?mode, "opened store file");
        Ok(FileOnDisk {
            state: Mutex::new(file),
        })
    }
}

impl FileLayer for FileOnDisk {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BurrowError> {
        let mut file = self.state.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| BurrowError::IoError(e.to_string()))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file
                .read(&mut buf[total..])
                .map_err(|e| BurrowError::IoError(e.to_string()))?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), BurrowError> {
        let mut file = self.state.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| BurrowError::IoError(e.to_string()))?;
        file.write_all(data)
            .map_err(|e| BurrowError::IoError(e.to_string()))?;
        Ok(())
    }

    fn len(&self) -> Result<u64, BurrowError> {
        let file = self.state.lock().unwrap();
        let len = file
            .metadata()
            .map_err(|e| BurrowError::IoError(e.to_string()))?
            .len();
        Ok(len)
    }

    fn set_len(&self, len: u64) -> Result<(), BurrowError> {
        let file = self.state.lock().unwrap();
        file.set_len(len)
            .map_err(|e| BurrowError::IoError(e.to_string()))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), BurrowError> {
        let mut file = self.state.lock().unwrap();
        file.flush()
            .map_err(|e| BurrowError::IoError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.burrow");
        let path_str = path.to_str().unwrap();

        {
            let file = FileOnDisk::create(path_str).unwrap();
            file.set_len(64).unwrap();
            file.write(16, b"hello disk").unwrap();
            file.flush().unwrap();
            assert_eq!(file.len().unwrap(), 64);
        }

        let file = FileOnDisk::open(path_str, OpenMode::Read).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(file.read(16, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"hello disk");

        // Reads past the end come back short, not as an error
        let mut tail = [0u8; 32];
        assert_eq!(file.read(48, &mut tail).unwrap(), 16);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.burrow");
        let path_str = path.to_str().unwrap();

        let _file = FileOnDisk::create(path_str).unwrap();
        drop(_file);
        assert!(matches!(
            FileOnDisk::create(path_str),
            Err(BurrowError::IoError(_))
        ));
    }

    #[test]
    fn test_write_past_end_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.burrow");
        let file = FileOnDisk::create(path.to_str().unwrap()).unwrap();

        file.write(100, &[0xAB; 4]).unwrap();
        assert_eq!(file.len().unwrap(), 104);

        // The gap reads as zeros
        let mut buf = [0xFFu8; 8];
        assert_eq!(file.read(96, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0, 0, 0, 0, 0xAB, 0xAB, 0xAB, 0xAB]);
    }
}
