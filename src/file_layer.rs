use crate::BurrowError;

/// Random-access byte stream underneath the block layer.
///
/// Wraps a single extensible stream and provides offset-addressed reads and
/// writes. All methods take `&self` so one instance can serve every block
/// borrowed from the same store; implementations use interior mutability
/// (e.g. `Mutex`) to protect stream state.
pub trait FileLayer: Send + Sync {
    /// Read bytes at the given absolute offset.
    /// Returns the number of bytes actually read; short counts occur only at
    /// end of stream.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BurrowError>;

    /// Write bytes at the given absolute offset, extending the stream when
    /// the range ends past the current length.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), BurrowError>;

    /// Current stream length in bytes.
    fn len(&self) -> Result<u64, BurrowError>;

    /// Check whether the stream is empty (length == 0).
    fn is_empty(&self) -> Result<bool, BurrowError> {
        Ok(self.len()? == 0)
    }

    /// Set the stream length. Used to grow the stream when allocating new
    /// blocks; new bytes read as zero.
    fn set_len(&self, len: u64) -> Result<(), BurrowError>;

    /// Push any buffered bytes down to the underlying medium.
    fn flush(&self) -> Result<(), BurrowError>;
}
