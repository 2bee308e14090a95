//! Owned, seekable byte sources passed between resolver stages.
//!
//! A [`Stream`] wraps any `Read + Seek + Send` source (an open file or an
//! in-memory buffer). Ownership moves from the caller to the compression
//! stage, then to the format stage, and finally either into the loaded
//! format's [`crate::format::FileInfo`] (keep-open) or is closed.
//!
//! Closing is idempotent: several cleanup paths may try to close the same
//! stream and only the first one has any effect.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// Anything a [`Stream`] can own.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

pub struct Stream {
    inner: Option<Box<dyn ReadSeek>>,
    label: String,
}

impl Stream {
    pub fn new<R: ReadSeek + 'static>(reader: R, label: impl Into<String>) -> Self {
        Self { inner: Some(Box::new(reader)), label: label.into() }
    }

    /// Wrap an owned buffer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::new(Cursor::new(data), "<memory>")
    }

    /// Open `path` read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }

    /// Diagnostic label (file path or `<memory>`).
    pub fn label(&self) -> &str { &self.label }

    pub fn is_closed(&self) -> bool { self.inner.is_none() }

    /// Release the underlying source.
    ///
    /// Returns `true` if this call closed the stream and `false` if it was
    /// already closed. Never fails.
    pub fn close(&mut self) -> bool {
        match self.inner.take() {
            Some(_) => {
                tracing::trace!(stream = %self.label, "closed stream");
                true
            }
            None => false,
        }
    }

    /// Total length in bytes. The current position is preserved.
    pub fn len(&mut self) -> io::Result<u64> {
        let inner = self.inner_mut()?;
        let pos = inner.stream_position()?;
        let end = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    pub fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn position(&mut self) -> io::Result<u64> {
        self.inner_mut()?.stream_position()
    }

    pub fn rewind_to(&mut self, pos: u64) -> io::Result<()> {
        self.inner_mut()?.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    /// Read everything from the current position to the end.
    pub fn read_remaining(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.inner_mut()?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Read up to `N` bytes from the current position without consuming them.
    ///
    /// Returns fewer bytes than `N` only at end of stream.
    pub fn peek<const N: usize>(&mut self) -> io::Result<Vec<u8>> {
        let inner = self.inner_mut()?;
        let pos = inner.stream_position()?;
        let mut buf = Vec::with_capacity(N);
        inner.by_ref().take(N as u64).read_to_end(&mut buf)?;
        inner.seek(SeekFrom::Start(pos))?;
        Ok(buf)
    }

    fn inner_mut(&mut self) -> io::Result<&mut Box<dyn ReadSeek>> {
        self.inner.as_mut().ok_or_else(closed)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_mut()?.read(buf)
    }
}

impl Seek for Stream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner_mut()?.seek(pos)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed() -> io::Error { io::Error::new(io::ErrorKind::Other, "stream is closed") }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let mut s = Stream::from_bytes(vec![1, 2, 3]);
        assert!(s.close());
        assert!(!s.close());
        assert!(s.is_closed());
        assert!(s.len().is_err());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut s = Stream::from_bytes(b"Yaz0rest".to_vec());
        assert_eq!(s.peek::<4>().unwrap(), b"Yaz0");
        assert_eq!(s.position().unwrap(), 0);
        assert_eq!(s.len().unwrap(), 8);
        assert_eq!(s.peek::<16>().unwrap().len(), 8);
    }
}
