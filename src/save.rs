//! Save pipeline: serialize a loaded format back to disk or memory.
//!
//! Exactly one strategy runs per [`save_to_path`] call:
//!
//! | Strategy | When | Behaviour |
//! |---|---|---|
//! | `KeepOpenReplace` | keep-open and the target exists | write sibling temp file, delete target, rename, reload |
//! | `Compressed` | compression configured | serialize in memory, compress, single write |
//! | `Direct` | otherwise | stream straight into the target |
//!
//! The keep-open path exists because the retained stream may be reading the
//! very file being replaced; it is closed before anything touches the disk.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::codec::{CodecError, CompressionFormat};
use crate::format::{stamp_children, FileFormat, FormatError};
use crate::stream::Stream;

/// Fixed name of the sibling temp file used by keep-open saves.
pub const TEMP_FILE_NAME: &str = ".nxio-save.tmp";

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} does not support saving")]
    NotSupported(&'static str),
    #[error("Original removed but rename failed; saved data left at {}: {source}", .temp.display())]
    Stranded { temp: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SaveStrategy {
    KeepOpenReplace,
    Compressed,
    Direct,
}

/// Outcome of a successful [`save_to_path`].
#[derive(Debug, Clone)]
pub struct SaveLog {
    pub strategy:      SaveStrategy,
    pub elapsed:       Duration,
    /// Bytes written to the target file (after compression).
    pub bytes_written: u64,
    pub finished_at:   DateTime<Utc>,
}

impl SaveLog {
    /// Elapsed time as `MM:SS:mmm`.
    pub fn save_time(&self) -> String {
        let ms = self.elapsed.as_millis();
        format!("{:02}:{:02}:{:03}", ms / 60_000, (ms / 1000) % 60, ms % 1000)
    }
}

impl fmt::Display for SaveLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} save of {} bytes in {} (finished {})",
            self.strategy,
            self.bytes_written,
            self.save_time(),
            self.finished_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Save `format` to `path`, updating its recorded path and sizes.
///
/// `on_compress` fires right before compression starts (never for
/// uncompressed saves).
pub fn save_to_path<P: AsRef<Path>>(
    format:      &mut dyn FileFormat,
    path:        P,
    on_compress: Option<&mut dyn FnMut()>,
) -> Result<SaveLog, SaveError> {
    let started = Instant::now();
    let path = path.as_ref();
    if !format.can_save() {
        return Err(SaveError::NotSupported(format.description()));
    }
    format.info_mut().set_path(&path.to_string_lossy());

    let info = format.info();
    let compression = Arc::clone(&info.compression);
    let strategy = if info.keep_open && path.exists() {
        SaveStrategy::KeepOpenReplace
    } else if info.is_compressed() {
        SaveStrategy::Compressed
    } else {
        SaveStrategy::Direct
    };

    let bytes_written = match strategy {
        SaveStrategy::KeepOpenReplace => replace_keep_open(format, path, &compression, on_compress)?,
        SaveStrategy::Compressed => {
            let raw = serialize(format)?;
            let packed = compress(&compression, &raw, on_compress)?;
            fs::write(path, &packed)?;
            record_sizes(format, packed.len(), raw.len());
            packed.len() as u64
        }
        SaveStrategy::Direct => {
            let mut out = WriteBuffer::new(File::create(path)?, WRITE_BUFFER_SIZE);
            format.save(&mut out)?;
            out.flush()?;
            let n = out.bytes_written as usize;
            record_sizes(format, n, n);
            n as u64
        }
    };

    let log = SaveLog {
        strategy,
        elapsed: started.elapsed(),
        bytes_written,
        finished_at: Utc::now(),
    };
    tracing::info!(
        file = %path.display(),
        strategy = ?log.strategy,
        bytes = log.bytes_written,
        time = %log.save_time(),
        "saved"
    );
    Ok(log)
}

/// Serialize `format` into an in-memory stream, compressed the same way as
/// the file it was loaded from. Used to embed edited children in archives.
pub fn save_to_stream(format: &mut dyn FileFormat) -> Result<Stream, SaveError> {
    if !format.can_save() {
        return Err(SaveError::NotSupported(format.description()));
    }
    let raw = serialize(format)?;
    let compression = Arc::clone(&format.info().compression);
    let out = if compression.is_identity() { raw.clone() } else { compression.compress_bytes(&raw)? };
    record_sizes(format, out.len(), raw.len());
    Ok(Stream::from_bytes(out))
}

/// Run [`save_to_path`] on a dedicated worker thread.
///
/// The format moves to the worker and comes back through `on_complete`
/// together with the result. The returned error only covers failing to
/// spawn the thread.
pub fn save_background<F>(
    mut format:      Box<dyn FileFormat>,
    path:            PathBuf,
    mut on_compress: Option<Box<dyn FnMut() + Send>>,
    on_complete:     F,
) -> io::Result<()>
where
    F: FnOnce(Box<dyn FileFormat>, Result<SaveLog, SaveError>) + Send + 'static,
{
    thread::Builder::new()
        .name("nxio-save".into())
        .spawn(move || {
            let hook = on_compress.as_mut().map(|f| f.as_mut() as &mut dyn FnMut());
            let result = save_to_path(format.as_mut(), &path, hook);
            if let Err(e) = &result {
                tracing::warn!(file = %path.display(), error = %e, "background save failed");
            }
            on_complete(format, result);
        })
        .map(|_| ())
}

fn replace_keep_open(
    format:      &mut dyn FileFormat,
    path:        &Path,
    compression: &Arc<dyn CompressionFormat>,
    on_compress: Option<&mut dyn FnMut()>,
) -> Result<u64, SaveError> {
    let raw = serialize(format)?;
    let raw_len = raw.len();
    let out = if compression.is_identity() { raw } else { compress(compression, &raw, on_compress)? };

    // The retained stream may hold the target open.
    format.info_mut().close_stream();
    swap_into_place(&path.with_file_name(TEMP_FILE_NAME), path, &out, |from, to| fs::rename(from, to))?;
    record_sizes(format, out.len(), raw_len);

    let mut stream = Stream::open(path)?;
    if !compression.is_identity() {
        let decompressed = compression.decompress(&mut stream)?;
        stream.close();
        stream = decompressed;
    }
    format.load(&mut stream)?;
    stamp_children(format);
    stream.rewind_to(0)?;
    format.info_mut().stream = Some(stream);
    Ok(out.len() as u64)
}

/// Write `data` to `tmp`, delete `path`, then rename `tmp` over it.
///
/// The temp file is removed on failure only while the original still
/// exists. Once the original is gone the temp file is the only copy and
/// is reported in [`SaveError::Stranded`].
fn swap_into_place<R>(tmp: &Path, path: &Path, data: &[u8], rename: R) -> Result<(), SaveError>
where
    R: FnOnce(&Path, &Path) -> io::Result<()>,
{
    if let Err(e) = fs::write(tmp, data).and_then(|()| fs::remove_file(path)) {
        if tmp.is_file() {
            let _ = fs::remove_file(tmp);
        }
        return Err(e.into());
    }
    rename(tmp, path).map_err(|source| SaveError::Stranded { temp: tmp.to_path_buf(), source })
}

fn serialize(format: &mut dyn FileFormat) -> Result<Vec<u8>, SaveError> {
    let mut raw = Vec::new();
    format.save(&mut raw)?;
    Ok(raw)
}

fn compress(
    compression: &Arc<dyn CompressionFormat>,
    raw:         &[u8],
    on_compress: Option<&mut dyn FnMut()>,
) -> Result<Vec<u8>, SaveError> {
    if let Some(hook) = on_compress {
        hook();
    }
    Ok(compression.compress_bytes(raw)?)
}

fn record_sizes(format: &mut dyn FileFormat, compressed: usize, decompressed: usize) {
    let info = format.info_mut();
    info.compressed_size = compressed as u64;
    info.decompressed_size = decompressed as u64;
}

/// Buffered writer that counts what passes through it.
struct WriteBuffer<W: Write> {
    inner:         W,
    buf:           Vec<u8>,
    capacity:      usize,
    bytes_written: u64,
}

impl<W: Write> WriteBuffer<W> {
    fn new(inner: W, capacity: usize) -> Self {
        Self { inner, buf: Vec::with_capacity(capacity), capacity, bytes_written: 0 }
    }
}

impl<W: Write> Write for WriteBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buf.len() + buf.len() > self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        if buf.len() >= self.capacity {
            self.inner.write_all(buf)?;
        } else {
            self.buf.extend_from_slice(buf);
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ZstdCodec;
    use crate::format::FileInfo;
    use tempfile::tempdir;

    /// Opaque payload that can be told to fail on save.
    #[derive(Default)]
    struct Blob {
        info:    FileInfo,
        data:    Vec<u8>,
        broken:  bool,
    }

    impl FileFormat for Blob {
        fn description(&self) -> &'static str { "blob" }
        fn identify(&self, _: &FileInfo, _: &mut Stream) -> bool { true }
        fn load(&mut self, stream: &mut Stream) -> Result<(), FormatError> {
            self.data = stream.read_remaining()?;
            Ok(())
        }
        fn save(&mut self, out: &mut dyn Write) -> Result<(), FormatError> {
            if self.broken {
                return Err(FormatError::Malformed("refusing to save".into()));
            }
            out.write_all(&self.data)?;
            Ok(())
        }
        fn info(&self) -> &FileInfo { &self.info }
        fn info_mut(&mut self) -> &mut FileInfo { &mut self.info }
    }

    #[test]
    fn failed_rename_keeps_the_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let tmp = dir.path().join(TEMP_FILE_NAME);
        fs::write(&path, b"old").unwrap();

        let err = swap_into_place(&tmp, &path, b"new", |_, _| Err(io::Error::other("busy")))
            .unwrap_err();
        assert!(matches!(&err, SaveError::Stranded { temp, .. } if temp == &tmp));
        assert!(!path.exists());
        assert_eq!(fs::read(&tmp).unwrap(), b"new");
    }

    #[test]
    fn failed_staging_keeps_the_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let tmp = dir.path().join(TEMP_FILE_NAME);
        fs::write(&path, b"old").unwrap();
        // A directory in the temp file's place makes the write fail.
        fs::create_dir(&tmp).unwrap();

        let err = swap_into_place(&tmp, &path, b"new", |from, to| fs::rename(from, to)).unwrap_err();
        assert!(matches!(err, SaveError::Io(_)));
        assert_eq!(fs::read(&path).unwrap(), b"old");
        assert!(tmp.is_dir());
    }

    #[test]
    fn failed_serialize_keeps_retained_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"contents").unwrap();

        let mut blob = Blob { broken: true, ..Blob::default() };
        blob.info.keep_open = true;
        blob.info.stream = Some(Stream::open(&path).unwrap());

        assert!(matches!(save_to_path(&mut blob, &path, None), Err(SaveError::Format(_))));
        assert!(blob.info.stream.as_ref().is_some_and(|s| !s.is_closed()));
        assert_eq!(fs::read(&path).unwrap(), b"contents");
    }

    #[test]
    fn stream_save_records_sizes() {
        let mut blob = Blob { data: vec![3u8; 4096], ..Blob::default() };
        blob.info.compression = Arc::new(ZstdCodec::default());

        let mut out = save_to_stream(&mut blob).unwrap();
        let packed = out.read_remaining().unwrap();
        assert_eq!(blob.info.compressed_size, packed.len() as u64);
        assert_eq!(blob.info.decompressed_size, 4096);
        assert!(packed.len() < 4096);
    }

    #[test]
    fn save_time_format() {
        let log = SaveLog {
            strategy:      SaveStrategy::Direct,
            elapsed:       Duration::from_millis(61_234),
            bytes_written: 0,
            finished_at:   Utc::now(),
        };
        assert_eq!(log.save_time(), "01:01:234");
    }

    #[test]
    fn write_buffer_counts_and_flushes() {
        let mut out = Vec::new();
        {
            let mut w = WriteBuffer::new(&mut out, 8);
            w.write_all(b"abc").unwrap();
            w.write_all(b"defghijkl").unwrap();
            w.write_all(b"m").unwrap();
            assert_eq!(w.bytes_written, 13);
            w.flush().unwrap();
        }
        assert_eq!(out, b"abcdefghijklm");
    }
}
