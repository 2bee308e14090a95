use std::io::Cursor;
use std::path::Path;

use super::{is_filtered, stamp_children, FileFormat, FileInfo, FormatError, ResolutionContext};
use crate::codec::{try_decompress, uncompressed, MIN_STREAM_LEN};
use crate::registry::Registry;
use crate::stream::Stream;

pub type Resolved = Result<Option<Box<dyn FileFormat>>, FormatError>;

impl Registry {
    /// Open `path` and resolve it. See [`open_stream`](Self::open_stream).
    pub fn open_path<P: AsRef<Path>>(&self, path: P, ctx: ResolutionContext) -> Resolved {
        let path = path.as_ref();
        let stream = Stream::open(path)?;
        self.open_stream(stream, &path.to_string_lossy(), ctx)
    }

    /// Resolve a stream to a loaded format instance.
    ///
    /// Takes ownership of `stream`. `Ok(None)` means no registered format
    /// accepted the (decompressed) data, or the stream was too short to
    /// identify. Errors come from I/O on the stream or from the matched
    /// format's `load`.
    pub fn open_stream(&self, mut stream: Stream, path: &str, mut ctx: ResolutionContext) -> Resolved {
        let len = stream.len()?;
        if len < MIN_STREAM_LEN {
            stream.close();
            return Ok(None);
        }

        let mut info = FileInfo::new(path);
        info.parent_archive = ctx.parent_archive.clone();

        let mut stream = if ctx.compression.is_none() {
            let d = try_decompress(self.compressions(), stream, &info.file_name)?;
            ctx.compressed_size = d.compressed_size;
            ctx.decompressed_size = d.decompressed_size;
            ctx.compression = Some(d.compression);
            d.stream
        } else {
            if ctx.compressed_size == 0 {
                ctx.compressed_size = len;
            }
            if ctx.decompressed_size == 0 {
                ctx.decompressed_size = len;
            }
            stream
        };
        if stream.len()? < MIN_STREAM_LEN {
            tracing::debug!(file = path, "decompressed data too short to identify");
            stream.close();
            return Ok(None);
        }

        let start = stream.position()?;
        for factory in self.formats() {
            stream.rewind_to(start)?;
            let candidate = factory();
            if !candidate.identify(&info, &mut stream) {
                continue;
            }
            if is_filtered(&*candidate, &ctx.filter) {
                tracing::debug!(format = candidate.description(), file = path, "identified but filtered out");
                continue;
            }
            stream.rewind_to(start)?;
            return load_matched(candidate, info, stream, ctx).map(Some);
        }

        tracing::debug!(file = path, compressed = ctx.is_compressed(), "no format matched");
        stream.close();
        Ok(None)
    }

    /// Resolve the `index`-th child of an archive format from memory.
    ///
    /// The child is parented to the entry's recorded archive, or to
    /// `archive` itself when the entry was never stamped.
    pub fn open_entry(&self, archive: &dyn FileFormat, index: usize, ctx: ResolutionContext) -> Resolved {
        let entries = archive
            .as_archive()
            .ok_or(FormatError::Unsupported("format is not an archive"))?
            .entries();
        let entry = entries
            .get(index)
            .ok_or_else(|| FormatError::EntryNotFound(format!("#{index}")))?;

        let parent = entry
            .parent_archive
            .clone()
            .unwrap_or_else(|| archive.info().archive_ref());
        let stream = Stream::new(Cursor::new(entry.data.clone()), entry.file_name.clone());
        self.open_stream(stream, &entry.file_name, ctx.with_parent(parent))
    }

    pub fn open_entry_by_name(&self, archive: &dyn FileFormat, file_name: &str, ctx: ResolutionContext) -> Resolved {
        let index = archive
            .as_archive()
            .and_then(|a| a.position(file_name))
            .ok_or_else(|| FormatError::EntryNotFound(file_name.to_owned()))?;
        self.open_entry(archive, index, ctx)
    }
}

fn load_matched(
    mut format: Box<dyn FileFormat>,
    mut info:   FileInfo,
    mut stream: Stream,
    ctx:        ResolutionContext,
) -> Result<Box<dyn FileFormat>, FormatError> {
    let keep_open = ctx.keep_open || format.info().keep_open;
    info.compressed_size = ctx.compressed_size;
    info.decompressed_size = ctx.decompressed_size;
    info.compression = ctx.compression.unwrap_or_else(uncompressed);
    info.keep_open = keep_open;
    *format.info_mut() = info;

    if let Err(e) = format.load(&mut stream) {
        stream.close();
        return Err(e);
    }
    stamp_children(&mut *format);

    if keep_open {
        stream.rewind_to(0)?;
        format.info_mut().stream = Some(stream);
    } else {
        stream.close();
    }

    let info = format.info();
    tracing::debug!(
        format = format.description(),
        file = %info.file_path,
        codec = info.compression.name(),
        size = info.decompressed_size,
        keep_open,
        "resolved"
    );
    Ok(format)
}
