//! File-format plugins, their metadata, and the format resolver.
//!
//! # Contract
//! A [`FileFormat`] is created empty by its registry factory, asked to
//! [`identify`](FileFormat::identify) a stream, and on a match
//! [`load`](FileFormat::load)s it. `load` must copy out everything it needs:
//! unless keep-open is requested the stream is closed as soon as `load`
//! returns.
//!
//! # Archive parentage
//! Formats exposing [`ArchiveFile`] have each entry stamped with an
//! [`ArchiveRef`] to the archive that produced it. The reference is a plain
//! value (id, name, path and the archive's own ancestry), so children never
//! own or borrow their parent.

mod resolver;

pub use resolver::Resolved;

use std::any::{Any, TypeId};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::codec::{uncompressed, CodecError, CompressionFormat};
use crate::stream::Stream;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported version: {0:#06x}")]
    UnsupportedVersion(u32),
    #[error("Malformed data: {0}")]
    Malformed(String),
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Entry not found: {0}")]
    EntryNotFound(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Capabilities and filters ─────────────────────────────────────────────────

/// Broad category a format belongs to, used by [`FilterEntry::Capability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Capability {
    Archive,
    Texture,
    Model,
    Audio,
}

/// One entry of a resolution filter.
///
/// With a non-empty filter a format can only match if some entry names its
/// concrete type or one of its capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterEntry {
    Type(TypeId),
    Capability(Capability),
}

impl FilterEntry {
    pub fn of<T: FileFormat>() -> Self {
        FilterEntry::Type(TypeId::of::<T>())
    }

    fn admits(&self, format: &dyn FileFormat) -> bool {
        match self {
            FilterEntry::Type(t) => format.as_any().type_id() == *t,
            FilterEntry::Capability(c) => format.capabilities().contains(c),
        }
    }
}

/// `true` if `filter` excludes `format`.
pub fn is_filtered(format: &dyn FileFormat, filter: &[FilterEntry]) -> bool {
    !filter.is_empty() && !filter.iter().any(|entry| entry.admits(format))
}

// ── Parent references ────────────────────────────────────────────────────────

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning reference from an archive child to the archive it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRef {
    pub id:        u64,
    pub file_name: String,
    pub file_path: String,
    pub parent:    Option<Box<ArchiveRef>>,
}

impl ArchiveRef {
    /// This archive followed by its ancestors, innermost first.
    pub fn ancestry(&self) -> impl Iterator<Item = &ArchiveRef> {
        std::iter::successors(Some(self), |a| a.parent.as_deref())
    }

    /// Number of enclosing archives, counting this one.
    pub fn depth(&self) -> usize { self.ancestry().count() }
}

// ── FileInfo ─────────────────────────────────────────────────────────────────

/// Metadata of a resolved file.
#[derive(Debug)]
pub struct FileInfo {
    pub file_name:         String,
    pub file_path:         String,
    pub compressed_size:   u64,
    pub decompressed_size: u64,
    pub compression:       Arc<dyn CompressionFormat>,
    pub parent_archive:    Option<ArchiveRef>,
    /// Keep the backing stream open after load (held in `stream`).
    pub keep_open:         bool,
    pub stream:            Option<Stream>,
    id:                    u64,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            file_name:         String::new(),
            file_path:         String::new(),
            compressed_size:   0,
            decompressed_size: 0,
            compression:       uncompressed(),
            parent_archive:    None,
            keep_open:         false,
            stream:            None,
            id:                NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl FileInfo {
    pub fn new(path: &str) -> Self {
        let mut info = Self::default();
        info.set_path(path);
        info
    }

    /// Set the path and derive the file name from its last component.
    pub fn set_path(&mut self, path: &str) {
        self.file_path = path.to_owned();
        self.file_name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_owned());
    }

    /// Process-unique id of the owning format instance.
    pub fn id(&self) -> u64 { self.id }

    pub fn is_compressed(&self) -> bool { !self.compression.is_identity() }

    /// Reference children can hold to this file.
    pub fn archive_ref(&self) -> ArchiveRef {
        ArchiveRef {
            id:        self.id,
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            parent:    self.parent_archive.clone().map(Box::new),
        }
    }

    /// Release a retained stream, if any.
    pub fn close_stream(&mut self) {
        if let Some(mut s) = self.stream.take() {
            s.close();
        }
    }
}

// ── Format traits ────────────────────────────────────────────────────────────

/// Upcast helper so filters and callers can recover the concrete type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any { self }
    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

pub trait FileFormat: AsAny + Send + 'static {
    /// Short human-readable description, e.g. `"SARC archive"`.
    fn description(&self) -> &'static str;

    fn extensions(&self) -> &'static [&'static str] { &[] }

    /// Inspect the stream. `info` carries the file name for extension-based
    /// detection. The caller restores the stream position.
    fn identify(&self, info: &FileInfo, stream: &mut Stream) -> bool;

    fn load(&mut self, stream: &mut Stream) -> Result<(), FormatError>;

    fn save(&mut self, out: &mut dyn Write) -> Result<(), FormatError>;

    fn can_save(&self) -> bool { true }

    fn info(&self) -> &FileInfo;

    fn info_mut(&mut self) -> &mut FileInfo;

    fn capabilities(&self) -> &'static [Capability] { &[] }

    fn as_archive(&self) -> Option<&dyn ArchiveFile> { None }

    fn as_archive_mut(&mut self) -> Option<&mut dyn ArchiveFile> { None }
}

impl dyn FileFormat {
    pub fn is<T: FileFormat>(&self) -> bool { self.as_any().is::<T>() }

    pub fn downcast_ref<T: FileFormat>(&self) -> Option<&T> { self.as_any().downcast_ref() }

    pub fn downcast_mut<T: FileFormat>(&mut self) -> Option<&mut T> { self.as_any_mut().downcast_mut() }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// A file stored inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub file_name:      String,
    pub data:           Vec<u8>,
    pub parent_archive: Option<ArchiveRef>,
}

impl ArchiveEntry {
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self { file_name: file_name.into(), data, parent_archive: None }
    }

    pub fn size(&self) -> u64 { self.data.len() as u64 }

    /// The entry name as a path relative to an extraction root.
    ///
    /// `None` when the name is empty or could leave the root (`..`, an
    /// absolute path or a drive prefix).
    pub fn relative_path(&self) -> Option<PathBuf> {
        let mut out = PathBuf::new();
        for component in Path::new(&self.file_name).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        (!out.as_os_str().is_empty()).then_some(out)
    }
}

/// Capability of formats that contain other files.
pub trait ArchiveFile {
    fn entries(&self) -> &[ArchiveEntry];

    fn entries_mut(&mut self) -> &mut Vec<ArchiveEntry>;

    fn find(&self, file_name: &str) -> Option<&ArchiveEntry> {
        self.entries().iter().find(|e| e.file_name == file_name)
    }

    fn position(&self, file_name: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.file_name == file_name)
    }

    /// Replace the data of an existing entry, e.g. with the output of
    /// [`crate::save::save_to_stream`] for an edited child.
    fn replace_entry(&mut self, file_name: &str, data: Vec<u8>) -> Result<(), FormatError> {
        let entry = self
            .entries_mut()
            .iter_mut()
            .find(|e| e.file_name == file_name)
            .ok_or_else(|| FormatError::EntryNotFound(file_name.to_owned()))?;
        entry.data = data;
        Ok(())
    }

    fn add_entry(&mut self, entry: ArchiveEntry) -> Result<(), FormatError> {
        if self.find(&entry.file_name).is_some() {
            return Err(FormatError::Malformed(format!("duplicate entry {}", entry.file_name)));
        }
        self.entries_mut().push(entry);
        Ok(())
    }
}

/// Point every child entry of an archive format back at it.
pub(crate) fn stamp_children(format: &mut dyn FileFormat) {
    let parent = format.info().archive_ref();
    if let Some(archive) = format.as_archive_mut() {
        for entry in archive.entries_mut().iter_mut() {
            entry.parent_archive = Some(parent.clone());
        }
    }
}

// ── ResolutionContext ────────────────────────────────────────────────────────

/// Per-call settings for the format resolver.
#[derive(Debug, Default)]
pub struct ResolutionContext {
    /// Already-resolved compression. `None` runs compression detection.
    pub compression:       Option<Arc<dyn CompressionFormat>>,
    pub parent_archive:    Option<ArchiveRef>,
    pub compressed_size:   u64,
    pub decompressed_size: u64,
    pub filter:            Vec<FilterEntry>,
    pub keep_open:         bool,
}

impl ResolutionContext {
    pub fn new() -> Self { Self::default() }

    pub fn with_filter(mut self, entry: FilterEntry) -> Self {
        self.filter.push(entry);
        self
    }

    pub fn keep_open(mut self, keep_open: bool) -> Self {
        self.keep_open = keep_open;
        self
    }

    pub fn with_parent(mut self, parent: ArchiveRef) -> Self {
        self.parent_archive = Some(parent);
        self
    }

    pub fn with_compression(mut self, compression: Arc<dyn CompressionFormat>) -> Self {
        self.compression = Some(compression);
        self
    }

    fn is_compressed(&self) -> bool {
        self.compression.as_ref().is_some_and(|c| !c.is_identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_last_path_component() {
        let info = FileInfo::new("content/Model/model.bin");
        assert_eq!(info.file_name, "model.bin");
        assert_eq!(info.file_path, "content/Model/model.bin");
        assert!(!info.is_compressed());
    }

    #[test]
    fn entry_paths_stay_under_the_root() {
        let path = |name: &str| ArchiveEntry::new(name, Vec::new()).relative_path();
        assert_eq!(path("Model/a.bin"), Some(PathBuf::from("Model/a.bin")));
        assert_eq!(path("./Model/a.bin"), Some(PathBuf::from("Model/a.bin")));
        assert_eq!(path("../a.bin"), None);
        assert_eq!(path("Model/../../a.bin"), None);
        assert_eq!(path("/etc/passwd"), None);
        assert_eq!(path(""), None);
    }

    #[test]
    fn instance_ids_are_unique() {
        assert_ne!(FileInfo::default().id(), FileInfo::default().id());
    }

    #[test]
    fn ancestry_walks_outwards() {
        let outer = FileInfo::new("pack/outer.sarc");
        let outer_ref = outer.archive_ref();
        let mut inner = FileInfo::new("inner.sarc");
        inner.parent_archive = Some(outer_ref.clone());
        let inner_ref = inner.archive_ref();

        let names: Vec<&str> = inner_ref.ancestry().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, ["inner.sarc", "outer.sarc"]);
        assert_eq!(inner_ref.depth(), 2);
        assert_eq!(inner_ref.parent.as_deref(), Some(&outer_ref));
    }
}
