//! Ordered plugin registries.
//!
//! Both lists are priority-ordered: resolution walks them front to back and
//! the first detector that accepts the input wins. A process-wide registry
//! is built once on first use (or installed explicitly at startup) and is
//! read-only afterwards.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::codec::{builtin_codecs, CompressionFormat};
use crate::format::FileFormat;
use crate::formats::sarc::Sarc;

/// Creates an empty instance of one format, ready for `identify`/`load`.
pub type FormatFactory = fn() -> Box<dyn FileFormat>;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

fn make<T: FileFormat + Default>() -> Box<dyn FileFormat> {
    Box::new(T::default())
}

#[derive(Default, Clone)]
pub struct Registry {
    compressions: Vec<Arc<dyn CompressionFormat>>,
    formats:      Vec<FormatFactory>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self { Self::default() }

    /// Built-in compression formats and file formats.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new().with_format::<Sarc>();
        registry.compressions = builtin_codecs();
        registry
    }

    /// The process-wide registry, populated with the built-ins on first use
    /// unless [`install_global`](Self::install_global) ran earlier.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::with_builtins)
    }

    /// Make `registry` the process-wide one. Fails (returning it) if the
    /// global registry was already initialised.
    pub fn install_global(registry: Registry) -> Result<(), Registry> {
        GLOBAL.set(registry)
    }

    pub fn with_compression(mut self, format: Arc<dyn CompressionFormat>) -> Self {
        self.compressions.push(format);
        self
    }

    pub fn with_format<T: FileFormat + Default>(self) -> Self {
        self.with_format_factory(make::<T>)
    }

    pub fn with_format_factory(mut self, factory: FormatFactory) -> Self {
        self.formats.push(factory);
        self
    }

    pub fn compressions(&self) -> &[Arc<dyn CompressionFormat>] { &self.compressions }

    pub fn formats(&self) -> &[FormatFactory] { &self.formats }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formats: Vec<&str> = self.formats.iter().map(|make| make().description()).collect();
        f.debug_struct("Registry")
            .field("compressions", &self.compressions)
            .field("formats", &formats)
            .finish()
    }
}
