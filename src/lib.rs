pub mod stream;
pub mod codec;
pub mod format;
pub mod formats;
pub mod registry;
pub mod save;
pub mod swizzle;
pub mod texture;

pub use stream::Stream;
pub use codec::{CodecId, CompressionFormat, get_codec, try_decompress};
pub use format::{ArchiveFile, FileFormat, FileInfo, FilterEntry, FormatError, ResolutionContext};
pub use registry::Registry;
pub use save::{SaveError, SaveLog, save_background, save_to_path, save_to_stream};
pub use swizzle::{Surface, SwizzleError, deswizzle, swizzle, extract_slice};
pub use texture::{TexFormat, TextureInfo};
