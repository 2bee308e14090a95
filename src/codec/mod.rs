//! Compression formats and the compression resolver.
//!
//! # Detection order
//! Detectors are tried in registration order and the first positive
//! [`CompressionFormat::identify`] wins; nothing matching means
//! [`Uncompressed`]. The resolver rewinds the stream before every detector, so
//! detectors never need to restore the position themselves.
//!
//! # Misdetection
//! [`try_decompress`] treats a failing `decompress` after a positive
//! identification as a false positive: the error is logged, the stream is
//! rewound and the input is passed through as uncompressed. A genuinely
//! corrupt file that was correctly identified therefore also comes back as
//! uncompressed bytes.

pub mod yaz0;

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::stream::Stream;

pub use yaz0::Yaz0Codec;

/// Streams shorter than this are never inspected.
pub const MIN_STREAM_LEN: u64 = 8;

/// Default Zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const LZMA_PROPERTIES: u8 = 0x5D;

// ── CodecId enum ─────────────────────────────────────────────────────────────

/// Built-in codec discriminant, used to pick a codec by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Yaz0,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl CodecId {
    /// Human-readable name (for diagnostics and the CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Yaz0   => "yaz0",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma   => "lzma",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"   => Some(CodecId::None),
            "yaz0"   => Some(CodecId::Yaz0),
            "zstd"   => Some(CodecId::Zstd),
            "lz4"    => Some(CodecId::Lz4),
            "brotli" => Some(CodecId::Brotli),
            "lzma"   => Some(CodecId::Lzma),
            _        => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── CompressionFormat trait ──────────────────────────────────────────────────

/// A pluggable compression scheme.
///
/// Implementors provide the byte-slice transforms; the stream-level
/// [`decompress`](Self::decompress) and [`compress`](Self::compress) read
/// from the stream's current position to its end.
pub trait CompressionFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// `true` only for [`Uncompressed`].
    fn is_identity(&self) -> bool { false }

    /// Inspect the stream. Must not fail; the caller restores the position.
    fn identify(&self, stream: &mut Stream, file_name: &str) -> bool;

    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn decompress(&self, stream: &mut Stream) -> Result<Stream, CodecError> {
        let data = stream.read_remaining()?;
        Ok(Stream::from_bytes(self.decompress_bytes(&data)?))
    }

    fn compress(&self, stream: &mut Stream) -> Result<Stream, CodecError> {
        let data = stream.read_remaining()?;
        Ok(Stream::from_bytes(self.compress_bytes(&data)?))
    }

    /// A copy of this format carrying parameters read from a file header
    /// (first 16 bytes), so that recompression reproduces them.
    fn parameters_from(&self, _header: &[u8]) -> Option<Arc<dyn CompressionFormat>> {
        None
    }
}

impl std::fmt::Debug for dyn CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Built-in codec implementations ──────────────────────────────────────────

/// Identity format; the resolver's default when nothing matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncompressed;
impl CompressionFormat for Uncompressed {
    fn name(&self) -> &'static str { "uncompressed" }
    fn is_identity(&self) -> bool { true }
    fn identify(&self, _: &mut Stream, _: &str) -> bool { false }
    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn compress_bytes(&self, data: &[u8])   -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub fn uncompressed() -> Arc<dyn CompressionFormat> { Arc::new(Uncompressed) }

#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    pub level: i32,
}
impl Default for ZstdCodec {
    fn default() -> Self { Self { level: DEFAULT_COMPRESSION_LEVEL } }
}
impl CompressionFormat for ZstdCodec {
    fn name(&self) -> &'static str { "zstd" }
    fn identify(&self, stream: &mut Stream, _: &str) -> bool {
        matches!(stream.peek::<4>(), Ok(m) if m == ZSTD_MAGIC)
    }
    fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, self.level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

/// Size-prepended LZ4 blocks. There is no magic, so detection is by extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;
impl CompressionFormat for Lz4Codec {
    fn name(&self) -> &'static str { "lz4" }
    fn identify(&self, _: &mut Stream, file_name: &str) -> bool {
        has_extension(file_name, "lz4")
    }
    fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BrotliCodec {
    pub quality: u32,
}
impl Default for BrotliCodec {
    fn default() -> Self { Self { quality: 9 } }
}
impl CompressionFormat for BrotliCodec {
    fn name(&self) -> &'static str { "brotli" }
    fn identify(&self, _: &mut Stream, file_name: &str) -> bool {
        has_extension(file_name, "br")
    }
    fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, self.quality.min(11), 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Legacy `.lzma` streams: 13-byte header starting with the `lc/lp/pb`
/// properties byte (almost always `0x5D`) and a power-of-two dictionary size.
#[derive(Debug, Clone, Copy, Default)]
pub struct LzmaCodec;
impl CompressionFormat for LzmaCodec {
    fn name(&self) -> &'static str { "lzma" }
    fn identify(&self, stream: &mut Stream, file_name: &str) -> bool {
        if has_extension(file_name, "lzma") {
            return true;
        }
        match stream.peek::<5>() {
            Ok(h) if h.len() == 5 && h[0] == LZMA_PROPERTIES => {
                let dict = u32::from_le_bytes([h[1], h[2], h[3], h[4]]);
                dict >= 4096 && dict.is_power_of_two()
            }
            _ => false,
        }
    }
    fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

fn has_extension(file_name: &str, ext: &str) -> bool {
    std::path::Path::new(file_name)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CodecId to a built-in codec with default parameters.
pub fn get_codec(id: CodecId) -> Arc<dyn CompressionFormat> {
    match id {
        CodecId::None   => Arc::new(Uncompressed),
        CodecId::Yaz0   => Arc::new(Yaz0Codec::default()),
        CodecId::Zstd   => Arc::new(ZstdCodec::default()),
        CodecId::Lz4    => Arc::new(Lz4Codec),
        CodecId::Brotli => Arc::new(BrotliCodec::default()),
        CodecId::Lzma   => Arc::new(LzmaCodec),
    }
}

/// Built-in detectors in priority order. Magic-based detectors come first so
/// that extension-only detectors never shadow them.
pub fn builtin_codecs() -> Vec<Arc<dyn CompressionFormat>> {
    [CodecId::Yaz0, CodecId::Zstd, CodecId::Lzma, CodecId::Lz4, CodecId::Brotli]
        .into_iter()
        .map(get_codec)
        .collect()
}

// ── Resolver ─────────────────────────────────────────────────────────────────

/// Outcome of [`try_decompress`]. Owns whichever stream the format stage
/// should read next.
#[derive(Debug)]
pub struct Decompressed {
    pub stream:            Stream,
    pub compression:       Arc<dyn CompressionFormat>,
    pub compressed_size:   u64,
    pub decompressed_size: u64,
}

impl Decompressed {
    pub fn is_compressed(&self) -> bool { !self.compression.is_identity() }

    fn passthrough(stream: Stream, len: u64) -> Self {
        Self {
            stream,
            compression:       uncompressed(),
            compressed_size:   len,
            decompressed_size: len,
        }
    }
}

/// First registered format whose `identify` accepts the stream, or
/// [`Uncompressed`]. The stream is left at its starting position.
pub fn resolve_compression(
    formats:   &[Arc<dyn CompressionFormat>],
    stream:    &mut Stream,
    file_name: &str,
) -> io::Result<Arc<dyn CompressionFormat>> {
    let start = stream.position()?;
    for format in formats {
        stream.rewind_to(start)?;
        if format.identify(stream, file_name) {
            stream.rewind_to(start)?;
            tracing::debug!(codec = format.name(), file = file_name, "compression identified");
            return Ok(Arc::clone(format));
        }
    }
    stream.rewind_to(start)?;
    Ok(uncompressed())
}

/// Resolve and apply decompression.
///
/// On success the compressed input stream is closed and the decompressed
/// one returned. A decompression failure falls back to the untouched input.
/// Only I/O failures on the input stream itself are returned as errors.
pub fn try_decompress(
    formats:    &[Arc<dyn CompressionFormat>],
    mut stream: Stream,
    file_name:  &str,
) -> Result<Decompressed, CodecError> {
    let start = stream.position()?;
    let len = stream.len()?.saturating_sub(start);
    if len < MIN_STREAM_LEN {
        return Ok(Decompressed::passthrough(stream, len));
    }

    let format = resolve_compression(formats, &mut stream, file_name)?;
    if format.is_identity() {
        return Ok(Decompressed::passthrough(stream, len));
    }

    let header = stream.peek::<16>()?;
    match format.decompress(&mut stream) {
        Ok(mut out) => {
            let decompressed_size = out.len()?;
            stream.close();
            let compression = format.parameters_from(&header).unwrap_or(format);
            tracing::debug!(
                codec = compression.name(),
                file = file_name,
                compressed = len,
                decompressed = decompressed_size,
                "decompressed"
            );
            Ok(Decompressed { stream: out, compression, compressed_size: len, decompressed_size })
        }
        Err(e) => {
            tracing::warn!(
                codec = format.name(),
                file = file_name,
                error = %e,
                "identified compression failed to decompress; treating as uncompressed"
            );
            stream.rewind_to(start)?;
            Ok(Decompressed::passthrough(stream, len))
        }
    }
}
