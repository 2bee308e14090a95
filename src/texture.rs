//! Texture format descriptors and the decoder plugin contract.
//!
//! The swizzle engine only needs three facts about a pixel format: the size
//! of one element in bytes and the pixel footprint of that element. For
//! uncompressed formats the footprint is 1×1×1; block-compressed formats
//! (BC*, ASTC) use one element per block.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TexFormat {
    R8Unorm,
    Rg8Unorm,
    Rgb565Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    Bc1Unorm,
    Bc2Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
    Bc6hUf16,
    Bc7Unorm,
    Astc4x4,
    Astc5x5,
    Astc6x6,
    Astc8x8,
}

impl TexFormat {
    /// Bytes per element (pixel, or block for compressed formats).
    pub fn bytes_per_pixel(self) -> u32 {
        use TexFormat::*;
        match self {
            R8Unorm => 1,
            Rg8Unorm | Rgb565Unorm => 2,
            Rgba8Unorm | Rgba8Srgb | Bgra8Unorm => 4,
            Rgba16Float | Bc1Unorm | Bc4Unorm => 8,
            Rgba32Float | Bc2Unorm | Bc3Unorm | Bc5Unorm | Bc6hUf16 | Bc7Unorm => 16,
            Astc4x4 | Astc5x5 | Astc6x6 | Astc8x8 => 16,
        }
    }

    pub fn block_width(self) -> u32 {
        use TexFormat::*;
        match self {
            Bc1Unorm | Bc2Unorm | Bc3Unorm | Bc4Unorm | Bc5Unorm | Bc6hUf16 | Bc7Unorm => 4,
            Astc4x4 => 4,
            Astc5x5 => 5,
            Astc6x6 => 6,
            Astc8x8 => 8,
            _ => 1,
        }
    }

    pub fn block_height(self) -> u32 {
        // Every supported block format is square.
        self.block_width()
    }

    pub fn block_depth(self) -> u32 { 1 }

    pub fn is_compressed(self) -> bool { self.block_width() > 1 }

    /// Byte size of a `width`×`height` image in this format, without padding.
    pub fn image_size(self, width: u32, height: u32) -> u32 {
        width.div_ceil(self.block_width()) * height.div_ceil(self.block_height()) * self.bytes_per_pixel()
    }
}

/// Everything needed to locate one slice inside a tiled texture blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureInfo {
    pub format:      TexFormat,
    pub width:       u32,
    pub height:      u32,
    pub depth:       u32,
    pub array_count: u32,
    pub mip_count:   u32,
    /// Log2 of the GOB block height. `None` derives it from the height.
    pub block_height_log2: Option<u32>,
    /// Pitch-linear instead of block-linear.
    pub linear: bool,
}

impl TextureInfo {
    pub fn new(format: TexFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            depth: 1,
            array_count: 1,
            mip_count: 1,
            block_height_log2: None,
            linear: false,
        }
    }

    pub fn with_mips(mut self, mip_count: u32) -> Self {
        self.mip_count = mip_count;
        self
    }

    pub fn with_array(mut self, array_count: u32) -> Self {
        self.array_count = array_count;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }
}

#[derive(Error, Debug)]
pub enum TextureError {
    #[error("Format {0:?} is not supported by this decoder")]
    Unsupported(TexFormat),
    #[error("Decoder is not available on this platform")]
    UnsupportedPlatform,
    #[error("Texture data too small: expected {expected} bytes, got {actual}")]
    DataTooSmall { expected: usize, actual: usize },
}

/// Converts linear (already deswizzled) texel data to and from RGBA8.
pub trait TextureDecoder: Send + Sync {
    fn can_encode(&self, format: TexFormat) -> bool;
    fn is_supported_platform(&self) -> bool;
    fn decode(&self, format: TexFormat, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TextureError>;
    fn encode(&self, format: TexFormat, rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TextureError>;
}

/// Handles the uncompressed 8-bit-per-channel formats by channel shuffling.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainDecoder;

impl PlainDecoder {
    fn check(format: TexFormat, data: &[u8], width: u32, height: u32) -> Result<(), TextureError> {
        let expected = format.image_size(width, height) as usize;
        if data.len() < expected {
            return Err(TextureError::DataTooSmall { expected, actual: data.len() });
        }
        Ok(())
    }
}

impl TextureDecoder for PlainDecoder {
    fn can_encode(&self, format: TexFormat) -> bool {
        matches!(
            format,
            TexFormat::R8Unorm | TexFormat::Rg8Unorm | TexFormat::Rgba8Unorm | TexFormat::Rgba8Srgb | TexFormat::Bgra8Unorm
        )
    }

    fn is_supported_platform(&self) -> bool { true }

    fn decode(&self, format: TexFormat, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TextureError> {
        if !self.can_encode(format) {
            return Err(TextureError::Unsupported(format));
        }
        Self::check(format, data, width, height)?;
        let pixels = (width * height) as usize;
        let bpp = format.bytes_per_pixel() as usize;
        let mut out = Vec::with_capacity(pixels * 4);
        for px in data[..pixels * bpp].chunks_exact(bpp) {
            let rgba = match format {
                TexFormat::R8Unorm => [px[0], px[0], px[0], 0xFF],
                TexFormat::Rg8Unorm => [px[0], px[1], 0, 0xFF],
                TexFormat::Bgra8Unorm => [px[2], px[1], px[0], px[3]],
                _ => [px[0], px[1], px[2], px[3]],
            };
            out.extend_from_slice(&rgba);
        }
        Ok(out)
    }

    fn encode(&self, format: TexFormat, rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TextureError> {
        if !self.can_encode(format) {
            return Err(TextureError::Unsupported(format));
        }
        Self::check(TexFormat::Rgba8Unorm, rgba, width, height)?;
        let pixels = (width * height) as usize;
        let mut out = Vec::with_capacity(pixels * format.bytes_per_pixel() as usize);
        for px in rgba[..pixels * 4].chunks_exact(4) {
            match format {
                TexFormat::R8Unorm => out.push(px[0]),
                TexFormat::Rg8Unorm => out.extend_from_slice(&px[..2]),
                TexFormat::Bgra8Unorm => out.extend_from_slice(&[px[2], px[1], px[0], px[3]]),
                _ => out.extend_from_slice(px),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_formats_report_footprint() {
        assert_eq!(TexFormat::Bc1Unorm.bytes_per_pixel(), 8);
        assert_eq!(TexFormat::Bc1Unorm.block_width(), 4);
        assert_eq!(TexFormat::Rgba8Unorm.block_width(), 1);
        assert_eq!(TexFormat::Bc7Unorm.image_size(10, 10), 3 * 3 * 16);
        assert_eq!(TexFormat::Astc5x5.image_size(10, 10), 2 * 2 * 16);
    }

    #[test]
    fn plain_decoder_swaps_bgra() {
        let d = PlainDecoder;
        let rgba = d.decode(TexFormat::Bgra8Unorm, &[1, 2, 3, 4], 1, 1).unwrap();
        assert_eq!(rgba, [3, 2, 1, 4]);
        assert_eq!(d.encode(TexFormat::Bgra8Unorm, &rgba, 1, 1).unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn plain_decoder_rejects_block_formats() {
        assert!(matches!(
            PlainDecoder.decode(TexFormat::Bc1Unorm, &[0; 8], 4, 4),
            Err(TextureError::Unsupported(TexFormat::Bc1Unorm))
        ));
    }
}
