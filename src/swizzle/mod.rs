//! Tegra X1 block-linear swizzling.
//!
//! # Block-linear layout
//! Tiled memory is made of GOBs (groups of bytes): 512-byte cells covering
//! 64 bytes × 8 rows. `block_height` GOBs are stacked vertically to form a
//! block; blocks are laid out left to right across the image width, then
//! the next row of blocks follows. Inside a GOB the bytes follow a fixed
//! pattern keyed by the low bits of the byte column and row, see
//! [`addr_block_linear`].
//!
//! All coordinates here are in *elements*: pixels for plain formats, or
//! compression blocks (e.g. 4×4 for BC1) for block-compressed formats.
//! Pixel dimensions are ceil-divided by the format's block footprint first.
//!
//! # Depth
//! Slices of a 3D surface are stored back to back, each occupying one full
//! 2D surface.

pub mod mip;

use thiserror::Error;

use crate::texture::TexFormat;

pub use mip::{assemble_image, extract_all, extract_slice, mip_layout, try_extract_slice, MipLayout, Slice};

/// Size of one GOB in bytes.
pub const GOB_SIZE: u32 = 512;
/// Width of one GOB row in bytes.
pub const GOB_WIDTH: u32 = 64;
/// Rows per GOB.
pub const GOB_HEIGHT: u32 = 8;
/// Largest block height (in GOBs) derived from a texture height.
pub const MAX_BLOCK_HEIGHT: u32 = 16;
/// Largest block height log2 the hardware accepts.
pub const MAX_BLOCK_HEIGHT_LOG2: u32 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwizzleError {
    #[error("Source buffer too small: need {needed} bytes, have {actual}")]
    SourceTooSmall { needed: usize, actual: usize },
    #[error("Invalid surface: {0}")]
    InvalidSurface(&'static str),
    #[error("Slice out of range: array {array}, mip {mip}, depth {depth}")]
    SliceOutOfRange { array: u32, mip: u32, depth: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileMode {
    #[default]
    BlockLinear,
    /// Plain row-major with a (possibly padded) pitch.
    Pitch,
}

// ── Arithmetic helpers ───────────────────────────────────────────────────────

#[inline]
pub fn div_round_up(n: u32, d: u32) -> u32 {
    n.div_ceil(d)
}

/// Round `x` up to a multiple of `y`. `y` must be a power of two.
#[inline]
pub fn round_up(x: u32, y: u32) -> u32 {
    (x.wrapping_sub(1) | (y - 1)).wrapping_add(1)
}

/// Smallest power of two `>= x`; `0` maps to `0`.
#[inline]
pub fn pow2_round_up(x: u32) -> u32 {
    let mut x = x.wrapping_sub(1);
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    x.wrapping_add(1)
}

/// Block height in GOBs for a surface `height` elements tall.
pub fn block_height(height: u32) -> u32 {
    pow2_round_up(height / GOB_HEIGHT).clamp(1, MAX_BLOCK_HEIGHT)
}

/// Log2 of a power-of-two block height.
#[inline]
pub fn block_height_log2(block_height: u32) -> u32 {
    31 - block_height.max(1).leading_zeros()
}

/// Byte offset of element `(x, y)` inside a block-linear surface.
///
/// `width` is the surface width in elements, `bpp` bytes per element and
/// `block_height` the number of GOBs per block.
pub fn addr_block_linear(x: u32, y: u32, width: u32, bpp: u32, base_address: u64, block_height: u32) -> u64 {
    let (x, y, bpp, bh) = (x as u64, y as u64, bpp as u64, block_height as u64);
    let gob = GOB_SIZE as u64;
    let image_width_in_gobs = (width as u64 * bpp).div_ceil(GOB_WIDTH as u64);

    let gob_address = base_address
        + (y / (8 * bh)) * gob * bh * image_width_in_gobs
        + (x * bpp / 64) * gob * bh
        + (y % (8 * bh) / 8) * gob;

    let x = x * bpp;
    gob_address
        + ((x % 64) / 32) * 256
        + ((y % 8) / 2) * 64
        + ((x % 32) / 16) * 32
        + (y % 2) * 16
        + (x % 16)
}

// ── Surface description ──────────────────────────────────────────────────────

/// Geometry of one tiled surface (a single mip level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub width:      u32,
    pub height:     u32,
    pub depth:      u32,
    pub blk_width:  u32,
    pub blk_height: u32,
    pub blk_depth:  u32,
    pub bpp:        u32,
    pub tile_mode:  TileMode,
    pub block_height_log2: u32,
    /// Pitch mode only: pad rows to 32 bytes.
    pub round_pitch: bool,
}

impl Surface {
    /// Uncompressed surface with `bpp` bytes per pixel.
    pub fn new(width: u32, height: u32, bpp: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
            blk_width: 1,
            blk_height: 1,
            blk_depth: 1,
            bpp,
            tile_mode: TileMode::BlockLinear,
            block_height_log2: block_height_log2(block_height(height)),
            round_pitch: false,
        }
    }

    /// Surface for `format`, block height derived from the height in blocks.
    pub fn for_format(format: TexFormat, width: u32, height: u32) -> Self {
        let blk_height = format.block_height();
        Self {
            blk_width: format.block_width(),
            blk_height,
            blk_depth: format.block_depth(),
            block_height_log2: block_height_log2(block_height(div_round_up(height, blk_height))),
            ..Self::new(width, height, format.bytes_per_pixel())
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_block_height_log2(mut self, log2: u32) -> Self {
        self.block_height_log2 = log2;
        self
    }

    pub fn with_tile_mode(mut self, tile_mode: TileMode) -> Self {
        self.tile_mode = tile_mode;
        self
    }

    fn validate(&self) -> Result<(), SwizzleError> {
        if self.bpp == 0 {
            return Err(SwizzleError::InvalidSurface("zero bytes per element"));
        }
        if self.blk_width == 0 || self.blk_height == 0 || self.blk_depth == 0 {
            return Err(SwizzleError::InvalidSurface("zero block dimension"));
        }
        if self.block_height_log2 > MAX_BLOCK_HEIGHT_LOG2 {
            return Err(SwizzleError::InvalidSurface("block height log2 above 5"));
        }
        let (w, _, _) = self.block_dims();
        if w.checked_mul(self.bpp).and_then(|row| row.checked_add(GOB_WIDTH)).is_none() {
            return Err(SwizzleError::InvalidSurface("row pitch exceeds 4 GiB"));
        }
        Ok(())
    }

    /// Dimensions in elements.
    pub fn block_dims(&self) -> (u32, u32, u32) {
        (
            div_round_up(self.width, self.blk_width),
            div_round_up(self.height, self.blk_height),
            div_round_up(self.depth.max(1), self.blk_depth),
        )
    }

    /// Bytes per row of elements in tiled memory.
    pub fn pitch(&self) -> u32 {
        let (w, _, _) = self.block_dims();
        match self.tile_mode {
            TileMode::BlockLinear => round_up(w.saturating_mul(self.bpp), GOB_WIDTH),
            TileMode::Pitch if self.round_pitch => round_up(w.saturating_mul(self.bpp), 32),
            TileMode::Pitch => w.saturating_mul(self.bpp),
        }
    }

    /// Tiled bytes occupied by one depth slice.
    pub fn slice_size(&self) -> usize {
        let (_, h, _) = self.block_dims();
        let rows = match self.tile_mode {
            TileMode::BlockLinear => round_up(h, (1 << self.block_height_log2) * GOB_HEIGHT),
            TileMode::Pitch => h,
        };
        self.pitch() as usize * rows as usize
    }

    /// Tiled bytes occupied by the whole surface.
    pub fn surface_size(&self) -> usize {
        self.slice_size() * self.block_dims().2 as usize
    }

    /// Bytes of the unpadded row-major representation.
    pub fn linear_size(&self) -> usize {
        let (w, h, d) = self.block_dims();
        w as usize * h as usize * d as usize * self.bpp as usize
    }
}

// ── Swizzle / deswizzle ──────────────────────────────────────────────────────

/// Linear → tiled. Returns [`Surface::surface_size`] bytes.
pub fn swizzle(surface: &Surface, linear: &[u8]) -> Result<Vec<u8>, SwizzleError> {
    transcode(surface, linear, true)
}

/// Tiled → linear. Returns exactly [`Surface::linear_size`] bytes.
pub fn deswizzle(surface: &Surface, tiled: &[u8]) -> Result<Vec<u8>, SwizzleError> {
    transcode(surface, tiled, false)
}

fn transcode(surface: &Surface, src: &[u8], to_tiled: bool) -> Result<Vec<u8>, SwizzleError> {
    surface.validate()?;
    let (width, height, depth) = surface.block_dims();
    let bpp = surface.bpp as usize;
    let block_height = 1u32 << surface.block_height_log2;
    let pitch = surface.pitch() as usize;
    let slice_size = surface.slice_size();
    let linear_slice = width as usize * height as usize * bpp;

    if to_tiled && src.len() < surface.linear_size() {
        return Err(SwizzleError::SourceTooSmall { needed: surface.linear_size(), actual: src.len() });
    }
    let mut out = vec![0u8; if to_tiled { surface.surface_size() } else { surface.linear_size() }];

    for z in 0..depth as usize {
        let tiled_base = z * slice_size;
        let linear_base = z * linear_slice;

        for y in 0..height {
            for x in 0..width {
                let pos = match surface.tile_mode {
                    TileMode::Pitch => y as usize * pitch + x as usize * bpp,
                    TileMode::BlockLinear => {
                        addr_block_linear(x, y, width, surface.bpp, 0, block_height) as usize
                    }
                };
                // Possible at non-power-of-two dimensions.
                if pos + bpp > slice_size {
                    continue;
                }
                let pos_ = (y as usize * width as usize + x as usize) * bpp;

                let (from, to) = if to_tiled {
                    (linear_base + pos_, tiled_base + pos)
                } else {
                    (tiled_base + pos, linear_base + pos_)
                };
                let element = src
                    .get(from..from + bpp)
                    .ok_or(SwizzleError::SourceTooSmall { needed: from + bpp, actual: src.len() })?;
                out[to..to + bpp].copy_from_slice(element);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_up_scenarios() {
        assert_eq!(round_up(100, 64), 128);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(div_round_up(10, 4), 3);
    }

    #[test]
    fn pow2_round_up_values() {
        assert_eq!(pow2_round_up(0), 0);
        assert_eq!(pow2_round_up(1), 1);
        assert_eq!(pow2_round_up(5), 8);
        assert_eq!(pow2_round_up(8), 8);
        assert_eq!(pow2_round_up(1000), 1024);
    }

    #[test]
    fn block_height_is_clamped() {
        assert_eq!(block_height(64), 8);
        assert_eq!(block_height(512), 16);
        assert_eq!(block_height(4), 1);
        assert_eq!(block_height(100), 16);
        assert_eq!(block_height_log2(8), 3);
        assert_eq!(block_height_log2(1), 0);
    }

    #[test]
    fn origin_maps_to_base() {
        assert_eq!(addr_block_linear(0, 0, 64, 4, 0, 8), 0);
        assert_eq!(addr_block_linear(0, 0, 64, 4, 0x1000, 8), 0x1000);
    }

    #[test]
    fn intra_gob_pattern() {
        // bpp 1, one GOB wide, block height 1.
        assert_eq!(addr_block_linear(16, 0, 64, 1, 0, 1), 32);
        assert_eq!(addr_block_linear(32, 0, 64, 1, 0, 1), 256);
        assert_eq!(addr_block_linear(0, 1, 64, 1, 0, 1), 16);
        assert_eq!(addr_block_linear(0, 2, 64, 1, 0, 1), 64);
        assert_eq!(addr_block_linear(0, 8, 64, 1, 0, 2), 512);
        // Next GOB column starts after a whole block.
        assert_eq!(addr_block_linear(64, 0, 128, 1, 0, 2), 1024);
    }

    #[test]
    fn surface_sizes_are_gob_padded() {
        let s = Surface::new(10, 10, 4).with_block_height_log2(0);
        assert_eq!(s.pitch(), 64);
        assert_eq!(s.slice_size(), 64 * 16);
        assert_eq!(s.linear_size(), 400);
    }

    #[test]
    fn bc1_surface_works_in_blocks() {
        let s = Surface::for_format(TexFormat::Bc1Unorm, 64, 64);
        assert_eq!(s.block_dims(), (16, 16, 1));
        assert_eq!(s.block_height_log2, 1);
        let linear: Vec<u8> = (0..s.linear_size()).map(|i| (i % 253) as u8).collect();
        let tiled = swizzle(&s, &linear).unwrap();
        assert_eq!(tiled.len(), s.surface_size());
        assert_eq!(deswizzle(&s, &tiled).unwrap(), linear);
    }

    #[test]
    fn pitch_mode_pads_rows() {
        let mut s = Surface::new(3, 2, 4).with_tile_mode(TileMode::Pitch);
        s.round_pitch = true;
        let tiled = swizzle(&s, &[1u8; 24]).unwrap();
        assert_eq!(tiled.len(), 64);
        assert_eq!(&tiled[12..32], &[0u8; 20]);
    }

    #[test]
    fn short_tiled_source_is_an_error() {
        let s = Surface::new(16, 16, 4);
        assert!(matches!(deswizzle(&s, &[0u8; 100]), Err(SwizzleError::SourceTooSmall { .. })));
    }

    #[test]
    fn rejects_degenerate_surface() {
        let s = Surface::new(4, 4, 0);
        assert_eq!(swizzle(&s, &[]), Err(SwizzleError::InvalidSurface("zero bytes per element")));
    }

    #[test]
    fn rejects_pitch_overflow() {
        let s = Surface::new(u32::MAX / 4, 1, 16);
        assert_eq!(deswizzle(&s, &[]), Err(SwizzleError::InvalidSurface("row pitch exceeds 4 GiB")));
    }

    proptest! {
        #[test]
        fn deswizzle_inverts_swizzle(
            width in 1u32..80,
            height in 1u32..80,
            depth in 1u32..3,
            bpp in prop::sample::select(vec![1u32, 2, 4, 8, 16]),
            log2 in 0u32..5,
            pitch in any::<bool>(),
        ) {
            let s = Surface::new(width, height, bpp)
                .with_depth(depth)
                .with_block_height_log2(log2)
                .with_tile_mode(if pitch { TileMode::Pitch } else { TileMode::BlockLinear });
            let linear: Vec<u8> = (0..s.linear_size()).map(|i| (i * 31 % 251) as u8).collect();
            let tiled = swizzle(&s, &linear).unwrap();
            prop_assert_eq!(deswizzle(&s, &tiled).unwrap(), linear);
        }
    }
}
