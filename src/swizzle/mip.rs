//! Mip-chain and array-layer bookkeeping for tiled texture images.
//!
//! A tiled image stores its array layers back to back, each layer taking
//! `image_size / array_count` bytes. Inside a layer the mip levels follow
//! each other, every level starting on a 512-byte boundary. Small mips use
//! a reduced block height: each time a level's height in blocks rounds to
//! fewer lines than one full block, the block height halves.

use crate::texture::{TexFormat, TextureInfo};

use super::{
    block_height, block_height_log2, deswizzle, div_round_up, pow2_round_up, swizzle, Surface,
    SwizzleError, TileMode, GOB_HEIGHT, GOB_SIZE, GOB_WIDTH,
};

/// Byte offsets of every mip level of every array layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipLayout {
    /// Per array layer, the offset of each mip relative to the layer start.
    pub mip_offsets: Vec<Vec<u32>>,
    /// Offset of each array layer inside the image.
    pub layer_offsets: Vec<u32>,
    /// Effective block height log2 of each mip level.
    pub mip_block_height_log2: Vec<u32>,
    /// Tiled bytes one layer's mip chain occupies.
    pub layer_size: u32,
}

impl MipLayout {
    /// Absolute offset of `(array, mip)`.
    pub fn offset(&self, array: u32, mip: u32) -> Option<u32> {
        let layer = *self.layer_offsets.get(array as usize)?;
        let mip = *self.mip_offsets.get(array as usize)?.get(mip as usize)?;
        Some(layer + mip)
    }
}

/// Derived or explicit block height log2 of the base level.
fn base_block_height_log2(format: TexFormat, height: u32, explicit: Option<u32>) -> u32 {
    explicit.unwrap_or_else(|| block_height_log2(block_height(div_round_up(height, format.block_height()))))
}

fn layout(
    format:      TexFormat,
    width:       u32,
    height:      u32,
    depth:       u32,
    array_count: u32,
    mip_count:   u32,
    image_size:  u32,
    base_log2:   u32,
) -> Result<MipLayout, SwizzleError> {
    let bpp = format.bytes_per_pixel();
    let (blk_w, blk_h, blk_d) = (format.block_width(), format.block_height(), format.block_depth());
    let lines_per_block_height = (1u32 << base_log2) * GOB_HEIGHT;
    let array_count = array_count.max(1);

    let mut offsets = Vec::with_capacity(mip_count as usize);
    let mut log2s = Vec::with_capacity(mip_count as usize);
    let mut surface_size = 0u64;
    let mut shift = 0u32;

    for mip in 0..mip_count {
        let w = (width >> mip).max(1);
        let h = (height >> mip).max(1);
        let d = (depth >> mip).max(1);

        if pow2_round_up(div_round_up(h, blk_h)) < lines_per_block_height {
            shift += 1;
        }
        let mip_log2 = base_log2.saturating_sub(shift);

        surface_size = align_to(surface_size, GOB_SIZE as u64);
        offsets.push(u32::try_from(surface_size).map_err(|_| too_large())?);
        log2s.push(mip_log2);

        let pitch = align_to(div_round_up(w, blk_w) as u64 * bpp as u64, GOB_WIDTH as u64);
        let rows = align_to(div_round_up(h, blk_h) as u64, ((1u64 << mip_log2) * GOB_HEIGHT as u64).max(1));
        surface_size += pitch * rows * div_round_up(d, blk_d) as u64;
    }

    let stride = image_size / array_count;
    Ok(MipLayout {
        mip_offsets: vec![offsets; array_count as usize],
        layer_offsets: (0..array_count).map(|a| a * stride).collect(),
        mip_block_height_log2: log2s,
        layer_size: u32::try_from(surface_size).map_err(|_| too_large())?,
    })
}

fn too_large() -> SwizzleError {
    SwizzleError::InvalidSurface("texture exceeds 4 GiB")
}

fn align_to(x: u64, align: u64) -> u64 {
    x.div_ceil(align) * align
}

/// Mip offsets for a texture whose tiled image is `image_size` bytes.
pub fn mip_layout(
    format:      TexFormat,
    width:       u32,
    height:      u32,
    depth:       u32,
    array_count: u32,
    mip_count:   u32,
    image_size:  u32,
) -> Result<MipLayout, SwizzleError> {
    let log2 = base_block_height_log2(format, height, None);
    layout(format, width, height, depth, array_count, mip_count, image_size, log2)
}

fn texture_layout(tex: &TextureInfo, image_size: u32) -> Result<MipLayout, SwizzleError> {
    let log2 = base_block_height_log2(tex.format, tex.height, tex.block_height_log2);
    layout(tex.format, tex.width, tex.height, tex.depth, tex.array_count, tex.mip_count, image_size, log2)
}

fn mip_surface(tex: &TextureInfo, mip: u32, log2: u32) -> Surface {
    Surface::for_format(tex.format, (tex.width >> mip).max(1), (tex.height >> mip).max(1))
        .with_depth((tex.depth >> mip).max(1))
        .with_block_height_log2(log2)
        .with_tile_mode(if tex.linear { TileMode::Pitch } else { TileMode::BlockLinear })
}

/// One deswizzled slice of a texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub array: u32,
    pub mip:   u32,
    pub depth: u32,
    pub data:  Vec<u8>,
}

/// Deswizzle the `(array, mip, depth)` slice of `image`, trimmed to the
/// mip's unpadded size.
pub fn try_extract_slice(
    tex:   &TextureInfo,
    image: &[u8],
    array: u32,
    mip:   u32,
    depth: u32,
) -> Result<Vec<u8>, SwizzleError> {
    let out_of_range = SwizzleError::SliceOutOfRange { array, mip, depth };
    if array >= tex.array_count.max(1) || mip >= tex.mip_count || depth >= (tex.depth >> mip).max(1) {
        return Err(out_of_range);
    }
    let image_size = u32::try_from(image.len()).map_err(|_| SwizzleError::InvalidSurface("image exceeds 4 GiB"))?;
    let layout = texture_layout(tex, image_size)?;
    let first = layout.mip_offsets[array as usize][0];
    let mip_offset = layout.mip_offsets[array as usize][mip as usize];
    let start = layout.offset(array, mip).ok_or(out_of_range)? as usize;

    let mip_len = ((first as u64 + image_size as u64).saturating_sub(mip_offset as u64) / tex.array_count.max(1) as u64) as usize;
    let end = (start + mip_len).min(image.len());
    let data = image.get(start..end).ok_or(SwizzleError::SourceTooSmall { needed: start, actual: image.len() })?;

    let surface = mip_surface(tex, mip, layout.mip_block_height_log2[mip as usize]);
    let linear = deswizzle(&surface, data)?;

    let w = (tex.width >> mip).max(1);
    let h = (tex.height >> mip).max(1);
    let size = tex.format.image_size(w, h) as usize;
    let from = depth as usize * size;
    Ok(linear[from..from + size].to_vec())
}

/// Like [`try_extract_slice`], but a failure yields an empty buffer for this
/// slice only. Callers must check for empty output.
pub fn extract_slice(tex: &TextureInfo, image: &[u8], array: u32, mip: u32, depth: u32) -> Vec<u8> {
    match try_extract_slice(tex, image, array, mip, depth) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(array, mip, depth, error = %e, "failed to extract texture slice");
            Vec::new()
        }
    }
}

/// Every slice, array-major then mip then depth. Failed slices are empty.
pub fn extract_all(tex: &TextureInfo, image: &[u8]) -> Vec<Slice> {
    let mut out = Vec::new();
    for array in 0..tex.array_count.max(1) {
        for mip in 0..tex.mip_count {
            for depth in 0..(tex.depth >> mip).max(1) {
                out.push(Slice { array, mip, depth, data: extract_slice(tex, image, array, mip, depth) });
            }
        }
    }
    out
}

/// Build a tiled image from linear mip data, the inverse of [`extract_all`].
///
/// `levels` holds, array-major, one buffer per `(array, mip)` containing all
/// depth slices of that mip back to back.
pub fn assemble_image(tex: &TextureInfo, levels: &[Vec<u8>]) -> Result<Vec<u8>, SwizzleError> {
    let arrays = tex.array_count.max(1);
    if levels.len() != (arrays * tex.mip_count) as usize {
        return Err(SwizzleError::InvalidSurface("level count does not match array and mip count"));
    }
    let layer_size = texture_layout(tex, 0)?.layer_size;
    let image_size = layer_size.checked_mul(arrays).ok_or_else(too_large)?;
    let layout = texture_layout(tex, image_size)?;

    let mut image = vec![0u8; image_size as usize];
    for array in 0..arrays {
        for mip in 0..tex.mip_count {
            let surface = mip_surface(tex, mip, layout.mip_block_height_log2[mip as usize]);
            let tiled = swizzle(&surface, &levels[(array * tex.mip_count + mip) as usize])?;
            let start = layout.offset(array, mip).ok_or(SwizzleError::SliceOutOfRange { array, mip, depth: 0 })?;
            let start = start as usize;
            image[start..start + tiled.len()].copy_from_slice(&tiled);
        }
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    #[test]
    fn offsets_start_at_zero_and_increase() {
        let layout = mip_layout(TexFormat::Rgba8Unorm, 256, 128, 1, 2, 8, 0).unwrap();
        for offsets in &layout.mip_offsets {
            assert_eq!(offsets[0], 0);
            for pair in offsets.windows(2) {
                assert!(pair[1] > pair[0]);
                assert_eq!(pair[1] % GOB_SIZE, 0);
            }
        }
    }

    #[test]
    fn block_height_shrinks_for_small_mips() {
        let layout = mip_layout(TexFormat::Rgba8Unorm, 256, 256, 1, 1, 6, 0).unwrap();
        // 256 rows => 16 GOBs per block (128 lines). Mip 2 is the first below that.
        assert_eq!(layout.mip_block_height_log2, vec![4, 4, 3, 2, 1, 0]);
        assert_eq!(layout.mip_offsets[0][1], 256 * 4 * 256);
    }

    #[test]
    fn layers_are_spaced_by_image_share() {
        let layout = mip_layout(TexFormat::Bc1Unorm, 64, 64, 1, 3, 1, 3 * 4096).unwrap();
        assert_eq!(layout.layer_offsets, vec![0, 4096, 8192]);
        assert_eq!(layout.offset(2, 0), Some(8192));
        assert_eq!(layout.offset(3, 0), None);
    }

    #[test]
    fn slices_roundtrip_through_assembled_image() {
        let tex = TextureInfo::new(TexFormat::Rgba8Unorm, 40, 24).with_mips(3).with_array(2);
        let levels: Vec<Vec<u8>> = (0..2)
            .flat_map(|a| (0..3).map(move |m| (a, m)))
            .map(|(a, m)| pattern(tex.format.image_size(40 >> m, 24 >> m) as usize, a * 10 + m))
            .collect();
        let image = assemble_image(&tex, &levels).unwrap();

        let slices = extract_all(&tex, &image);
        assert_eq!(slices.len(), 6);
        for (slice, expected) in slices.iter().zip(&levels) {
            assert_eq!(&slice.data, expected, "array {} mip {}", slice.array, slice.mip);
        }
    }

    #[test]
    fn bc_slices_are_trimmed_to_mip_size() {
        let tex = TextureInfo::new(TexFormat::Bc3Unorm, 64, 64).with_mips(4);
        let levels: Vec<Vec<u8>> = (0..4)
            .map(|m| pattern(tex.format.image_size(64 >> m, 64 >> m) as usize, m as u8))
            .collect();
        let image = assemble_image(&tex, &levels).unwrap();
        let mip3 = extract_slice(&tex, &image, 0, 3, 0);
        assert_eq!(mip3.len(), 2 * 2 * 16);
        assert_eq!(mip3, levels[3]);
    }

    #[test]
    fn failed_slice_is_empty_not_fatal() {
        let tex = TextureInfo::new(TexFormat::Rgba8Unorm, 64, 64).with_mips(2);
        // Far too small for mip 0.
        assert!(extract_slice(&tex, &[0u8; 64], 0, 0, 0).is_empty());
        assert!(extract_slice(&tex, &[0u8; 64], 0, 5, 0).is_empty());
        assert!(matches!(
            try_extract_slice(&tex, &[0u8; 64], 1, 0, 0),
            Err(SwizzleError::SliceOutOfRange { array: 1, .. })
        ));
    }

    #[test]
    fn oversized_texture_fails_without_panicking() {
        // The base level alone is exactly 4 GiB.
        let tex = TextureInfo::new(TexFormat::Rgba32Float, 16384, 16384);
        assert!(extract_slice(&tex, &[0u8; 16], 0, 0, 0).is_empty());
        assert_eq!(
            try_extract_slice(&tex, &[0u8; 16], 0, 0, 0),
            Err(SwizzleError::InvalidSurface("texture exceeds 4 GiB"))
        );
        assert!(mip_layout(TexFormat::Rgba32Float, 16384, 16384, 1, 1, 1, 0).is_err());
        // Each layer fits, five of them do not.
        let layers = TextureInfo::new(TexFormat::Rgba32Float, 8192, 8192).with_array(5);
        assert!(matches!(
            assemble_image(&layers, &vec![Vec::new(); 5]),
            Err(SwizzleError::InvalidSurface(_))
        ));
    }

    #[test]
    fn depth_slices_are_addressable() {
        let tex = TextureInfo::new(TexFormat::R8Unorm, 16, 16).with_depth(2);
        let level = pattern(16 * 16 * 2, 3);
        let image = assemble_image(&tex, &[level.clone()]).unwrap();
        assert_eq!(extract_slice(&tex, &image, 0, 0, 1), &level[256..]);
    }
}
