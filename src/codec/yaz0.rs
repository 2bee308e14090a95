//! Yaz0: Nintendo's LZ77-style scheme with a 16-byte header.
//!
//! ```text
//! [0x00] Magic "Yaz0"                 (4 bytes)
//! [0x04] DecompressedSize             (u32 BE)
//! [0x08] Alignment                    (u32 BE, 0 = unspecified)
//! [0x0C] Reserved                     (u32)
//! [0x10] Groups: 1 flag byte + 8 chunks, MSB first
//!        flag bit 1 => literal byte
//!        flag bit 0 => back-reference:
//!          NR RR        (n = N + 2, distance = RRR + 1)      when N != 0
//!          0R RR NN     (n = NN + 0x12)                      when N == 0
//! ```
//!
//! The alignment field is a per-file parameter consumed by the game's
//! allocator. It is captured on decompression and written back unchanged.

use std::io::Write;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::{CodecError, CompressionFormat};
use crate::stream::Stream;

pub const YAZ0_MAGIC: &[u8; 4] = b"Yaz0";
pub const YAZ0_HEADER_SIZE: usize = 0x10;

const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 0xFF + 0x12;
const MAX_DISTANCE: usize = 0x1000;
const MAX_PREALLOC: usize = 64 << 20;

/// Default match-search effort (0 = literals only, 9 = full window).
pub const DEFAULT_YAZ0_LEVEL: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Yaz0Codec {
    pub alignment: u32,
    pub level:     u32,
}

impl Default for Yaz0Codec {
    fn default() -> Self {
        Self { alignment: 0, level: DEFAULT_YAZ0_LEVEL }
    }
}

impl Yaz0Codec {
    pub fn with_alignment(alignment: u32) -> Self {
        Self { alignment, ..Self::default() }
    }

    fn window(&self) -> usize {
        MAX_DISTANCE * self.level.min(9) as usize / 9
    }
}

impl CompressionFormat for Yaz0Codec {
    fn name(&self) -> &'static str { "yaz0" }

    fn identify(&self, stream: &mut Stream, _file_name: &str) -> bool {
        matches!(stream.peek::<4>(), Ok(m) if m == YAZ0_MAGIC)
    }

    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        decompress(data)
    }

    fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        compress(data, self.alignment, self.window())
    }

    fn parameters_from(&self, header: &[u8]) -> Option<Arc<dyn CompressionFormat>> {
        if header.len() < 12 || &header[..4] != YAZ0_MAGIC {
            return None;
        }
        Some(Arc::new(Yaz0Codec {
            alignment: BigEndian::read_u32(&header[8..12]),
            level:     self.level,
        }))
    }
}

fn truncated() -> CodecError {
    CodecError::Decompression("truncated yaz0 stream".into())
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() < YAZ0_HEADER_SIZE || &data[..4] != YAZ0_MAGIC {
        return Err(CodecError::Decompression("missing yaz0 header".into()));
    }
    let size = BigEndian::read_u32(&data[4..8]) as usize;
    let mut out = Vec::with_capacity(size.min(MAX_PREALLOC));
    let mut pos = YAZ0_HEADER_SIZE;

    while out.len() < size {
        let mut code = *data.get(pos).ok_or_else(truncated)?;
        pos += 1;

        for _ in 0..8 {
            if out.len() >= size {
                break;
            }
            if code & 0x80 != 0 {
                out.push(*data.get(pos).ok_or_else(truncated)?);
                pos += 1;
            } else {
                let b1 = *data.get(pos).ok_or_else(truncated)? as usize;
                let b2 = *data.get(pos + 1).ok_or_else(truncated)? as usize;
                pos += 2;

                let distance = ((b1 & 0x0F) << 8 | b2) + 1;
                let count = match b1 >> 4 {
                    0 => {
                        let n = *data.get(pos).ok_or_else(truncated)? as usize;
                        pos += 1;
                        n + 0x12
                    }
                    n => n + 2,
                };
                if distance > out.len() {
                    return Err(CodecError::Decompression(format!(
                        "yaz0 back-reference {distance} exceeds output length {}",
                        out.len()
                    )));
                }
                // Byte-by-byte: source and destination may overlap.
                let from = out.len() - distance;
                for i in 0..count.min(size - out.len()) {
                    let b = out[from + i];
                    out.push(b);
                }
            }
            code <<= 1;
        }
    }
    Ok(out)
}

pub fn compress(src: &[u8], alignment: u32, window: usize) -> Result<Vec<u8>, CodecError> {
    let size = u32::try_from(src.len())
        .map_err(|_| CodecError::Compression("yaz0 input exceeds 4 GiB".into()))?;

    let mut out = Vec::with_capacity(YAZ0_HEADER_SIZE + src.len() + src.len() / 8 + 1);
    out.write_all(YAZ0_MAGIC)?;
    out.write_u32::<BigEndian>(size)?;
    out.write_u32::<BigEndian>(alignment)?;
    out.write_u32::<BigEndian>(0)?;

    let mut pos = 0;
    while pos < src.len() {
        let flag_at = out.len();
        out.push(0);
        let mut flags = 0u8;

        for bit in 0..8 {
            if pos >= src.len() {
                break;
            }
            let (len, distance) = find_match(src, pos, window);
            if len >= MIN_MATCH {
                let d = distance - 1;
                if len >= 0x12 {
                    out.push((d >> 8) as u8);
                    out.push(d as u8);
                    out.push((len - 0x12) as u8);
                } else {
                    out.push((((len - 2) << 4) | (d >> 8)) as u8);
                    out.push(d as u8);
                }
                pos += len;
            } else {
                flags |= 0x80 >> bit;
                out.push(src[pos]);
                pos += 1;
            }
        }
        out[flag_at] = flags;
    }
    Ok(out)
}

/// Longest earlier occurrence of `src[pos..]` within `window` bytes.
fn find_match(src: &[u8], pos: usize, window: usize) -> (usize, usize) {
    let max_len = (src.len() - pos).min(MAX_MATCH);
    if max_len < MIN_MATCH || window == 0 {
        return (0, 0);
    }
    let mut best = (0, 0);
    for candidate in (pos.saturating_sub(window)..pos).rev() {
        let mut len = 0;
        while len < max_len && src[candidate + len] == src[pos + len] {
            len += 1;
        }
        if len > best.0 {
            best = (len, pos - candidate);
            if len == max_len {
                break;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_literals_and_backrefs() {
        // "abcabcabc": 3 literals + one 6-byte back-reference at distance 3.
        let mut data = b"Yaz0".to_vec();
        data.extend_from_slice(&9u32.to_be_bytes());
        data.extend_from_slice(&[0; 8]);
        data.push(0b1110_0000);
        data.extend_from_slice(b"abc");
        data.push((6 - 2) << 4);
        data.push(2);
        assert_eq!(decompress(&data).unwrap(), b"abcabcabc");
    }

    #[test]
    fn long_runs_use_three_byte_references() {
        let src = vec![0x41u8; 1000];
        let packed = compress(&src, 0, MAX_DISTANCE).unwrap();
        assert!(packed.len() < 40);
        assert_eq!(decompress(&packed).unwrap(), src);
    }

    #[test]
    fn alignment_is_captured_from_header() {
        let packed = Yaz0Codec::with_alignment(0x80).compress_bytes(b"hello hello").unwrap();
        let codec = Yaz0Codec::default().parameters_from(&packed[..16]).unwrap();
        let repacked = codec.compress_bytes(b"hello hello").unwrap();
        assert_eq!(BigEndian::read_u32(&repacked[8..12]), 0x80);
    }

    #[test]
    fn rejects_out_of_range_reference() {
        let mut data = b"Yaz0".to_vec();
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(&[0; 8]);
        data.extend_from_slice(&[0x00, 0x20, 0x10]);
        assert!(decompress(&data).is_err());
    }
}
