//! SARC (SEAD ARChive), the general-purpose Nintendo container.
//!
//! ## Layout
//! ```text
//! [0x00] SARC header  (0x14 bytes)
//! [0x14] SFAT header  (0x0C bytes) + FAT entries (FileCount × 0x10)
//! [...]  SFNT header  (0x08 bytes) + null-terminated filenames (4-byte aligned)
//! [...]  Data section (begins at offset given in SARC header)
//! ```
//!
//! The header size and BOM fields are always little-endian; every other
//! multi-byte field follows the BOM (`0xFFFE` little, `0xFEFF` big).
//! FAT entries are sorted by filename hash, so saving re-sorts them.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::format::{ArchiveEntry, ArchiveFile, Capability, FileFormat, FileInfo, FormatError};
use crate::stream::Stream;

pub const MAGIC: &[u8; 4] = b"SARC";
pub const DEFAULT_HASH_MULTIPLIER: u32 = 0x65;
pub const DEFAULT_ALIGNMENT: u32 = 0x80;
const MAX_FILES: usize = 0x3FFF;

const SARC_HEADER_LEN: usize = 0x14;
const SFAT_HEADER_LEN: usize = 0x0C;
const SFAT_ENTRY_LEN: usize = 0x10;
const SFNT_HEADER_LEN: usize = 0x08;
const BOM_LITTLE: u16 = 0xFFFE;
const BOM_BIG: u16 = 0xFEFF;
const NAMED_ENTRY: u32 = 0x0100_0000;

#[derive(Debug)]
pub struct Sarc {
    info: FileInfo,
    pub entries: Vec<ArchiveEntry>,
    pub le: bool,
    /// Header version, normally 0x0100.
    pub version: u16,
    pub hash_multiplier: u32,
    /// Alignment of the data section and of each file in it.
    pub alignment: u32,
    /// Entries stored without a name, keyed by their `0xHHHHHHHH` name.
    unnamed: HashMap<String, u32>,
}

impl Default for Sarc {
    fn default() -> Self {
        Self {
            info: FileInfo::default(),
            entries: Vec::new(),
            le: true,
            version: 0x0100,
            hash_multiplier: DEFAULT_HASH_MULTIPLIER,
            alignment: DEFAULT_ALIGNMENT,
            unnamed: HashMap::new(),
        }
    }
}

impl Sarc {
    pub fn new() -> Self { Self::default() }

    pub fn hash_filename(&self, name: &str) -> u32 {
        sarc_hash(name.as_bytes(), self.hash_multiplier)
    }

    /// Hash stored for an entry. Unnamed entries keep the hash they were
    /// loaded with.
    fn entry_hash(&self, file_name: &str) -> u32 {
        match self.unnamed.get(file_name) {
            Some(&hash) => hash,
            None => self.hash_filename(file_name),
        }
    }

    fn parse<E: ByteOrder>(&mut self, data: &[u8]) -> Result<(), FormatError> {
        let mut r = Cursor::new(data);
        r.set_position(8);
        let _total_size = r.read_u32::<E>()?;
        let data_offset = r.read_u32::<E>()? as usize;
        self.version = r.read_u16::<LittleEndian>()?;
        let _padding = r.read_u16::<LittleEndian>()?;

        expect_magic(&mut r, b"SFAT")?;
        if r.read_u16::<LittleEndian>()? as usize != SFAT_HEADER_LEN {
            return Err(FormatError::Malformed("unexpected SFAT header size".into()));
        }
        let file_count = r.read_u16::<E>()? as usize;
        self.hash_multiplier = r.read_u32::<E>()?;
        if file_count > MAX_FILES {
            return Err(FormatError::Malformed("SARC file count exceeds maximum".into()));
        }

        let mut fat = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let hash = r.read_u32::<E>()?;
            let attrs = r.read_u32::<E>()?;
            let start = r.read_u32::<E>()? as usize;
            let end = r.read_u32::<E>()? as usize;
            fat.push((hash, attrs, start, end));
        }

        expect_magic(&mut r, b"SFNT")?;
        if r.read_u16::<LittleEndian>()? as usize != SFNT_HEADER_LEN {
            return Err(FormatError::Malformed("unexpected SFNT header size".into()));
        }
        let _padding = r.read_u16::<LittleEndian>()?;
        let names = &data[r.position() as usize..];

        self.unnamed.clear();
        self.entries = fat
            .into_iter()
            .map(|(hash, attrs, start, end)| {
                let file_name = if attrs == 0 {
                    let name = format!("0x{hash:08X}");
                    self.unnamed.insert(name.clone(), hash);
                    name
                } else {
                    read_name(names, (attrs & 0x00FF_FFFF) as usize * 4)?
                };
                let body = data
                    .get(data_offset + start..data_offset + end)
                    .ok_or_else(|| FormatError::Malformed(format!("{file_name}: data out of bounds")))?;
                Ok::<_, FormatError>(ArchiveEntry::new(file_name, body.to_vec()))
            })
            .collect::<Result<_, FormatError>>()?;

        self.alignment = (1u32 << (data_offset as u32).trailing_zeros().min(12)).max(4);
        Ok(())
    }

    fn write<E: ByteOrder>(&self, out: &mut dyn Write) -> Result<(), FormatError> {
        if self.entries.len() > MAX_FILES {
            return Err(FormatError::Malformed("SARC file count exceeds maximum".into()));
        }
        let align = self.alignment.max(4) as usize;

        let mut sorted: Vec<(u32, &ArchiveEntry)> =
            self.entries.iter().map(|e| (self.entry_hash(&e.file_name), e)).collect();
        sorted.sort_by_key(|(hash, _)| *hash);

        let mut names = Vec::new();
        let mut attrs = Vec::with_capacity(sorted.len());
        for (_, entry) in &sorted {
            if self.unnamed.contains_key(&entry.file_name) {
                attrs.push(0);
                continue;
            }
            attrs.push(NAMED_ENTRY | (names.len() / 4) as u32);
            names.extend_from_slice(entry.file_name.as_bytes());
            names.push(0);
            names.resize(align_up(names.len(), 4), 0);
        }

        let mut body = Vec::new();
        let mut ranges = Vec::with_capacity(sorted.len());
        for (_, entry) in &sorted {
            body.resize(align_up(body.len(), align), 0);
            let start = body.len();
            body.extend_from_slice(&entry.data);
            ranges.push((start as u32, body.len() as u32));
        }

        let meta_len = SARC_HEADER_LEN
            + SFAT_HEADER_LEN
            + SFAT_ENTRY_LEN * sorted.len()
            + SFNT_HEADER_LEN
            + names.len();
        let data_offset = align_up(meta_len, align);

        out.write_all(MAGIC)?;
        out.write_u16::<LittleEndian>(SARC_HEADER_LEN as u16)?;
        out.write_u16::<LittleEndian>(if self.le { BOM_LITTLE } else { BOM_BIG })?;
        out.write_u32::<E>((data_offset + body.len()) as u32)?;
        out.write_u32::<E>(data_offset as u32)?;
        out.write_u16::<LittleEndian>(self.version)?;
        out.write_u16::<LittleEndian>(0)?;

        out.write_all(b"SFAT")?;
        out.write_u16::<LittleEndian>(SFAT_HEADER_LEN as u16)?;
        out.write_u16::<E>(sorted.len() as u16)?;
        out.write_u32::<E>(self.hash_multiplier)?;
        for (((hash, _), attr), (start, end)) in sorted.iter().zip(&attrs).zip(&ranges) {
            out.write_u32::<E>(*hash)?;
            out.write_u32::<E>(*attr)?;
            out.write_u32::<E>(*start)?;
            out.write_u32::<E>(*end)?;
        }

        out.write_all(b"SFNT")?;
        out.write_u16::<LittleEndian>(SFNT_HEADER_LEN as u16)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_all(&names)?;
        out.write_all(&vec![0u8; data_offset - meta_len])?;
        out.write_all(&body)?;
        Ok(())
    }
}

impl FileFormat for Sarc {
    fn description(&self) -> &'static str { "SARC archive" }

    fn extensions(&self) -> &'static [&'static str] { &["sarc", "pack", "bars", "blarc"] }

    fn identify(&self, _: &FileInfo, stream: &mut Stream) -> bool {
        matches!(stream.peek::<4>(), Ok(m) if m == MAGIC)
    }

    fn load(&mut self, stream: &mut Stream) -> Result<(), FormatError> {
        let data = stream.read_remaining()?;
        if data.len() < SARC_HEADER_LEN || &data[..4] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        if u16::from_le_bytes([data[4], data[5]]) as usize != SARC_HEADER_LEN {
            return Err(FormatError::Malformed("unexpected SARC header size".into()));
        }
        match u16::from_le_bytes([data[6], data[7]]) {
            BOM_LITTLE => {
                self.le = true;
                self.parse::<LittleEndian>(&data)
            }
            BOM_BIG => {
                self.le = false;
                self.parse::<BigEndian>(&data)
            }
            _ => Err(FormatError::Malformed("invalid SARC BOM".into())),
        }
    }

    fn save(&mut self, out: &mut dyn Write) -> Result<(), FormatError> {
        if self.le {
            self.write::<LittleEndian>(out)
        } else {
            self.write::<BigEndian>(out)
        }
    }

    fn info(&self) -> &FileInfo { &self.info }

    fn info_mut(&mut self) -> &mut FileInfo { &mut self.info }

    fn capabilities(&self) -> &'static [Capability] { &[Capability::Archive] }

    fn as_archive(&self) -> Option<&dyn ArchiveFile> { Some(self) }

    fn as_archive_mut(&mut self) -> Option<&mut dyn ArchiveFile> { Some(self) }
}

impl ArchiveFile for Sarc {
    fn entries(&self) -> &[ArchiveEntry] { &self.entries }

    fn entries_mut(&mut self) -> &mut Vec<ArchiveEntry> { &mut self.entries }

    /// Hash-then-name lookup.
    fn find(&self, file_name: &str) -> Option<&ArchiveEntry> {
        let target = self.entry_hash(file_name);
        self.entries
            .iter()
            .find(|e| e.file_name == file_name && self.entry_hash(&e.file_name) == target)
    }
}

/// SARC filename hash. Bytes are sign-extended before accumulating, which
/// matters for non-ASCII paths.
pub fn sarc_hash(name: &[u8], multiplier: u32) -> u32 {
    name.iter()
        .fold(0u32, |h, &b| h.wrapping_mul(multiplier).wrapping_add(b as i8 as u32))
}

fn expect_magic(r: &mut Cursor<&[u8]>, magic: &[u8; 4]) -> Result<(), FormatError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    if &buf != magic {
        return Err(FormatError::InvalidMagic);
    }
    Ok(())
}

fn read_name(table: &[u8], offset: usize) -> Result<String, FormatError> {
    let tail = table
        .get(offset..)
        .ok_or_else(|| FormatError::Malformed(format!("name offset {offset:#x} out of bounds")))?;
    let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(le: bool) -> Sarc {
        let mut sarc = Sarc { le, ..Sarc::default() };
        sarc.entries.push(ArchiveEntry::new("Model/model.bin", b"GMSH mesh data".to_vec()));
        sarc.entries.push(ArchiveEntry::new("Tex/a.bntx", vec![0xAB; 300]));
        sarc.entries.push(ArchiveEntry::new("actor.byml", b"BY".to_vec()));
        sarc
    }

    fn reload(sarc: &mut Sarc) -> Sarc {
        let mut bytes = Vec::new();
        sarc.save(&mut bytes).unwrap();
        let mut out = Sarc::default();
        out.load(&mut Stream::from_bytes(bytes)).unwrap();
        out
    }

    fn sorted_names(sarc: &Sarc) -> Vec<String> {
        let mut names: Vec<String> = sarc.entries.iter().map(|e| e.file_name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn hash_sign_extends() {
        assert_eq!(sarc_hash(b"a", DEFAULT_HASH_MULTIPLIER), 0x61);
        assert_eq!(sarc_hash(b"ab", DEFAULT_HASH_MULTIPLIER), 0x61 * 0x65 + 0x62);
        assert_eq!(sarc_hash(&[0xFF], DEFAULT_HASH_MULTIPLIER), u32::MAX);
    }

    #[test]
    fn saves_and_reloads_both_byte_orders() {
        for le in [true, false] {
            let mut sarc = sample(le);
            let back = reload(&mut sarc);
            assert_eq!(back.le, le);
            assert_eq!(back.version, 0x0100);
            assert_eq!(back.entries.len(), 3);
            assert_eq!(sorted_names(&back), sorted_names(&sarc));
            assert_eq!(back.find("Tex/a.bntx").unwrap().data, vec![0xAB; 300]);
        }
    }

    #[test]
    fn entries_are_stored_in_hash_order() {
        let back = reload(&mut sample(true));
        let hashes: Vec<u32> = back.entries.iter().map(|e| back.hash_filename(&e.file_name)).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn data_is_aligned() {
        let mut bytes = Vec::new();
        sample(true).save(&mut bytes).unwrap();
        let data_offset = u32::from_le_bytes(bytes[0x0C..0x10].try_into().unwrap());
        assert_eq!(data_offset % DEFAULT_ALIGNMENT, 0);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize, bytes.len());
    }

    #[test]
    fn unnamed_entries_get_hash_names() {
        let mut bytes = Vec::new();
        sample(true).save(&mut bytes).unwrap();
        let first = SARC_HEADER_LEN + SFAT_HEADER_LEN;
        let hash = u32::from_le_bytes(bytes[first..first + 4].try_into().unwrap());
        bytes[first + 4..first + 8].copy_from_slice(&[0; 4]);

        let mut sarc = Sarc::default();
        sarc.load(&mut Stream::from_bytes(bytes)).unwrap();
        let name = format!("0x{hash:08X}");
        assert_eq!(sarc.entries[0].file_name, name);
        assert!(sarc.find(&name).is_some());

        // Written back under the original hash, still without a name.
        let mut again = Vec::new();
        sarc.save(&mut again).unwrap();
        assert_eq!(u32::from_le_bytes(again[first..first + 4].try_into().unwrap()), hash);
        assert_eq!(u32::from_le_bytes(again[first + 4..first + 8].try_into().unwrap()), 0);
        let back = reload(&mut sarc);
        assert_eq!(back.entries.len(), 3);
        assert_eq!(back.entries[0].file_name, name);
    }

    #[test]
    fn rejects_bad_bom() {
        let mut bytes = Vec::new();
        sample(true).save(&mut bytes).unwrap();
        bytes[6] = 0;
        let err = Sarc::default().load(&mut Stream::from_bytes(bytes)).unwrap_err();
        assert!(matches!(err, FormatError::Malformed(_)));
    }

    #[test]
    fn truncated_data_is_malformed() {
        let mut bytes = Vec::new();
        sample(true).save(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 10);
        assert!(Sarc::default().load(&mut Stream::from_bytes(bytes)).is_err());
    }
}
