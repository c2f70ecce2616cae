//! Definition section codec (§3, §4.9): written once at tracebuffer-create
//! time, read-only afterward. Holds the tracebuffer's name and, for files
//! written since the "extended" revision, a small self-checksummed block
//! recording its source kind. Older (V1) definition sections simply don't
//! have that block; this module treats anything without a recognizable
//! extended magic as such a legacy section rather than as corrupt.

use crate::crc8::crc8_chain;
use crate::error::{Error, Result};

pub const EXT_MAGIC: [u8; 8] = *b"CLLTK_EX";
pub const EXT_VERSION: u8 = 2;
const EXT_BLOCK_LEN: usize = 8 + 1 + 1 + 5 + 1; // magic+version+source+reserved+crc

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Unknown = 0,
    Userspace = 1,
    Kernel = 2,
    Tty = 3,
}

impl SourceKind {
    fn from_u8(b: u8) -> SourceKind {
        match b {
            1 => SourceKind::Userspace,
            2 => SourceKind::Kernel,
            3 => SourceKind::Tty,
            _ => SourceKind::Unknown,
        }
    }
}

/// Bytes needed for a definition section body (everything after the file
/// header) holding a name of `name_len` bytes plus the extended block.
pub fn calculate_size(name_len: usize) -> usize {
    8 + (name_len + 1) + EXT_BLOCK_LEN
}

pub struct Definition<'a> {
    region: &'a mut [u8],
}

impl<'a> Definition<'a> {
    /// Writes `body_size`, the NUL-terminated name, and a fresh extended
    /// block recording `source_kind`. `region` must be at least
    /// `calculate_size(name.len())` bytes.
    pub fn init(region: &'a mut [u8], name: &str, source_kind: SourceKind) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::BadHeader {
                inner: "definition section name must be non-empty".into(),
            });
        }
        let needed = calculate_size(name.len());
        if region.len() < needed {
            return Err(Error::BadHeader {
                inner: "definition section region too small".into(),
            });
        }

        let body_len = (name.len() + 1 + EXT_BLOCK_LEN) as u64;
        region[0..8].copy_from_slice(&body_len.to_le_bytes());

        let name_off = 8;
        region[name_off..name_off + name.len()].copy_from_slice(name.as_bytes());
        region[name_off + name.len()] = 0;

        let ext_off = name_off + name.len() + 1;
        region[ext_off..ext_off + 8].copy_from_slice(&EXT_MAGIC);
        region[ext_off + 8] = EXT_VERSION;
        region[ext_off + 9] = source_kind as u8;
        region[ext_off + 10..ext_off + 15].copy_from_slice(&[0u8; 5]);
        let crc = crc8_chain(&[
            &region[name_off..name_off + name.len() + 1],
            &region[ext_off..ext_off + 15],
        ]);
        region[ext_off + 15] = crc;

        Ok(Definition { region })
    }

    pub fn open(region: &'a mut [u8]) -> Result<Self> {
        if region.len() < 9 {
            return Err(Error::BadHeader {
                inner: "definition section region smaller than a body_size + empty name".into(),
            });
        }
        Ok(Definition { region })
    }

    fn name_len(&self) -> usize {
        self.region[8..]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.region.len() - 8)
    }

    pub fn get_name(&self) -> &str {
        let len = self.name_len();
        std::str::from_utf8(&self.region[8..8 + len]).unwrap_or("")
    }

    fn ext_offset(&self) -> usize {
        8 + self.name_len() + 1
    }

    fn extended(&self) -> Option<&[u8]> {
        let off = self.ext_offset();
        if off + EXT_BLOCK_LEN > self.region.len() {
            return None;
        }
        let block = &self.region[off..off + EXT_BLOCK_LEN];
        if block[0..8] != EXT_MAGIC {
            return None;
        }
        Some(block)
    }

    /// `Unknown` for a legacy (no extended block) section, for a section
    /// whose extended CRC fails, or for an out-of-range stored code.
    pub fn get_source_type(&self) -> SourceKind {
        match self.extended() {
            Some(block) if self.validate_crc() => SourceKind::from_u8(block[9]),
            _ => SourceKind::Unknown,
        }
    }

    /// `true` for a legacy section with no extended block at all (nothing
    /// to validate); for an extended section, `true` iff its stored CRC
    /// matches the recomputed one.
    pub fn validate_crc(&self) -> bool {
        let name_off = 8;
        let name_len = self.name_len();
        match self.extended() {
            None => true,
            Some(block) => {
                let stored = block[15];
                let computed = crc8_chain(&[
                    &self.region[name_off..name_off + name_len + 1],
                    &block[0..15],
                ]);
                stored == computed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_name_and_source() {
        let mut region = vec![0u8; calculate_size(3)];
        Definition::init(&mut region, "TTY", SourceKind::Tty).unwrap();
        let def = Definition::open(&mut region).unwrap();
        assert_eq!(def.get_name(), "TTY");
        assert_eq!(def.get_source_type(), SourceKind::Tty);
        assert!(def.validate_crc());
    }

    #[test]
    fn flipping_extended_byte_invalidates_crc_and_source() {
        let mut region = vec![0u8; calculate_size(3)];
        Definition::init(&mut region, "TTY", SourceKind::Tty).unwrap();
        let ext_off = 8 + 3 + 1;
        region[ext_off + 9] ^= 0xFF; // corrupt the source-kind byte
        let def = Definition::open(&mut region).unwrap();
        assert!(!def.validate_crc());
        assert_eq!(def.get_source_type(), SourceKind::Unknown);
    }

    #[test]
    fn legacy_section_with_no_extended_block_validates_true() {
        let mut region = vec![0u8; 8 + 4]; // body_size + "abc\0", nothing after
        region[0..8].copy_from_slice(&4u64.to_le_bytes());
        region[8..11].copy_from_slice(b"abc");
        region[11] = 0;
        let def = Definition::open(&mut region).unwrap();
        assert_eq!(def.get_name(), "abc");
        assert!(def.validate_crc());
        assert_eq!(def.get_source_type(), SourceKind::Unknown);
    }

    #[test]
    fn rejects_empty_name() {
        let mut region = vec![0u8; calculate_size(0)];
        assert!(Definition::init(&mut region, "", SourceKind::Unknown).is_err());
    }
}
