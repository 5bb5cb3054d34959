//! Directory entry and long file name fragment decoding

use super::constants::*;
use super::fat_entry::{read_u16, read_u32};
use crate::filesys::{Cluster, FsError};
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Attribute byte of a directory entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        /// Marks a long file name fragment, compared as a whole byte
        const LONG_NAME = Self::READ_ONLY.bits()
            | Self::HIDDEN.bits()
            | Self::SYSTEM.bits()
            | Self::VOLUME_ID.bits();
    }
}

/// VFAT checksum of an 11-byte short name as stored on disk
pub fn lfn_checksum(raw: &[u8]) -> u8 {
    raw.iter()
        .take(DIR_NAME_LENGTH)
        .fold(0u8, |sum, &byte| sum.rotate_right(1).wrapping_add(byte))
}

/// Space padded 8.3 name
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName([u8; DIR_NAME_LENGTH]);

impl ShortName {
    pub const fn from_bytes(raw: [u8; DIR_NAME_LENGTH]) -> Self {
        Self(raw)
    }

    /// Converts `NAME.EXT` to the stored form, upper-casing ASCII letters
    pub fn parse(name: &str) -> Result<Self, FsError> {
        let mut raw = [b' '; DIR_NAME_LENGTH];
        if name == "." || name == ".." {
            raw[..name.len()].copy_from_slice(name.as_bytes());
            return Ok(Self(raw));
        }

        let (base, ext) = match name.rfind('.') {
            Some(dot) => (&name[..dot], &name[dot + 1..]),
            None => (name, ""),
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 {
            return Err(FsError::InvalidName);
        }

        let (base_slots, ext_slots) = raw.split_at_mut(8);
        for (slot, byte) in base_slots
            .iter_mut()
            .zip(base.bytes())
            .chain(ext_slots.iter_mut().zip(ext.bytes()))
        {
            if !is_short_name_byte(byte) {
                return Err(FsError::InvalidName);
            }
            *slot = byte.to_ascii_uppercase();
        }
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; DIR_NAME_LENGTH] {
        &self.0
    }

    pub fn checksum(&self) -> u8 {
        lfn_checksum(&self.0)
    }
}

fn is_short_name_byte(byte: u8) -> bool {
    byte.is_ascii_graphic() && !b"\"*+,./:;<=>?[\\]|".contains(&byte)
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trimmed =
            |part: &[u8]| part.len() - part.iter().rev().take_while(|&&b| b == b' ').count();
        let (base, ext) = self.0.split_at(8);
        for &byte in &base[..trimmed(base)] {
            write!(f, "{}", byte as char)?;
        }
        let ext = &ext[..trimmed(ext)];
        if !ext.is_empty() {
            write!(f, ".")?;
            for &byte in ext {
                write!(f, "{}", byte as char)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({})", self)
    }
}

/// How a raw 32-byte slot is to be treated while scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// No further entries in this directory
    End,
    Deleted,
    Live,
}

impl Slot {
    pub fn classify(raw: &[u8]) -> Self {
        match raw[0] {
            END_OF_DIRECTORY => Slot::End,
            DELETED_ENTRY_MARKER => Slot::Deleted,
            _ => Slot::Live,
        }
    }
}

/// Decoded short directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: ShortName,
    pub attributes: Attributes,
    /// First cluster, 0 for empty files and for the root directory
    pub cluster: Cluster,
    /// File size in bytes
    pub size: u32,
}

impl DirEntry {
    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; DIR_NAME_LENGTH];
        name.copy_from_slice(&raw[..DIR_NAME_LENGTH]);
        if name[0] == ESCAPED_E5 {
            name[0] = DELETED_ENTRY_MARKER;
        }
        let high = read_u16(raw, DIR_CLUSTER_HIGH) as u32;
        let low = read_u16(raw, DIR_CLUSTER_LOW) as u32;

        Self {
            name: ShortName(name),
            attributes: Attributes::from_bits_retain(raw[DIR_ATTRIBUTES]),
            cluster: high << 16 | low,
            size: read_u32(raw, DIR_FILE_SIZE),
        }
    }

    /// Returns true if entry is a directory
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes.contains(Attributes::VOLUME_ID)
    }

    /// Hidden and system entries never match a name search
    pub fn is_concealed(&self) -> bool {
        self.attributes
            .intersects(Attributes::HIDDEN | Attributes::SYSTEM)
    }
}

/// One 13-unit piece of a long file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfnFragment {
    /// Sequence number with the last-fragment flag
    pub ordinal: u8,
    /// Checksum of the short entry the name belongs to
    pub checksum: u8,
    pub units: [u16; LFN_UNITS_PER_FRAGMENT],
}

impl LfnFragment {
    pub fn decode(raw: &[u8]) -> Self {
        let mut units = [0u16; LFN_UNITS_PER_FRAGMENT];
        for (unit, &offset) in units.iter_mut().zip(LFN_UNIT_OFFSETS.iter()) {
            *unit = read_u16(raw, offset);
        }
        Self {
            ordinal: raw[0],
            checksum: raw[LFN_CHECKSUM],
            units,
        }
    }

    /// 1-based position of this fragment in the name
    pub fn sequence(&self) -> u8 {
        self.ordinal & LFN_ORDINAL_MASK
    }

    /// Stored first, holds the end of the name
    pub fn is_last(&self) -> bool {
        self.ordinal & LFN_LAST_FRAGMENT != 0
    }

    /// Index of the first unit of this fragment within the whole name
    pub fn name_offset(&self) -> usize {
        (self.sequence() as usize).saturating_sub(1) * LFN_UNITS_PER_FRAGMENT
    }
}

/// A live directory slot as reported to a dump consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Entry(DirEntry),
    LongName(LfnFragment),
}

impl Record {
    pub fn decode(raw: &[u8]) -> Self {
        if raw[DIR_ATTRIBUTES] == Attributes::LONG_NAME.bits() {
            Record::LongName(LfnFragment::decode(raw))
        } else {
            Record::Entry(DirEntry::decode(raw))
        }
    }
}
