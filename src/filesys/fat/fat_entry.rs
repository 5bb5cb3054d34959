//! FAT entry encodings and cluster sentinels

use super::boot_sector::{FatType, Volume};
use super::constants::*;
use crate::filesys::Cluster;

/// Cluster id of the fixed FAT16 root region
pub const ROOT_REGION: Cluster = 0;

/// First cluster of the data region
pub const FIRST_DATA_CLUSTER: Cluster = 2;

/// Normalized "no next cluster" value for both FAT widths
pub const INVALID_CLUSTER: Cluster = 0x0FFF_FFF7;

/// Passed to `concatenate` to terminate a chain
pub const END_OF_CHAIN: Cluster = 0x0FFF_FFFF;

/// Returns true for clusters that address the data region
pub fn is_valid(cluster: Cluster) -> bool {
    (FIRST_DATA_CLUSTER..INVALID_CLUSTER).contains(&cluster)
}

/// Raw value of one FAT slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatEntry {
    /// Next cluster, free marker (0) or an end/bad encoding
    pub cluster: u32,
}

impl FatEntry {
    pub const FREE: FatEntry = FatEntry { cluster: 0 };

    /// Decodes the entry at `offset` of a FAT sector
    pub fn read(fat_type: FatType, sector: &[u8; SECTOR_SIZE], offset: usize) -> Self {
        let cluster = match fat_type {
            FatType::Fat32 => read_u32(sector, offset) & FAT32_MASK,
            _ => read_u16(sector, offset) as u32,
        };
        Self { cluster }
    }

    /// Stores the entry at `offset`, keeping the reserved top nibble of FAT32 slots
    pub fn write(self, fat_type: FatType, sector: &mut [u8; SECTOR_SIZE], offset: usize) {
        match fat_type {
            FatType::Fat32 => {
                let old = read_u32(sector, offset);
                write_u32(sector, offset, (old & !FAT32_MASK) | (self.cluster & FAT32_MASK));
            }
            _ => write_u16(sector, offset, self.cluster as u16),
        }
    }

    /// Entry linking to `to`; `END_OF_CHAIN` becomes the width-specific marker
    pub fn link(fat_type: FatType, to: Cluster) -> Self {
        let cluster = if to >= INVALID_CLUSTER {
            match fat_type {
                FatType::Fat32 => FAT32_EOC,
                _ => FAT16_EOC,
            }
        } else {
            to
        };
        Self { cluster }
    }

    /// Returns true if this cluster is unused/free
    pub fn is_free(&self) -> bool {
        self.cluster == 0
    }

    /// Returns true if this entry marks the end of a cluster chain (or a bad cluster)
    pub fn is_end_of_chain(&self, fat_type: FatType) -> bool {
        match fat_type {
            FatType::Fat32 => self.cluster >= INVALID_CLUSTER,
            _ => self.cluster >= FAT16_RESERVED,
        }
    }

    /// Follow-on cluster, with free, reserved, bad, end and out-of-range
    /// values all collapsed to `INVALID_CLUSTER`
    pub fn next_cluster(&self, volume: &Volume) -> Cluster {
        if self.is_end_of_chain(volume.fat_type)
            || self.cluster < FIRST_DATA_CLUSTER
            || self.cluster > volume.last_cluster()
        {
            INVALID_CLUSTER
        } else {
            self.cluster
        }
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
