//! Master boot record, BIOS parameter block and FSINFO parsing

use super::cache::FatRegion;
use super::constants::*;
use super::fat_entry::{read_u16, read_u32, FIRST_DATA_CLUSTER, ROOT_REGION};
use crate::filesys::{Cluster, FsError, Sector};
use log::{debug, info, warn};

/// Variant of the allocation table, classified by cluster count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    /// Too few clusters (FAT12) and not handled
    Unknown,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn from_cluster_count(count: u32) -> Self {
        if count < FAT16_MIN_CLUSTERS {
            FatType::Unknown
        } else if count < FAT32_MIN_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// log2 of the width of one FAT entry in bytes
    pub fn entry_shift(self) -> u32 {
        match self {
            FatType::Fat32 => 2,
            _ => 1,
        }
    }
}

fn check_signature(sector: &[u8; SECTOR_SIZE]) -> Result<(), FsError> {
    if read_u16(sector, BOOT_SIGNATURE_OFFSET) != BOOT_SIGNATURE {
        return Err(FsError::Signature);
    }
    Ok(())
}

/// Returns the start sector of the first FAT16/FAT32 partition in an MBR
pub fn find_fat_partition(mbr: &[u8; SECTOR_SIZE]) -> Result<Sector, FsError> {
    check_signature(mbr)?;

    for index in 0..PARTITION_COUNT {
        let record = PARTITION_TABLE_OFFSET + index * PARTITION_RECORD_SIZE;
        let kind = mbr[record + PARTITION_TYPE_OFFSET];
        if PARTITION_TYPES_FAT16.contains(&kind) || PARTITION_TYPES_FAT32.contains(&kind) {
            let start = read_u32(mbr, record + PARTITION_LBA_OFFSET);
            debug!("Partition {} has type {:#04x} at sector {}", index, kind, start);
            return Ok(start);
        }
    }

    Err(FsError::NoPartition)
}

/// Fields of the BIOS parameter block used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    /// Including the boot sector
    pub reserved_sectors: u16,
    pub fat_count: u8,
    /// Zero on FAT32
    pub root_entry_count: u16,
    /// TotSec16, or TotSec32 when the former is zero
    pub total_sectors: u32,
    /// FATSz16, or FATSz32 when the former is zero
    pub fat_size: u32,
    /// FAT32 only
    pub root_cluster: u32,
    /// FAT32 only, relative to the volume start
    pub fsinfo_sector: u16,
}

impl BiosParameterBlock {
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Result<Self, FsError> {
        check_signature(sector)?;

        let bytes_per_sector = read_u16(sector, BPB_BYTES_PER_SECTOR);
        let sectors_per_cluster = sector[BPB_SECTORS_PER_CLUSTER];
        if bytes_per_sector as usize != SECTOR_SIZE || !sectors_per_cluster.is_power_of_two() {
            return Err(FsError::InvalidBpb);
        }

        let total_sectors = match read_u16(sector, BPB_TOTAL_SECTORS_16) {
            0 => read_u32(sector, BPB_TOTAL_SECTORS_32),
            small => small as u32,
        };
        let fat_size = match read_u16(sector, BPB_FAT_SIZE_16) {
            0 => read_u32(sector, BPB_FAT_SIZE_32),
            small => small as u32,
        };
        let fat_count = sector[BPB_FAT_COUNT];
        if fat_size == 0 || fat_count == 0 {
            return Err(FsError::InvalidBpb);
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors: read_u16(sector, BPB_RESERVED_SECTORS),
            fat_count,
            root_entry_count: read_u16(sector, BPB_ROOT_ENTRY_COUNT),
            total_sectors,
            fat_size,
            root_cluster: read_u32(sector, BPB_ROOT_CLUSTER),
            fsinfo_sector: read_u16(sector, BPB_FSINFO_SECTOR),
        })
    }
}

/// Free-cluster hints from the FAT32 FSINFO sector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsInfo {
    pub free_count: Option<u32>,
    pub next_free: Option<Cluster>,
}

impl FsInfo {
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Result<Self, FsError> {
        if read_u32(sector, FSINFO_LEAD_OFFSET) != FSINFO_LEAD_SIGNATURE
            || read_u32(sector, FSINFO_STRUCT_OFFSET) != FSINFO_STRUCT_SIGNATURE
            || read_u32(sector, FSINFO_TRAIL_OFFSET) != FSINFO_TRAIL_SIGNATURE
        {
            return Err(FsError::Signature);
        }

        let known = |value: u32| (value != FSINFO_UNKNOWN).then_some(value);
        Ok(Self {
            free_count: known(read_u32(sector, FSINFO_FREE_COUNT_OFFSET)),
            next_free: known(read_u32(sector, FSINFO_NEXT_FREE_OFFSET)),
        })
    }
}

/// Geometry of a mounted volume. Fixed after mount apart from the
/// free-cluster hints, which only the table walker updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Volume {
    pub fat_type: FatType,
    /// Partition start; every other sector field below is absolute
    pub hidden_sectors: Sector,
    /// log2 of sectors per cluster
    pub cluster_shift: u32,
    pub reserved_sectors: u32,
    pub fat_count: u32,
    pub root_entry_count: u32,
    pub total_sectors: u32,
    /// Sectors per FAT copy
    pub fat_size: u32,
    /// First sector of the primary FAT
    pub fat_start: Sector,
    /// FAT16 root region start (equals `data_start` on FAT32)
    pub root_sector: Sector,
    pub data_start: Sector,
    /// Root directory cluster, `ROOT_REGION` on FAT16
    pub root_cluster: Cluster,
    pub cluster_count: u32,
    pub fsinfo_sector: Option<Sector>,
    pub next_free: Option<Cluster>,
    pub free_count: Option<u32>,
}

impl Volume {
    /// Derives the volume layout and classifies its type. Fails closed on
    /// FAT12-sized volumes and on geometry that does not fit the sector
    /// address space.
    pub fn from_bpb(hidden_sectors: Sector, bpb: &BiosParameterBlock) -> Result<Self, FsError> {
        let cluster_shift = bpb.sectors_per_cluster.trailing_zeros();
        let reserved_sectors = bpb.reserved_sectors as u32;
        let fat_count = bpb.fat_count as u32;
        let root_entry_count = bpb.root_entry_count as u32;

        let root_dir_sectors =
            (root_entry_count * DIR_ENTRY_SIZE as u32).div_ceil(SECTOR_SIZE as u32);
        let (fat_start, fat_end, data_start) = hidden_sectors
            .checked_add(reserved_sectors)
            .and_then(|fat_start| {
                let fat_end = fat_start.checked_add(bpb.fat_size.checked_mul(fat_count)?)?;
                Some((fat_start, fat_end, fat_end.checked_add(root_dir_sectors)?))
            })
            .ok_or(FsError::InvalidBpb)?;
        if hidden_sectors.checked_add(bpb.total_sectors).is_none() {
            return Err(FsError::InvalidBpb);
        }

        let data_offset = data_start - hidden_sectors;
        if bpb.total_sectors <= data_offset {
            return Err(FsError::InvalidBpb);
        }
        let cluster_count = (bpb.total_sectors - data_offset) >> cluster_shift;
        let fat_type = FatType::from_cluster_count(cluster_count);

        let (root_cluster, fsinfo_sector) = match fat_type {
            FatType::Unknown => {
                warn!("{} clusters is too few for FAT16", cluster_count);
                return Err(FsError::Unsupported);
            }
            FatType::Fat16 => (ROOT_REGION, None),
            FatType::Fat32 => {
                let fsinfo = match bpb.fsinfo_sector {
                    0 | 0xFFFF => None,
                    offset => Some(hidden_sectors + offset as u32),
                };
                (bpb.root_cluster, fsinfo)
            }
        };

        // Every cluster needs a slot in one FAT copy
        let slots = (bpb.fat_size as u64) * (SECTOR_SIZE >> fat_type.entry_shift()) as u64;
        if cluster_count as u64 + FIRST_DATA_CLUSTER as u64 > slots {
            warn!("{} sectors per FAT cannot map {} clusters", bpb.fat_size, cluster_count);
            return Err(FsError::InvalidBpb);
        }

        let volume = Self {
            fat_type,
            hidden_sectors,
            cluster_shift,
            reserved_sectors,
            fat_count,
            root_entry_count,
            total_sectors: bpb.total_sectors,
            fat_size: bpb.fat_size,
            fat_start,
            root_sector: fat_end,
            data_start,
            root_cluster,
            cluster_count,
            fsinfo_sector,
            next_free: None,
            free_count: None,
        };
        info!(
            "{:?} volume at sector {}: {} clusters of {} sectors, data at {}",
            fat_type,
            hidden_sectors,
            cluster_count,
            volume.sectors_per_cluster(),
            data_start
        );
        Ok(volume)
    }

    /// Seeds the free-cluster hints, dropping values outside the volume
    pub fn apply_fsinfo(&mut self, fsinfo: FsInfo) {
        self.free_count = fsinfo.free_count.filter(|&count| count <= self.cluster_count);
        self.next_free = fsinfo
            .next_free
            .filter(|&cluster| (FIRST_DATA_CLUSTER..=self.last_cluster()).contains(&cluster));
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        1 << self.cluster_shift
    }

    pub fn cluster_bytes(&self) -> usize {
        SECTOR_SIZE << self.cluster_shift
    }

    /// Highest cluster id addressable on this volume
    pub fn last_cluster(&self) -> Cluster {
        self.cluster_count + 1
    }

    /// First sector of a data cluster
    pub fn cluster_to_sector(&self, cluster: Cluster) -> Sector {
        self.data_start + ((cluster - FIRST_DATA_CLUSTER) << self.cluster_shift)
    }

    /// Sector and byte offset of a cluster's slot in the primary FAT
    pub fn fat_entry_location(&self, cluster: Cluster) -> (Sector, usize) {
        let shift = self.fat_type.entry_shift();
        let per_sector = (SECTOR_SIZE >> shift) as u32;
        let sector = self.fat_start + cluster / per_sector;
        let offset = ((cluster % per_sector) as usize) << shift;
        (sector, offset)
    }

    /// Number of sectors in the fixed FAT16 root region
    pub fn root_sector_count(&self) -> u32 {
        self.data_start - self.root_sector
    }

    pub fn fat_region(&self) -> FatRegion {
        FatRegion {
            start: self.fat_start,
            end: self.root_sector,
            copy_size: self.fat_size,
        }
    }
}
