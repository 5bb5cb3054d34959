//! FAT16/FAT32 on-disk constants

/// Size of a disk sector in bytes
pub const SECTOR_SIZE: usize = 512;

/// Size of one directory slot in bytes
pub const DIR_ENTRY_SIZE: usize = 32;

/// Directory slots per sector
pub const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

/// Boot sector signature at offset 510 of the MBR and of the BPB
pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const BOOT_SIGNATURE_OFFSET: usize = 510;

// Master boot record
pub const PARTITION_TABLE_OFFSET: usize = 446;
pub const PARTITION_RECORD_SIZE: usize = 16;
pub const PARTITION_COUNT: usize = 4;
pub const PARTITION_TYPE_OFFSET: usize = 4;
pub const PARTITION_LBA_OFFSET: usize = 8;

/// Partition types handled as FAT16 (FAT16 <32M, FAT16, FAT16 LBA)
pub const PARTITION_TYPES_FAT16: [u8; 3] = [0x04, 0x06, 0x0E];

/// Partition types handled as FAT32 (CHS, LBA)
pub const PARTITION_TYPES_FAT32: [u8; 2] = [0x0B, 0x0C];

// BIOS parameter block field offsets
pub const BPB_BYTES_PER_SECTOR: usize = 11;
pub const BPB_SECTORS_PER_CLUSTER: usize = 13;
pub const BPB_RESERVED_SECTORS: usize = 14;
pub const BPB_FAT_COUNT: usize = 16;
pub const BPB_ROOT_ENTRY_COUNT: usize = 17;
pub const BPB_TOTAL_SECTORS_16: usize = 19;
pub const BPB_FAT_SIZE_16: usize = 22;
pub const BPB_TOTAL_SECTORS_32: usize = 32;
pub const BPB_FAT_SIZE_32: usize = 36;
pub const BPB_ROOT_CLUSTER: usize = 44;
pub const BPB_FSINFO_SECTOR: usize = 48;

// FSINFO sector
pub const FSINFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
pub const FSINFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
pub const FSINFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;
pub const FSINFO_LEAD_OFFSET: usize = 0;
pub const FSINFO_STRUCT_OFFSET: usize = 484;
pub const FSINFO_FREE_COUNT_OFFSET: usize = 488;
pub const FSINFO_NEXT_FREE_OFFSET: usize = 492;
pub const FSINFO_TRAIL_OFFSET: usize = 508;

/// FSINFO value meaning "not known"
pub const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Volumes with fewer clusters are FAT12, which is not handled
pub const FAT16_MIN_CLUSTERS: u32 = 4085;

/// Volumes with at least this many clusters are FAT32
pub const FAT32_MIN_CLUSTERS: u32 = 65525;

/// FAT16 entry values at or above this are bad or end-of-chain
pub const FAT16_RESERVED: u32 = 0xFFF7;

/// Low 28 bits of a FAT32 entry hold the cluster number
pub const FAT32_MASK: u32 = 0x0FFF_FFFF;

pub const FAT16_EOC: u32 = 0xFFFF;
pub const FAT32_EOC: u32 = 0x0FFF_FFFF;

// Directory entry field offsets
pub const DIR_NAME_LENGTH: usize = 11;
pub const DIR_ATTRIBUTES: usize = 11;
pub const DIR_CLUSTER_HIGH: usize = 20;
pub const DIR_CLUSTER_LOW: usize = 26;
pub const DIR_FILE_SIZE: usize = 28;

/// First name byte of the slot that terminates a directory
pub const END_OF_DIRECTORY: u8 = 0x00;

/// Marker for deleted directory entries
pub const DELETED_ENTRY_MARKER: u8 = 0xE5;

/// Stored in place of a leading 0xE5 name byte
pub const ESCAPED_E5: u8 = 0x05;

// Long file name fragments
pub const LFN_LAST_FRAGMENT: u8 = 0x40;
pub const LFN_ORDINAL_MASK: u8 = 0x1F;
pub const LFN_CHECKSUM: usize = 13;
pub const LFN_UNITS_PER_FRAGMENT: usize = 13;

/// Longest long name in UTF-16 code units
pub const LFN_MAX_UNITS: usize = 255;

/// Byte offsets of the 13 UTF-16 units inside a fragment
pub const LFN_UNIT_OFFSETS: [usize; LFN_UNITS_PER_FRAGMENT] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
