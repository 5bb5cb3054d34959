//! Disk images and clients shared by the unit tests

use super::boot_sector::{BiosParameterBlock, Volume};
use super::constants::*;
use super::dir_entry::{Attributes, Record, ShortName};
use super::fat_entry::{write_u16, write_u32, FatEntry, ROOT_REGION};
use super::{Client, FatType, Filesystem, Origin, Outcome};
use crate::filesys::block::memory::{run, MemoryBlockDevice};
use crate::filesys::{Cluster, Flow, FsError, Sector};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// First FAT sector of [`ImageBuilder::fat16`]
pub(crate) const FAT16_FAT_START: Sector = 68;

const FAT16_HIDDEN: Sector = 64;
const FAT32_HIDDEN: Sector = 2048;
const FAT32_FSINFO: u16 = 1;

/// Geometry of [`ImageBuilder::fat32`] with the FSINFO hints applied
pub(crate) fn fat32_volume() -> Volume {
    Volume {
        fat_type: FatType::Fat32,
        hidden_sectors: FAT32_HIDDEN,
        cluster_shift: 3,
        reserved_sectors: 32,
        fat_count: 2,
        root_entry_count: 0,
        total_sectors: 1_048_576,
        fat_size: 1024,
        fat_start: 2080,
        root_sector: 4128,
        data_start: 4128,
        root_cluster: 2,
        cluster_count: 130_812,
        fsinfo_sector: Some(FAT32_HIDDEN + FAT32_FSINFO as u32),
        next_free: Some(3),
        free_count: Some(130_811),
    }
}

/// A 32-byte short directory slot
pub(crate) fn short_slot(
    name: &[u8; DIR_NAME_LENGTH],
    attributes: Attributes,
    cluster: Cluster,
    size: u32,
) -> [u8; DIR_ENTRY_SIZE] {
    let mut slot = [0u8; DIR_ENTRY_SIZE];
    slot[..DIR_NAME_LENGTH].copy_from_slice(name);
    slot[DIR_ATTRIBUTES] = attributes.bits();
    write_u16(&mut slot, DIR_CLUSTER_HIGH, (cluster >> 16) as u16);
    write_u16(&mut slot, DIR_CLUSTER_LOW, cluster as u16);
    write_u32(&mut slot, DIR_FILE_SIZE, size);
    slot
}

/// Long name fragments for `name` in on-disk order, last fragment first
pub(crate) fn lfn_slots(name: &str, checksum: u8) -> Vec<[u8; DIR_ENTRY_SIZE]> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    if units.len() % LFN_UNITS_PER_FRAGMENT != 0 {
        units.push(0x0000);
    }
    while units.len() % LFN_UNITS_PER_FRAGMENT != 0 {
        units.push(0xFFFF);
    }

    let count = units.len() / LFN_UNITS_PER_FRAGMENT;
    (1..=count)
        .rev()
        .map(|ordinal| {
            let mut slot = [0u8; DIR_ENTRY_SIZE];
            slot[0] = ordinal as u8;
            if ordinal == count {
                slot[0] |= LFN_LAST_FRAGMENT;
            }
            slot[DIR_ATTRIBUTES] = Attributes::LONG_NAME.bits();
            slot[LFN_CHECKSUM] = checksum;
            let chunk = &units[(ordinal - 1) * LFN_UNITS_PER_FRAGMENT..][..LFN_UNITS_PER_FRAGMENT];
            for (&offset, &unit) in LFN_UNIT_OFFSETS.iter().zip(chunk) {
                write_u16(&mut slot, offset, unit);
            }
            slot
        })
        .collect()
}

/// Sparse disk image with an MBR and one formatted FAT partition
pub(crate) struct ImageBuilder {
    hidden: Sector,
    sectors: BTreeMap<Sector, [u8; SECTOR_SIZE]>,
    /// Bump allocator for file and directory clusters
    next_cluster: Cluster,
    /// Slots used so far, per directory head cluster
    used_slots: BTreeMap<Cluster, usize>,
}

impl ImageBuilder {
    fn with_partition(hidden: Sector, partition_type: u8) -> Self {
        let mut image = Self {
            hidden,
            sectors: BTreeMap::new(),
            next_cluster: 2,
            used_slots: BTreeMap::new(),
        };
        let record = PARTITION_TABLE_OFFSET;
        image.patch(0, record + PARTITION_TYPE_OFFSET, &[partition_type]);
        image.patch(0, record + PARTITION_LBA_OFFSET, &hidden.to_le_bytes());
        image.patch(0, BOOT_SIGNATURE_OFFSET, &BOOT_SIGNATURE.to_le_bytes());
        image
    }

    /// 5000 clusters of 4 sectors, 512 root entries, two 32-sector FATs
    pub fn fat16() -> Self {
        let mut image = Self::with_partition(FAT16_HIDDEN, 0x06);
        let bpb = FAT16_HIDDEN;
        image.patch(bpb, 0, &[0xEB, 0x3C, 0x90]);
        image.patch(bpb, 3, b"NBFAT   ");
        image.patch(bpb, BPB_BYTES_PER_SECTOR, &512u16.to_le_bytes());
        image.patch(bpb, BPB_SECTORS_PER_CLUSTER, &[4]);
        image.patch(bpb, BPB_RESERVED_SECTORS, &4u16.to_le_bytes());
        image.patch(bpb, BPB_FAT_COUNT, &[2]);
        image.patch(bpb, BPB_ROOT_ENTRY_COUNT, &512u16.to_le_bytes());
        image.patch(bpb, BPB_TOTAL_SECTORS_16, &20_100u16.to_le_bytes());
        image.patch(bpb, 21, &[0xF8]);
        image.patch(bpb, BPB_FAT_SIZE_16, &32u16.to_le_bytes());
        image.patch(bpb, 28, &FAT16_HIDDEN.to_le_bytes());
        image.patch(bpb, BOOT_SIGNATURE_OFFSET, &BOOT_SIGNATURE.to_le_bytes());

        image.set_fat(0, 0xFFF8).set_fat(1, FAT16_EOC);
        image
    }

    /// 130812 clusters of 8 sectors, root directory at cluster 2, FSINFO
    /// suggesting cluster 3
    pub fn fat32() -> Self {
        let mut image = Self::with_partition(FAT32_HIDDEN, 0x0C);
        let bpb = FAT32_HIDDEN;
        image.patch(bpb, 0, &[0xEB, 0x58, 0x90]);
        image.patch(bpb, 3, b"NBFAT   ");
        image.patch(bpb, BPB_BYTES_PER_SECTOR, &512u16.to_le_bytes());
        image.patch(bpb, BPB_SECTORS_PER_CLUSTER, &[8]);
        image.patch(bpb, BPB_RESERVED_SECTORS, &32u16.to_le_bytes());
        image.patch(bpb, BPB_FAT_COUNT, &[2]);
        image.patch(bpb, 21, &[0xF8]);
        image.patch(bpb, 28, &FAT32_HIDDEN.to_le_bytes());
        image.patch(bpb, BPB_TOTAL_SECTORS_32, &1_048_576u32.to_le_bytes());
        image.patch(bpb, BPB_FAT_SIZE_32, &1024u32.to_le_bytes());
        image.patch(bpb, BPB_ROOT_CLUSTER, &2u32.to_le_bytes());
        image.patch(bpb, BPB_FSINFO_SECTOR, &FAT32_FSINFO.to_le_bytes());
        image.patch(bpb, BOOT_SIGNATURE_OFFSET, &BOOT_SIGNATURE.to_le_bytes());

        let fsinfo = FAT32_HIDDEN + FAT32_FSINFO as u32;
        image.patch(fsinfo, FSINFO_LEAD_OFFSET, &FSINFO_LEAD_SIGNATURE.to_le_bytes());
        image.patch(fsinfo, FSINFO_STRUCT_OFFSET, &FSINFO_STRUCT_SIGNATURE.to_le_bytes());
        image.patch(fsinfo, FSINFO_FREE_COUNT_OFFSET, &130_811u32.to_le_bytes());
        image.patch(fsinfo, FSINFO_NEXT_FREE_OFFSET, &3u32.to_le_bytes());
        image.patch(fsinfo, FSINFO_TRAIL_OFFSET, &FSINFO_TRAIL_SIGNATURE.to_le_bytes());

        image
            .set_fat(0, 0x0FFF_FFF8)
            .set_fat(1, FAT32_EOC)
            .set_fat(2, FAT32_EOC);
        image.next_cluster = 3;
        image
    }

    /// Copy of one sector, zeroes if never written
    pub fn sector(&self, sector: Sector) -> [u8; SECTOR_SIZE] {
        self.sectors
            .get(&sector)
            .copied()
            .unwrap_or([0; SECTOR_SIZE])
    }

    fn sector_mut(&mut self, sector: Sector) -> &mut [u8; SECTOR_SIZE] {
        self.sectors.entry(sector).or_insert([0; SECTOR_SIZE])
    }

    /// Overwrites bytes of a sector
    pub fn patch(&mut self, sector: Sector, offset: usize, bytes: &[u8]) -> &mut Self {
        self.sector_mut(sector)[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn fill_sector(&mut self, sector: Sector, byte: u8) -> &mut Self {
        self.sector_mut(sector).fill(byte);
        self
    }

    /// Layout as derived from the BPB, without FSINFO hints
    pub fn volume(&self) -> Volume {
        let bpb = BiosParameterBlock::parse(&self.sector(self.hidden)).unwrap();
        Volume::from_bpb(self.hidden, &bpb).unwrap()
    }

    /// Stores a raw entry value in every FAT copy
    pub fn set_fat(&mut self, cluster: Cluster, value: u32) -> &mut Self {
        let volume = self.volume();
        let (sector, offset) = volume.fat_entry_location(cluster);
        for copy in 0..volume.fat_count {
            let data = self.sector_mut(sector + copy * volume.fat_size);
            match volume.fat_type {
                FatType::Fat32 => write_u32(data, offset, value),
                _ => write_u16(data, offset, value as u16),
            }
        }
        self
    }

    /// Sets every data cluster entry to `value`
    pub fn fill_fat(&mut self, value: u32) -> &mut Self {
        let last = self.volume().last_cluster();
        for cluster in 2..=last {
            self.set_fat(cluster, value);
        }
        self
    }

    fn end_of_chain(&self) -> u32 {
        match self.volume().fat_type {
            FatType::Fat32 => FAT32_EOC,
            _ => FAT16_EOC,
        }
    }

    /// Hands out `count` consecutive clusters linked into one chain
    fn allocate(&mut self, count: u32) -> Cluster {
        if count == 0 {
            return ROOT_REGION;
        }
        let first = self.next_cluster;
        self.next_cluster += count;
        let eoc = self.end_of_chain();
        for cluster in first..first + count {
            let next = if cluster + 1 == first + count { eoc } else { cluster + 1 };
            self.set_fat(cluster, next);
        }
        first
    }

    fn write_data(&mut self, cluster: Cluster, data: &[u8]) {
        let first = self.volume().cluster_to_sector(cluster);
        for (index, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            self.sector_mut(first + index as u32)[..chunk.len()].copy_from_slice(chunk);
        }
    }

    /// Sector holding slot `index` of a directory, extending its chain when
    /// the slot falls past the last cluster
    fn slot_location(&mut self, dir: Cluster, index: usize) -> (Sector, usize) {
        let volume = self.volume();
        let within = (index % ENTRIES_PER_SECTOR) * DIR_ENTRY_SIZE;
        let sector_index = (index / ENTRIES_PER_SECTOR) as u32;
        if dir == ROOT_REGION {
            assert!(sector_index < volume.root_sector_count(), "root region full");
            return (volume.root_sector + sector_index, within);
        }

        let mut cluster = dir;
        for _ in 0..sector_index >> volume.cluster_shift {
            let (sector, offset) = volume.fat_entry_location(cluster);
            let entry = FatEntry::read(volume.fat_type, &self.sector(sector), offset);
            cluster = if entry.is_end_of_chain(volume.fat_type) {
                let grown = self.allocate(1);
                self.set_fat(cluster, grown);
                grown
            } else {
                entry.cluster
            };
        }
        let within_cluster = sector_index & (volume.sectors_per_cluster() - 1);
        let sector = volume.cluster_to_sector(cluster) + within_cluster;
        (sector, within)
    }

    fn root(&self) -> Cluster {
        self.volume().root_cluster
    }

    fn append_slot(&mut self, dir: Cluster, slot: [u8; DIR_ENTRY_SIZE]) {
        let index = *self.used_slots.get(&dir).unwrap_or(&0);
        let (sector, offset) = self.slot_location(dir, index);
        self.patch(sector, offset, &slot);
        self.used_slots.insert(dir, index + 1);
    }

    /// Appends a slot to the root directory as is
    pub fn add_raw_slot(&mut self, slot: [u8; DIR_ENTRY_SIZE]) -> &mut Self {
        let root = self.root();
        self.append_slot(root, slot);
        self
    }

    /// Writes `data` to fresh clusters and lists it in directory `dir`
    pub fn add_file_in(&mut self, dir: Cluster, name: &str, data: &[u8]) -> Cluster {
        let cluster_bytes = self.volume().cluster_bytes();
        let cluster = self.allocate(data.len().div_ceil(cluster_bytes) as u32);
        if !data.is_empty() {
            self.write_data(cluster, data);
        }
        let name = ShortName::parse(name).unwrap();
        let slot = short_slot(name.as_bytes(), Attributes::ARCHIVE, cluster, data.len() as u32);
        self.append_slot(dir, slot);
        cluster
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Cluster {
        let root = self.root();
        self.add_file_in(root, name, data)
    }

    /// A root file preceded by the long name fragments for `long`
    pub fn add_long_file(&mut self, long: &str, short: &str, data: &[u8]) -> Cluster {
        let checksum = ShortName::parse(short).unwrap().checksum();
        for slot in lfn_slots(long, checksum) {
            self.add_raw_slot(slot);
        }
        self.add_file(short, data)
    }

    /// An empty root subdirectory holding `.` and `..`
    pub fn add_directory(&mut self, name: &str) -> Cluster {
        let cluster = self.allocate(1);
        let mut dot = [b' '; DIR_NAME_LENGTH];
        dot[0] = b'.';
        self.append_slot(cluster, short_slot(&dot, Attributes::DIRECTORY, cluster, 0));
        dot[1] = b'.';
        self.append_slot(cluster, short_slot(&dot, Attributes::DIRECTORY, ROOT_REGION, 0));

        let name = ShortName::parse(name).unwrap();
        let root = self.root();
        self.append_slot(root, short_slot(name.as_bytes(), Attributes::DIRECTORY, cluster, 0));
        cluster
    }

    /// Memory device holding the MBR gap, the partition and every sector
    /// written so far
    pub fn build(&self) -> MemoryBlockDevice {
        let total = self.hidden + self.volume().total_sectors;
        let mut device = MemoryBlockDevice::new(total);
        for (&sector, data) in &self.sectors {
            device.write_block(sector, data).unwrap();
        }
        device
    }

    pub fn hidden(&self) -> Sector {
        self.hidden
    }
}

/// Mounts the partition of `image`, panicking on failure
pub(crate) fn mounted(image: ImageBuilder) -> Filesystem<MemoryBlockDevice> {
    let mut fs = Filesystem::new(image.build());
    let mut recorder = Recorder::default();
    fs.mount(image.hidden(), &mut recorder).unwrap();
    run(&mut fs, &mut recorder);
    assert!(
        matches!(recorder.single(Origin::Volume), Ok(Outcome::Mounted(_))),
        "mount failed"
    );
    fs
}

/// Client remembering everything it is told
#[derive(Default)]
pub(crate) struct Recorder {
    pub records: Vec<Record>,
    pub results: Vec<(Origin, Result<Outcome, FsError>)>,
    /// Aborts a dump once this many records arrived
    pub stop_after: Option<usize>,
}

impl Recorder {
    /// The only result so far, which must come from `origin`
    pub fn single(&self, origin: Origin) -> Result<Outcome, FsError> {
        assert_eq!(self.results.len(), 1, "results: {:?}", self.results);
        let (from, result) = &self.results[0];
        assert_eq!(*from, origin);
        result.clone()
    }
}

impl Client for Recorder {
    fn on_record(&mut self, record: &Record) -> Flow {
        self.records.push(*record);
        if Some(self.records.len()) == self.stop_after {
            Flow::Abort
        } else {
            Flow::Continue
        }
    }

    fn on_complete(&mut self, origin: Origin, result: Result<Outcome, FsError>) {
        self.results.push((origin, result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_layouts_match_their_descriptions() {
        assert_eq!(ImageBuilder::fat16().volume().fat_start, FAT16_FAT_START);
        let mut volume = ImageBuilder::fat32().volume();
        volume.next_free = Some(3);
        volume.free_count = Some(130_811);
        assert_eq!(volume, fat32_volume());
    }

    #[test]
    fn root_chain_grows_with_its_entries() {
        let mut image = ImageBuilder::fat32();
        for index in 0..129 {
            image.add_file(&alloc::format!("E{}", index), b"");
        }
        let volume = image.volume();
        let (sector, offset) = volume.fat_entry_location(2);
        let entry = FatEntry::read(volume.fat_type, &image.sector(sector), offset);
        assert_eq!(entry.cluster, 3);
    }
}
