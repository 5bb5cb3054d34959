//! One-slot write-back sector cache, one instance per channel

use super::constants::SECTOR_SIZE;
use crate::filesys::{BlockDevice, Channel, FsError, Sector, Transfer};
use core::task::Poll;
use log::{debug, warn};

/// Primary FAT and its mirror copies, laid out back to back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatRegion {
    pub start: Sector,
    /// One past the last sector of the last copy
    pub end: Sector,
    pub copy_size: u32,
}

impl FatRegion {
    /// The same sector in the next FAT copy, if there is one
    pub fn mirror_of(&self, sector: Sector) -> Option<Sector> {
        let mirror = sector.checked_add(self.copy_size)?;
        (sector >= self.start && mirror < self.end).then_some(mirror)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Invalid,
    Clean,
    Dirty,
}

/// What to do once a dirty slot reached the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Then {
    Nothing,
    Load(Sector),
    Claim(Sector),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Load(Sector),
    WriteBack { sector: Sector, then: Then },
}

pub struct SectorCache {
    channel: Channel,
    state: SlotState,
    cached: Sector,
    pending: Option<Pending>,
    fat: Option<FatRegion>,
    data: [u8; SECTOR_SIZE],
}

impl SectorCache {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            state: SlotState::Invalid,
            cached: 0,
            pending: None,
            fat: None,
            data: [0; SECTOR_SIZE],
        }
    }

    /// Drops the slot contents and sets the FAT range whose writes are mirrored
    pub fn configure(&mut self, fat: Option<FatRegion>) {
        self.state = SlotState::Invalid;
        self.pending = None;
        self.fat = fat;
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.state == SlotState::Dirty
    }

    /// Sector currently held, if any
    pub fn cached(&self) -> Option<Sector> {
        (self.state != SlotState::Invalid).then_some(self.cached)
    }

    pub fn data(&self) -> &[u8; SECTOR_SIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.data
    }

    /// Makes `sector` the cached sector. `Ready` means the data is available
    /// now; otherwise `on_complete` resolves the request later.
    pub fn request_read(
        &mut self,
        device: &mut dyn BlockDevice,
        sector: Sector,
    ) -> Result<Poll<()>, FsError> {
        if self.pending.is_some() {
            return Err(FsError::Busy);
        }
        if self.cached() == Some(sector) {
            return Ok(Poll::Ready(()));
        }
        if self.state == SlotState::Dirty {
            return self.write_back(device, Then::Load(sector));
        }
        self.load(device, sector)
    }

    /// Makes `sector` the cached sector without reading it, for callers that
    /// overwrite it completely. The slot is Dirty once this is ready.
    pub fn claim(
        &mut self,
        device: &mut dyn BlockDevice,
        sector: Sector,
    ) -> Result<Poll<()>, FsError> {
        if self.pending.is_some() {
            return Err(FsError::Busy);
        }
        if self.state == SlotState::Dirty && self.cached != sector {
            return self.write_back(device, Then::Claim(sector));
        }
        self.cached = sector;
        self.state = SlotState::Dirty;
        Ok(Poll::Ready(()))
    }

    /// Writes a dirty slot back to the medium (and its FAT mirrors)
    pub fn flush(&mut self, device: &mut dyn BlockDevice) -> Result<Poll<()>, FsError> {
        if self.pending.is_some() {
            return Err(FsError::Busy);
        }
        if self.state != SlotState::Dirty {
            return Ok(Poll::Ready(()));
        }
        self.write_back(device, Then::Nothing)
    }

    /// Marks the slot dirty after the caller mutated `data_mut` in place
    pub fn touch(&mut self) {
        if self.state != SlotState::Invalid {
            self.state = SlotState::Dirty;
        }
    }

    /// Forgets a clean copy of any sector in `first..first + count`
    pub fn invalidate_range(&mut self, first: Sector, count: u32) {
        if self.state == SlotState::Clean
            && self.pending.is_none()
            && self.cached >= first
            && self.cached - first < count
        {
            self.state = SlotState::Invalid;
        }
    }

    /// Returns true if the slot holds a modified sector in `first..first + count`
    pub fn holds_dirty(&self, first: Sector, count: u32) -> bool {
        self.state == SlotState::Dirty && self.cached >= first && self.cached - first < count
    }

    fn load(&mut self, device: &mut dyn BlockDevice, sector: Sector) -> Result<Poll<()>, FsError> {
        device.read_single(self.channel, sector)?;
        self.state = SlotState::Invalid;
        self.pending = Some(Pending::Load(sector));
        Ok(Poll::Pending)
    }

    fn write_back(
        &mut self,
        device: &mut dyn BlockDevice,
        then: Then,
    ) -> Result<Poll<()>, FsError> {
        debug!("{:?} cache writes back sector {}", self.channel, self.cached);
        device.write_single(self.channel, self.cached, &self.data)?;
        self.pending = Some(Pending::WriteBack {
            sector: self.cached,
            then,
        });
        Ok(Poll::Pending)
    }

    /// Resumes the outstanding request with a device completion
    pub fn on_complete(
        &mut self,
        device: &mut dyn BlockDevice,
        sector: Sector,
        transfer: Transfer<'_>,
    ) -> Result<Poll<()>, FsError> {
        let Some(pending) = self.pending.take() else {
            warn!("{:?} cache got an unexpected completion", self.channel);
            return Err(FsError::Device);
        };

        match (pending, transfer) {
            (Pending::Load(expected), Transfer::Loaded(buf)) if expected == sector => {
                self.data.copy_from_slice(buf);
                self.cached = sector;
                self.state = SlotState::Clean;
                Ok(Poll::Ready(()))
            }
            (
                Pending::WriteBack {
                    sector: written,
                    then,
                },
                Transfer::Stored,
            ) if written == sector => {
                if let Some(mirror) = self.fat.and_then(|fat| fat.mirror_of(written)) {
                    device.write_single(self.channel, mirror, &self.data)?;
                    self.pending = Some(Pending::WriteBack {
                        sector: mirror,
                        then,
                    });
                    return Ok(Poll::Pending);
                }
                match then {
                    Then::Nothing => {
                        self.state = SlotState::Clean;
                        Ok(Poll::Ready(()))
                    }
                    Then::Load(next) => self.load(device, next),
                    Then::Claim(next) => {
                        self.cached = next;
                        self.state = SlotState::Dirty;
                        Ok(Poll::Ready(()))
                    }
                }
            }
            (Pending::Load(_), _) => {
                self.state = SlotState::Invalid;
                Err(FsError::Device)
            }
            // The slot stays dirty so a later flush can retry
            (Pending::WriteBack { .. }, _) => Err(FsError::Device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::block::memory::{Access, MemoryBlockDevice};

    /// Services the oldest queued request and feeds it to the cache
    fn complete(
        device: &mut MemoryBlockDevice,
        cache: &mut SectorCache,
    ) -> Result<Poll<()>, FsError> {
        let mut step = device.poll().expect("no request queued");
        let completion = step.completion();
        let result = cache.on_complete(device, completion.sector, completion.transfer);
        device.commit(step);
        result
    }

    fn run(
        device: &mut MemoryBlockDevice,
        cache: &mut SectorCache,
        mut poll: Result<Poll<()>, FsError>,
    ) {
        while let Ok(Poll::Pending) = poll {
            poll = complete(device, cache);
        }
        assert_eq!(poll, Ok(Poll::Ready(())));
    }

    fn fat_region() -> FatRegion {
        FatRegion {
            start: 10,
            end: 40,
            copy_size: 10,
        }
    }

    #[test]
    fn second_read_is_a_cache_hit() {
        let mut device = MemoryBlockDevice::new(64);
        device.write_block(5, &[7; SECTOR_SIZE]).unwrap();
        let mut cache = SectorCache::new(Channel::Dir);

        let poll = cache.request_read(&mut device, 5);
        assert_eq!(poll, Ok(Poll::Pending));
        run(&mut device, &mut cache, poll);
        let first = *cache.data();

        assert_eq!(cache.request_read(&mut device, 5), Ok(Poll::Ready(())));
        assert_eq!(*cache.data(), first);
        assert_eq!(device.take_log(), [Access::Read(5)]);
    }

    #[test]
    fn busy_while_pending() {
        let mut device = MemoryBlockDevice::new(64);
        let mut cache = SectorCache::new(Channel::File);
        assert_eq!(cache.request_read(&mut device, 1), Ok(Poll::Pending));
        assert_eq!(cache.request_read(&mut device, 2), Err(FsError::Busy));
        assert_eq!(cache.flush(&mut device), Err(FsError::Busy));
    }

    #[test]
    fn dirty_slot_is_written_back_before_reload() {
        let mut device = MemoryBlockDevice::new(64);
        let mut cache = SectorCache::new(Channel::File);
        let poll = cache.request_read(&mut device, 3);
        run(&mut device, &mut cache, poll);
        cache.data_mut()[0] = 0xAB;
        cache.touch();

        let poll = cache.request_read(&mut device, 4);
        run(&mut device, &mut cache, poll);
        assert_eq!(
            device.take_log(),
            [Access::Read(3), Access::Write(3), Access::Read(4)]
        );
        assert_eq!(device.read_block(3).unwrap()[0], 0xAB);
        assert!(!cache.is_dirty());
    }

    #[test]
    fn fat_writes_reach_every_mirror() {
        let mut device = MemoryBlockDevice::new(64);
        let mut cache = SectorCache::new(Channel::Table);
        cache.configure(Some(fat_region()));

        let poll = cache.request_read(&mut device, 12);
        run(&mut device, &mut cache, poll);
        cache.data_mut()[4] = 0x42;
        cache.touch();
        let poll = cache.flush(&mut device);
        run(&mut device, &mut cache, poll);

        assert_eq!(
            device.take_log(),
            [
                Access::Read(12),
                Access::Write(12),
                Access::Write(22),
                Access::Write(32)
            ]
        );
        assert_eq!(device.read_block(32).unwrap()[4], 0x42);
    }

    #[test]
    fn writes_outside_the_fat_are_not_mirrored() {
        let mut device = MemoryBlockDevice::new(64);
        let mut cache = SectorCache::new(Channel::Table);
        cache.configure(Some(fat_region()));

        let poll = cache.claim(&mut device, 45);
        run(&mut device, &mut cache, poll);
        let poll = cache.flush(&mut device);
        run(&mut device, &mut cache, poll);
        assert_eq!(device.take_log(), [Access::Write(45)]);
    }

    #[test]
    fn failed_load_invalidates() {
        let mut device = MemoryBlockDevice::new(64);
        device.fail_sector(9);
        let mut cache = SectorCache::new(Channel::Dir);
        assert_eq!(cache.request_read(&mut device, 9), Ok(Poll::Pending));
        assert_eq!(complete(&mut device, &mut cache), Err(FsError::Device));
        assert_eq!(cache.cached(), None);
        assert!(!cache.is_busy());
    }
}
