//! Position within a cluster chain or the fixed FAT16 root region
//!
//! A cursor streams sectors to a [`Stream`] consumer. Single sectors go
//! through the cursor's own cache slot; whole-cluster transfers starting on
//! a cluster boundary go straight to the device as one multi-sector request.
//! The cluster chain is followed lazily: the next FAT entry is only looked
//! up once a sector beyond the current cluster is actually needed.

use super::boot_sector::Volume;
use super::cache::SectorCache;
use super::fat_entry::{is_valid, INVALID_CLUSTER, ROOT_REGION};
use super::table::{Requester, TableWalker, Walked};
use crate::filesys::{BlockDevice, Channel, Cluster, Flow, FsError, Sector, Transfer, SECTOR_SIZE};
use core::task::Poll;
use log::{debug, trace, warn};

/// Shared collaborators a cursor needs to make progress
pub struct Io<'a> {
    pub device: &'a mut dyn BlockDevice,
    pub volume: &'a mut Volume,
    pub table: &'a mut TableWalker,
}

/// Consumer of a cursor stream
pub trait Stream {
    /// A sector was read
    fn on_sector(&mut self, _sector: Sector, _data: &[u8; SECTOR_SIZE]) -> Flow {
        Flow::Continue
    }

    /// A sector is about to be written. For per-sector updates `data` holds
    /// the current contents; for cluster writes it must be filled completely.
    fn on_fill(&mut self, _sector: Sector, _data: &mut [u8; SECTOR_SIZE]) -> Flow {
        Flow::Continue
    }

    /// The stream ended, early or not. Called exactly once per accepted
    /// operation.
    fn on_end(&mut self, result: Result<(), FsError>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Idle,
    Seeking,
    Reading,
    Writing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Seek,
    ReadSector,
    UpdateSector,
    ReadCluster,
    WriteCluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    /// Nothing outstanding, the job can step
    Ready,
    Lookup,
    Cache,
    Batch { done: u32, aborted: bool },
}

#[derive(Debug)]
struct Job {
    mode: Mode,
    remaining: u32,
    wait: Wait,
}

pub struct ClusterCursor {
    requester: Requester,
    cache: SectorCache,
    head: Cluster,
    current: Cluster,
    /// Position of `current` in the chain
    index: u32,
    /// Sector offset from the start of the chain
    offset: u32,
    job: Option<Job>,
}

impl ClusterCursor {
    pub fn new(channel: Channel, requester: Requester) -> Self {
        Self {
            requester,
            cache: SectorCache::new(channel),
            head: INVALID_CLUSTER,
            current: INVALID_CLUSTER,
            index: 0,
            offset: 0,
            job: None,
        }
    }

    pub fn cache_mut(&mut self) -> &mut SectorCache {
        &mut self.cache
    }

    pub fn state(&self) -> CursorState {
        match self.job.as_ref().map(|job| job.mode) {
            None => CursorState::Idle,
            Some(Mode::Seek) => CursorState::Seeking,
            Some(Mode::ReadSector | Mode::ReadCluster) => CursorState::Reading,
            Some(Mode::UpdateSector | Mode::WriteCluster) => CursorState::Writing,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.job.is_none()
    }

    pub fn head(&self) -> Cluster {
        self.head
    }

    /// Current sector offset from the start of the chain
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Starts over at the chain beginning with `cluster`. Anything below 2
    /// opens an empty chain.
    pub fn open(&mut self, cluster: Cluster) -> Result<(), FsError> {
        if self.job.is_some() {
            return Err(FsError::Busy);
        }
        self.head = if is_valid(cluster) {
            cluster
        } else {
            INVALID_CLUSTER
        };
        self.rewind()
    }

    /// Opens the root directory: the fixed region on FAT16, a chain on FAT32
    pub fn open_root(&mut self, volume: &Volume) -> Result<(), FsError> {
        if self.job.is_some() {
            return Err(FsError::Busy);
        }
        self.head = volume.root_cluster;
        self.rewind()
    }

    pub fn rewind(&mut self) -> Result<(), FsError> {
        if self.job.is_some() {
            return Err(FsError::Busy);
        }
        self.current = self.head;
        self.index = 0;
        self.offset = 0;
        Ok(())
    }

    fn in_root_region(&self) -> bool {
        self.head == ROOT_REGION
    }

    /// Moves to sector offset `target`, following the chain as needed
    pub fn seek(
        &mut self,
        io: &mut Io<'_>,
        target: u32,
        stream: &mut dyn Stream,
    ) -> Result<(), FsError> {
        self.start(io, Mode::Seek, target, 0, stream)
    }

    /// Streams `count` sectors from `first` through the cache
    pub fn read_each_sector(
        &mut self,
        io: &mut Io<'_>,
        first: u32,
        count: u32,
        stream: &mut dyn Stream,
    ) -> Result<(), FsError> {
        self.start(io, Mode::ReadSector, first, count, stream)
    }

    /// Read-modify-write of `count` sectors from `first` through the cache
    pub fn update_each_sector(
        &mut self,
        io: &mut Io<'_>,
        first: u32,
        count: u32,
        stream: &mut dyn Stream,
    ) -> Result<(), FsError> {
        self.start(io, Mode::UpdateSector, first, count, stream)
    }

    /// Streams `count` sectors from `first`, a cluster per device request
    pub fn read_each_cluster(
        &mut self,
        io: &mut Io<'_>,
        first: u32,
        count: u32,
        stream: &mut dyn Stream,
    ) -> Result<(), FsError> {
        self.start(io, Mode::ReadCluster, first, count, stream)
    }

    /// Overwrites `count` whole sectors from `first`, a cluster per device
    /// request
    pub fn write_each_cluster(
        &mut self,
        io: &mut Io<'_>,
        first: u32,
        count: u32,
        stream: &mut dyn Stream,
    ) -> Result<(), FsError> {
        self.start(io, Mode::WriteCluster, first, count, stream)
    }

    fn start(
        &mut self,
        io: &mut Io<'_>,
        mode: Mode,
        first: u32,
        count: u32,
        stream: &mut dyn Stream,
    ) -> Result<(), FsError> {
        if self.job.is_some() {
            return Err(FsError::Busy);
        }
        self.job = Some(Job {
            mode,
            remaining: count,
            wait: Wait::Ready,
        });

        // The chain cannot be walked backwards
        if !self.in_root_region() && first >> io.volume.cluster_shift < self.index {
            self.current = self.head;
            self.index = 0;
        }
        self.offset = first;
        self.resume(io, stream);
        Ok(())
    }

    fn park(&mut self, wait: Wait) {
        if let Some(job) = self.job.as_mut() {
            job.wait = wait;
        }
    }

    /// Follows the chain until `current` holds the cluster of `offset`
    fn advance(&mut self, io: &mut Io<'_>) -> Result<Poll<()>, FsError> {
        if self.in_root_region() {
            return Ok(Poll::Ready(()));
        }
        let target = self.offset >> io.volume.cluster_shift;
        while self.index < target {
            if !is_valid(self.current) {
                return Err(FsError::Eof);
            }
            match io
                .table
                .lookup(&mut *io.device, &mut *io.volume, self.requester, self.current)?
            {
                Poll::Pending => {
                    self.park(Wait::Lookup);
                    return Ok(Poll::Pending);
                }
                Poll::Ready(walked) => self.step_to(walked)?,
            }
        }
        Ok(Poll::Ready(()))
    }

    fn step_to(&mut self, walked: Walked) -> Result<(), FsError> {
        match walked {
            Walked::Next(next) if is_valid(next) => {
                trace!("{:?} cursor moves to cluster {}", self.requester, next);
                self.current = next;
                self.index += 1;
                Ok(())
            }
            Walked::Next(_) => Err(FsError::Eof),
            other => {
                warn!("{:?} cursor got {:?} for a lookup", self.requester, other);
                Err(FsError::Device)
            }
        }
    }

    /// Device sector at the current position
    fn sector(&self, volume: &Volume) -> Result<Sector, FsError> {
        if self.in_root_region() {
            if self.offset >= volume.root_sector_count() {
                return Err(FsError::Eof);
            }
            return Ok(volume.root_sector + self.offset);
        }
        if !is_valid(self.current) || self.current > volume.last_cluster() {
            return Err(FsError::Eof);
        }
        let within = self.offset & (volume.sectors_per_cluster() - 1);
        Ok(volume.cluster_to_sector(self.current) + within)
    }

    /// Sectors left before the end of the current cluster or root region
    fn span(&self, volume: &Volume) -> u32 {
        if self.in_root_region() {
            volume.root_sector_count() - self.offset
        } else {
            volume.sectors_per_cluster() - (self.offset & (volume.sectors_per_cluster() - 1))
        }
    }

    fn is_aligned(&self, volume: &Volume) -> bool {
        self.in_root_region() || self.offset & (volume.sectors_per_cluster() - 1) == 0
    }

    fn drive(&mut self, io: &mut Io<'_>, stream: &mut dyn Stream) -> Result<Poll<()>, FsError> {
        loop {
            let Some(job) = self.job.as_ref() else {
                return Ok(Poll::Ready(()));
            };
            let (mode, remaining) = (job.mode, job.remaining);
            if remaining == 0 && mode != Mode::Seek {
                return Ok(Poll::Ready(()));
            }
            try_ready!(self.advance(io));
            if mode == Mode::Seek {
                return Ok(Poll::Ready(()));
            }

            let sector = self.sector(io.volume)?;
            let channel = self.cache.channel();

            let batched = matches!(mode, Mode::ReadCluster | Mode::WriteCluster);
            if batched && self.is_aligned(io.volume) {
                let count = remaining.min(self.span(io.volume));
                if self.cache.holds_dirty(sector, count) {
                    if self.cache.flush(&mut *io.device)?.is_pending() {
                        self.park(Wait::Cache);
                        return Ok(Poll::Pending);
                    }
                    continue;
                }
                self.cache.invalidate_range(sector, count);
                debug!("{:?} transfers {} sectors from {}", channel, count, sector);
                if mode == Mode::ReadCluster {
                    io.device.read_multiple(channel, sector, count)?;
                } else {
                    io.device.write_multiple(channel, sector, count)?;
                }
                self.park(Wait::Batch {
                    done: 0,
                    aborted: false,
                });
                return Ok(Poll::Pending);
            }

            let loaded = if mode == Mode::WriteCluster {
                self.cache.claim(&mut *io.device, sector)?
            } else {
                self.cache.request_read(&mut *io.device, sector)?
            };
            if loaded.is_pending() {
                self.park(Wait::Cache);
                return Ok(Poll::Pending);
            }

            let flow = match mode {
                Mode::ReadSector | Mode::ReadCluster => stream.on_sector(sector, self.cache.data()),
                _ => {
                    let flow = stream.on_fill(sector, self.cache.data_mut());
                    self.cache.touch();
                    flow
                }
            };
            self.offset += 1;
            if let Some(job) = self.job.as_mut() {
                job.remaining -= 1;
            }
            if flow == Flow::Abort {
                return Ok(Poll::Ready(()));
            }
        }
    }

    fn resume(&mut self, io: &mut Io<'_>, stream: &mut dyn Stream) {
        match self.drive(io, stream) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(())) => self.finish(Ok(()), stream),
            Err(error) => self.finish(Err(error), stream),
        }
    }

    fn finish(&mut self, result: Result<(), FsError>, stream: &mut dyn Stream) {
        self.job = None;
        stream.on_end(result);
    }

    /// Resumes the job with a completion of this cursor's channel
    pub fn on_complete(
        &mut self,
        io: &mut Io<'_>,
        sector: Sector,
        transfer: Transfer<'_>,
        stream: &mut dyn Stream,
    ) {
        let Some(job) = self.job.as_mut() else {
            warn!("{:?} completion for sector {} while idle", self.cache.channel(), sector);
            return;
        };

        let result = match job.wait {
            Wait::Cache => match self.cache.on_complete(&mut *io.device, sector, transfer) {
                Ok(Poll::Pending) => return,
                Ok(Poll::Ready(())) => {
                    job.wait = Wait::Ready;
                    Ok(())
                }
                Err(error) => Err(error),
            },
            Wait::Batch { done, aborted } => match transfer {
                Transfer::Loaded(data) => {
                    let aborted = aborted || stream.on_sector(sector, data) == Flow::Abort;
                    job.wait = Wait::Batch {
                        done: done + 1,
                        aborted,
                    };
                    return;
                }
                // Sectors of a write batch are always filled, an abort only
                // takes effect at the end of the batch
                Transfer::Fill(data) => {
                    let aborted = stream.on_fill(sector, data) == Flow::Abort || aborted;
                    job.wait = Wait::Batch {
                        done: done + 1,
                        aborted,
                    };
                    return;
                }
                Transfer::End => {
                    self.offset += done;
                    job.remaining = if aborted {
                        0
                    } else {
                        job.remaining.saturating_sub(done)
                    };
                    job.wait = Wait::Ready;
                    Ok(())
                }
                Transfer::Stored | Transfer::Failed => Err(FsError::Device),
            },
            Wait::Ready | Wait::Lookup => {
                warn!("{:?} unexpected completion for sector {}", self.cache.channel(), sector);
                return;
            }
        };

        match result {
            Ok(()) => self.resume(io, stream),
            Err(error) => self.finish(Err(error), stream),
        }
    }

    /// Resumes a walk that waited for the table
    pub fn on_lookup(
        &mut self,
        io: &mut Io<'_>,
        result: Result<Walked, FsError>,
        stream: &mut dyn Stream,
    ) {
        match self.job.as_mut() {
            Some(job) if job.wait == Wait::Lookup => job.wait = Wait::Ready,
            _ => {
                warn!("{:?} cursor got a lookup it did not ask for", self.requester);
                return;
            }
        }
        match result.and_then(|walked| self.step_to(walked)) {
            Ok(()) => self.resume(io, stream),
            Err(error) => self.finish(Err(error), stream),
        }
    }
}
