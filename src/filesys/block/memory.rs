//! In-memory block device implementation
//!
//! Requests are queued and serviced one completion at a time by [`poll`],
//! which lets tests drive the engine step by step or run it to quiescence
//! with [`run`].
//!
//! [`poll`]: MemoryBlockDevice::poll

use crate::filesys::fat::{Client, Filesystem};
use crate::filesys::{BlockDevice, Channel, Completion, FsError, Sector, Transfer, SECTOR_SIZE};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use log::{trace, warn};

/// Device access recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read(Sector),
    Write(Sector),
}

#[derive(Debug)]
enum Kind {
    ReadSingle,
    WriteSingle(Box<[u8; SECTOR_SIZE]>),
    ReadMultiple { remaining: u32 },
    WriteMultiple { remaining: u32 },
}

#[derive(Debug)]
struct Request {
    channel: Channel,
    /// Next sector to transfer
    sector: Sector,
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Loaded,
    Fill,
    Stored,
    End,
    Failed,
}

/// One serviced completion, owning the sector buffer it carries
pub struct Step {
    channel: Channel,
    sector: Sector,
    kind: StepKind,
    buf: [u8; SECTOR_SIZE],
}

impl Step {
    pub fn completion(&mut self) -> Completion<'_> {
        let transfer = match self.kind {
            StepKind::Loaded => Transfer::Loaded(&self.buf),
            StepKind::Fill => Transfer::Fill(&mut self.buf),
            StepKind::Stored => Transfer::Stored,
            StepKind::End => Transfer::End,
            StepKind::Failed => Transfer::Failed,
        };
        Completion::new(self.channel, self.sector, transfer)
    }
}

/// Block device that stores data in memory
pub struct MemoryBlockDevice {
    /// Sectors that were ever written; the rest read as zeros
    blocks: BTreeMap<Sector, [u8; SECTOR_SIZE]>,
    total_blocks: u32,
    queue: ArrayQueue<Request>,
    /// Channels with a request outstanding
    busy: [bool; 3],
    log: Vec<Access>,
    faults: BTreeSet<Sector>,
}

impl MemoryBlockDevice {
    /// Creates a new memory block device with given size
    pub fn new(total_blocks: u32) -> Self {
        Self {
            blocks: BTreeMap::new(),
            total_blocks,
            queue: ArrayQueue::new(Channel::ALL.len()),
            busy: [false; 3],
            log: Vec::new(),
            faults: BTreeSet::new(),
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Validates block number is within bounds
    fn validate_block(&self, sector: Sector) -> Result<(), FsError> {
        if sector >= self.total_blocks {
            return Err(FsError::Device);
        }
        Ok(())
    }

    /// Reads a block immediately, bypassing the queue and the log
    pub fn read_block(&self, sector: Sector) -> Result<[u8; SECTOR_SIZE], FsError> {
        self.validate_block(sector)?;
        Ok(self
            .blocks
            .get(&sector)
            .copied()
            .unwrap_or([0; SECTOR_SIZE]))
    }

    /// Writes a block immediately, bypassing the queue and the log
    pub fn write_block(&mut self, sector: Sector, data: &[u8; SECTOR_SIZE]) -> Result<(), FsError> {
        self.validate_block(sector)?;
        self.blocks.insert(sector, *data);
        Ok(())
    }

    /// Makes every later transfer of `sector` fail
    pub fn fail_sector(&mut self, sector: Sector) {
        self.faults.insert(sector);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    /// Returns and clears the access log
    pub fn take_log(&mut self) -> Vec<Access> {
        core::mem::take(&mut self.log)
    }

    /// Number of queued requests
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn submit(&mut self, channel: Channel, sector: Sector, kind: Kind) -> Result<(), FsError> {
        self.validate_block(sector)?;
        if self.busy[channel.index()] {
            return Err(FsError::Busy);
        }
        trace!("{:?} queues {:?} at sector {}", channel, kind_name(&kind), sector);
        self.queue
            .push(Request {
                channel,
                sector,
                kind,
            })
            .map_err(|_| FsError::Busy)?;
        self.busy[channel.index()] = true;
        Ok(())
    }

    fn requeue(&mut self, request: Request) {
        if self.queue.push(request).is_err() {
            warn!("Memory device queue overflow");
        }
    }

    /// Services the oldest queued request. The returned step must be handed
    /// back through [`commit`](Self::commit) after the engine consumed it.
    pub fn poll(&mut self) -> Option<Step> {
        let mut request = self.queue.pop()?;
        let channel = request.channel;
        let sector = request.sector;
        let faulted = self.faults.contains(&sector) || sector >= self.total_blocks;
        let mut buf = [0u8; SECTOR_SIZE];

        let kind = match &mut request.kind {
            Kind::ReadSingle => {
                self.busy[channel.index()] = false;
                if faulted {
                    StepKind::Failed
                } else {
                    self.log.push(Access::Read(sector));
                    buf = self.blocks.get(&sector).copied().unwrap_or(buf);
                    StepKind::Loaded
                }
            }
            Kind::WriteSingle(data) => {
                self.busy[channel.index()] = false;
                if faulted {
                    StepKind::Failed
                } else {
                    self.log.push(Access::Write(sector));
                    self.blocks.insert(sector, **data);
                    StepKind::Stored
                }
            }
            Kind::ReadMultiple { remaining } | Kind::WriteMultiple { remaining }
                if *remaining == 0 =>
            {
                self.busy[channel.index()] = false;
                StepKind::End
            }
            Kind::ReadMultiple { .. } | Kind::WriteMultiple { .. } if faulted => {
                self.busy[channel.index()] = false;
                StepKind::Failed
            }
            Kind::ReadMultiple { remaining } => {
                *remaining -= 1;
                self.log.push(Access::Read(sector));
                buf = self.blocks.get(&sector).copied().unwrap_or(buf);
                StepKind::Loaded
            }
            Kind::WriteMultiple { remaining } => {
                *remaining -= 1;
                StepKind::Fill
            }
        };

        if matches!(kind, StepKind::Loaded | StepKind::Fill)
            && matches!(
                request.kind,
                Kind::ReadMultiple { .. } | Kind::WriteMultiple { .. }
            )
        {
            request.sector += 1;
            self.requeue(request);
        }

        Some(Step {
            channel,
            sector,
            kind,
            buf,
        })
    }

    /// Stores the data the engine filled into a write step
    pub fn commit(&mut self, step: Step) {
        if step.kind == StepKind::Fill {
            self.log.push(Access::Write(step.sector));
            self.blocks.insert(step.sector, step.buf);
        }
    }
}

fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::ReadSingle => "read",
        Kind::WriteSingle(_) => "write",
        Kind::ReadMultiple { .. } => "read multiple",
        Kind::WriteMultiple { .. } => "write multiple",
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_single(&mut self, channel: Channel, sector: Sector) -> Result<(), FsError> {
        self.submit(channel, sector, Kind::ReadSingle)
    }

    fn write_single(
        &mut self,
        channel: Channel,
        sector: Sector,
        data: &[u8; SECTOR_SIZE],
    ) -> Result<(), FsError> {
        self.submit(channel, sector, Kind::WriteSingle(Box::new(*data)))
    }

    fn read_multiple(
        &mut self,
        channel: Channel,
        sector: Sector,
        count: u32,
    ) -> Result<(), FsError> {
        self.submit(channel, sector, Kind::ReadMultiple { remaining: count })
    }

    fn write_multiple(
        &mut self,
        channel: Channel,
        sector: Sector,
        count: u32,
    ) -> Result<(), FsError> {
        self.submit(channel, sector, Kind::WriteMultiple { remaining: count })
    }
}

/// Services requests until the device is idle. Returns the number of
/// completions delivered.
pub fn run<C: Client>(fs: &mut Filesystem<MemoryBlockDevice>, client: &mut C) -> usize {
    let mut steps = 0;
    while let Some(mut step) = fs.device_mut().poll() {
        fs.dispatch(step.completion(), client);
        fs.device_mut().commit(step);
        steps += 1;
    }
    steps
}
