//! FAT16/FAT32 filesystem engine
//!
//! [`Filesystem`] owns the device, the mounted [`Volume`], the table walker,
//! the current directory and the open file. Operations are started by the
//! methods below and finish later, when the device hands completions back
//! through [`Filesystem::dispatch`]. Every accepted operation reports to its
//! [`Client`] exactly once; an `Err` from the starting call means it was not
//! accepted.

/// Unwraps `Ok(Poll::Ready(v))` to `v`, returning early on errors and on
/// `Poll::Pending`
macro_rules! try_ready {
    ($e:expr) => {
        match $e? {
            core::task::Poll::Ready(value) => value,
            core::task::Poll::Pending => return Ok(core::task::Poll::Pending),
        }
    };
}

pub mod boot_sector;
pub mod cache;
pub mod constants;
pub mod cursor;
pub mod dir;
pub mod dir_entry;
pub mod fat_entry;
pub mod file;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

use crate::filesys::{BlockDevice, Channel, Cluster, Completion, Flow, FsError, Sector, Transfer};
use alloc::vec::Vec;
use boot_sector::{find_fat_partition, BiosParameterBlock, FsInfo};
use cache::SectorCache;
use core::task::Poll;
use cursor::Io;
use dir::Directory;
use file::FileStream;
use log::{error, info, trace, warn};
use table::{Requester, TableWalker, Walked};

pub use boot_sector::{FatType, Volume};
pub use dir_entry::{Attributes, DirEntry, LfnFragment, Record, ShortName};
pub use fat_entry::END_OF_CHAIN;

/// Component that finished an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Partition search, mount, flush and unmount
    Volume,
    Directory,
    File,
    /// Cluster operations started by the user
    Table,
}

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Start sector of the first FAT partition
    PartitionFound(Sector),
    Mounted(FatType),
    Unmounted,
    Flushed,
    Dumped,
    /// Entry of a name search, `None` if there is no such entry
    Found(Option<DirEntry>),
    /// Bytes read, fewer than asked for at the end of the file or chain
    Read(Vec<u8>),
    /// Bytes written, fewer than given at the end of the chain
    Written(usize),
    /// Follow-on cluster, `INVALID_CLUSTER` at the end of the chain
    NextCluster(Cluster),
    /// First cluster of a newly linked run
    Allocated(Cluster),
    Deallocated,
    Linked,
}

/// Receiver of operation results
pub trait Client {
    /// Called for every live directory slot during a dump
    fn on_record(&mut self, _record: &Record) -> Flow {
        Flow::Continue
    }

    fn on_complete(&mut self, origin: Origin, result: Result<Outcome, FsError>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Unmounted,
    FindingPartition,
    ReadingBpb { hidden: Sector },
    ReadingFsInfo { volume: Volume },
    Mounted,
    /// Flushing the caches in `Channel::ALL` order
    Syncing { next: usize, unmount: bool },
}

/// Mutable views of the engine used by mounted operations
struct Parts<'a> {
    io: Io<'a>,
    dir: &'a mut Directory,
    file: &'a mut FileStream,
}

fn walked_outcome(walked: Walked) -> Outcome {
    match walked {
        Walked::Next(cluster) => Outcome::NextCluster(cluster),
        Walked::Allocated(cluster) => Outcome::Allocated(cluster),
        Walked::Released => Outcome::Deallocated,
        Walked::Linked => Outcome::Linked,
    }
}

fn channel_cache<'a>(
    table: &'a mut TableWalker,
    dir: &'a mut Directory,
    file: &'a mut FileStream,
    channel: Channel,
) -> &'a mut SectorCache {
    match channel {
        Channel::Table => table.cache_mut(),
        Channel::Dir => dir.cursor_mut().cache_mut(),
        Channel::File => file.cursor_mut().cache_mut(),
    }
}

/// FAT filesystem driver
pub struct Filesystem<D: BlockDevice> {
    /// Underlying block device
    device: D,
    volume: Option<Volume>,
    state: MountState,
    table: TableWalker,
    dir: Directory,
    file: FileStream,
}

impl<D: BlockDevice> Filesystem<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            volume: None,
            state: MountState::Unmounted,
            table: TableWalker::new(),
            dir: Directory::new(),
            file: FileStream::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Geometry of the mounted volume
    pub fn volume(&self) -> Option<&Volume> {
        self.volume.as_ref()
    }

    pub fn is_mounted(&self) -> bool {
        self.volume.is_some()
    }

    /// Head cluster of the current directory, `ROOT_REGION` for the FAT16 root
    pub fn current_dir(&self) -> Option<Cluster> {
        self.volume.map(|_| self.dir.cluster())
    }

    /// First cluster of the open file
    pub fn open_cluster(&self) -> Option<Cluster> {
        self.volume.map(|_| self.file.cluster())
    }

    pub fn file_size(&self) -> Option<u32> {
        self.volume.map(|_| self.file.size())
    }

    pub fn position(&self) -> Option<u32> {
        self.volume.map(|_| self.file.position())
    }

    fn parts(&mut self) -> Result<Parts<'_>, FsError> {
        match self.state {
            MountState::Mounted => {}
            MountState::Syncing { .. } => return Err(FsError::Busy),
            _ => return Err(FsError::NotMounted),
        }
        let volume = self.volume.as_mut().ok_or(FsError::NotMounted)?;
        Ok(Parts {
            io: Io {
                device: &mut self.device,
                volume,
                table: &mut self.table,
            },
            dir: &mut self.dir,
            file: &mut self.file,
        })
    }

    fn check_unmounted(&self) -> Result<(), FsError> {
        match self.state {
            MountState::Unmounted => Ok(()),
            MountState::Mounted => Err(FsError::Unsupported),
            _ => Err(FsError::Busy),
        }
    }

    /// Reads the MBR and reports the start sector of the first FAT16/FAT32
    /// partition
    pub fn find_partition(&mut self, client: &mut dyn Client) -> Result<(), FsError> {
        self.check_unmounted()?;
        self.table.cache_mut().configure(None);
        self.state = MountState::FindingPartition;
        self.drive_mount(client);
        Ok(())
    }

    /// Mounts the volume whose boot sector is at `hidden`
    pub fn mount(&mut self, hidden: Sector, client: &mut dyn Client) -> Result<(), FsError> {
        self.check_unmounted()?;
        self.table.cache_mut().configure(None);
        self.state = MountState::ReadingBpb { hidden };
        self.drive_mount(client);
        Ok(())
    }

    fn drive_mount(&mut self, client: &mut dyn Client) {
        loop {
            let sector = match self.state {
                MountState::FindingPartition => 0,
                MountState::ReadingBpb { hidden } => hidden,
                MountState::ReadingFsInfo { volume } => match volume.fsinfo_sector {
                    Some(sector) => sector,
                    None => return self.finish_mount(volume, client),
                },
                _ => return,
            };
            match self.table.cache_mut().request_read(&mut self.device, sector) {
                Ok(Poll::Pending) => return,
                Ok(Poll::Ready(())) => {}
                Err(error) => return self.fail_mount(error, client),
            }

            let data = self.table.cache().data();
            match self.state {
                MountState::FindingPartition => {
                    let result = find_fat_partition(data);
                    self.state = MountState::Unmounted;
                    match result {
                        Ok(start) => info!("FAT partition starts at sector {}", start),
                        Err(error) => warn!("No usable partition: {}", error),
                    }
                    return client.on_complete(Origin::Volume, result.map(Outcome::PartitionFound));
                }
                MountState::ReadingBpb { hidden } => {
                    let volume = BiosParameterBlock::parse(data)
                        .and_then(|bpb| Volume::from_bpb(hidden, &bpb));
                    match volume {
                        Ok(volume) if volume.fat_type == FatType::Fat32 => {
                            self.state = MountState::ReadingFsInfo { volume };
                        }
                        Ok(volume) => return self.finish_mount(volume, client),
                        Err(error) => return self.fail_mount(error, client),
                    }
                }
                MountState::ReadingFsInfo { mut volume } => {
                    match FsInfo::parse(data) {
                        Ok(fsinfo) => volume.apply_fsinfo(fsinfo),
                        Err(_) => warn!("Ignoring invalid FSINFO sector {}", sector),
                    }
                    return self.finish_mount(volume, client);
                }
                _ => return,
            }
        }
    }

    fn fail_mount(&mut self, error: FsError, client: &mut dyn Client) {
        error!("Mount failed: {}", error);
        self.state = MountState::Unmounted;
        self.volume = None;
        client.on_complete(Origin::Volume, Err(error));
    }

    fn finish_mount(&mut self, volume: Volume, client: &mut dyn Client) {
        self.table.cache_mut().configure(Some(volume.fat_region()));
        self.dir.cursor_mut().cache_mut().configure(None);
        self.file.cursor_mut().cache_mut().configure(None);
        let reset = self
            .dir
            .open_root(&volume)
            .and_then(|()| self.file.close());
        if let Err(error) = reset {
            return self.fail_mount(error, client);
        }

        info!(
            "Mounted {:?} volume, next free cluster {:?}",
            volume.fat_type, volume.next_free
        );
        self.volume = Some(volume);
        self.state = MountState::Mounted;
        client.on_complete(Origin::Volume, Ok(Outcome::Mounted(volume.fat_type)));
    }

    /// Writes every dirty cache slot back to the device
    pub fn flush(&mut self, client: &mut dyn Client) -> Result<(), FsError> {
        self.sync(false, client)
    }

    /// Flushes, then forgets the volume. Succeeds at once when nothing is
    /// mounted.
    pub fn unmount(&mut self, client: &mut dyn Client) -> Result<(), FsError> {
        if self.state == MountState::Unmounted {
            client.on_complete(Origin::Volume, Ok(Outcome::Unmounted));
            return Ok(());
        }
        self.sync(true, client)
    }

    fn sync(&mut self, unmount: bool, client: &mut dyn Client) -> Result<(), FsError> {
        match self.state {
            MountState::Mounted => {}
            MountState::Unmounted => return Err(FsError::NotMounted),
            _ => return Err(FsError::Busy),
        }
        if self.table.is_busy() || !self.dir.is_idle() || !self.file.is_idle() {
            return Err(FsError::Busy);
        }
        self.state = MountState::Syncing { next: 0, unmount };
        self.drive_sync(client);
        Ok(())
    }

    fn drive_sync(&mut self, client: &mut dyn Client) {
        loop {
            let MountState::Syncing { next, unmount } = self.state else {
                return;
            };
            let Some(&channel) = Channel::ALL.get(next) else {
                let outcome = if unmount {
                    info!("Unmounted");
                    self.volume = None;
                    self.state = MountState::Unmounted;
                    Outcome::Unmounted
                } else {
                    self.state = MountState::Mounted;
                    Outcome::Flushed
                };
                return client.on_complete(Origin::Volume, Ok(outcome));
            };

            let cache = channel_cache(&mut self.table, &mut self.dir, &mut self.file, channel);
            match cache.flush(&mut self.device) {
                Ok(Poll::Pending) => return,
                Ok(Poll::Ready(())) => {
                    self.state = MountState::Syncing {
                        next: next + 1,
                        unmount,
                    }
                }
                Err(error) => return self.fail_sync(error, client),
            }
        }
    }

    fn fail_sync(&mut self, error: FsError, client: &mut dyn Client) {
        warn!("Flush failed: {}", error);
        self.state = MountState::Mounted;
        client.on_complete(Origin::Volume, Err(error));
    }

    /// Reports every live slot of the current directory to `on_record`
    pub fn dump(&mut self, client: &mut dyn Client) -> Result<(), FsError> {
        let Parts { mut io, dir, .. } = self.parts()?;
        dir.dump(&mut io, client)
    }

    /// Searches the current directory for a `NAME.EXT` short name
    pub fn find(&mut self, name: &str, client: &mut dyn Client) -> Result<(), FsError> {
        let name = ShortName::parse(name)?;
        let Parts { mut io, dir, .. } = self.parts()?;
        dir.find(&mut io, name, client)
    }

    /// Searches the current directory for a long file name
    #[cfg(feature = "lfn")]
    pub fn find_by_long_name(
        &mut self,
        name: &str,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        let Parts { mut io, dir, .. } = self.parts()?;
        dir.find_by_long_name(&mut io, name, client)
    }

    pub fn change_dir(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        let Parts { io, dir, .. } = self.parts()?;
        dir.change(io.volume, entry)
    }

    pub fn root_dir(&mut self) -> Result<(), FsError> {
        let Parts { io, dir, .. } = self.parts()?;
        dir.open_root(io.volume)
    }

    /// Makes `entry` the open file, positioned at its start
    pub fn open(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        let Parts { file, .. } = self.parts()?;
        file.open(entry)
    }

    pub fn seek(&mut self, position: u32) -> Result<(), FsError> {
        let Parts { file, .. } = self.parts()?;
        file.seek(position)
    }

    /// Reads up to `len` bytes of the open file
    pub fn read(&mut self, len: usize, client: &mut dyn Client) -> Result<(), FsError> {
        let Parts { mut io, file, .. } = self.parts()?;
        file.read(&mut io, len, client)
    }

    /// Writes `data` into the open file's allocated clusters
    pub fn write(&mut self, data: &[u8], client: &mut dyn Client) -> Result<(), FsError> {
        let Parts { mut io, file, .. } = self.parts()?;
        file.write(&mut io, data, client)
    }

    fn report(
        &mut self,
        walked: Result<Poll<Walked>, FsError>,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        if let Poll::Ready(walked) = walked? {
            client.on_complete(Origin::Table, Ok(walked_outcome(walked)));
        }
        Ok(())
    }

    /// Reports the cluster following `cluster` in its chain
    pub fn lookup(&mut self, cluster: Cluster, client: &mut dyn Client) -> Result<(), FsError> {
        let Parts { io, .. } = self.parts()?;
        let walked = io.table.lookup(io.device, io.volume, Requester::User, cluster);
        self.report(walked, client)
    }

    /// Links `count` free clusters into a new chain
    pub fn allocate(&mut self, count: u32, client: &mut dyn Client) -> Result<(), FsError> {
        let Parts { io, .. } = self.parts()?;
        let walked = io.table.allocate(io.device, io.volume, Requester::User, count);
        self.report(walked, client)
    }

    /// Frees `count` consecutive clusters starting at `cluster`
    pub fn deallocate(
        &mut self,
        cluster: Cluster,
        count: u32,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        let Parts { io, .. } = self.parts()?;
        let walked = io
            .table
            .deallocate(io.device, io.volume, Requester::User, cluster, count);
        self.report(walked, client)
    }

    /// Points `from` at `to`; `END_OF_CHAIN` terminates the chain at `from`
    pub fn concatenate(
        &mut self,
        from: Cluster,
        to: Cluster,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        let Parts { io, .. } = self.parts()?;
        let walked = io
            .table
            .concatenate(io.device, io.volume, Requester::User, from, to);
        self.report(walked, client)
    }

    pub fn truncate(&mut self, from: Cluster, client: &mut dyn Client) -> Result<(), FsError> {
        let Parts { io, .. } = self.parts()?;
        let walked = io.table.truncate(io.device, io.volume, Requester::User, from);
        self.report(walked, client)
    }

    /// Feeds one device completion into the component owning its channel
    pub fn dispatch(&mut self, completion: Completion<'_>, client: &mut dyn Client) {
        let Completion {
            channel,
            sector,
            transfer,
        } = completion;
        trace!("{:?} completion for sector {}", channel, sector);

        match self.state {
            MountState::FindingPartition
            | MountState::ReadingBpb { .. }
            | MountState::ReadingFsInfo { .. } => {
                if channel != Channel::Table {
                    warn!("{:?} completion while mounting", channel);
                    return;
                }
                match self.table.cache_mut().on_complete(&mut self.device, sector, transfer) {
                    Ok(Poll::Pending) => {}
                    Ok(Poll::Ready(())) => self.drive_mount(client),
                    Err(error) => self.fail_mount(error, client),
                }
                return;
            }
            MountState::Syncing { .. } => {
                return self.sync_complete(channel, sector, transfer, client)
            }
            MountState::Unmounted => {
                warn!("{:?} completion while unmounted", channel);
                return;
            }
            MountState::Mounted => {}
        }

        let Some(volume) = self.volume.as_mut() else {
            return;
        };
        let mut io = Io {
            device: &mut self.device,
            volume,
            table: &mut self.table,
        };
        match channel {
            Channel::Table => {
                let settled = io
                    .table
                    .on_complete(&mut *io.device, &mut *io.volume, sector, transfer);
                for (requester, result) in settled {
                    match requester {
                        Requester::Dir => self.dir.on_lookup(&mut io, result, client),
                        Requester::File => self.file.on_lookup(&mut io, result, client),
                        Requester::User => {
                            client.on_complete(Origin::Table, result.map(walked_outcome))
                        }
                    }
                }
            }
            Channel::Dir => self.dir.on_complete(&mut io, sector, transfer, client),
            Channel::File => self.file.on_complete(&mut io, sector, transfer, client),
        }
    }

    fn sync_complete(
        &mut self,
        channel: Channel,
        sector: Sector,
        transfer: Transfer<'_>,
        client: &mut dyn Client,
    ) {
        let MountState::Syncing { next, unmount } = self.state else {
            return;
        };
        if Channel::ALL.get(next) != Some(&channel) {
            warn!("{:?} completion while flushing", channel);
            return;
        }
        let cache = channel_cache(&mut self.table, &mut self.dir, &mut self.file, channel);
        match cache.on_complete(&mut self.device, sector, transfer) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(())) => {
                self.state = MountState::Syncing {
                    next: next + 1,
                    unmount,
                };
                self.drive_sync(client);
            }
            Err(error) => self.fail_sync(error, client),
        }
    }
}
