//! FAT chain operations over the table channel
//!
//! Every operation needs one FAT entry at a time. The sector holding it is
//! fetched through the table cache; as long as consecutive entries share a
//! sector the walk continues without waiting, otherwise it parks until the
//! cache completion arrives.

use super::boot_sector::Volume;
use super::cache::SectorCache;
use super::cursor::{ClusterCursor, Io, Stream};
use super::fat_entry::{is_valid, FatEntry, END_OF_CHAIN, FIRST_DATA_CLUSTER};
use crate::filesys::{BlockDevice, Channel, Cluster, FsError, Sector, Transfer};
use arrayvec::ArrayVec;
use core::task::Poll;
use log::{debug, trace, warn};

/// Component a table result is routed back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Dir,
    File,
    User,
}

impl Requester {
    pub const ALL: [Requester; 3] = [Requester::Dir, Requester::File, Requester::User];

    fn index(self) -> usize {
        self as usize
    }
}

/// Results of operations that finished while handling one completion, at
/// most one per requester
pub type Settled = ArrayVec<(Requester, Result<Walked, FsError>), 3>;

/// Result of a finished table operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walked {
    /// Follow-on cluster, `INVALID_CLUSTER` at the end of the chain
    Next(Cluster),
    /// First cluster of a freshly linked run
    Allocated(Cluster),
    Released,
    Linked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scan {
    count: u32,
    /// Where the scan began; reaching it again after the wrap ends the search
    start: Cluster,
    cursor: Cluster,
    run_start: Cluster,
    run_len: u32,
    wrapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableOp {
    Lookup {
        cluster: Cluster,
    },
    Allocate(Scan),
    /// Writes `next -> next + 1` up to `last`, which gets the end marker
    Link {
        first: Cluster,
        next: Cluster,
        last: Cluster,
    },
    Deallocate {
        first: Cluster,
        next: Cluster,
        remaining: u32,
    },
    Concatenate {
        from: Cluster,
        to: Cluster,
    },
}

impl TableOp {
    /// Cluster whose FAT entry the operation needs next
    fn cluster(&self) -> Cluster {
        match *self {
            TableOp::Lookup { cluster } => cluster,
            TableOp::Allocate(scan) => scan.cursor,
            TableOp::Link { next, .. } => next,
            TableOp::Deallocate { next, .. } => next,
            TableOp::Concatenate { from, .. } => from,
        }
    }

    /// Consumes the entry at `offset` of the cached FAT sector. Returns the
    /// result once the operation is done.
    fn apply(
        &mut self,
        cache: &mut SectorCache,
        volume: &mut Volume,
        offset: usize,
    ) -> Result<Option<Walked>, FsError> {
        let fat_type = volume.fat_type;
        match self {
            TableOp::Lookup { .. } => {
                let entry = FatEntry::read(fat_type, cache.data(), offset);
                Ok(Some(Walked::Next(entry.next_cluster(volume))))
            }
            TableOp::Allocate(scan) => {
                if FatEntry::read(fat_type, cache.data(), offset).is_free() {
                    if scan.run_len == 0 {
                        scan.run_start = scan.cursor;
                    }
                    scan.run_len += 1;
                    if scan.run_len == scan.count {
                        debug!("Found {} free clusters at {}", scan.count, scan.run_start);
                        *self = TableOp::Link {
                            first: scan.run_start,
                            next: scan.run_start,
                            last: scan.run_start + scan.count - 1,
                        };
                        return Ok(None);
                    }
                } else {
                    scan.run_len = 0;
                }

                scan.cursor += 1;
                if scan.cursor > volume.last_cluster() {
                    if scan.wrapped || scan.start == FIRST_DATA_CLUSTER {
                        return Err(FsError::NoSpace);
                    }
                    trace!("Free cluster scan wraps to the table start");
                    scan.wrapped = true;
                    scan.cursor = FIRST_DATA_CLUSTER;
                    scan.run_len = 0;
                }
                if scan.wrapped && scan.cursor >= scan.start {
                    return Err(FsError::NoSpace);
                }
                Ok(None)
            }
            TableOp::Link { first, next, last } => {
                let to = if *next == *last { END_OF_CHAIN } else { *next + 1 };
                FatEntry::link(fat_type, to).write(fat_type, cache.data_mut(), offset);
                cache.touch();
                if *next < *last {
                    *next += 1;
                    return Ok(None);
                }

                let count = *last - *first + 1;
                let after = *last + 1;
                volume.next_free = Some(if after > volume.last_cluster() {
                    FIRST_DATA_CLUSTER
                } else {
                    after
                });
                volume.free_count = volume.free_count.map(|free| free.saturating_sub(count));
                Ok(Some(Walked::Allocated(*first)))
            }
            TableOp::Deallocate {
                first,
                next,
                remaining,
            } => {
                FatEntry::FREE.write(fat_type, cache.data_mut(), offset);
                cache.touch();
                *next += 1;
                *remaining -= 1;
                if *remaining > 0 {
                    return Ok(None);
                }

                let count = *next - *first;
                volume.free_count = volume
                    .free_count
                    .map(|free| (free + count).min(volume.cluster_count));
                if volume.next_free.map_or(true, |hint| *first < hint) {
                    volume.next_free = Some(*first);
                }
                Ok(Some(Walked::Released))
            }
            TableOp::Concatenate { to, .. } => {
                FatEntry::link(fat_type, *to).write(fat_type, cache.data_mut(), offset);
                cache.touch();
                Ok(Some(Walked::Linked))
            }
        }
    }
}

/// Walks and edits the allocation table through the table channel
///
/// One operation runs at a time. An operation from another requester waits
/// in that requester's slot and starts once the running one settles.
pub struct TableWalker {
    cache: SectorCache,
    pending: Option<(Requester, TableOp)>,
    parked: [Option<TableOp>; 3],
}

impl Default for TableWalker {
    fn default() -> Self {
        Self::new()
    }
}

impl TableWalker {
    pub fn new() -> Self {
        Self {
            cache: SectorCache::new(Channel::Table),
            pending: None,
            parked: [None; 3],
        }
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || self.parked.iter().any(Option::is_some) || self.cache.is_busy()
    }

    /// Whether `requester` has an operation running or waiting
    pub fn serves(&self, requester: Requester) -> bool {
        matches!(self.pending, Some((running, _)) if running == requester)
            || self.parked[requester.index()].is_some()
    }

    pub fn cache(&self) -> &SectorCache {
        &self.cache
    }

    /// The table channel's cache, also used for MBR, BPB and FSINFO reads
    pub fn cache_mut(&mut self) -> &mut SectorCache {
        &mut self.cache
    }

    fn check_cluster(volume: &Volume, cluster: Cluster) -> Result<(), FsError> {
        if !is_valid(cluster) || cluster > volume.last_cluster() {
            return Err(FsError::InvalidOffset);
        }
        Ok(())
    }

    /// Reads the FAT entry of `cluster`
    pub fn lookup(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        requester: Requester,
        cluster: Cluster,
    ) -> Result<Poll<Walked>, FsError> {
        Self::check_cluster(volume, cluster)?;
        trace!("{:?} looks up cluster {}", requester, cluster);
        self.start(device, volume, requester, TableOp::Lookup { cluster })
    }

    /// Positions a cursor at sector offset `target`, looking up FAT entries
    /// through this walker. Completion is reported to `stream.on_end`.
    pub fn seek(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        cursor: &mut ClusterCursor,
        target: u32,
        stream: &mut dyn Stream,
    ) -> Result<(), FsError> {
        let mut io = Io {
            device,
            volume,
            table: self,
        };
        cursor.seek(&mut io, target, stream)
    }

    /// Finds `count` consecutive free clusters, links them into a chain
    /// ending in EOC and returns the first one
    pub fn allocate(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        requester: Requester,
        count: u32,
    ) -> Result<Poll<Walked>, FsError> {
        if count == 0 {
            return Err(FsError::Unsupported);
        }
        if count > volume.cluster_count {
            return Err(FsError::NoSpace);
        }
        let start = volume
            .next_free
            .filter(|&hint| Self::check_cluster(volume, hint).is_ok())
            .unwrap_or(FIRST_DATA_CLUSTER);
        debug!("Allocating {} clusters from {}", count, start);
        self.start(
            device,
            volume,
            requester,
            TableOp::Allocate(Scan {
                count,
                start,
                cursor: start,
                run_start: start,
                run_len: 0,
                wrapped: false,
            }),
        )
    }

    /// Frees `count` consecutive clusters starting at `cluster`
    pub fn deallocate(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        requester: Requester,
        cluster: Cluster,
        count: u32,
    ) -> Result<Poll<Walked>, FsError> {
        if count == 0 {
            return Ok(Poll::Ready(Walked::Released));
        }
        Self::check_cluster(volume, cluster)?;
        let last = cluster.checked_add(count - 1).ok_or(FsError::InvalidOffset)?;
        Self::check_cluster(volume, last)?;
        debug!("Releasing clusters {}..={}", cluster, last);
        self.start(
            device,
            volume,
            requester,
            TableOp::Deallocate {
                first: cluster,
                next: cluster,
                remaining: count,
            },
        )
    }

    /// Points the entry of `from` at `to`, or terminates it for `END_OF_CHAIN`
    pub fn concatenate(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        requester: Requester,
        from: Cluster,
        to: Cluster,
    ) -> Result<Poll<Walked>, FsError> {
        Self::check_cluster(volume, from)?;
        if to != END_OF_CHAIN {
            Self::check_cluster(volume, to)?;
        }
        debug!("Linking cluster {} to {:#x}", from, to);
        self.start(device, volume, requester, TableOp::Concatenate { from, to })
    }

    /// Makes `from` the last cluster of its chain
    pub fn truncate(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        requester: Requester,
        from: Cluster,
    ) -> Result<Poll<Walked>, FsError> {
        self.concatenate(device, volume, requester, from, END_OF_CHAIN)
    }

    fn start(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        requester: Requester,
        op: TableOp,
    ) -> Result<Poll<Walked>, FsError> {
        if self.serves(requester) {
            return Err(FsError::Busy);
        }
        if self.pending.is_some() {
            debug!("{:?} waits for the table", requester);
            self.parked[requester.index()] = Some(op);
            return Ok(Poll::Pending);
        }
        // Only mount and flush use the table cache without an operation
        if self.cache.is_busy() {
            return Err(FsError::Busy);
        }
        self.pending = Some((requester, op));
        let poll = self.drive(device, volume);
        self.settle(poll)
    }

    fn drive(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
    ) -> Result<Poll<Walked>, FsError> {
        loop {
            let Some((_, op)) = self.pending.as_mut() else {
                return Err(FsError::Device);
            };
            let (sector, offset): (Sector, usize) = volume.fat_entry_location(op.cluster());
            if self.cache.request_read(device, sector)?.is_pending() {
                return Ok(Poll::Pending);
            }
            if let Some(walked) = op.apply(&mut self.cache, volume, offset)? {
                return Ok(Poll::Ready(walked));
            }
        }
    }

    fn settle(&mut self, poll: Result<Poll<Walked>, FsError>) -> Result<Poll<Walked>, FsError> {
        if !matches!(poll, Ok(Poll::Pending)) {
            self.pending = None;
        }
        poll
    }

    /// Resumes the outstanding operation with a table channel completion.
    /// Once it finishes, waiting operations start in requester order; every
    /// operation done by the time the table parks again is returned with
    /// who asked for it.
    pub fn on_complete(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        sector: Sector,
        transfer: Transfer<'_>,
    ) -> Settled {
        let mut settled = Settled::new();
        let Some((requester, _)) = self.pending else {
            warn!("Table completion for sector {} with nothing pending", sector);
            return settled;
        };

        let poll = match self.cache.on_complete(device, sector, transfer) {
            Ok(Poll::Ready(())) => self.drive(device, volume),
            Ok(Poll::Pending) => Ok(Poll::Pending),
            Err(error) => Err(error),
        };
        match self.settle(poll) {
            Ok(Poll::Pending) => return settled,
            Ok(Poll::Ready(walked)) => settled.push((requester, Ok(walked))),
            Err(error) => settled.push((requester, Err(error))),
        }
        self.start_parked(device, volume, &mut settled);
        settled
    }

    fn start_parked(
        &mut self,
        device: &mut dyn BlockDevice,
        volume: &mut Volume,
        settled: &mut Settled,
    ) {
        while self.pending.is_none() {
            let Some((requester, op)) = Requester::ALL
                .into_iter()
                .find_map(|requester| Some((requester, self.parked[requester.index()].take()?)))
            else {
                return;
            };
            trace!("{:?} gets the table", requester);
            self.pending = Some((requester, op));
            let poll = self.drive(device, volume);
            match self.settle(poll) {
                Ok(Poll::Pending) => {}
                Ok(Poll::Ready(walked)) => settled.push((requester, Ok(walked))),
                Err(error) => settled.push((requester, Err(error))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::block::memory::{Access, MemoryBlockDevice};
    use crate::filesys::fat::fat_entry::INVALID_CLUSTER as INVALID;
    use crate::filesys::fat::testing::{ImageBuilder, FAT16_FAT_START};

    struct Bench {
        device: MemoryBlockDevice,
        volume: Volume,
        table: TableWalker,
    }

    impl Bench {
        fn new(image: ImageBuilder) -> Self {
            let volume = image.volume();
            let mut table = TableWalker::new();
            table.cache_mut().configure(Some(volume.fat_region()));
            Self {
                device: image.build(),
                volume,
                table,
            }
        }

        /// Runs an operation to completion, servicing table requests
        fn run(&mut self, first: Result<Poll<Walked>, FsError>) -> Result<Walked, FsError> {
            let mut poll = first?;
            loop {
                if let Poll::Ready(walked) = poll {
                    return Ok(walked);
                }
                let mut settled = self.step();
                poll = match settled.pop() {
                    None => Poll::Pending,
                    Some((requester, result)) => {
                        assert_eq!(requester, Requester::User);
                        Poll::Ready(result?)
                    }
                };
                assert!(settled.is_empty());
            }
        }

        /// Serves one table request
        fn step(&mut self) -> Settled {
            let mut step = self.device.poll().expect("table operation stalled");
            let completion = step.completion();
            let settled = self.table.on_complete(
                &mut self.device,
                &mut self.volume,
                completion.sector,
                completion.transfer,
            );
            self.device.commit(step);
            settled
        }

        fn lookup(&mut self, cluster: Cluster) -> Result<Walked, FsError> {
            let first = self
                .table
                .lookup(&mut self.device, &mut self.volume, Requester::User, cluster);
            self.run(first)
        }

        fn allocate(&mut self, count: u32) -> Result<Walked, FsError> {
            let first = self
                .table
                .allocate(&mut self.device, &mut self.volume, Requester::User, count);
            self.run(first)
        }

        fn flush(&mut self) {
            let mut poll = self.table.cache_mut().flush(&mut self.device);
            while let Ok(Poll::Pending) = poll {
                let mut step = self.device.poll().unwrap();
                let completion = step.completion();
                poll = self.table.cache_mut().on_complete(
                    &mut self.device,
                    completion.sector,
                    completion.transfer,
                );
                self.device.commit(step);
            }
            assert_eq!(poll, Ok(Poll::Ready(())));
        }

        fn entry(&self, cluster: Cluster) -> u32 {
            let (sector, offset) = self.volume.fat_entry_location(cluster);
            let data = self.device.read_block(sector).unwrap();
            FatEntry::read(self.volume.fat_type, &data, offset).cluster
        }
    }

    #[test]
    fn lookup_follows_and_normalizes() {
        let mut image = ImageBuilder::fat16();
        image.set_fat(5, 9).set_fat(9, 0xFFFF).set_fat(11, 0xFFF7);
        let mut bench = Bench::new(image);

        assert_eq!(bench.lookup(5), Ok(Walked::Next(9)));
        assert_eq!(bench.lookup(9), Ok(Walked::Next(INVALID)));
        assert_eq!(bench.lookup(11), Ok(Walked::Next(INVALID)));
        assert_eq!(bench.lookup(1), Err(FsError::InvalidOffset));
        // All three entries share one FAT sector
        assert_eq!(bench.device.take_log(), [Access::Read(FAT16_FAT_START)]);
    }

    #[test]
    fn allocate_exact_run_and_no_space() {
        let mut image = ImageBuilder::fat16();
        image.fill_fat(0xFFFF);
        for cluster in 10..13 {
            image.set_fat(cluster, 0);
        }
        let mut bench = Bench::new(image);
        bench.volume.next_free = Some(2);

        assert_eq!(bench.allocate(4), Err(FsError::NoSpace));
        assert!(!bench.table.is_busy());
        assert_eq!(bench.allocate(3), Ok(Walked::Allocated(10)));
        bench.flush();
        assert_eq!(bench.entry(10), 11);
        assert_eq!(bench.entry(11), 12);
        assert_eq!(bench.entry(12), 0xFFFF);
        assert_eq!(bench.volume.next_free, Some(13));
    }

    #[test]
    fn allocation_wraps_once() {
        let mut image = ImageBuilder::fat16();
        image.fill_fat(0xFFFF);
        // 4 and 5 free before the hint, 20 free after it but alone
        image.set_fat(4, 0).set_fat(5, 0).set_fat(20, 0);
        let mut bench = Bench::new(image);
        bench.volume.next_free = Some(15);

        assert_eq!(bench.allocate(2), Ok(Walked::Allocated(4)));
        assert_eq!(bench.allocate(1), Ok(Walked::Allocated(20)));
        assert_eq!(bench.volume.next_free, Some(21));
        assert_eq!(bench.allocate(1), Err(FsError::NoSpace));
    }

    #[test]
    fn run_does_not_span_the_wrap_point() {
        let mut image = ImageBuilder::fat16();
        image.fill_fat(0xFFFF);
        let last = image.volume().last_cluster();
        image.set_fat(last, 0).set_fat(2, 0);
        let mut bench = Bench::new(image);
        bench.volume.next_free = Some(last);
        assert_eq!(bench.allocate(2), Err(FsError::NoSpace));
    }

    #[test]
    fn deallocate_updates_hints_and_mirror() {
        let mut image = ImageBuilder::fat16();
        image.set_fat(7, 8).set_fat(8, 9).set_fat(9, 0xFFFF);
        let mut bench = Bench::new(image);
        bench.volume.next_free = Some(100);
        bench.volume.free_count = Some(10);

        let first =
            bench
                .table
                .deallocate(&mut bench.device, &mut bench.volume, Requester::User, 7, 3);
        assert_eq!(bench.run(first), Ok(Walked::Released));
        bench.flush();
        assert_eq!((bench.entry(7), bench.entry(8), bench.entry(9)), (0, 0, 0));
        assert_eq!(bench.volume.next_free, Some(7));
        assert_eq!(bench.volume.free_count, Some(13));

        let fat_size = bench.volume.fat_size;
        let log = bench.device.take_log();
        assert!(log.contains(&Access::Write(FAT16_FAT_START)));
        assert!(log.contains(&Access::Write(FAT16_FAT_START + fat_size)));
    }

    #[test]
    fn concatenate_and_truncate() {
        let mut image = ImageBuilder::fat32();
        image.set_fat(40, 0xF000_0000);
        let mut bench = Bench::new(image);

        let first =
            bench
                .table
                .concatenate(&mut bench.device, &mut bench.volume, Requester::User, 40, 41);
        assert_eq!(bench.run(first), Ok(Walked::Linked));
        assert_eq!(bench.lookup(40), Ok(Walked::Next(41)));

        let first = bench
            .table
            .truncate(&mut bench.device, &mut bench.volume, Requester::User, 41);
        assert_eq!(bench.run(first), Ok(Walked::Linked));
        bench.flush();
        assert_eq!(bench.entry(41), 0x0FFF_FFFF);

        // Reserved top bits survive the rewrite
        let (sector, offset) = bench.volume.fat_entry_location(40);
        let raw = bench.device.read_block(sector).unwrap();
        assert_eq!(
            crate::filesys::fat::fat_entry::read_u32(&raw, offset),
            0xF000_0029
        );

        assert_eq!(
            bench
                .table
                .concatenate(&mut bench.device, &mut bench.volume, Requester::User, 40, 1),
            Err(FsError::InvalidOffset)
        );
    }

    #[test]
    fn one_operation_at_a_time() {
        let mut image = ImageBuilder::fat16();
        image.set_fat(3, 4).set_fat(6, 0xFFFF);
        let mut bench = Bench::new(image);
        let first = bench
            .table
            .lookup(&mut bench.device, &mut bench.volume, Requester::Dir, 3);
        assert_eq!(first, Ok(Poll::Pending));
        assert_eq!(
            bench
                .table
                .lookup(&mut bench.device, &mut bench.volume, Requester::Dir, 5),
            Err(FsError::Busy)
        );

        // Other requesters wait instead of failing
        let second = bench
            .table
            .lookup(&mut bench.device, &mut bench.volume, Requester::File, 6);
        assert_eq!(second, Ok(Poll::Pending));
        let third = bench
            .table
            .allocate(&mut bench.device, &mut bench.volume, Requester::User, 1);
        assert_eq!(third, Ok(Poll::Pending));
        assert_eq!(
            bench
                .table
                .lookup(&mut bench.device, &mut bench.volume, Requester::File, 7),
            Err(FsError::Busy)
        );
        assert!(bench.table.serves(Requester::User));

        // The FAT sector is shared, so the waiting operations finish on the
        // same completion, in requester order
        let settled = bench.step();
        assert_eq!(
            settled.as_slice(),
            [
                (Requester::Dir, Ok(Walked::Next(4))),
                (Requester::File, Ok(Walked::Next(INVALID))),
                (Requester::User, Ok(Walked::Allocated(2))),
            ]
        );
        assert!(!bench.table.is_busy());
        assert_eq!(bench.device.pending(), 0);
    }

    #[test]
    fn waiting_operation_survives_a_failed_one() {
        let mut image = ImageBuilder::fat16();
        image.set_fat(300, 301);
        let mut bench = Bench::new(image);
        // Cluster 300 lives in the second FAT sector
        assert_eq!(bench.volume.fat_entry_location(300).0, FAT16_FAT_START + 1);
        bench.device.fail_sector(FAT16_FAT_START);

        let first = bench
            .table
            .lookup(&mut bench.device, &mut bench.volume, Requester::Dir, 3);
        assert_eq!(first, Ok(Poll::Pending));
        let second = bench
            .table
            .lookup(&mut bench.device, &mut bench.volume, Requester::File, 300);
        assert_eq!(second, Ok(Poll::Pending));

        let settled = bench.step();
        assert_eq!(settled.as_slice(), [(Requester::Dir, Err(FsError::Device))]);
        assert!(bench.table.serves(Requester::File));

        let settled = bench.step();
        assert_eq!(settled.as_slice(), [(Requester::File, Ok(Walked::Next(301)))]);
        assert!(!bench.table.is_busy());
    }
}
