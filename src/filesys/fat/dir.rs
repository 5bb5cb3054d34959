//! Directory scanning: dump, short name search and long name search

use super::boot_sector::Volume;
use super::cursor::{ClusterCursor, Io, Stream};
use super::dir_entry::{DirEntry, Record, ShortName, Slot};
use super::fat_entry::ROOT_REGION;
use super::table::{Requester, Walked};
use super::{Client, Origin, Outcome};
use crate::filesys::{Channel, Cluster, Flow, FsError, Sector, Transfer, SECTOR_SIZE};
use log::{debug, trace};

#[cfg(feature = "lfn")]
use super::constants::{LFN_MAX_UNITS, LFN_UNITS_PER_FRAGMENT};
#[cfg(feature = "lfn")]
use super::dir_entry::{lfn_checksum, LfnFragment};
#[cfg(feature = "lfn")]
use arrayvec::ArrayVec;

use super::constants::DIR_ENTRY_SIZE;

/// Progress of a long name match across consecutive fragments
#[cfg(feature = "lfn")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Idle,
    /// Fragments down to `expect + 1` matched so far
    Matching { expect: u8, checksum: u8 },
    /// The whole name matched; the next short entry is the candidate
    Matched { checksum: u8 },
}

#[derive(Debug)]
enum Scan {
    Idle,
    Dump,
    Find {
        name: ShortName,
        found: Option<DirEntry>,
    },
    #[cfg(feature = "lfn")]
    FindLong {
        target: ArrayVec<u16, LFN_MAX_UNITS>,
        progress: Progress,
        found: Option<DirEntry>,
    },
}

/// Current directory of a mounted volume
pub struct Directory {
    cursor: ClusterCursor,
    scan: Scan,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            cursor: ClusterCursor::new(Channel::Dir, Requester::Dir),
            scan: Scan::Idle,
        }
    }

    pub fn cursor(&self) -> &ClusterCursor {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut ClusterCursor {
        &mut self.cursor
    }

    pub fn is_idle(&self) -> bool {
        self.cursor.is_idle()
    }

    /// Head cluster, `ROOT_REGION` for the FAT16 root
    pub fn cluster(&self) -> Cluster {
        self.cursor.head()
    }

    /// Moves to the subdirectory described by `entry`. A `..` entry with
    /// cluster 0 leads back to the root.
    pub fn change(&mut self, volume: &Volume, entry: &DirEntry) -> Result<(), FsError> {
        if !entry.is_directory() {
            return Err(FsError::NotADirectory);
        }
        if entry.cluster == 0 {
            return self.open_root(volume);
        }
        debug!("Changing directory to cluster {}", entry.cluster);
        self.cursor.open(entry.cluster)
    }

    pub fn open_root(&mut self, volume: &Volume) -> Result<(), FsError> {
        self.cursor.open_root(volume)
    }

    /// Reports every live slot to `client.on_record`
    pub fn dump(&mut self, io: &mut Io<'_>, client: &mut dyn Client) -> Result<(), FsError> {
        self.begin(io, Scan::Dump, client)
    }

    /// Looks for a visible entry with exactly this short name
    pub fn find(
        &mut self,
        io: &mut Io<'_>,
        name: ShortName,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        debug!("Searching for {}", name);
        self.begin(io, Scan::Find { name, found: None }, client)
    }

    /// Looks for the short entry owning the long name `name`
    #[cfg(feature = "lfn")]
    pub fn find_by_long_name(
        &mut self,
        io: &mut Io<'_>,
        name: &str,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        let mut target = ArrayVec::new();
        for unit in name.encode_utf16() {
            target.try_push(unit).map_err(|_| FsError::InvalidName)?;
        }
        if target.is_empty() {
            return Err(FsError::InvalidName);
        }
        debug!("Searching for long name {}", name);
        self.begin(
            io,
            Scan::FindLong {
                target,
                progress: Progress::Idle,
                found: None,
            },
            client,
        )
    }

    fn begin(
        &mut self,
        io: &mut Io<'_>,
        scan: Scan,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        if !self.cursor.is_idle() {
            return Err(FsError::Busy);
        }
        let count = if self.cursor.head() == ROOT_REGION {
            io.volume.root_sector_count()
        } else {
            u32::MAX
        };
        self.scan = scan;
        let mut scanner = Scanner {
            scan: &mut self.scan,
            client,
        };
        self.cursor.read_each_sector(io, 0, count, &mut scanner)
    }

    pub fn on_complete(
        &mut self,
        io: &mut Io<'_>,
        sector: Sector,
        transfer: Transfer<'_>,
        client: &mut dyn Client,
    ) {
        let mut scanner = Scanner {
            scan: &mut self.scan,
            client,
        };
        self.cursor.on_complete(io, sector, transfer, &mut scanner);
    }

    pub fn on_lookup(
        &mut self,
        io: &mut Io<'_>,
        result: Result<Walked, FsError>,
        client: &mut dyn Client,
    ) {
        let mut scanner = Scanner {
            scan: &mut self.scan,
            client,
        };
        self.cursor.on_lookup(io, result, &mut scanner);
    }
}

/// Feeds directory sectors into the active scan
struct Scanner<'a> {
    scan: &'a mut Scan,
    client: &'a mut dyn Client,
}

impl Scanner<'_> {
    fn visit(&mut self, raw: &[u8]) -> Flow {
        match self.scan {
            Scan::Idle => Flow::Continue,
            Scan::Dump => {
                let record = Record::decode(raw);
                trace!("{:?}", record);
                self.client.on_record(&record)
            }
            Scan::Find { name, found } => match Record::decode(raw) {
                Record::Entry(entry) if entry.name == *name && visible(&entry) => {
                    *found = Some(entry);
                    Flow::Abort
                }
                _ => Flow::Continue,
            },
            #[cfg(feature = "lfn")]
            Scan::FindLong {
                target,
                progress,
                found,
            } => match Record::decode(raw) {
                Record::LongName(fragment) => {
                    *progress = match_fragment(target, *progress, &fragment);
                    Flow::Continue
                }
                Record::Entry(entry) => match *progress {
                    Progress::Matched { checksum }
                        if lfn_checksum(raw) == checksum && visible(&entry) =>
                    {
                        *found = Some(entry);
                        Flow::Abort
                    }
                    _ => {
                        *progress = Progress::Idle;
                        Flow::Continue
                    }
                },
            },
        }
    }

    #[cfg(feature = "lfn")]
    fn forget_progress(&mut self) {
        if let Scan::FindLong { progress, .. } = self.scan {
            *progress = Progress::Idle;
        }
    }

    #[cfg(not(feature = "lfn"))]
    fn forget_progress(&mut self) {}
}

fn visible(entry: &DirEntry) -> bool {
    !entry.is_concealed() && !entry.is_volume_label()
}

/// Advances a long name match by one fragment. Fragments are stored last
/// first; any gap, checksum change or differing unit starts over.
#[cfg(feature = "lfn")]
fn match_fragment(target: &[u16], progress: Progress, fragment: &LfnFragment) -> Progress {
    let sequence = fragment.sequence();
    if fragment.is_last() {
        if sequence as usize != target.len().div_ceil(LFN_UNITS_PER_FRAGMENT) {
            return Progress::Idle;
        }
    } else {
        match progress {
            Progress::Matching { expect, checksum }
                if expect == sequence && checksum == fragment.checksum => {}
            _ => return Progress::Idle,
        }
    }

    let offset = fragment.name_offset();
    let units_match = fragment.units.iter().enumerate().all(|(index, &unit)| {
        let position = offset + index;
        match position.cmp(&target.len()) {
            core::cmp::Ordering::Less => unit == target[position],
            core::cmp::Ordering::Equal => unit == 0,
            core::cmp::Ordering::Greater => true,
        }
    });
    if !units_match {
        return Progress::Idle;
    }

    if sequence == 1 {
        Progress::Matched {
            checksum: fragment.checksum,
        }
    } else {
        Progress::Matching {
            expect: sequence - 1,
            checksum: fragment.checksum,
        }
    }
}

impl Stream for Scanner<'_> {
    fn on_sector(&mut self, _sector: Sector, data: &[u8; SECTOR_SIZE]) -> Flow {
        for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
            match Slot::classify(raw) {
                Slot::End => return Flow::Abort,
                Slot::Deleted => self.forget_progress(),
                Slot::Live => {
                    if self.visit(raw) == Flow::Abort {
                        return Flow::Abort;
                    }
                }
            }
        }
        Flow::Continue
    }

    fn on_end(&mut self, result: Result<(), FsError>) {
        let scan = core::mem::replace(self.scan, Scan::Idle);
        // Running off the end of the chain is the end of the directory
        let result = match result {
            Ok(()) | Err(FsError::Eof) => Ok(()),
            Err(error) => Err(error),
        };
        let outcome = result.map(|()| match scan {
            Scan::Idle | Scan::Dump => Outcome::Dumped,
            Scan::Find { found, .. } => Outcome::Found(found),
            #[cfg(feature = "lfn")]
            Scan::FindLong { found, .. } => Outcome::Found(found),
        });
        self.client.on_complete(Origin::Directory, outcome);
    }
}
