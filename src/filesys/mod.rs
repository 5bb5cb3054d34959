//! Non-blocking FAT filesystem engine and the block-device boundary it drives.
//!
//! Every device access is a request tagged with the [`Channel`] that issued
//! it. The device collaborator performs the transfer whenever it likes and
//! hands the result back through [`fat::Filesystem::dispatch`] as a
//! [`Completion`]. No call in this module ever waits for the device.

use core::fmt;

pub mod block;
pub mod fat;

pub use fat::constants::SECTOR_SIZE;

/// Absolute logical sector number on the block device.
pub type Sector = u32;

/// Cluster number inside the data region of a mounted volume.
pub type Cluster = u32;

// Define error types for the filesystem operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// MBR, BPB or FSINFO magic mismatch
    Signature,
    /// No FAT16/FAT32 partition in the MBR
    NoPartition,
    /// Unsupported sector size or cluster size in the BPB
    InvalidBpb,
    /// Opaque failure reported by the block device
    Device,
    /// The component already has an operation outstanding
    Busy,
    /// The cluster chain ended before the request was satisfied
    Eof,
    /// No free run of clusters large enough
    NoSpace,
    /// Operation not available for this volume or entry
    Unsupported,
    /// No volume is mounted
    NotMounted,
    /// Name cannot be encoded as a short or long directory name
    InvalidName,
    /// Entry is not a directory
    NotADirectory,
    /// Position or cluster outside the valid range
    InvalidOffset,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Signature => write!(f, "Boot signature mismatch"),
            FsError::NoPartition => write!(f, "No FAT partition found"),
            FsError::InvalidBpb => write!(f, "Invalid BIOS parameter block"),
            FsError::Device => write!(f, "Block device error"),
            FsError::Busy => write!(f, "Operation already in progress"),
            FsError::Eof => write!(f, "End of cluster chain"),
            FsError::NoSpace => write!(f, "No free clusters"),
            FsError::Unsupported => write!(f, "Operation not supported"),
            FsError::NotMounted => write!(f, "No volume mounted"),
            FsError::InvalidName => write!(f, "Invalid file name"),
            FsError::NotADirectory => write!(f, "Not a directory"),
            FsError::InvalidOffset => write!(f, "Offset out of range"),
        }
    }
}

/// Independent I/O channel. Each one owns exactly one cache slot and has at
/// most one device request outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    /// FAT sectors, MBR, BPB and FSINFO
    Table,
    /// Current directory clusters
    Dir,
    /// Open file clusters
    File,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Table, Channel::Dir, Channel::File];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Returned by stream consumers to continue or stop early.
///
/// `Abort` is not an error: the streaming loop absorbs it and completes
/// normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

/// Request side of the block device interface.
///
/// Each method only queues the request and returns. The device later resumes
/// the engine by passing a [`Completion`] carrying the same channel to
/// [`fat::Filesystem::dispatch`]:
///
/// * `read_single` completes with one [`Transfer::Loaded`]
/// * `write_single` completes with one [`Transfer::Stored`]; the data is
///   copied at submission
/// * `read_multiple` yields one `Loaded` per sector, then [`Transfer::End`]
/// * `write_multiple` asks for each sector with [`Transfer::Fill`], then
///   finishes with `End`
///
/// Any of them may complete with [`Transfer::Failed`] instead.
pub trait BlockDevice {
    fn read_single(&mut self, channel: Channel, sector: Sector) -> Result<(), FsError>;
    fn write_single(
        &mut self,
        channel: Channel,
        sector: Sector,
        data: &[u8; SECTOR_SIZE],
    ) -> Result<(), FsError>;
    fn read_multiple(&mut self, channel: Channel, sector: Sector, count: u32)
        -> Result<(), FsError>;
    fn write_multiple(
        &mut self,
        channel: Channel,
        sector: Sector,
        count: u32,
    ) -> Result<(), FsError>;
}

/// Payload of one device completion.
#[derive(Debug)]
pub enum Transfer<'a> {
    /// A sector arrived from the device
    Loaded(&'a [u8; SECTOR_SIZE]),
    /// The device wants the contents of the next sector to write
    Fill(&'a mut [u8; SECTOR_SIZE]),
    /// A single-sector write reached the medium
    Stored,
    /// A multi-sector stream finished
    End,
    /// The device could not complete the request
    Failed,
}

/// Completion handed back to the engine by the device collaborator.
#[derive(Debug)]
pub struct Completion<'a> {
    pub channel: Channel,
    pub sector: Sector,
    pub transfer: Transfer<'a>,
}

impl<'a> Completion<'a> {
    pub fn new(channel: Channel, sector: Sector, transfer: Transfer<'a>) -> Self {
        Self {
            channel,
            sector,
            transfer,
        }
    }
}
