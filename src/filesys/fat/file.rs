//! Byte-addressed file reads and writes over a cluster chain
//!
//! A transfer is split into at most three pieces: a partial head sector, a
//! run of whole sectors and a partial tail sector. Partial sectors go
//! through the cache (read-modify-write for writes); whole sectors are
//! streamed a cluster at a time straight to or from the caller's bytes.

use super::cursor::{ClusterCursor, Io, Stream};
use super::dir_entry::DirEntry;
use super::fat_entry::ROOT_REGION;
use super::table::{Requester, Walked};
use super::{Client, Origin, Outcome};
use crate::filesys::{Channel, Cluster, Flow, FsError, Sector, Transfer, SECTOR_SIZE};
use alloc::vec;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::cmp::min;
use log::{debug, warn};

const SECTOR_BYTES: u32 = SECTOR_SIZE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceKind {
    /// One partial sector through the cache
    Partial,
    /// Whole sectors, batched per cluster
    Whole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    kind: PieceKind,
    /// Sector offset within the file
    first: u32,
    count: u32,
}

/// Splits `start..start + len` into head, body and tail pieces
fn plan(start: u32, len: u32) -> ArrayVec<Piece, 3> {
    let mut pieces = ArrayVec::new();
    if len == 0 {
        return pieces;
    }
    let end = start + len;
    let first_whole = start.div_ceil(SECTOR_BYTES);
    let last_whole = end / SECTOR_BYTES;

    let head = start % SECTOR_BYTES != 0;
    if head {
        pieces.push(Piece {
            kind: PieceKind::Partial,
            first: start / SECTOR_BYTES,
            count: 1,
        });
    }
    if first_whole < last_whole {
        pieces.push(Piece {
            kind: PieceKind::Whole,
            first: first_whole,
            count: last_whole - first_whole,
        });
    }
    // Skipped when head and tail fall into the same sector
    if end % SECTOR_BYTES != 0 && (!head || last_whole >= first_whole) {
        pieces.push(Piece {
            kind: PieceKind::Partial,
            first: last_whole,
            count: 1,
        });
    }
    pieces
}

struct Motion {
    direction: Direction,
    buf: Vec<u8>,
    /// File position of the next byte to move
    next: u32,
    /// File position one past the last byte to move
    end: u32,
    done: usize,
    pieces: ArrayVec<Piece, 3>,
    piece: usize,
    in_flight: bool,
    ended: Option<Result<(), FsError>>,
}

impl Motion {
    /// Byte range of the current sector that belongs to the transfer
    fn window(&self) -> Option<(usize, usize)> {
        if self.next >= self.end {
            return None;
        }
        let base = self.next - self.next % SECTOR_BYTES;
        let low = (self.next - base) as usize;
        let high = min(self.end - base, SECTOR_BYTES) as usize;
        Some((low, high))
    }

    fn advance(&mut self, moved: usize) {
        self.done += moved;
        self.next += moved as u32;
    }
}

/// Moves bytes between sectors and the transfer buffer
struct Mover<'a> {
    motion: &'a mut Motion,
}

impl Stream for Mover<'_> {
    fn on_sector(&mut self, _sector: Sector, data: &[u8; SECTOR_SIZE]) -> Flow {
        let Some((low, high)) = self.motion.window() else {
            return Flow::Abort;
        };
        let done = self.motion.done;
        self.motion.buf[done..done + high - low].copy_from_slice(&data[low..high]);
        self.motion.advance(high - low);
        Flow::Continue
    }

    fn on_fill(&mut self, _sector: Sector, data: &mut [u8; SECTOR_SIZE]) -> Flow {
        let Some((low, high)) = self.motion.window() else {
            return Flow::Abort;
        };
        let done = self.motion.done;
        data[low..high].copy_from_slice(&self.motion.buf[done..done + high - low]);
        self.motion.advance(high - low);
        Flow::Continue
    }

    fn on_end(&mut self, result: Result<(), FsError>) {
        self.motion.in_flight = false;
        self.motion.ended = Some(result);
    }
}

/// The open file of a mounted volume
pub struct FileStream {
    cursor: ClusterCursor,
    size: u32,
    position: u32,
    motion: Option<Motion>,
}

impl Default for FileStream {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStream {
    pub fn new() -> Self {
        Self {
            cursor: ClusterCursor::new(Channel::File, Requester::File),
            size: 0,
            position: 0,
            motion: None,
        }
    }

    pub fn cursor_mut(&mut self) -> &mut ClusterCursor {
        &mut self.cursor
    }

    pub fn is_idle(&self) -> bool {
        self.motion.is_none() && self.cursor.is_idle()
    }

    /// Size in bytes, including anything written past the original end
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// First cluster of the open file
    pub fn cluster(&self) -> Cluster {
        self.cursor.head()
    }

    pub fn open(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        if !self.is_idle() {
            return Err(FsError::Busy);
        }
        self.cursor.open(entry.cluster)?;
        self.size = entry.size;
        self.position = 0;
        debug!("Opened {} ({} bytes at cluster {})", entry.name, entry.size, entry.cluster);
        Ok(())
    }

    /// Leaves no file open
    pub fn close(&mut self) -> Result<(), FsError> {
        if !self.is_idle() {
            return Err(FsError::Busy);
        }
        self.cursor.open(ROOT_REGION)?;
        self.size = 0;
        self.position = 0;
        Ok(())
    }

    /// Sets the byte position of the next transfer
    pub fn seek(&mut self, position: u32) -> Result<(), FsError> {
        if !self.is_idle() {
            return Err(FsError::Busy);
        }
        if position > self.size {
            return Err(FsError::InvalidOffset);
        }
        self.position = position;
        Ok(())
    }

    /// Reads up to `len` bytes, never past the file size
    pub fn read(
        &mut self,
        io: &mut Io<'_>,
        len: usize,
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        if !self.is_idle() {
            return Err(FsError::Busy);
        }
        let available = self.size.saturating_sub(self.position);
        let len = min(len, available as usize) as u32;
        self.begin(io, Direction::Read, vec![0; len as usize], client);
        Ok(())
    }

    /// Writes `data` at the current position. The transfer stops short at
    /// the end of the allocated chain.
    pub fn write(
        &mut self,
        io: &mut Io<'_>,
        data: &[u8],
        client: &mut dyn Client,
    ) -> Result<(), FsError> {
        if !self.is_idle() {
            return Err(FsError::Busy);
        }
        let len = u32::try_from(data.len()).map_err(|_| FsError::InvalidOffset)?;
        self.position.checked_add(len).ok_or(FsError::InvalidOffset)?;
        self.begin(io, Direction::Write, data.to_vec(), client);
        Ok(())
    }

    fn begin(
        &mut self,
        io: &mut Io<'_>,
        direction: Direction,
        buf: Vec<u8>,
        client: &mut dyn Client,
    ) {
        let len = buf.len() as u32;
        debug!("{:?} of {} bytes at {}", direction, len, self.position);
        self.motion = Some(Motion {
            direction,
            buf,
            next: self.position,
            end: self.position + len,
            done: 0,
            pieces: plan(self.position, len),
            piece: 0,
            in_flight: false,
            ended: None,
        });
        self.pump(io, client);
    }

    /// Starts pieces until one has to wait for the device, or reports the
    /// outcome once none are left
    fn pump(&mut self, io: &mut Io<'_>, client: &mut dyn Client) {
        loop {
            let Some(motion) = self.motion.as_mut() else {
                return;
            };
            if motion.in_flight {
                return;
            }
            match motion.ended.take() {
                // The chain is shorter than the transfer
                Some(Err(FsError::Eof)) => motion.piece = motion.pieces.len(),
                Some(Err(error)) => {
                    warn!("{:?} failed: {}", motion.direction, error);
                    self.motion = None;
                    client.on_complete(Origin::File, Err(error));
                    return;
                }
                Some(Ok(())) | None => {}
            }

            let Some(piece) = motion.pieces.get(motion.piece).copied() else {
                self.finish(client);
                return;
            };
            motion.piece += 1;
            motion.in_flight = true;
            let direction = motion.direction;
            let mut mover = Mover {
                motion: &mut *motion,
            };
            let started = match (direction, piece.kind) {
                (Direction::Read, PieceKind::Partial) => {
                    self.cursor
                        .read_each_sector(io, piece.first, piece.count, &mut mover)
                }
                (Direction::Read, PieceKind::Whole) => {
                    self.cursor
                        .read_each_cluster(io, piece.first, piece.count, &mut mover)
                }
                (Direction::Write, PieceKind::Partial) => {
                    self.cursor
                        .update_each_sector(io, piece.first, piece.count, &mut mover)
                }
                (Direction::Write, PieceKind::Whole) => {
                    self.cursor
                        .write_each_cluster(io, piece.first, piece.count, &mut mover)
                }
            };
            if let Err(error) = started {
                motion.in_flight = false;
                motion.ended = Some(Err(error));
            }
        }
    }

    fn finish(&mut self, client: &mut dyn Client) {
        let Some(motion) = self.motion.take() else {
            return;
        };
        self.position = motion.next;
        let outcome = match motion.direction {
            Direction::Read => {
                let mut buf = motion.buf;
                buf.truncate(motion.done);
                Outcome::Read(buf)
            }
            Direction::Write => {
                self.size = self.size.max(self.position);
                Outcome::Written(motion.done)
            }
        };
        debug!("{:?} moved {} bytes", motion.direction, motion.done);
        client.on_complete(Origin::File, Ok(outcome));
    }

    pub fn on_complete(
        &mut self,
        io: &mut Io<'_>,
        sector: Sector,
        transfer: Transfer<'_>,
        client: &mut dyn Client,
    ) {
        let Some(motion) = self.motion.as_mut() else {
            warn!("File completion for sector {} with no transfer", sector);
            return;
        };
        self.cursor
            .on_complete(io, sector, transfer, &mut Mover { motion });
        self.pump(io, client);
    }

    pub fn on_lookup(
        &mut self,
        io: &mut Io<'_>,
        result: Result<Walked, FsError>,
        client: &mut dyn Client,
    ) {
        let Some(motion) = self.motion.as_mut() else {
            warn!("File lookup result with no transfer");
            return;
        };
        self.cursor.on_lookup(io, result, &mut Mover { motion });
        self.pump(io, client);
    }
}
