//! Staging and partial-write buffers for the reassembled ULog stream.
//!
//! Fragments append raw stream bytes to a bounded staging area; the flush
//! path peels whole records off its head and writes each in a single
//! attempt, so a non-blocking file sees record-aligned writes. A short
//! write spills the record remainder into the partial buffer, which must
//! drain completely before anything else touches the file. The partial
//! buffer is the explicit representation of a suspended write, kept as
//! data so its overflow mode is observable and testable.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};
use tracing::{error, warn};

/// Capacity of the record staging area.
pub const STAGING_CAPACITY: usize = 2048;
/// Capacity of the partial-write spill area.
pub const PARTIAL_CAPACITY: usize = STAGING_CAPACITY / 2;
/// ULog record header: msg_size u16 LE + msg_type u8.
pub const RECORD_HEADER_LEN: usize = 3;

/// Result of appending fragment bytes to the staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Bytes staged.
    Appended,
    /// The append would exceed capacity; staging was discarded whole and
    /// the caller must re-synchronise on a record boundary.
    Overflow,
}

/// How far a flush got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushProgress {
    /// Every complete staged record is on its way to the file.
    Clean,
    /// The file would block; remaining bytes stay staged for next time.
    Blocked,
    /// The partial spill overflowed; the file is corrupt and this session
    /// writes nothing further.
    Corrupt,
}

/// In-memory staging of the reassembled ULog byte stream.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    staging: BytesMut,
    partial: BytesMut,
    corrupt: bool,
}

impl ReassemblyBuffer {
    /// An empty buffer pair.
    pub fn new() -> Self {
        Self {
            staging: BytesMut::with_capacity(STAGING_CAPACITY),
            partial: BytesMut::with_capacity(PARTIAL_CAPACITY),
            corrupt: false,
        }
    }

    /// Bytes currently staged.
    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    /// Bytes currently spilled from a short record write.
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    /// Whether the partial spill overflowed and writes are disabled.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    /// Appends stream bytes to the staging tail.
    pub fn append(&mut self, bytes: &[u8]) -> AppendOutcome {
        if self.staging.len() + bytes.len() > STAGING_CAPACITY {
            self.staging.clear();
            return AppendOutcome::Overflow;
        }
        self.staging.extend_from_slice(bytes);
        AppendOutcome::Appended
    }

    /// Discards staged bytes after a drop or overflow.
    ///
    /// The partial spill is deliberately kept: it is the tail of a record
    /// whose head is already on disk, and draining it is the only way the
    /// file keeps whole-record framing.
    pub fn discard_staging(&mut self) {
        self.staging.clear();
    }

    /// Clears everything for a new session.
    pub fn reset(&mut self) {
        self.staging.clear();
        self.partial.clear();
        self.corrupt = false;
    }

    /// Writes bytes that bypass record framing (the file header), spilling
    /// whatever the file does not take into the partial buffer so they
    /// still land ahead of every staged record.
    ///
    /// Returns the count the file took directly; spilled bytes are counted
    /// when the spill drains. Fails only when the writer errors before
    /// taking a single byte, leaving the file untouched.
    pub fn write_through<W: Write>(&mut self, w: &mut W, bytes: &[u8]) -> io::Result<usize> {
        if self.corrupt {
            return Ok(0);
        }

        let mut written = 0;
        if self.partial.is_empty() {
            while written < bytes.len() {
                match w.write(&bytes[written..]) {
                    Ok(0) => break,
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if written == 0 => return Err(e),
                    Err(e) => {
                        warn!("write error after partial progress, queueing remainder: {e}");
                        break;
                    }
                }
            }
        }
        // A pending spill drains first; anything new queues behind it.

        let remainder = &bytes[written..];
        if !remainder.is_empty() {
            if self.partial.len() + remainder.len() > PARTIAL_CAPACITY {
                error!(
                    queued = self.partial.len(),
                    incoming = remainder.len(),
                    "partial spill exceeds capacity, log file is corrupt"
                );
                self.corrupt = true;
                self.staging.clear();
                self.partial.clear();
            } else {
                self.partial.extend_from_slice(remainder);
            }
        }
        Ok(written)
    }

    /// Drives writes toward `w` until everything writable is written, the
    /// writer blocks, or the session turns corrupt.
    ///
    /// A fatal I/O error drops the record being written and propagates;
    /// the caller may keep the session alive and flush again later.
    pub fn flush_to<W: Write>(&mut self, w: &mut W) -> io::Result<FlushProgress> {
        if self.corrupt {
            return Ok(FlushProgress::Corrupt);
        }

        loop {
            // The spill drains first; while it holds bytes the file is
            // mid-record and nothing else may be written.
            while !self.partial.is_empty() {
                match w.write(&self.partial) {
                    Ok(0) => return Ok(FlushProgress::Blocked),
                    Ok(n) => self.partial.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(FlushProgress::Blocked)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.partial.clear();
                        return Err(e);
                    }
                }
            }

            if self.staging.len() < RECORD_HEADER_LEN {
                return Ok(FlushProgress::Clean);
            }
            let msg_size = u16::from_le_bytes([self.staging[0], self.staging[1]]) as usize;
            let full = msg_size + RECORD_HEADER_LEN;
            if full > self.staging.len() {
                // Head record not complete yet; wait for more fragments.
                return Ok(FlushProgress::Clean);
            }

            match w.write(&self.staging[..full]) {
                Ok(0) => return Ok(FlushProgress::Blocked),
                Ok(n) if n >= full => self.staging.advance(full),
                Ok(n) => {
                    let remainder = full - n;
                    if remainder > PARTIAL_CAPACITY {
                        error!(
                            msg_type = self.staging[2],
                            full_msg_size = full,
                            "partial spill exceeds capacity, log file is corrupt"
                        );
                        self.corrupt = true;
                        self.staging.clear();
                        self.partial.clear();
                        return Ok(FlushProgress::Corrupt);
                    }
                    self.partial.extend_from_slice(&self.staging[n..full]);
                    self.staging.advance(full);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushProgress::Blocked)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.staging.advance(full);
                    return Err(e);
                }
            }
        }
    }
}
