//! Reader side of the realtime log buffer.
//!
//! The reader maps the shm object read-only and keeps its own
//! `(wrap, offset)` cursor, comparing it against the producer's atomic
//! header on every poll. It never writes to the shared region, so any
//! number of independent readers can tail one producer.

use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicU64, Ordering};

use super::shm::{advance, data_size, frame_size, shm_size};
use super::{LogRecord, WrapOff, SEEK_OLDEST_CRUSH_ZONE};
use crate::ffi::syscall::{fstat_size, mmap, munmap, shm_open};

/// Reader state relative to the writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// Reader has consumed everything the writer published.
    NoData,
    /// At least one unread frame is available.
    NewData,
    /// The writer lapped the reader; unread frames were overwritten
    /// and the cursor must be reset.
    Overrun,
    /// Inconsistent positions (reader ahead of writer). Treated like
    /// an overrun by callers.
    Error,
}

pub struct LogClient {
    ptr: *const u8,
    len: usize,
    ino: u64,
    cursor: WrapOff,
    _file: File,
}

// Single-cursor reader; the shared region is only ever loaded.
unsafe impl Send for LogClient {}

impl LogClient {
    /// Open the shm object `name` read-only and start at the writer's
    /// current position (i.e. skip the backlog).
    pub fn open(name: &str) -> Result<LogClient> {
        let file = shm_open(name, libc::O_RDONLY, 0o640)?;
        let (size, ino) = fstat_size(&file)?;

        if size < shm_size() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("log shm too small: {size} < {}", shm_size()),
            ));
        }

        let ptr: *const u8 = unsafe { mmap(shm_size(), libc::PROT_READ, libc::MAP_SHARED, &file) }?;

        let mut client = LogClient {
            ptr,
            len: shm_size(),
            ino,
            cursor: WrapOff::ZERO,
            _file: file,
        };
        client.reset();
        Ok(client)
    }

    /// Inode of the mapped object; changes when the producer re-creates
    /// the shm, which readers use to reopen transparently.
    pub fn inode(&self) -> u64 {
        self.ino
    }

    fn writer_pos(&self) -> WrapOff {
        // Loads only; the cast is needed because `AtomicU64::from_ptr`
        // takes *mut.
        let header = unsafe { AtomicU64::from_ptr(self.ptr as *mut u64) };
        WrapOff::unpack(header.load(Ordering::Acquire))
    }

    fn data(&self) -> *const u8 {
        unsafe { self.ptr.add(size_of::<u64>()) }
    }

    /// Reset the cursor to the writer's position (drop the backlog).
    pub fn reset(&mut self) {
        self.cursor = self.writer_pos();
    }

    /// Move the cursor to the oldest frame that is still safe to read,
    /// keeping [`SEEK_OLDEST_CRUSH_ZONE`] frames of distance from the
    /// write pointer.
    pub fn seek_to_oldest(&mut self) {
        let w = self.writer_pos();
        let mut pos = w;
        pos.off += SEEK_OLDEST_CRUSH_ZONE * frame_size() as u32;

        if pos.off > (data_size() - frame_size()) as u32 {
            // Moved ahead of the write pointer across the wrap point;
            // the writer's wrap already accounts for it.
            pos.off -= data_size() as u32;
        } else if pos.wrap == 0 {
            // Buffer never wrapped: offset 0 holds the oldest frame.
            pos.off = 0;
        } else {
            // Buffer is full; moving ahead of the write pointer within
            // the same lap means one wrap less than the writer.
            pos.wrap -= 1;
        }

        self.cursor = pos;
    }

    /// Compare cursor and writer position without consuming anything.
    pub fn status(&self) -> ReadStatus {
        let w = self.writer_pos();
        let r = self.cursor;
        let laps = w.wrap.wrapping_sub(r.wrap);

        if w.off == r.off && laps == 0 {
            ReadStatus::NoData
        } else if (w.off > r.off && laps == 0) || (w.off < r.off && laps == 1) {
            ReadStatus::NewData
        } else if laps >= 2 || (w.off >= r.off && laps == 1) {
            ReadStatus::Overrun
        } else {
            ReadStatus::Error
        }
    }

    /// Consume and return the next frame if one is available.
    ///
    /// Anything but `NewData` returns `None`; on `Overrun`/`Error` the
    /// caller decides whether to [`reset`](Self::reset) or
    /// [`seek_to_oldest`](Self::seek_to_oldest).
    pub fn read_frame(&mut self) -> (ReadStatus, Option<LogRecord>) {
        let status = self.status();
        if status != ReadStatus::NewData {
            return (status, None);
        }

        let rec = unsafe {
            let frame = self.data().add(self.cursor.off as usize);
            std::ptr::read(frame as *const LogRecord)
        };
        self.cursor = advance(self.cursor);

        (status, Some(rec))
    }

    /// Current read cursor (for tests and diagnostics).
    pub fn position(&self) -> WrapOff {
        self.cursor
    }
}

impl Drop for LogClient {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr as *mut u8, self.len) } {
            eprintln!("rtlog: failed to unmap log shm: {e}");
        }
    }
}
