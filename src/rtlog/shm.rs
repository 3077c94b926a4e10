//! Producer side of the realtime log buffer.

use std::fs::File;
use std::hint;
use std::io::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{LogRecord, WrapOff, LOG_BUFFER_DEPTH};
use crate::ffi::syscall::{ftruncate, mmap, munmap, shm_open, shm_unlink};

pub const fn frame_size() -> usize {
    size_of::<LogRecord>()
}

pub const fn data_size() -> usize {
    LOG_BUFFER_DEPTH * frame_size()
}

pub const fn shm_size() -> usize {
    size_of::<u64>() + data_size()
}

/// Advance a buffer position by one frame, wrapping at the last
/// full-frame offset. Shared with the reader so both sides agree on
/// the wrap point.
pub(super) fn advance(pos: WrapOff) -> WrapOff {
    let off = pos.off + frame_size() as u32;
    if off > (data_size() - frame_size()) as u32 {
        WrapOff {
            wrap: pos.wrap + 1,
            off: 0,
        }
    } else {
        WrapOff {
            wrap: pos.wrap,
            off,
        }
    }
}

// A parked thread cannot log in bounded time, so the per-process log
// lock spins instead of sleeping. Hold times are one 112-byte copy plus
// one atomic store.
struct SpinLock(AtomicBool);

struct SpinGuard<'a>(&'a SpinLock);

impl SpinLock {
    const fn new() -> SpinLock {
        SpinLock(AtomicBool::new(false))
    }

    fn lock(&self) -> SpinGuard<'_> {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        SpinGuard(self)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(false, Ordering::Release);
    }
}

/// The shm-backed log ring, producer side.
///
/// Creates the shared memory object on construction and unlinks it on
/// drop. One writer object per node; threads within the process are
/// serialised by the spinlock, readers in other processes synchronise
/// on the atomic header alone.
pub struct LogWriter {
    ptr: *mut u8,
    len: usize,
    name: String,
    // Keeps the fd open for the lifetime of the mapping.
    _file: File,
    lock: SpinLock,
}

// The raw mapping is private to this writer; all access goes through
// the spinlock or the atomic header.
unsafe impl Send for LogWriter {}
unsafe impl Sync for LogWriter {}

impl LogWriter {
    /// Create (or re-use and reset) the shm object `name` and map it.
    pub fn create(name: &str) -> Result<LogWriter> {
        let file = shm_open(name, libc::O_CREAT | libc::O_RDWR, 0o640)?;
        ftruncate(&file, shm_size())?;

        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let ptr: *mut u8 = unsafe { mmap(shm_size(), prot, libc::MAP_SHARED, &file) }?;

        let writer = LogWriter {
            ptr,
            len: shm_size(),
            name: name.to_string(),
            _file: file,
            lock: SpinLock::new(),
        };

        // A pre-existing object carries a stale header; start readers
        // from a clean position.
        writer.header().store(WrapOff::ZERO.pack(), Ordering::Release);

        Ok(writer)
    }

    fn header(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.ptr as *mut u64) }
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.ptr.add(size_of::<u64>()) }
    }

    /// Copy one record into the ring and publish the new position.
    ///
    /// Never blocks on I/O and never allocates; the oldest frames are
    /// overwritten when the reader lags (the reader detects this from
    /// the wrap counter).
    pub fn write(&self, rec: &LogRecord) {
        let _guard = self.lock.lock();

        // Only this process writes the header, and we hold the lock.
        let pos = WrapOff::unpack(self.header().load(Ordering::Relaxed));

        unsafe {
            let frame = self.data().add(pos.off as usize);
            std::ptr::copy_nonoverlapping(rec as *const LogRecord as *const u8, frame, frame_size());
        }

        self.header().store(advance(pos).pack(), Ordering::Release);
    }

    /// Current write position (for tests and diagnostics).
    pub fn position(&self) -> WrapOff {
        WrapOff::unpack(self.header().load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            eprintln!("rtlog: failed to unmap log shm: {e}");
        }
        let _ = shm_unlink(&self.name);
    }
}
