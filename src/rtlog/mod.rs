//! Realtime logging over a shared-memory SPSC ring.
//!
//! Blocks emit bounded, formatted records through their node's log sink
//! without allocating or blocking. The sink is a shared-memory ring of
//! fixed-size frames fronted by a single 64-bit `(wrap, offset)` header
//! that is read and written atomically; an out-of-process reader
//! ([`client::LogClient`], driven by the `blockrt-log` binary) tails the
//! ring and detects overruns from the wrap counter.

use std::fmt::{self, Write as _};

use arrayvec::ArrayString;

use crate::time::{gettime, Timespec};

pub mod client;
pub mod shm;

#[cfg(test)]
mod test;

/// Number of frames in the shared-memory ring.
pub const LOG_BUFFER_DEPTH: usize = 10000;

/// Fixed shm object name of the node log buffer.
pub const LOG_SHM_FILENAME: &str = "rtlog.logshm";

/// Bounded length of a record's source name (bytes, excluding NUL).
pub const SRC_MAXLEN: usize = 30;

/// Bounded length of a record's message (bytes, excluding NUL).
pub const MSG_MAXLEN: usize = 50;

/// Distance (in frames) that [`client::LogClient::seek_to_oldest`] keeps
/// from the write pointer so a late-attaching reader does not race the
/// producer at the tail.
pub const SEEK_OLDEST_CRUSH_ZONE: u32 = 100;

/// Log severity, syslog-style. Records above the effective level are
/// dropped before formatting.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Level {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warn = 4,
    Notice = 5,
    #[default]
    Info = 6,
    Debug = 7,
}

impl Level {
    /// Range-checked conversion; out-of-range values yield `None`.
    pub fn from_i32(v: i32) -> Option<Level> {
        match v {
            0 => Some(Level::Emerg),
            1 => Some(Level::Alert),
            2 => Some(Level::Crit),
            3 => Some(Level::Err),
            4 => Some(Level::Warn),
            5 => Some(Level::Notice),
            6 => Some(Level::Info),
            7 => Some(Level::Debug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Emerg => "EMERG",
            Level::Alert => "ALERT",
            Level::Crit => "CRIT",
            Level::Err => "ERROR",
            Level::Warn => "WARN",
            Level::Notice => "NOTICE",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fixed-size log frame.
///
/// The layout is `#[repr(C)]` and identical for producer and reader,
/// which share the struct definition.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LogRecord {
    level: i32,
    ts: Timespec,
    src: [u8; SRC_MAXLEN + 1],
    msg: [u8; MSG_MAXLEN + 1],
}

impl LogRecord {
    /// Build a record, truncating `src` and the formatted message to
    /// their bounded lengths. Does not allocate.
    pub fn format(level: Level, ts: Timespec, src: &str, args: fmt::Arguments<'_>) -> LogRecord {
        let mut rec = LogRecord {
            level: level as i32,
            ts,
            src: [0; SRC_MAXLEN + 1],
            msg: [0; MSG_MAXLEN + 1],
        };

        let n = src.len().min(SRC_MAXLEN);
        rec.src[..n].copy_from_slice(&src.as_bytes()[..n]);

        let mut buf = ArrayString::<MSG_MAXLEN>::new();
        let _ = Trunc(&mut buf).write_fmt(args);
        rec.msg[..buf.len()].copy_from_slice(buf.as_bytes());

        rec
    }

    pub fn level(&self) -> Option<Level> {
        Level::from_i32(self.level)
    }

    pub fn ts(&self) -> Timespec {
        self.ts
    }

    pub fn src(&self) -> &str {
        str_field(&self.src)
    }

    pub fn msg(&self) -> &str {
        str_field(&self.msg)
    }
}

fn str_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("<non-utf8>")
}

/// `fmt::Write` adaptor that silently truncates at the buffer capacity
/// instead of failing the whole write.
struct Trunc<'a, const N: usize>(&'a mut ArrayString<N>);

impl<const N: usize> fmt::Write for Trunc<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let free = self.0.capacity() - self.0.len();
        if s.len() <= free {
            return self.0.try_push_str(s).map_err(|_| fmt::Error);
        }
        // Cut back to a char boundary.
        let mut n = free;
        while n > 0 && !s.is_char_boundary(n) {
            n -= 1;
        }
        let _ = self.0.try_push_str(&s[..n]);
        Ok(())
    }
}

/// Packed `(wrap, offset)` buffer position. Stored little-endian with
/// `wrap` in the low half so the pair fits one atomic 64-bit word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrapOff {
    pub wrap: u32,
    pub off: u32,
}

impl WrapOff {
    pub const ZERO: WrapOff = WrapOff { wrap: 0, off: 0 };

    pub fn pack(self) -> u64 {
        self.wrap as u64 | (self.off as u64) << 32
    }

    pub fn unpack(v: u64) -> WrapOff {
        WrapOff {
            wrap: v as u32,
            off: (v >> 32) as u32,
        }
    }
}

/// Anything that can emit log records: blocks log with their own name as
/// source, nodes with the node name.
pub trait Loggable {
    /// Effective level of this source (per-block override, else the
    /// node-wide level).
    fn loglevel(&self) -> Level;

    /// Format and emit a record, bypassing the level filter.
    fn emit_record(&self, level: Level, args: fmt::Arguments<'_>);
}

impl<T: Loggable + ?Sized> Loggable for &T {
    fn loglevel(&self) -> Level {
        (**self).loglevel()
    }

    fn emit_record(&self, level: Level, args: fmt::Arguments<'_>) {
        (**self).emit_record(level, args)
    }
}

impl<T: Loggable + ?Sized> Loggable for std::sync::Arc<T> {
    fn loglevel(&self) -> Level {
        (**self).loglevel()
    }

    fn emit_record(&self, level: Level, args: fmt::Arguments<'_>) {
        (**self).emit_record(level, args)
    }
}

/// Macro plumbing; filters on the effective level before formatting.
#[doc(hidden)]
pub fn __log(ctx: &dyn Loggable, level: Level, args: fmt::Arguments<'_>) {
    if level <= ctx.loglevel() {
        ctx.emit_record(level, args);
    }
}

/// Log at `Err` level through a block's or node's sink.
#[macro_export]
macro_rules! log_err {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::rtlog::__log(&$ctx, $crate::rtlog::Level::Err, format_args!($($arg)*))
    };
}

/// Log at `Warn` level through a block's or node's sink.
#[macro_export]
macro_rules! log_warn {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::rtlog::__log(&$ctx, $crate::rtlog::Level::Warn, format_args!($($arg)*))
    };
}

/// Log at `Notice` level through a block's or node's sink.
#[macro_export]
macro_rules! log_notice {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::rtlog::__log(&$ctx, $crate::rtlog::Level::Notice, format_args!($($arg)*))
    };
}

/// Log at `Info` level through a block's or node's sink.
#[macro_export]
macro_rules! log_info {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::rtlog::__log(&$ctx, $crate::rtlog::Level::Info, format_args!($($arg)*))
    };
}

/// Log at `Debug` level through a block's or node's sink.
#[macro_export]
macro_rules! log_dbg {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::rtlog::__log(&$ctx, $crate::rtlog::Level::Debug, format_args!($($arg)*))
    };
}

/// Where a node's records go: the shm ring, or stderr when the shm
/// could not be created.
pub(crate) enum LogSink {
    Shm(shm::LogWriter),
    Stderr,
}

impl LogSink {
    pub(crate) fn write(&self, rec: &LogRecord) {
        match self {
            LogSink::Shm(w) => w.write(rec),
            LogSink::Stderr => {
                let level = rec.level().map(|l| l.as_str()).unwrap_or("INVALID");
                eprintln!(
                    "[{}.{:06}] {} {}: {}",
                    rec.ts().sec,
                    rec.ts().nsec / crate::time::NSEC_PER_USEC,
                    rec.src(),
                    level,
                    rec.msg()
                );
            }
        }
    }
}

pub(crate) fn record_now(level: Level, src: &str, args: fmt::Arguments<'_>) -> LogRecord {
    let ts = gettime().unwrap_or(Timespec::ZERO);
    LogRecord::format(level, ts, src, args)
}
