pub mod syscall;

/// Monotonic clock used for trigger pacing and log timestamps.
pub const CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
