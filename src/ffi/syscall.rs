use std::ffi::CString;
use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd};

pub fn shm_open(name: &str, oflag: i32, mode: u32) -> Result<File> {
    let name = CString::new(name).map_err(|_| ErrorKind::InvalidInput)?;
    let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, mode as libc::mode_t) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn shm_unlink(name: &str) -> Result<()> {
    let name = CString::new(name).map_err(|_| ErrorKind::InvalidInput)?;
    let result = unsafe { libc::shm_unlink(name.as_ptr()) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ftruncate(file: &File, len: usize) -> Result<()> {
    let result = unsafe { libc::ftruncate(file.as_raw_fd(), len as libc::off_t) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn fstat_size(file: &File) -> Result<(usize, u64)> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    let result = unsafe { libc::fstat(file.as_raw_fd(), st.as_mut_ptr()) };
    if result != -1 {
        let st = unsafe { st.assume_init() };
        Ok((st.st_size as usize, st.st_ino))
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn mmap<T>(len: usize, prot: i32, flags: i32, file: &File) -> Result<*mut T> {
    let ptr = libc::mmap(std::ptr::null_mut(), len, prot, flags, file.as_raw_fd(), 0);
    if ptr != libc::MAP_FAILED {
        Ok(ptr as _)
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn munmap<T>(ptr: *mut T, len: usize) -> Result<()> {
    let result = libc::munmap(ptr as _, len);
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn clock_gettime(clockid: libc::clockid_t) -> Result<libc::timespec> {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let result = unsafe { libc::clock_gettime(clockid, ts.as_mut_ptr()) };
    if result != -1 {
        Ok(unsafe { ts.assume_init() })
    } else {
        Err(Error::last_os_error())
    }
}

/// Absolute-deadline sleep on `clockid`, retrying on `EINTR`.
pub fn clock_nanosleep_abs(clockid: libc::clockid_t, deadline: &libc::timespec) -> Result<()> {
    loop {
        // clock_nanosleep returns the error number directly, not -1/errno.
        let errno = unsafe {
            libc::clock_nanosleep(clockid, libc::TIMER_ABSTIME, deadline, std::ptr::null_mut())
        };
        match errno {
            0 => return Ok(()),
            libc::EINTR => continue,
            e => return Err(Error::from_raw_os_error(e)),
        }
    }
}

/// Set scheduling policy and priority of the calling thread.
pub fn setschedparam_self(policy: i32, priority: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let errno = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
    if errno == 0 {
        Ok(())
    } else {
        Err(Error::from_raw_os_error(errno))
    }
}
