use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

/// Periodic maintenance tick backed by `timerfd`.
///
/// Drives idle sweeps and deferred-write retries without relying on
/// `epoll_wait` timeouts: under load the wait may return immediately for
/// long stretches and never hit its timeout path.
#[derive(Debug)]
pub struct MaintenanceTimer {
    fd: File,
}

impl MaintenanceTimer {
    pub fn new() -> io::Result<MaintenanceTimer> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        ))?;
        // SAFETY: `timerfd_create(2)` returned a valid owned fd.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(MaintenanceTimer { fd: file })
    }

    /// (Re-)arm the timer with the given period. A zero period disarms it.
    pub fn arm_periodic(&self, period: Duration) -> io::Result<()> {
        let ts = libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(period.subsec_nanos() as i32),
        };
        let spec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    /// Consume the expiration counter after the fd is reported readable.
    /// With edge triggering an unread counter would suppress later ticks.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::warn!("timerfd read failed: {}", err),
        }
    }
}

impl AsRawFd for MaintenanceTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
