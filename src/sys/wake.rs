use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Cross-thread wakeup backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// and are added to the count; reads reset the count to 0. Waking an
/// already-woken fd just bumps the counter, so `send` is cheap to call from
/// any thread while the reactor sleeps in `epoll_wait`.
#[derive(Debug)]
pub struct WakeupFd {
    fd: File,
}

impl WakeupFd {
    pub fn new() -> io::Result<WakeupFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a valid owned fd.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(WakeupFd { fd: file })
    }

    /// Signal the owning reactor. Never blocks; if the counter would
    /// overflow, it is drained and the wake retried.
    pub fn send(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is about to overflow;
                // reset it and wake again.
                self.drain();
                let _ = (&self.fd).write(&buf);
            }
            Err(err) => log::warn!("eventfd write failed: {}", err),
        }
    }

    /// Drain pending wakeups. Called by the owning reactor when the fd is
    /// reported readable.
    pub fn drain(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(_) => {}
            // Not yet woken; nothing to drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::warn!("eventfd read failed: {}", err),
        }
    }
}

impl AsRawFd for WakeupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_drain() {
        let wake = WakeupFd::new().unwrap();
        wake.send();
        wake.send();
        wake.drain();
        // Counter reset: a further drain is a no-op.
        wake.drain();
    }
}
