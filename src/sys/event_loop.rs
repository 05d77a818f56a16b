use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use log::{debug, error, warn};

/// Interest/readiness bitmask, mirroring the `epoll_event.events` field.
///
/// The reactor runs everything edge-triggered, so [`EventMask::ET`] is part
/// of every registration built through [`EventMask::readable`] /
/// [`EventMask::read_write`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const IN: EventMask = EventMask(libc::EPOLLIN as u32);
    pub const OUT: EventMask = EventMask(libc::EPOLLOUT as u32);
    pub const ERR: EventMask = EventMask(libc::EPOLLERR as u32);
    pub const HUP: EventMask = EventMask(libc::EPOLLHUP as u32);
    pub const RDHUP: EventMask = EventMask(libc::EPOLLRDHUP as u32);
    pub const ET: EventMask = EventMask(libc::EPOLLET as u32);

    /// Edge-triggered read interest: `EPOLLIN | EPOLLRDHUP | EPOLLET`.
    pub const fn readable() -> EventMask {
        EventMask(libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32 | libc::EPOLLET as u32)
    }

    /// Edge-triggered read+write interest.
    pub const fn read_write() -> EventMask {
        EventMask(
            libc::EPOLLIN as u32
                | libc::EPOLLOUT as u32
                | libc::EPOLLRDHUP as u32
                | libc::EPOLLET as u32,
        )
    }

    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}

/// One ready `(fd, mask)` pair returned by [`EventLoop::poll`].
#[derive(Clone, Copy, Debug)]
pub struct PolledEvent {
    pub fd: RawFd,
    pub mask: EventMask,
}

/// Outcome of a single [`EventLoop::poll`] call.
///
/// `Timeout` covers both the poll deadline elapsing and `EINTR` (treated as
/// a timeout so the caller runs its maintenance pass). `Shutdown` is an
/// unrecoverable `epoll_wait` failure; the caller should stop the loop.
pub enum PollOutcome<'a> {
    Ready(&'a [PolledEvent]),
    Timeout,
    Shutdown,
}

/// Edge-triggered readiness multiplexer over an `epoll` instance.
///
/// The event buffer starts at [`EventLoop::INITIAL_CAPACITY`] slots and
/// doubles whenever a poll comes back completely full, which yields
/// amortized O(1) growth and keeps the hot path allocation-free. The buffer
/// never shrinks: poll cost is independent of capacity and keeping the
/// memory avoids oscillations under fluctuating load. A failed growth
/// allocation is non-fatal; the next poll simply reuses the old capacity.
#[derive(Debug)]
pub struct EventLoop {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    poll_timeout_ms: libc::c_int,
    // Mirror of the last lengths handed out as `PolledEvent`s; reused across
    // polls so `poll()` hands out a span without allocating.
    scratch: Vec<PolledEvent>,
}

impl EventLoop {
    pub const INITIAL_CAPACITY: usize = 64;

    pub fn new(poll_timeout: Duration) -> io::Result<EventLoop> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EventLoop {
            ep,
            events: Vec::with_capacity(Self::INITIAL_CAPACITY),
            poll_timeout_ms: duration_to_millis(poll_timeout),
            scratch: Vec::with_capacity(Self::INITIAL_CAPACITY),
        })
    }

    /// Number of event slots available without reallocation.
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    pub fn update_poll_timeout(&mut self, poll_timeout: Duration) {
        self.poll_timeout_ms = duration_to_millis(poll_timeout);
    }

    /// Register `fd` with the given interest. Returns false on failure
    /// (logged); the caller decides policy.
    pub fn add(&self, fd: RawFd, mask: EventMask) -> bool {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, mask) {
            Ok(()) => true,
            Err(err) => {
                error!("epoll_ctl(ADD) failed for fd {}: {}", fd, err);
                false
            }
        }
    }

    /// Register `fd`, raising the underlying OS error on failure.
    pub fn add_or_err(&self, fd: RawFd, mask: EventMask) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    /// Change the interest set of an already registered `fd`. Returns false
    /// on failure (logged); with edge triggering a lost `mod` means the fd
    /// is unreachable, so callers escalate to drain-and-close.
    pub fn modify(&self, fd: RawFd, mask: EventMask) -> bool {
        match self.ctl(libc::EPOLL_CTL_MOD, fd, mask) {
            Ok(()) => true,
            Err(err) => {
                warn!("epoll_ctl(MOD) failed for fd {}: {}", fd, err);
                false
            }
        }
    }

    /// Deregister `fd`. Best-effort: failure is logged only, as the usual
    /// cause is the fd already being gone.
    pub fn del(&self, fd: RawFd) {
        if let Err(err) = syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        )) {
            debug!("epoll_ctl(DEL) failed for fd {}: {}", fd, err);
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: EventMask) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask.0,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
    }

    /// Wait for readiness, up to the configured poll timeout.
    ///
    /// Returns a span over the internal reusable buffer. `EINTR` is folded
    /// into `Timeout` so signal delivery triggers a maintenance pass rather
    /// than an error path.
    pub fn poll(&mut self) -> PollOutcome<'_> {
        let capacity = self.events.capacity();
        self.events.clear();
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            capacity as libc::c_int,
            self.poll_timeout_ms,
        ));

        let n_events = match res {
            Ok(n) => n as usize,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => return PollOutcome::Timeout,
            Err(err) => {
                error!("epoll_wait failed: {}", err);
                return PollOutcome::Shutdown;
            }
        };

        if n_events == 0 {
            return PollOutcome::Timeout;
        }

        // SAFETY: `epoll_wait` wrote `n_events` entries.
        unsafe { self.events.set_len(n_events) };

        self.scratch.clear();
        self.scratch.extend(self.events.iter().map(|ev| PolledEvent {
            fd: ev.u64 as RawFd,
            mask: EventMask(ev.events),
        }));

        // A completely full batch suggests more events were pending; double
        // the buffer for the next poll. Growth failure is tolerated.
        if n_events == capacity {
            self.events.reserve(capacity);
        }

        PollOutcome::Ready(&self.scratch)
    }
}

impl AsRawFd for EventLoop {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn duration_to_millis(timeout: Duration) -> libc::c_int {
    // `Duration::as_millis` truncates, so round up. This avoids turning
    // sub-millisecond timeouts into a busy-looping zero timeout.
    timeout
        .checked_add(Duration::from_nanos(999_999))
        .unwrap_or(timeout)
        .as_millis()
        .min(libc::c_int::MAX as u128) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_capacity() {
        let event_loop = EventLoop::new(Duration::from_millis(10)).unwrap();
        assert!(event_loop.capacity() >= EventLoop::INITIAL_CAPACITY);
    }

    #[test]
    fn poll_times_out_with_no_registrations() {
        let mut event_loop = EventLoop::new(Duration::from_millis(1)).unwrap();
        match event_loop.poll() {
            PollOutcome::Timeout => {}
            PollOutcome::Ready(events) => panic!("unexpected events: {:?}", events),
            PollOutcome::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn add_modify_del_roundtrip() {
        let event_loop = EventLoop::new(Duration::from_millis(1)).unwrap();
        let wake = crate::sys::WakeupFd::new().unwrap();
        assert!(event_loop.add(wake.as_raw_fd(), EventMask::readable()));
        assert!(event_loop.modify(wake.as_raw_fd(), EventMask::read_write()));
        event_loop.del(wake.as_raw_fd());
    }

    #[test]
    fn wakeup_is_reported_readable() {
        let mut event_loop = EventLoop::new(Duration::from_millis(100)).unwrap();
        let wake = crate::sys::WakeupFd::new().unwrap();
        assert!(event_loop.add(wake.as_raw_fd(), EventMask::readable()));
        wake.send();
        match event_loop.poll() {
            PollOutcome::Ready(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].fd, wake.as_raw_fd());
                assert!(events[0].mask.contains(EventMask::IN));
            }
            _ => panic!("expected a readiness event"),
        }
    }
}
