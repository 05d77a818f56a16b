//! Raw OS plumbing: epoll, eventfd, timerfd, socket syscalls, `sendfile`,
//! and MSG_ZEROCOPY completion tracking.
//!
//! Everything in this module speaks `RawFd` and errno; protocol logic lives
//! above it and consumes the typed results these wrappers return.

mod event_loop;
mod net;
mod sendfile;
mod timer;
mod wake;
mod zerocopy;

pub use self::event_loop::{EventLoop, EventMask, PollOutcome, PolledEvent};
pub use self::net::{accept_connection, bind_listener, set_nodelay, socket_error, AcceptedSocket};
pub use self::sendfile::{sendfile_to_socket, SendfileOutcome};
pub use self::timer::MaintenanceTimer;
pub use self::wake::WakeupFd;
pub use self::zerocopy::{
    drain_zerocopy_completions, enable_socket_zerocopy, zerocopy_send, ZeroCopyEnable, ZeroCopySeq,
};
