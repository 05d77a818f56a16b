use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;

// Not exposed through the libc crate on all supported versions.
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

/// Outcome of enabling `SO_ZEROCOPY` on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroCopyEnable {
    Enabled,
    /// Kernel or socket type does not support zerocopy. Not an error.
    NotSupported,
    Error,
}

/// Per-connection MSG_ZEROCOPY sequence cursor.
///
/// The kernel numbers zerocopy sends on a socket monotonically from 0 and
/// acknowledges them through the error queue as inclusive ranges. `lo` is
/// the next unacknowledged sequence, `hi` the next to issue, so
/// `hi - lo` is the number of buffers still pinned by the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroCopySeq {
    pub lo: u32,
    pub hi: u32,
    enabled: bool,
}

impl ZeroCopySeq {
    pub fn pending(&self) -> bool {
        self.lo < self.hi
    }

    pub fn pending_count(&self) -> u32 {
        self.hi - self.lo
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self) {
        self.enabled = true;
    }
}

/// Enable `SO_ZEROCOPY`. `ENOPROTOOPT`/`EOPNOTSUPP` mean the feature is
/// unavailable on this kernel or socket type, which is fine.
pub fn enable_socket_zerocopy(fd: RawFd) -> ZeroCopyEnable {
    let val: libc::c_int = 1;
    let res = syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ZEROCOPY,
        &val as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ));
    match res {
        Ok(_) => ZeroCopyEnable::Enabled,
        Err(ref err)
            if err.raw_os_error() == Some(libc::ENOPROTOOPT)
                || err.raw_os_error() == Some(libc::EOPNOTSUPP) =>
        {
            ZeroCopyEnable::NotSupported
        }
        Err(_) => ZeroCopyEnable::Error,
    }
}

/// Send `head` + `body` with `MSG_ZEROCOPY | MSG_NOSIGNAL`, bumping `seq.hi`
/// on success.
///
/// On success the caller MUST keep both buffers alive and unmodified until
/// the matching completion is observed by [`drain_zerocopy_completions`]:
/// the kernel DMAs from the user pages asynchronously and reusing them early
/// corrupts the stream.
pub fn zerocopy_send(
    fd: RawFd,
    head: &[u8],
    body: &[u8],
    seq: &mut ZeroCopySeq,
) -> io::Result<usize> {
    let mut iov = [
        libc::iovec {
            iov_base: head.as_ptr() as *mut libc::c_void,
            iov_len: head.len(),
        },
        libc::iovec {
            iov_base: body.as_ptr() as *mut libc::c_void,
            iov_len: body.len(),
        },
    ];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = if body.is_empty() { 1 } else { 2 };

    let sent = syscall!(sendmsg(fd, &msg, libc::MSG_ZEROCOPY | libc::MSG_NOSIGNAL))?;
    if sent > 0 {
        seq.hi = seq.hi.wrapping_add(1);
    }
    Ok(sent as usize)
}

/// Drain the socket error queue, advancing `seq.lo` past every range the
/// kernel reports complete. Returns the number of completion notifications
/// processed (possibly 0).
///
/// Anything other than `EAGAIN` stops this drain without being treated as
/// fatal; the pending set is kept and retried on the next maintenance tick.
pub fn drain_zerocopy_completions(fd: RawFd, seq: &mut ZeroCopySeq) -> usize {
    if !seq.pending() {
        return 0;
    }

    let mut completions = 0usize;
    // Space for one extended error structure plus its associated address.
    let mut control = [0u8; 64];

    loop {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        let res = syscall!(recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT));
        if res.is_err() {
            // EAGAIN means no more completions; other errors also stop the
            // drain but keep the pending cursor untouched.
            break;
        }

        // SAFETY: msghdr was filled by recvmsg; CMSG_* walk its control area.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let ctype = (*cmsg).cmsg_type;
                let is_ip_err = (level == libc::SOL_IP && ctype == libc::IP_RECVERR)
                    || (level == libc::SOL_IPV6 && ctype == libc::IPV6_RECVERR);
                if is_ip_err {
                    let serr = libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err;
                    if (*serr).ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                        // ee_data is the last completed sequence, inclusive.
                        // ee_code may say the kernel fell back to copying;
                        // either way the buffers are reusable now.
                        seq.lo = (*serr).ee_data.wrapping_add(1);
                        completions += 1;
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
    }

    completions
}
