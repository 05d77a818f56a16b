use std::io::{self, Read, Write};
use std::os::fd::RawFd;

use log::{debug, trace, warn};
use rustls::ServerConnection;

use crate::sys::{self, ZeroCopySeq};
use crate::tls::ktls;

/// Readiness hint attached to every transport operation, telling the
/// caller how to adjust epoll interest under edge triggering.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportHint {
    /// Progress was made (or cleanly nothing to do).
    None,
    /// Would block on the read side; wait for the next readable edge.
    ReadReady,
    /// Would block on the write side; arm writable interest.
    WriteReady,
    /// Unrecoverable transport failure.
    Error,
}

#[derive(Clone, Copy, Debug)]
pub struct TransportResult {
    pub bytes: usize,
    pub hint: TransportHint,
}

impl TransportResult {
    pub fn done(bytes: usize) -> TransportResult {
        TransportResult {
            bytes,
            hint: TransportHint::None,
        }
    }

    pub fn hint(hint: TransportHint) -> TransportResult {
        TransportResult { bytes: 0, hint }
    }
}

/// Outcome of attempting kernel TLS send offload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KtlsOutcome {
    Enabled,
    /// Kernel, module, or cipher suite cannot do it; user-space crypto
    /// continues to work.
    Unsupported,
    /// Offload disabled by policy.
    Disabled,
    /// Not applicable (plain transport, or handshake not finished).
    Unknown,
}

/// Negotiated TLS parameters captured at handshake completion for
/// callbacks and metrics.
#[derive(Clone, Debug, Default)]
pub struct TlsInfo {
    pub alpn: Option<String>,
    pub version: Option<String>,
    pub cipher: Option<String>,
}

/// `io::Read`/`io::Write` over a raw non-blocking socket fd, used to pump
/// rustls. `MSG_NOSIGNAL` keeps dying peers from raising SIGPIPE.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(recv(
            self.0,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        ))?;
        Ok(n as usize)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(send(
            self.0,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        ))?;
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Direct socket I/O, optionally with MSG_ZEROCOPY for large payloads.
#[derive(Debug)]
pub struct PlainTransport {
    fd: RawFd,
    zerocopy: ZeroCopySeq,
    zerocopy_threshold: usize,
}

impl PlainTransport {
    pub fn new(fd: RawFd, zerocopy_threshold: usize) -> PlainTransport {
        PlainTransport {
            fd,
            zerocopy: ZeroCopySeq::default(),
            zerocopy_threshold,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> TransportResult {
        loop {
            match syscall!(recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )) {
                Ok(n) => return TransportResult::done(n as usize),
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(ref err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                    return TransportResult::hint(TransportHint::ReadReady)
                }
                Err(err) => {
                    trace!("recv failed on fd {}: {}", self.fd, err);
                    return TransportResult::hint(TransportHint::Error);
                }
            }
        }
    }

    fn write2(&mut self, head: &[u8], body: &[u8]) -> TransportResult {
        let total = head.len() + body.len();
        if total == 0 {
            return TransportResult::done(0);
        }

        if self.zerocopy.enabled() && total >= self.zerocopy_threshold {
            // One EINTR retry, then fall through to a plain write.
            for _ in 0..2 {
                match sys::zerocopy_send(self.fd, head, body, &mut self.zerocopy) {
                    Ok(n) => return TransportResult::done(n),
                    Err(ref err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                        return TransportResult::hint(TransportHint::WriteReady)
                    }
                    Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                    // ENOBUFS: transient kernel refusal, never surfaced to
                    // the caller; retry as a regular copy below.
                    Err(ref err) if err.raw_os_error() == Some(libc::ENOBUFS) => break,
                    Err(err) => {
                        debug!("zerocopy send failed on fd {}: {}", self.fd, err);
                        break;
                    }
                }
            }
        }

        self.writev(head, body)
    }

    fn writev(&mut self, head: &[u8], body: &[u8]) -> TransportResult {
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
        let (ptr, len) = if head.is_empty() {
            (iov[1..].as_mut_ptr(), 1)
        } else if body.is_empty() {
            (iov.as_mut_ptr(), 1)
        } else {
            (iov.as_mut_ptr(), 2)
        };
        msg.msg_iov = ptr;
        msg.msg_iovlen = len;

        loop {
            match syscall!(sendmsg(self.fd, &msg, libc::MSG_NOSIGNAL)) {
                Ok(n) => return TransportResult::done(n as usize),
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(ref err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                    return TransportResult::hint(TransportHint::WriteReady)
                }
                Err(err) => {
                    trace!("sendmsg failed on fd {}: {}", self.fd, err);
                    return TransportResult::hint(TransportHint::Error);
                }
            }
        }
    }
}

/// User-space TLS via rustls. The session lives in an `Option` so kTLS
/// promotion can consume it without dismantling the whole transport.
pub struct TlsTransport {
    conn: Option<Box<ServerConnection>>,
    fd: RawFd,
    read_eof: bool,
    handshake_done: bool,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("fd", &self.fd)
            .field("handshake_done", &self.handshake_done)
            .finish()
    }
}

/// Failure modes of kTLS promotion.
enum KtlsPromotion {
    /// Not possible here; the user-space transport is handed back intact.
    Unsupported(Box<TlsTransport>),
    /// The session was already consumed; the connection must be closed.
    Fatal(io::Error),
}

impl TlsTransport {
    pub fn new(conn: ServerConnection, fd: RawFd) -> TlsTransport {
        TlsTransport {
            conn: Some(Box::new(conn)),
            fd,
            read_eof: false,
            handshake_done: false,
        }
    }

    fn conn_mut(&mut self) -> Option<&mut ServerConnection> {
        self.conn.as_deref_mut()
    }

    /// Push buffered TLS records (handshake replies, alerts, app data) to
    /// the socket. Returns the hint for interest management.
    fn flush_tls(&mut self) -> TransportHint {
        let fd = self.fd;
        let conn = match self.conn_mut() {
            Some(conn) => conn,
            None => return TransportHint::Error,
        };
        let mut io = FdIo(fd);
        while conn.wants_write() {
            match conn.write_tls(&mut io) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return TransportHint::WriteReady
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    trace!("write_tls failed on fd {}: {}", fd, err);
                    return TransportHint::Error;
                }
            }
        }
        TransportHint::None
    }

    fn read(&mut self, buf: &mut [u8]) -> TransportResult {
        let fd = self.fd;
        // Send anything rustls already queued (handshake flights) first.
        if self.flush_tls() == TransportHint::Error {
            return TransportResult::hint(TransportHint::Error);
        }

        let conn = match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => return TransportResult::hint(TransportHint::Error),
        };
        let mut io = FdIo(fd);

        // Pull ciphertext until the socket runs dry. Edge triggering
        // requires draining to EAGAIN.
        loop {
            match conn.read_tls(&mut io) {
                Ok(0) => {
                    self.read_eof = true;
                    break;
                }
                Ok(_) => {
                    if let Err(err) = conn.process_new_packets() {
                        debug!("TLS protocol error on fd {}: {:?}", fd, err);
                        // Try to get the alert out; best effort.
                        let _ = conn.write_tls(&mut io);
                        return TransportResult::hint(TransportHint::Error);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    trace!("read_tls failed on fd {}: {}", fd, err);
                    return TransportResult::hint(TransportHint::Error);
                }
            }
        }

        if !conn.is_handshaking() {
            self.handshake_done = true;
        }

        // Handshake progress may have queued records to send.
        if self.flush_tls() == TransportHint::Error {
            return TransportResult::hint(TransportHint::Error);
        }

        let conn = match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => return TransportResult::hint(TransportHint::Error),
        };
        match conn.reader().read(buf) {
            Ok(n) => TransportResult::done(n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                if self.read_eof {
                    // Peer went away without close_notify; report EOF.
                    TransportResult::done(0)
                } else {
                    TransportResult::hint(TransportHint::ReadReady)
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => TransportResult::done(0),
            Err(err) => {
                trace!("TLS plaintext read failed on fd {}: {}", fd, err);
                TransportResult::hint(TransportHint::Error)
            }
        }
    }

    fn write2(&mut self, head: &[u8], body: &[u8]) -> TransportResult {
        let conn = match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => return TransportResult::hint(TransportHint::Error),
        };

        let mut accepted = 0usize;
        'parts: for part in [head, body] {
            let mut offset = 0;
            while offset < part.len() {
                match conn.writer().write(&part[offset..]) {
                    // Internal buffer limit reached; stop accepting.
                    Ok(0) => break 'parts,
                    Ok(n) => {
                        offset += n;
                        accepted += n;
                    }
                    Err(_) => return TransportResult::hint(TransportHint::Error),
                }
            }
        }

        let hint = self.flush_tls();
        match hint {
            TransportHint::Error => TransportResult::hint(TransportHint::Error),
            TransportHint::WriteReady => TransportResult {
                bytes: accepted,
                hint: TransportHint::WriteReady,
            },
            _ => {
                if accepted < head.len() + body.len() {
                    // rustls buffered as much as it allows; come back once
                    // the socket drained some of it.
                    TransportResult {
                        bytes: accepted,
                        hint: TransportHint::WriteReady,
                    }
                } else {
                    TransportResult::done(accepted)
                }
            }
        }
    }

    fn tls_info(&self) -> TlsInfo {
        match self.conn.as_deref() {
            None => TlsInfo::default(),
            Some(conn) => TlsInfo {
                alpn: conn
                    .alpn_protocol()
                    .map(|proto| String::from_utf8_lossy(proto).into_owned()),
                version: conn
                    .protocol_version()
                    .map(|version| format!("{:?}", version)),
                cipher: conn
                    .negotiated_cipher_suite()
                    .map(|suite| format!("{:?}", suite.suite())),
            },
        }
    }

    /// Promote to kernel TLS. Consumes the rustls session on success (or
    /// on fatal failure); `Unsupported` hands the transport back intact.
    fn into_ktls(
        mut self: Box<Self>,
        zerocopy_threshold: usize,
    ) -> Result<(KtlsTransport, Vec<u8>), KtlsPromotion> {
        let version = self.conn.as_deref().and_then(|conn| conn.protocol_version());
        if !ktls::suite_supported(version) {
            return Err(KtlsPromotion::Unsupported(self));
        }

        // Flush pending records (TLS 1.3 session tickets in particular)
        // through user space before the kernel takes over the stream.
        match self.flush_tls() {
            TransportHint::None => {}
            _ => return Err(KtlsPromotion::Unsupported(self)),
        }

        if ktls::attach_ulp(self.fd).is_err() {
            return Err(KtlsPromotion::Unsupported(self));
        }

        let info = self.tls_info();
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                return Err(KtlsPromotion::Fatal(io::Error::from_raw_os_error(
                    libc::EBADFD,
                )))
            }
        };

        // Plaintext already decrypted in user space must not be lost.
        let mut leftover = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match conn.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => leftover.extend_from_slice(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        let version = match version {
            Some(version) => version,
            None => {
                return Err(KtlsPromotion::Fatal(io::Error::from_raw_os_error(
                    libc::EINVAL,
                )))
            }
        };
        let secrets = conn.dangerous_extract_secrets().map_err(|err| {
            KtlsPromotion::Fatal(io::Error::new(
                io::ErrorKind::Other,
                format!("secret extraction failed: {err}"),
            ))
        })?;
        ktls::install_secrets(self.fd, version, secrets).map_err(KtlsPromotion::Fatal)?;

        Ok((
            KtlsTransport {
                inner: PlainTransport::new(self.fd, zerocopy_threshold),
                info,
            },
            leftover,
        ))
    }
}

/// Kernel TLS: after promotion the kernel crypts records, so I/O is plain
/// socket I/O and `sendfile`/zerocopy work on the TLS stream.
#[derive(Debug)]
pub struct KtlsTransport {
    inner: PlainTransport,
    info: TlsInfo,
}

/// A connection's byte pipe. The variant set is closed; open-ended
/// protocol behavior lives in [`crate::protocol::ProtocolHandler`] instead.
#[derive(Debug)]
pub enum Transport {
    Plain(PlainTransport),
    Tls(Box<TlsTransport>),
    Ktls(KtlsTransport),
}

impl Transport {
    pub fn plain(fd: RawFd, zerocopy_threshold: usize) -> Transport {
        Transport::Plain(PlainTransport::new(fd, zerocopy_threshold))
    }

    pub fn tls(conn: ServerConnection, fd: RawFd) -> Transport {
        Transport::Tls(Box::new(TlsTransport::new(conn, fd)))
    }

    /// Fill `buf` with decrypted bytes. `(0, None)` is a clean peer close.
    pub fn read(&mut self, buf: &mut [u8]) -> TransportResult {
        match self {
            Transport::Plain(transport) => transport.read(buf),
            Transport::Tls(transport) => transport.read(buf),
            Transport::Ktls(transport) => transport.inner.read(buf),
        }
    }

    /// Scatter/gather write of two slices (response head + body). May use
    /// MSG_ZEROCOPY for large payloads: when
    /// [`Transport::zerocopy_pending`] is true afterwards, the caller must
    /// keep both buffers alive and unmodified until completions drain.
    pub fn write2(&mut self, head: &[u8], body: &[u8]) -> TransportResult {
        match self {
            Transport::Plain(transport) => transport.write2(head, body),
            Transport::Tls(transport) => transport.write2(head, body),
            Transport::Ktls(transport) => transport.inner.write2(head, body),
        }
    }

    /// Plain copying write for buffers whose storage may move or mutate
    /// afterwards (the connection's outbound buffer); never pins pages.
    pub fn write(&mut self, data: &[u8]) -> TransportResult {
        match self {
            Transport::Plain(transport) => transport.writev(data, &[]),
            Transport::Tls(transport) => transport.write2(data, &[]),
            Transport::Ktls(transport) => transport.inner.writev(data, &[]),
        }
    }

    /// Push any internally buffered ciphertext out. Plain transports hold
    /// nothing back.
    pub fn flush(&mut self) -> TransportHint {
        match self {
            Transport::Tls(transport) => transport.flush_tls(),
            _ => TransportHint::None,
        }
    }

    /// True while bytes sit in the transport itself (TLS records not yet
    /// written). The drain-close condition must account for these.
    pub fn has_buffered_output(&self) -> bool {
        match self {
            Transport::Tls(transport) => transport
                .conn
                .as_deref()
                .map_or(false, |conn| conn.wants_write()),
            _ => false,
        }
    }

    pub fn handshake_done(&self) -> bool {
        match self {
            Transport::Plain(_) | Transport::Ktls(_) => true,
            Transport::Tls(transport) => transport.handshake_done,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    /// `sendfile` can bypass user space only when no user-space crypto
    /// sits on the stream.
    pub fn sendfile_capable(&self) -> bool {
        !matches!(self, Transport::Tls(_))
    }

    pub fn tls_info(&self) -> TlsInfo {
        match self {
            Transport::Plain(_) => TlsInfo::default(),
            Transport::Tls(transport) => transport.tls_info(),
            Transport::Ktls(transport) => transport.info.clone(),
        }
    }

    /// Attempt send-side kTLS offload. Idempotent: an already promoted
    /// transport reports `Enabled`. `Err` means the TLS session was
    /// consumed but the kernel install failed; the connection is beyond
    /// recovery and must be closed immediately.
    pub fn enable_ktls_send(
        &mut self,
        zerocopy_threshold: usize,
    ) -> io::Result<(KtlsOutcome, Vec<u8>)> {
        match self {
            Transport::Ktls(_) => Ok((KtlsOutcome::Enabled, Vec::new())),
            Transport::Plain(_) => Ok((KtlsOutcome::Unknown, Vec::new())),
            Transport::Tls(transport) => {
                if !transport.handshake_done {
                    return Ok((KtlsOutcome::Unknown, Vec::new()));
                }
                let fd = transport.fd;
                let taken = match std::mem::replace(self, Transport::plain(fd, zerocopy_threshold))
                {
                    Transport::Tls(tls) => tls,
                    _ => unreachable!("variant checked above"),
                };
                match taken.into_ktls(zerocopy_threshold) {
                    Ok((ktls_transport, leftover)) => {
                        *self = Transport::Ktls(ktls_transport);
                        Ok((KtlsOutcome::Enabled, leftover))
                    }
                    Err(KtlsPromotion::Unsupported(tls)) => {
                        *self = Transport::Tls(tls);
                        Ok((KtlsOutcome::Unsupported, Vec::new()))
                    }
                    Err(KtlsPromotion::Fatal(err)) => {
                        warn!("kTLS promotion failed fatally on fd {}: {}", fd, err);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Enable MSG_ZEROCOPY where it is meaningful: plain sockets and kTLS
    /// streams. A no-op (reported unsupported) on user-space TLS.
    pub fn enable_zerocopy(&mut self) -> sys::ZeroCopyEnable {
        let plain = match self {
            Transport::Plain(transport) => transport,
            Transport::Ktls(transport) => &mut transport.inner,
            Transport::Tls(_) => return sys::ZeroCopyEnable::NotSupported,
        };
        let outcome = sys::enable_socket_zerocopy(plain.fd);
        if outcome == sys::ZeroCopyEnable::Enabled {
            plain.zerocopy.set_enabled();
        }
        outcome
    }

    pub fn zerocopy_state(&self) -> Option<&ZeroCopySeq> {
        match self {
            Transport::Plain(transport) => Some(&transport.zerocopy),
            Transport::Ktls(transport) => Some(&transport.inner.zerocopy),
            Transport::Tls(_) => None,
        }
    }

    /// Drain the error queue; returns completions observed.
    pub fn poll_zerocopy_completions(&mut self) -> usize {
        let plain = match self {
            Transport::Plain(transport) => transport,
            Transport::Ktls(transport) => &mut transport.inner,
            Transport::Tls(_) => return 0,
        };
        sys::drain_zerocopy_completions(plain.fd, &mut plain.zerocopy)
    }

    pub fn zerocopy_pending(&self) -> bool {
        self.zerocopy_state().map_or(false, ZeroCopySeq::pending)
    }
}
