use std::collections::VecDeque;
use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use log::trace;

use crate::buf::ByteBuf;
use crate::handlers::{AwaitReason, RequestTask};
use crate::http::HttpRequest;
use crate::protocol::{ProtocolHandler, ProtocolType};
use crate::sys::{self, SendfileOutcome};
use crate::tls::TlsContext;
use crate::transport::{Transport, TransportResult};

/// How much we try to pull off a socket per read call. Edge triggering
/// loops this until `EAGAIN`.
pub(crate) const READ_CHUNK: usize = 16 * 1024;

/// Close escalation ladder. Transitions are monotonic: `Immediate`
/// dominates `DrainThenClose`, and nothing ever goes back to `None`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub(crate) enum CloseMode {
    #[default]
    None,
    DrainThenClose,
    Immediate,
}

/// In-flight large-body response driven by the file-send engine.
#[derive(Debug, Default)]
pub(crate) struct FileSendState {
    pub file: Option<File>,
    pub active: bool,
    /// Response headers still sit in the outbound buffer and must flush
    /// before any file byte.
    pub headers_pending: bool,
    pub offset: u64,
    pub remaining: u64,
}

/// Progress report from one file-send engine step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FileProgress {
    /// Bytes went straight to the socket via `sendfile`.
    Sent(usize),
    /// Bytes were staged into the file scratch buffer (TLS path); the
    /// caller flushes them through the transport.
    Read(usize),
    WouldBlock { enable_writable: bool },
    Error,
}

/// Decode bookkeeping for a request whose body has not fully arrived.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingBody {
    pub chunked: bool,
    pub expect_continue: bool,
    pub continue_sent: bool,
}

/// A suspended async handler parked on the connection.
pub(crate) struct AsyncTaskState {
    pub task: RequestTask,
    pub await_reason: AwaitReason,
    pub needs_body: bool,
    pub pending: PendingBody,
}

/// Everything the server tracks for one accepted socket.
///
/// Owned and mutated exclusively by the event-loop thread. The entry in
/// the server's fd-keyed connection table is the single owner; peers of a
/// tunnel refer to each other by fd, never by reference.
pub(crate) struct Connection {
    socket: OwnedFd,
    pub peer_addr: SocketAddr,
    pub transport: Transport,

    /// Raw bytes received, not yet consumed by the active pipeline.
    pub in_buf: ByteBuf,
    /// Bytes queued for the socket.
    pub out_buf: ByteBuf,
    /// File staging (TLS file responses) XOR raw tunnel passthrough bytes;
    /// never both at once.
    pub tunnel_or_file_buf: Vec<u8>,
    /// Buffers pinned by the kernel for in-flight MSG_ZEROCOPY sends,
    /// FIFO by issue sequence. Released only as completions arrive.
    zerocopy_held: VecDeque<(u32, Vec<u8>)>,

    pub request: HttpRequest,
    pub requests_served: u32,

    pub last_activity: Instant,
    /// First byte of a pending request head; cleared once parsed.
    pub header_start: Option<Instant>,
    pub body_last_activity: Option<Instant>,
    pub accepted_at: Instant,

    pub close_mode: CloseMode,
    pub waiting_writable: bool,
    pub tls_established: bool,
    pub waiting_for_body: bool,
    /// Outbound `connect()` for a tunnel upstream has not completed yet.
    pub connect_pending: bool,
    pub zerocopy_requested: bool,

    pub protocol: ProtocolType,
    pub handler: Option<Box<dyn ProtocolHandler>>,
    pub file_send: FileSendState,
    pub pending_body: Option<PendingBody>,
    pub async_task: Option<AsyncTaskState>,

    /// Tunnel peer (by fd, cleared before close cascade) and the HTTP/2
    /// stream the tunnel belongs to.
    pub peer_fd: RawFd,
    pub peer_stream_id: u32,

    /// Keeps the TLS context this connection started with alive across
    /// hot reloads.
    pub tls_keepalive: Option<Arc<TlsContext>>,
    pub tls_handshake_emitted: bool,
}

impl Connection {
    pub fn new(
        socket: OwnedFd,
        peer_addr: SocketAddr,
        transport: Transport,
        now: Instant,
    ) -> Connection {
        Connection {
            socket,
            peer_addr,
            transport,
            in_buf: ByteBuf::new(),
            out_buf: ByteBuf::new(),
            tunnel_or_file_buf: Vec::new(),
            zerocopy_held: VecDeque::new(),
            request: HttpRequest::default(),
            requests_served: 0,
            last_activity: now,
            header_start: None,
            body_last_activity: None,
            accepted_at: now,
            close_mode: CloseMode::None,
            waiting_writable: false,
            tls_established: false,
            waiting_for_body: false,
            connect_pending: false,
            zerocopy_requested: false,
            protocol: ProtocolType::Http11,
            handler: None,
            file_send: FileSendState::default(),
            pending_body: None,
            async_task: None,
            peer_fd: -1,
            peer_stream_id: 0,
            tls_keepalive: None,
            tls_handshake_emitted: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn is_tunneling(&self) -> bool {
        self.peer_fd != -1
    }

    pub fn request_immediate_close(&mut self) {
        self.close_mode = CloseMode::Immediate;
    }

    pub fn request_drain_and_close(&mut self) {
        if self.close_mode == CloseMode::None {
            self.close_mode = CloseMode::DrainThenClose;
        }
    }

    pub fn close_requested(&self) -> bool {
        self.close_mode != CloseMode::None
    }

    pub fn can_close_for_drain(&self) -> bool {
        self.close_mode == CloseMode::DrainThenClose
            && self.out_buf.is_empty()
            && self.tunnel_or_file_buf.is_empty()
            && !self.file_send.active
            && !self.transport.has_buffered_output()
            && !self.transport.zerocopy_pending()
    }

    pub fn can_close_immediately(&self) -> bool {
        self.close_mode == CloseMode::Immediate || self.can_close_for_drain()
    }

    /// Pull up to `chunk` bytes off the transport into the input buffer.
    pub fn transport_read(&mut self, chunk: usize) -> TransportResult {
        let spare = self.in_buf.spare_capacity(chunk);
        let result = self.transport.read(spare);
        self.in_buf.truncate_back(chunk - result.bytes);
        result
    }

    /// One step of the file-send engine (§ file responses).
    ///
    /// Plain/kTLS transports hand the file to the kernel via `sendfile`;
    /// user-space TLS stages reads into `tunnel_or_file_buf` which the
    /// caller then writes through the transport like ordinary data.
    pub fn transport_file(&mut self, max_chunk: usize) -> FileProgress {
        debug_assert!(self.file_send.active);
        let file_fd = match &self.file_send.file {
            Some(file) => file.as_raw_fd(),
            None => return FileProgress::Error,
        };
        let want = (self.file_send.remaining as usize).min(max_chunk);

        if self.transport.sendfile_capable() {
            match sys::sendfile_to_socket(self.fd(), file_fd, self.file_send.offset, want) {
                SendfileOutcome::Sent(n) => {
                    self.file_send.offset += n as u64;
                    self.file_send.remaining -= n as u64;
                    if self.file_send.remaining == 0 {
                        self.file_send.active = false;
                        self.file_send.file = None;
                    }
                    FileProgress::Sent(n)
                }
                SendfileOutcome::WouldBlock { enable_writable } => {
                    FileProgress::WouldBlock { enable_writable }
                }
                SendfileOutcome::Error(err) => {
                    trace!("sendfile failed on fd {}: {}", self.fd(), err);
                    self.file_send.active = false;
                    self.file_send.file = None;
                    self.request_immediate_close();
                    FileProgress::Error
                }
            }
        } else {
            let staged = self.tunnel_or_file_buf.len();
            self.tunnel_or_file_buf.resize(staged + want, 0);
            let res = syscall!(pread(
                file_fd,
                self.tunnel_or_file_buf[staged..].as_mut_ptr() as *mut libc::c_void,
                want,
                self.file_send.offset as libc::off_t,
            ));
            match res {
                Ok(0) => {
                    // Unexpected short file; non-fatal, retried on the next
                    // maintenance tick.
                    self.tunnel_or_file_buf.truncate(staged);
                    FileProgress::WouldBlock {
                        enable_writable: false,
                    }
                }
                Ok(n) => {
                    let n = n as usize;
                    self.tunnel_or_file_buf.truncate(staged + n);
                    self.file_send.offset += n as u64;
                    self.file_send.remaining -= n as u64;
                    if self.file_send.remaining == 0 {
                        self.file_send.active = false;
                        self.file_send.file = None;
                    }
                    FileProgress::Read(n)
                }
                Err(ref err)
                    if err.raw_os_error() == Some(libc::EINTR)
                        || err.raw_os_error() == Some(libc::EAGAIN) =>
                {
                    self.tunnel_or_file_buf.truncate(staged);
                    FileProgress::WouldBlock {
                        enable_writable: false,
                    }
                }
                Err(err) => {
                    trace!("pread failed for file response on fd {}: {}", self.fd(), err);
                    self.tunnel_or_file_buf.truncate(staged);
                    self.file_send.active = false;
                    self.file_send.file = None;
                    self.request_immediate_close();
                    FileProgress::Error
                }
            }
        }
    }

    /// Keep `buffers` alive until the kernel confirms their zerocopy
    /// sends. If nothing is pending they are dropped immediately.
    pub fn hold_if_zerocopy_pending(&mut self, buffers: impl IntoIterator<Item = Vec<u8>>) {
        if !self.transport.zerocopy_pending() {
            return;
        }
        let issued = match self.transport.zerocopy_state() {
            Some(state) => state.hi.wrapping_sub(1),
            None => return,
        };
        for buffer in buffers {
            if !buffer.is_empty() {
                self.zerocopy_held.push_back((issued, buffer));
            }
        }
    }

    /// Drain the error queue and drop held buffers whose sends completed.
    /// Returns the number of completion notifications observed.
    pub fn release_completed_zerocopy(&mut self) -> usize {
        if self.zerocopy_held.is_empty() && !self.transport.zerocopy_pending() {
            return 0;
        }
        let completions = self.transport.poll_zerocopy_completions();
        if let Some(state) = self.transport.zerocopy_state() {
            let lo = state.lo;
            while let Some((seq, _)) = self.zerocopy_held.front() {
                // Strictly FIFO: release while seq < lo in wrapping order.
                if lo.wrapping_sub(*seq) as i32 > 0 {
                    self.zerocopy_held.pop_front();
                } else {
                    break;
                }
            }
        }
        completions
    }

    pub fn has_zerocopy_held(&self) -> bool {
        !self.zerocopy_held.is_empty()
    }

    /// Maintenance: give back memory hoarded by bursts.
    pub fn reclaim_oversized_buffers(&mut self, threshold: usize) {
        self.in_buf.shrink_if_oversized(threshold);
        self.out_buf.shrink_if_oversized(threshold);
        if self.tunnel_or_file_buf.capacity() > threshold && self.tunnel_or_file_buf.is_empty() {
            self.tunnel_or_file_buf.shrink_to(threshold);
        }
    }

    /// Flush helper used by the writable path: write from `out_buf` and
    /// consume what the socket took.
    pub fn flush_out_buf(&mut self) -> TransportResult {
        if self.out_buf.is_empty() {
            return TransportResult::done(0);
        }
        let result = self.transport.write(self.out_buf.as_slice());
        if result.bytes > 0 {
            self.out_buf.consume(result.bytes);
        }
        result
    }

    /// Flush staged file bytes (TLS path) from the scratch buffer.
    pub fn flush_file_buf(&mut self) -> TransportResult {
        if self.tunnel_or_file_buf.is_empty() {
            return TransportResult::done(0);
        }
        let result = self.transport.write(&self.tunnel_or_file_buf);
        if result.bytes > 0 {
            self.tunnel_or_file_buf.drain(..result.bytes);
        }
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("peer", &self.peer_addr)
            .field("protocol", &self.protocol)
            .field("close_mode", &self.close_mode)
            .field("in", &self.in_buf.len())
            .field("out", &self.out_buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::{FromRawFd, IntoRawFd};

    fn connected_pair() -> (TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer_addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let fd = server.into_raw_fd();
        // SAFETY: into_raw_fd transferred ownership.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };
        let transport = Transport::plain(fd, 16 * 1024);
        (
            client,
            Connection::new(socket, peer_addr, transport, Instant::now()),
        )
    }

    #[test]
    fn close_mode_is_monotonic() {
        let (_client, mut conn) = connected_pair();
        conn.request_drain_and_close();
        assert_eq!(conn.close_mode, CloseMode::DrainThenClose);
        conn.request_immediate_close();
        assert_eq!(conn.close_mode, CloseMode::Immediate);
        // Drain request never downgrades an immediate close.
        conn.request_drain_and_close();
        assert_eq!(conn.close_mode, CloseMode::Immediate);
    }

    #[test]
    fn drain_close_waits_for_buffers() {
        let (_client, mut conn) = connected_pair();
        conn.request_drain_and_close();
        assert!(conn.can_close_for_drain());
        conn.out_buf.extend_from_slice(b"pending");
        assert!(!conn.can_close_for_drain());
        conn.out_buf.consume(7);
        assert!(conn.can_close_for_drain());
    }

    #[test]
    fn transport_read_appends_to_in_buf() {
        let (mut client, mut conn) = connected_pair();
        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let result = conn.transport_read(READ_CHUNK);
        assert_eq!(result.bytes, 16);
        assert_eq!(conn.in_buf.as_slice(), b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn file_send_via_sendfile_tracks_offsets() {
        let (mut client, mut conn) = connected_pair();

        let mut file = tempfile();
        file.write_all(&vec![b'z'; 1000]).unwrap();
        conn.file_send = FileSendState {
            file: Some(file),
            active: true,
            headers_pending: false,
            offset: 0,
            remaining: 1000,
        };

        let mut total = 0usize;
        while conn.file_send.active {
            match conn.transport_file(256) {
                FileProgress::Sent(n) => total += n,
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(total, 1000);
        assert_eq!(conn.file_send.offset, 1000);
        assert_eq!(conn.file_send.remaining, 0);

        let mut received = vec![0u8; 1000];
        client.read_exact(&mut received).unwrap();
        assert!(received.iter().all(|&byte| byte == b'z'));
    }

    #[test]
    fn zerocopy_buffers_held_until_completion() {
        let (mut client, mut conn) = connected_pair();
        if conn.transport.enable_zerocopy() != sys::ZeroCopyEnable::Enabled {
            // Kernel without MSG_ZEROCOPY support; nothing to verify here.
            return;
        }
        conn.zerocopy_requested = true;

        let payload = vec![7u8; 17 * 1024];
        let result = conn.transport.write2(&payload, &[]);
        assert!(result.bytes > 0);
        conn.hold_if_zerocopy_pending([payload]);
        if !conn.transport.zerocopy_pending() {
            return; // kernel served it as a plain send
        }
        assert!(conn.has_zerocopy_held());

        // Drain the peer so the kernel can complete the send, then poll
        // the error queue until the buffer is released.
        let mut sink = vec![0u8; 32 * 1024];
        let _ = client.read(&mut sink);
        for _ in 0..200 {
            conn.release_completed_zerocopy();
            if !conn.has_zerocopy_held() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            let _ = client.read(&mut sink);
        }
        assert!(!conn.has_zerocopy_held(), "completion never released the buffer");
    }

    fn tempfile() -> File {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "aeronet-conn-test-{}-{:p}",
            std::process::id(),
            &path
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
