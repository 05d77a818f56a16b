use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::config::{HttpServerConfig, KtlsMode, TelemetryConfig, ZeroCopyMode};
use crate::connection::{
    CloseMode, Connection, FileProgress, FileSendState, PendingBody, READ_CHUNK,
};
use crate::handlers::{
    AwaitReason, ExpectationHandler, ExpectationResult, Http2HandlerFactory, MetricsCallback,
    ParserErrorCallback, RequestMetrics, ResponseStream, TaskContext, TaskPoll,
    TlsHandshakeCallback, TlsHandshakeEvent,
};
use crate::http::body::{decode_chunked, ChunkedDecode};
use crate::http::encoding::{decompress_request_body, Encoding, EncodingSelector};
use crate::http::request::HeadParse;
use crate::http::response::{
    build_simple_error, is_reserved_header, write_header, write_status_line, ResponseBody,
};
use crate::http::{self, HttpRequest, HttpResponse, Method, StatusCode, Version};
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::protocol::{ProtocolAction, ProtocolType};
use crate::router::{RedirectSlash, Router, RoutingResult};
use crate::sys::{
    self, EventLoop, EventMask, MaintenanceTimer, PollOutcome, PolledEvent, WakeupFd,
};
use crate::tls::ticket::TicketKeyStore;
use crate::tls::TlsContext;
use crate::transport::{KtlsOutcome, Transport, TransportHint};
use crate::upgrade;
use crate::websocket::{self, WebSocketHandler};
use crate::ServerError;

/// Largest slice handed to one `sendfile` call or staged per `pread`.
const FILE_CHUNK: usize = 256 * 1024;
/// Scratch buffers above this get shrunk on maintenance ticks.
const BUFFER_RECLAIM_THRESHOLD: usize = 64 * 1024;

// Process-wide stop request, typically set from a signal handler installed
// by the embedding process. Polled on every maintenance tick.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Ask every running server in this process to drain and stop. Safe to
/// call from a signal handler.
pub fn request_stop() {
    STOP_REQUESTED.store(true, Ordering::Release);
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::Acquire)
}

/// Cumulative counters surfaced by [`Server::stats`].
#[derive(Debug, Default, Clone)]
pub struct ServerStats {
    pub total_bytes_queued: u64,
    pub total_bytes_written_immediate: u64,
    pub total_bytes_written_flush: u64,
    pub deferred_write_events: u64,
    pub flush_cycles: u64,
    pub epoll_mod_failures: u64,
    pub max_connection_outbound_buffer: u64,
    pub total_requests_served: u64,
    pub connections_accepted: u64,
    pub tls_handshakes_succeeded: u64,
    pub tls_handshakes_failed: u64,
    pub tls_handshakes_rejected_rate_limit: u64,
    pub tls_alpn_distribution: Vec<(String, u64)>,
    pub ktls_send_enabled_connections: u64,
    pub ktls_send_enable_fallbacks: u64,
    pub ktls_send_forced_shutdowns: u64,
}

#[derive(Debug, Default)]
struct StatsInternal {
    total_bytes_queued: u64,
    total_bytes_written_immediate: u64,
    total_bytes_written_flush: u64,
    deferred_write_events: u64,
    flush_cycles: u64,
    epoll_mod_failures: u64,
    max_connection_outbound_buffer: u64,
    total_requests_served: u64,
    connections_accepted: u64,
    tls_handshakes_succeeded: u64,
    tls_handshakes_failed: u64,
    tls_handshakes_rejected_rate_limit: u64,
    tls_alpn: HashMap<String, u64>,
    ktls_enabled: u64,
    ktls_fallbacks: u64,
    ktls_forced_shutdowns: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LifecycleState {
    Running,
    Draining,
    Stopping,
}

struct Lifecycle {
    state: LifecycleState,
    drain_deadline: Option<Instant>,
}

#[derive(Default)]
struct Callbacks {
    parser_err: Option<ParserErrorCallback>,
    metrics: Option<MetricsCallback>,
    tls_handshake: Option<TlsHandshakeCallback>,
    expectation: Option<ExpectationHandler>,
}

type ConfigUpdater = Box<dyn FnOnce(&mut HttpServerConfig) + Send>;
type RouterUpdater = Box<dyn FnOnce(&mut Router) + Send>;

struct AsyncCompletion {
    fd: RawFd,
    work: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct PendingUpdates {
    config: Vec<ConfigUpdater>,
    router: Vec<RouterUpdater>,
    async_completions: Vec<AsyncCompletion>,
    drain: Option<Option<Duration>>,
    stop: bool,
}

/// Thread-safe control surface shared between the server and its handles.
struct SharedControl {
    updates: Mutex<PendingUpdates>,
    wakeup: WakeupFd,
}

/// Cloneable handle for posting work to a running server from any thread.
/// Updates are applied exactly once, at the top of the next loop tick, in
/// order: config, router, async completions.
#[derive(Clone)]
pub struct ServerHandle {
    control: Arc<SharedControl>,
}

impl ServerHandle {
    pub fn post_config_update(
        &self,
        updater: impl FnOnce(&mut HttpServerConfig) + Send + 'static,
    ) {
        if let Ok(mut updates) = self.control.updates.lock() {
            updates.config.push(Box::new(updater));
        }
        self.control.wakeup.send();
    }

    pub fn post_router_update(&self, updater: impl FnOnce(&mut Router) + Send + 'static) {
        if let Ok(mut updates) = self.control.updates.lock() {
            updates.router.push(Box::new(updater));
        }
        self.control.wakeup.send();
    }

    /// Resume the async task parked on `connection_fd`, optionally running
    /// `work` on the event-loop thread first.
    pub fn post_async_completion(
        &self,
        connection_fd: RawFd,
        work: impl FnOnce() + Send + 'static,
    ) {
        if let Ok(mut updates) = self.control.updates.lock() {
            updates.async_completions.push(AsyncCompletion {
                fd: connection_fd,
                work: Some(Box::new(work)),
            });
        }
        self.control.wakeup.send();
    }

    /// Stop accepting, let in-flight exchanges finish, force-close at
    /// `deadline` (when given).
    pub fn begin_drain(&self, deadline: Option<Duration>) {
        if let Ok(mut updates) = self.control.updates.lock() {
            updates.drain = Some(deadline);
        }
        self.control.wakeup.send();
    }

    pub fn stop(&self) {
        if let Ok(mut updates) = self.control.updates.lock() {
            updates.stop = true;
        }
        self.control.wakeup.send();
    }
}

enum CloseStatus {
    Keep,
    Close,
}

/// Single-threaded edge-triggered HTTP server core: one epoll loop driving
/// per-connection state machines for HTTP/1.1, WebSocket (and installed
/// protocol handlers), TLS/kTLS transports, file sends and zerocopy
/// completion tracking.
pub struct Server {
    config: HttpServerConfig,
    router: Router,
    listener: Option<OwnedFd>,
    listen_addr: SocketAddr,
    event_loop: EventLoop,
    maintenance_timer: MaintenanceTimer,
    control: Arc<SharedControl>,
    connections: HashMap<RawFd, Connection>,
    lifecycle: Lifecycle,
    callbacks: Callbacks,
    metrics: Arc<dyn MetricsSink>,
    stats: StatsInternal,
    selector: EncodingSelector,
    tls: Option<Arc<TlsContext>>,
    ticket_store: Arc<TicketKeyStore>,
    http2_factory: Option<Http2HandlerFactory>,
    now: Instant,
    in_multi_worker: bool,
    // Events copied out of the poll span so connection handling can borrow
    // the server mutably; reused across ticks.
    event_scratch: Vec<PolledEvent>,
    // One-second window for the TLS handshake rate limit.
    handshake_window: (Instant, u32),
}

impl Server {
    pub fn new(config: HttpServerConfig) -> Result<Server, ServerError> {
        let ticket_store = Arc::new(TicketKeyStore::new(
            &config
                .tls
                .as_ref()
                .map(|tls| tls.session_tickets.clone())
                .unwrap_or_default(),
        ));
        Server::with_shared(config, Router::new(), Arc::new(NoopMetrics), ticket_store, false)
    }

    /// Worker-constructor: multi-worker setups share the ticket store and
    /// metrics sink and hand each worker its own router copy.
    pub(crate) fn with_shared(
        config: HttpServerConfig,
        router: Router,
        metrics: Arc<dyn MetricsSink>,
        ticket_store: Arc<TicketKeyStore>,
        in_multi_worker: bool,
    ) -> Result<Server, ServerError> {
        config.validate()?;

        let tls = match &config.tls {
            Some(tls_config) => Some(Arc::new(TlsContext::build(
                tls_config,
                ticket_store.clone(),
            )?)),
            None => None,
        };

        let (listener, listen_addr) =
            sys::bind_listener(config.socket_addr(), config.reuse_port)
                .map_err(ServerError::Bind)?;

        let mut event_loop = EventLoop::new(config.poll_interval)?;
        let maintenance_timer = MaintenanceTimer::new()?;
        let control = Arc::new(SharedControl {
            updates: Mutex::new(PendingUpdates::default()),
            wakeup: WakeupFd::new()?,
        });

        event_loop.add_or_err(listener.as_raw_fd(), EventMask::readable())?;
        event_loop.add_or_err(control.wakeup.as_raw_fd(), EventMask::readable())?;
        event_loop.add_or_err(maintenance_timer.as_raw_fd(), EventMask::readable())?;
        event_loop.update_poll_timeout(config.poll_interval);

        let selector = EncodingSelector::new(&config.compression);

        let server = Server {
            config,
            router,
            listener: Some(listener),
            listen_addr,
            event_loop,
            maintenance_timer,
            control,
            connections: HashMap::new(),
            lifecycle: Lifecycle {
                state: LifecycleState::Running,
                drain_deadline: None,
            },
            callbacks: Callbacks::default(),
            metrics,
            stats: StatsInternal::default(),
            selector,
            tls,
            ticket_store,
            http2_factory: None,
            now: Instant::now(),
            in_multi_worker,
            event_scratch: Vec::with_capacity(EventLoop::INITIAL_CAPACITY),
            handshake_window: (Instant::now(), 0),
        };
        server.arm_maintenance_timer();
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: self.control.clone(),
        }
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn set_metrics_sink(&mut self, sink: Arc<dyn MetricsSink>) {
        self.metrics = sink;
    }

    pub fn set_parser_error_callback(&mut self, callback: ParserErrorCallback) {
        self.callbacks.parser_err = Some(callback);
    }

    pub fn set_metrics_callback(&mut self, callback: MetricsCallback) {
        self.callbacks.metrics = Some(callback);
    }

    pub fn set_tls_handshake_callback(&mut self, callback: TlsHandshakeCallback) {
        self.callbacks.tls_handshake = Some(callback);
    }

    pub fn set_expectation_handler(&mut self, handler: ExpectationHandler) {
        self.callbacks.expectation = Some(handler);
    }

    pub fn set_http2_handler_factory(&mut self, factory: Http2HandlerFactory) {
        self.http2_factory = Some(factory);
    }

    pub fn stats(&self) -> ServerStats {
        let mut alpn: Vec<(String, u64)> = self
            .stats
            .tls_alpn
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        alpn.sort();
        ServerStats {
            total_bytes_queued: self.stats.total_bytes_queued,
            total_bytes_written_immediate: self.stats.total_bytes_written_immediate,
            total_bytes_written_flush: self.stats.total_bytes_written_flush,
            deferred_write_events: self.stats.deferred_write_events,
            flush_cycles: self.stats.flush_cycles,
            epoll_mod_failures: self.stats.epoll_mod_failures,
            max_connection_outbound_buffer: self.stats.max_connection_outbound_buffer,
            total_requests_served: self.stats.total_requests_served,
            connections_accepted: self.stats.connections_accepted,
            tls_handshakes_succeeded: self.stats.tls_handshakes_succeeded,
            tls_handshakes_failed: self.stats.tls_handshakes_failed,
            tls_handshakes_rejected_rate_limit: self.stats.tls_handshakes_rejected_rate_limit,
            tls_alpn_distribution: alpn,
            ktls_send_enabled_connections: self.stats.ktls_enabled,
            ktls_send_enable_fallbacks: self.stats.ktls_fallbacks,
            ktls_send_forced_shutdowns: self.stats.ktls_forced_shutdowns,
        }
    }

    /// Run until stopped (via handle, drain completion, or process stop
    /// flag).
    pub fn run(&mut self) {
        info!("server listening on {}", self.listen_addr);
        loop {
            self.poll_once();
            if self.lifecycle.state == LifecycleState::Stopping && self.connections.is_empty() {
                break;
            }
        }
        self.close_all_connections();
        self.close_listener();
        if !self.in_multi_worker {
            info!("server stopped");
        }
    }

    /// One loop tick: apply posted updates, poll, dispatch, maintain.
    pub fn poll_once(&mut self) {
        self.apply_pending_updates();

        let mut maintenance_tick = false;
        let mut batch = std::mem::take(&mut self.event_scratch);
        batch.clear();
        match self.event_loop.poll() {
            PollOutcome::Shutdown => {
                self.metrics.counter_add(names::EVENTS_ERRORS, 1);
                self.lifecycle.state = LifecycleState::Stopping;
            }
            PollOutcome::Timeout => {
                // Timeout (or EINTR). Retry deferred writes: with EPOLLET a
                // socket turning writable between an EAGAIN and the
                // epoll_ctl(MOD) would otherwise lose its edge.
                maintenance_tick = true;
            }
            PollOutcome::Ready(events) => {
                batch.extend_from_slice(events);
            }
        }

        self.now = Instant::now();

        if !batch.is_empty() {
            let listener_fd = self.listener.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1);
            for event in &batch {
                if event.fd == listener_fd {
                    self.accept_new_connections();
                } else if event.fd == self.control.wakeup.as_raw_fd() {
                    self.control.wakeup.drain();
                } else if event.fd == self.maintenance_timer.as_raw_fd() {
                    self.maintenance_timer.drain();
                    maintenance_tick = true;
                } else {
                    self.handle_connection_event(event.fd, event.mask);
                }
            }
            self.metrics
                .counter_add(names::EVENTS_PROCESSED, batch.len() as u64);
        }
        self.event_scratch = batch;

        if maintenance_tick {
            self.run_maintenance();
        }
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn begin_drain(&mut self, deadline: Option<Duration>) {
        if self.lifecycle.state != LifecycleState::Running {
            return;
        }
        info!(
            "draining: closing listener, {} connection(s) remain",
            self.connections.len()
        );
        self.close_listener();
        self.lifecycle.state = LifecycleState::Draining;
        self.lifecycle.drain_deadline = deadline.map(|limit| self.now + limit);
        // Ask protocol handlers (WebSocket in particular) to start their
        // graceful close handshakes.
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            if let Some(mut conn) = self.connections.remove(&fd) {
                if let Some(handler) = conn.handler.as_mut() {
                    handler.initiate_close();
                    self.splice_handler_output(&mut conn);
                }
                let closed = matches!(self.flush_outbound(&mut conn), CloseStatus::Close);
                if closed || conn.can_close_immediately() {
                    self.destroy_connection(conn);
                } else {
                    self.connections.insert(fd, conn);
                }
            }
        }
    }

    fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.event_loop.del(listener.as_raw_fd());
            drop(listener);
            self.control.wakeup.send();
        }
    }

    fn close_all_connections(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            if let Some(conn) = self.connections.remove(&fd) {
                self.destroy_connection(conn);
            }
        }
    }

    fn arm_maintenance_timer(&self) {
        let mut period = self.config.poll_interval;
        let mut consider = |candidate: Duration| {
            if !candidate.is_zero() && candidate < period {
                period = candidate;
            }
        };
        if self.config.enable_keep_alive {
            consider(self.config.keep_alive_timeout);
        }
        consider(self.config.header_read_timeout);
        consider(self.config.body_read_timeout);
        if let Some(tls) = &self.config.tls {
            consider(tls.handshake_timeout);
        }
        if let Err(err) = self.maintenance_timer.arm_periodic(period) {
            warn!("failed to arm maintenance timer: {}", err);
        }
    }

    // ---- posted updates ------------------------------------------------

    fn apply_pending_updates(&mut self) {
        let pending = {
            let mut updates = match self.control.updates.lock() {
                Ok(updates) => updates,
                Err(_) => return,
            };
            std::mem::take(&mut *updates)
        };

        if !pending.config.is_empty() {
            let before = self.config.clone();
            let immutable = ImmutableConfigSnapshot::capture(&self.config);
            for updater in pending.config {
                updater(&mut self.config);
            }
            immutable.restore(&mut self.config);
            if let Err(err) = self.config.validate() {
                error!("posted config update rejected: {}; keeping previous config", err);
                self.config = before;
            } else {
                self.selector = EncodingSelector::new(&self.config.compression);
                self.event_loop.update_poll_timeout(self.config.poll_interval);
                self.arm_maintenance_timer();
                // Rebuild the TLS context when its config changed. The old
                // context stays alive through per-connection keep-alives.
                if self.config.tls != before.tls {
                    match &self.config.tls {
                        Some(tls_config) => {
                            match TlsContext::build(tls_config, self.ticket_store.clone()) {
                                Ok(context) => self.tls = Some(Arc::new(context)),
                                Err(err) => {
                                    error!("TLS context rebuild failed: {}; keeping previous", err);
                                }
                            }
                        }
                        None => self.tls = None,
                    }
                }
            }
        }

        for updater in pending.router {
            updater(&mut self.router);
        }

        for completion in pending.async_completions {
            if let Some(work) = completion.work {
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    error!("panic in posted async completion work");
                }
            }
            self.resume_async_task(completion.fd, AwaitReason::WaitingForCallback);
        }

        if let Some(deadline) = pending.drain {
            self.begin_drain(deadline);
        }
        if pending.stop {
            self.lifecycle.state = LifecycleState::Stopping;
        }
    }

    // ---- accept --------------------------------------------------------

    fn accept_new_connections(&mut self) {
        loop {
            let listener_fd = match self.listener.as_ref() {
                Some(listener) => listener.as_raw_fd(),
                None => return,
            };
            let accepted = match sys::accept_connection(listener_fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    return;
                }
            };

            let fd = accepted.fd.as_raw_fd();
            if let Err(err) = sys::set_nodelay(fd) {
                trace!("TCP_NODELAY failed on fd {}: {}", fd, err);
            }

            let zerocopy_requested = match self.config.zerocopy.mode {
                ZeroCopyMode::Disabled => false,
                ZeroCopyMode::Enabled => true,
                ZeroCopyMode::Opportunistic => !accepted.local_loopback,
            };

            let tls_params = self
                .tls
                .as_ref()
                .map(|context| (context.handshake_rate_limit, context.server_config.clone()));
            let transport = match tls_params {
                None => Transport::plain(fd, self.config.zerocopy.threshold),
                Some((rate_limit, server_config)) => {
                    if self.handshake_rate_limited(rate_limit) {
                        self.stats.tls_handshakes_rejected_rate_limit += 1;
                        debug!("TLS handshake rate limit hit; dropping fd {}", fd);
                        continue;
                    }
                    match rustls::ServerConnection::new(server_config) {
                        Ok(session) => Transport::tls(session, fd),
                        Err(err) => {
                            warn!("TLS session init failed: {}", err);
                            continue;
                        }
                    }
                }
            };

            let mut conn = Connection::new(accepted.fd, accepted.peer, transport, self.now);
            conn.zerocopy_requested = zerocopy_requested;
            conn.tls_keepalive = self.tls.clone();
            if zerocopy_requested && !conn.transport.is_tls() {
                conn.transport.enable_zerocopy();
            }

            if !self.event_loop.add(fd, EventMask::readable()) {
                // Registration failed; drop the socket on the floor.
                continue;
            }

            self.stats.connections_accepted += 1;
            self.metrics.counter_add(names::CONNECTIONS_ACCEPTED, 1);
            trace!("accepted fd {} from {}", fd, conn.peer_addr);
            self.connections.insert(fd, conn);
        }
    }

    /// Sliding one-second window over new TLS handshakes; 0 disables.
    fn handshake_rate_limited(&mut self, limit: u32) -> bool {
        if limit == 0 {
            return false;
        }
        let (window_start, count) = &mut self.handshake_window;
        if self.now.duration_since(*window_start) >= Duration::from_secs(1) {
            *window_start = self.now;
            *count = 0;
        }
        *count += 1;
        *count > limit
    }

    // ---- event dispatch ------------------------------------------------

    fn handle_connection_event(&mut self, fd: RawFd, mask: EventMask) {
        let mut conn = match self.connections.remove(&fd) {
            Some(conn) => conn,
            None => {
                debug!("fd {} not found (stale epoll event or race)", fd);
                return;
            }
        };
        conn.last_activity = self.now;

        let mut close = false;
        if mask.contains(EventMask::OUT) {
            close |= matches!(self.handle_writable(&mut conn), CloseStatus::Close);
        }
        // EPOLLERR/EPOLLHUP/EPOLLRDHUP can arrive without EPOLLIN; treat
        // them as read triggers so EOF/errors are observed promptly.
        if !close
            && (mask.contains(EventMask::IN)
                || mask.contains(EventMask::ERR)
                || mask.contains(EventMask::HUP)
                || mask.contains(EventMask::RDHUP))
        {
            close |= matches!(self.handle_readable(&mut conn), CloseStatus::Close);
        }

        if close || conn.can_close_immediately() {
            self.destroy_connection(conn);
        } else {
            self.connections.insert(fd, conn);
        }
    }

    fn handle_readable(&mut self, conn: &mut Connection) -> CloseStatus {
        loop {
            let result = conn.transport_read(READ_CHUNK);
            match result.hint {
                TransportHint::Error => return CloseStatus::Close,
                TransportHint::WriteReady => {
                    // TLS wants the socket writable to make progress.
                    self.ensure_writable_interest(conn);
                    break;
                }
                TransportHint::ReadReady => break,
                TransportHint::None => {
                    if result.bytes == 0 {
                        // Peer closed. If we are mid-drain with queued
                        // output, give the flush path a last chance.
                        return CloseStatus::Close;
                    }
                }
            }

            if conn.transport.is_tls() && !conn.tls_handshake_emitted {
                if let CloseStatus::Close = self.finalize_tls_handshake(conn) {
                    return CloseStatus::Close;
                }
            }

            if !conn.in_buf.is_empty() {
                if conn.protocol == ProtocolType::Http11
                    && !conn.waiting_for_body
                    && conn.async_task.is_none()
                    && conn.header_start.is_none()
                {
                    conn.header_start = Some(self.now);
                }
                if conn.waiting_for_body {
                    conn.body_last_activity = Some(self.now);
                }
                if self.process_connection_input(conn) {
                    break;
                }
            }

            if conn.close_requested() {
                break;
            }
        }

        match self.flush_outbound(conn) {
            CloseStatus::Close => CloseStatus::Close,
            CloseStatus::Keep => CloseStatus::Keep,
        }
    }

    fn handle_writable(&mut self, conn: &mut Connection) -> CloseStatus {
        if conn.connect_pending {
            // Non-blocking tunnel connect resolved (EPOLLOUT signals it).
            conn.connect_pending = false;
            match sys::socket_error(conn.fd()) {
                Ok(None) => debug!("tunnel upstream fd {} connected", conn.fd()),
                Ok(Some(err)) => {
                    debug!("tunnel upstream fd {} failed to connect: {}", conn.fd(), err);
                    return CloseStatus::Close;
                }
                Err(_) => return CloseStatus::Close,
            }
        }
        self.flush_outbound(conn)
    }

    // ---- TLS handshake completion -------------------------------------

    fn finalize_tls_handshake(&mut self, conn: &mut Connection) -> CloseStatus {
        if !conn.transport.handshake_done() {
            return CloseStatus::Keep;
        }
        conn.tls_handshake_emitted = true;
        conn.tls_established = true;

        let info = conn.transport.tls_info();
        let duration = self.now.duration_since(conn.accepted_at);
        self.stats.tls_handshakes_succeeded += 1;
        self.metrics.counter_add(names::TLS_HANDSHAKES_SUCCEEDED, 1);
        self.metrics
            .histogram(names::TLS_HANDSHAKE_DURATION, duration.as_nanos() as u64);
        if let Some(alpn) = &info.alpn {
            *self.stats.tls_alpn.entry(alpn.clone()).or_insert(0) += 1;
        }
        if let Some(callback) = &self.callbacks.tls_handshake {
            let event = TlsHandshakeEvent {
                info: info.clone(),
                duration,
            };
            let callback = callback.clone();
            if catch_unwind(AssertUnwindSafe(move || callback(&event))).is_err() {
                error!("panic in TLS handshake callback");
            }
        }

        // kTLS offload per policy. The connection's own context governs:
        // a hot-reloaded server context must not change in-flight
        // connections.
        let ktls_mode = conn
            .tls_keepalive
            .as_ref()
            .map(|context| context.ktls)
            .unwrap_or(KtlsMode::Disabled);
        if ktls_mode != KtlsMode::Disabled {
            match conn.transport.enable_ktls_send(self.config.zerocopy.threshold) {
                Ok((KtlsOutcome::Enabled, leftover)) => {
                    self.stats.ktls_enabled += 1;
                    self.metrics.counter_add(names::KTLS_ENABLED, 1);
                    if !leftover.is_empty() {
                        conn.in_buf.extend_from_slice(&leftover);
                    }
                    if conn.zerocopy_requested {
                        conn.transport.enable_zerocopy();
                    }
                }
                Ok((outcome, _)) => {
                    // Every attempted non-Enabled outcome counts as a
                    // fallback; the forced shutdown fires only under
                    // Required.
                    self.stats.ktls_fallbacks += 1;
                    self.metrics.counter_add(names::KTLS_FALLBACKS, 1);
                    debug!(
                        "kTLS offload unavailable on fd {} ({:?}), continuing in user space",
                        conn.fd(),
                        outcome
                    );
                    if ktls_mode == KtlsMode::Required {
                        self.stats.ktls_forced_shutdowns += 1;
                        self.metrics.counter_add(names::KTLS_FORCED_SHUTDOWNS, 1);
                        conn.request_immediate_close();
                        return CloseStatus::Close;
                    }
                }
                Err(err) => {
                    warn!("kTLS promotion wedged fd {}: {}", conn.fd(), err);
                    self.stats.ktls_fallbacks += 1;
                    if ktls_mode == KtlsMode::Required {
                        self.stats.ktls_forced_shutdowns += 1;
                        self.metrics.counter_add(names::KTLS_FORCED_SHUTDOWNS, 1);
                    }
                    conn.request_immediate_close();
                    return CloseStatus::Close;
                }
            }
        }

        // ALPN "h2" switches straight to the external HTTP/2 handler.
        if info.alpn.as_deref() == Some("h2") && self.config.http2.enabled {
            if let Some(factory) = &self.http2_factory {
                conn.handler = Some(factory());
                conn.protocol = ProtocolType::Http2;
                // Server preface (SETTINGS) queued by the handler goes out
                // first.
                self.splice_handler_output(conn);
            } else if self.tls.as_ref().is_some_and(|context| context.alpn_must_match) {
                debug!("ALPN negotiated h2 but no HTTP/2 handler installed; closing");
                conn.request_drain_and_close();
            }
        }
        CloseStatus::Keep
    }

    // ---- input processing ---------------------------------------------

    /// Returns true when the caller should stop reading this tick.
    fn process_connection_input(&mut self, conn: &mut Connection) -> bool {
        if conn.handler.is_some() {
            return self.process_protocol_handler(conn);
        }

        // h2c prior knowledge: HTTP/2 preface on a plaintext listener.
        if self.config.http2.enabled
            && self.config.http2.enable_h2c
            && self.tls.is_none()
            && self.http2_factory.is_some()
            && conn.in_buf.as_slice().starts_with(b"PRI ")
        {
            if conn.in_buf.len() < upgrade::HTTP2_PREFACE.len() {
                return false; // need the full preface
            }
            if conn.in_buf.as_slice().starts_with(upgrade::HTTP2_PREFACE) {
                let factory = self.http2_factory.as_ref().expect("checked above").clone();
                conn.handler = Some(factory());
                conn.protocol = ProtocolType::Http2;
                debug!("HTTP/2 prior-knowledge connection on fd {}", conn.fd());
                return self.process_protocol_handler(conn);
            }
            debug!("invalid HTTP/2 preface on fd {}, falling back to HTTP/1.1", conn.fd());
        }

        self.process_http1_requests(conn)
    }

    fn process_protocol_handler(&mut self, conn: &mut Connection) -> bool {
        while !conn.in_buf.is_empty() {
            let handler = match conn.handler.as_mut() {
                Some(handler) => handler,
                None => return false,
            };
            let result = handler.process_input(conn.in_buf.as_slice());
            conn.in_buf.consume(result.consumed);

            self.splice_handler_output(conn);

            match result.action {
                ProtocolAction::Continue | ProtocolAction::ResponseReady => {
                    if result.consumed == 0 {
                        return conn.close_requested();
                    }
                }
                ProtocolAction::Close => {
                    conn.request_drain_and_close();
                    return true;
                }
                ProtocolAction::CloseImmediate => {
                    warn!("protocol handler reported error on fd {}", conn.fd());
                    conn.request_drain_and_close();
                    return true;
                }
            }
        }
        conn.close_requested()
    }

    /// Move the handler's queued output into the connection's outbound
    /// buffer and try to flush.
    fn splice_handler_output(&mut self, conn: &mut Connection) {
        let pending: Vec<u8> = match conn.handler.as_ref() {
            Some(handler) if handler.has_pending_output() => handler.pending_output().to_vec(),
            _ => return,
        };
        if let Some(handler) = conn.handler.as_mut() {
            handler.on_output_written(pending.len());
        }
        self.queue_bytes(conn, &pending);
    }

    fn process_http1_requests(&mut self, conn: &mut Connection) -> bool {
        if conn.async_task.is_some() {
            self.handle_async_body_progress(conn);
            return conn.close_requested();
        }
        if conn.waiting_for_body {
            if let Some(pending) = conn.pending_body {
                self.try_finish_pending_body(conn, pending);
            }
            if conn.waiting_for_body || conn.close_requested() {
                return conn.close_requested();
            }
        }

        loop {
            if conn.in_buf.len() < http::MIN_REQUEST_LINE_LEN {
                break;
            }

            let head = {
                let mut request = std::mem::take(&mut conn.request);
                let outcome = request.try_set_head(
                    conn.in_buf.as_slice(),
                    self.config.max_header_bytes,
                    self.config.merge_unknown_request_headers,
                );
                conn.request = request;
                outcome
            };
            let head_len = match head {
                HeadParse::NeedMoreData => break,
                HeadParse::Fail(status) => {
                    self.emit_simple_error(conn, status, "");
                    break;
                }
                HeadParse::Ok { head_len } => head_len,
            };

            // A full head is in; the header timeout now tracks only the
            // next pending request.
            conn.header_start = None;
            conn.request.started_at = Some(self.now);

            let mut is_chunked = false;
            if let Some(te) = conn.request.header_value(http::H_TRANSFER_ENCODING) {
                if conn.request.version() == Version::Http10 {
                    self.emit_simple_error(
                        conn,
                        http::STATUS_BAD_REQUEST,
                        "Transfer-Encoding not allowed in HTTP/1.0",
                    );
                    break;
                }
                if te.trim().eq_ignore_ascii_case("chunked") {
                    is_chunked = true;
                } else {
                    self.emit_simple_error(
                        conn,
                        http::STATUS_NOT_IMPLEMENTED,
                        "Unsupported Transfer-Encoding",
                    );
                    break;
                }
                if conn.request.header_value(http::H_CONTENT_LENGTH).is_some() {
                    self.emit_simple_error(
                        conn,
                        http::STATUS_BAD_REQUEST,
                        "Content-Length and Transfer-Encoding cannot be used together",
                    );
                    break;
                }
            }

            let negotiated = self
                .selector
                .negotiate(conn.request.header_value_or_empty(http::H_ACCEPT_ENCODING));
            if negotiated.reject {
                // identity;q=0 with nothing else to offer (RFC 9110
                // §12.5.3): no handler call.
                self.emit_simple_error(
                    conn,
                    http::STATUS_NOT_ACCEPTABLE,
                    "No acceptable content-coding available",
                );
                break;
            }

            let routing = self
                .router
                .resolve(conn.request.method(), &conn.request.path().to_owned());

            // h2c upgrade (plaintext listeners only).
            if self.config.http2.enabled
                && self.tls.is_none()
                && upgrade::detect_upgrade_target(
                    conn.request.header_value_or_empty(http::H_UPGRADE),
                ) == ProtocolType::Http2
            {
                if self.try_h2c_upgrade(conn, head_len) {
                    return conn.close_requested();
                }
                break; // upgrade failed; error queued
            }

            // WebSocket upgrade.
            if let Some(endpoint) = routing.websocket.clone() {
                if conn.request.method() == Method::Get {
                    let validation =
                        websocket::validate_upgrade(conn.request.headers(), &endpoint.config);
                    if validation.valid {
                        self.install_websocket(conn, &endpoint, validation, head_len);
                        if !conn.in_buf.is_empty() {
                            // Client bytes racing the 101 go straight to
                            // the new handler.
                            self.process_protocol_handler(conn);
                        }
                        return conn.close_requested();
                    }
                    if upgrade::detect_upgrade_target(
                        conn.request.header_value_or_empty(http::H_UPGRADE),
                    ) == ProtocolType::WebSocket
                    {
                        self.emit_simple_error(
                            conn,
                            http::STATUS_BAD_REQUEST,
                            validation.error_message,
                        );
                        break;
                    }
                    // No upgrade intent: fall through to normal dispatch
                    // (likely 404/405 unless another route matches).
                }
            }

            // Expect header tokens beyond the built-in 100-continue.
            let mut expect_continue = false;
            if let Some(expect) = conn.request.header_value(http::H_EXPECT).map(str::to_owned) {
                if self.handle_expect_header(conn, &expect, &routing, &mut expect_continue) {
                    break; // response queued
                }
            }

            let pending = PendingBody {
                chunked: is_chunked,
                expect_continue,
                continue_sent: false,
            };
            let body = match self.decode_body_if_ready(conn, head_len, pending) {
                BodyDecodeStatus::Error => break,
                BodyDecodeStatus::NeedMore(pending) => {
                    if self.config.body_read_timeout > Duration::ZERO {
                        conn.waiting_for_body = true;
                        conn.body_last_activity = Some(self.now);
                    }
                    if let Some(async_handler) = routing.async_handler.clone() {
                        // Async handlers may start before the body is in.
                        self.dispatch_async(conn, async_handler, &routing, false, pending);
                        return conn.close_requested();
                    }
                    conn.waiting_for_body = true;
                    conn.pending_body = Some(pending);
                    break;
                }
                BodyDecodeStatus::Ready { consumed } => {
                    conn.waiting_for_body = false;
                    conn.body_last_activity = None;
                    consumed
                }
            };
            debug_assert!(body >= head_len);

            if !self.decompress_request_body_if_needed(conn) {
                break;
            }

            if self.dispatch_request(conn, routing) {
                break;
            }

            if conn.close_requested() {
                break;
            }
        }
        conn.close_requested()
    }

    // ---- body decoding -------------------------------------------------

    fn decode_body_if_ready(
        &mut self,
        conn: &mut Connection,
        head_len: usize,
        mut pending: PendingBody,
    ) -> BodyDecodeStatus {
        if pending.chunked {
            match decode_chunked(&conn.in_buf.as_slice()[head_len..], self.config.max_body_bytes) {
                ChunkedDecode::Fail(status) => {
                    self.emit_simple_error(conn, status, "Malformed chunked body");
                    BodyDecodeStatus::Error
                }
                ChunkedDecode::NeedMore => {
                    self.maybe_send_continue(conn, &mut pending);
                    BodyDecodeStatus::NeedMore(pending)
                }
                ChunkedDecode::Ready {
                    consumed,
                    body,
                    trailers,
                } => {
                    self.finish_continue(conn, &mut pending);
                    conn.request.set_body(body);
                    conn.request.set_trailers(trailers);
                    conn.in_buf.consume(head_len + consumed);
                    BodyDecodeStatus::Ready {
                        consumed: head_len + consumed,
                    }
                }
            }
        } else {
            let content_length = match conn.request.content_length() {
                Ok(length) => length.unwrap_or(0) as usize,
                Err(status) => {
                    self.emit_simple_error(conn, status, "Invalid Content-Length");
                    return BodyDecodeStatus::Error;
                }
            };
            if content_length > self.config.max_body_bytes {
                self.emit_simple_error(conn, http::STATUS_PAYLOAD_TOO_LARGE, "Body too large");
                return BodyDecodeStatus::Error;
            }
            if conn.in_buf.len() < head_len + content_length {
                self.maybe_send_continue(conn, &mut pending);
                return BodyDecodeStatus::NeedMore(pending);
            }
            self.finish_continue(conn, &mut pending);
            let body = conn.in_buf.as_slice()[head_len..head_len + content_length].to_vec();
            conn.request.set_body(body);
            conn.in_buf.consume(head_len + content_length);
            BodyDecodeStatus::Ready {
                consumed: head_len + content_length,
            }
        }
    }

    /// Emit the interim 100 once the client is actually waiting on it.
    fn maybe_send_continue(&mut self, conn: &mut Connection, pending: &mut PendingBody) {
        if pending.expect_continue && !pending.continue_sent {
            pending.continue_sent = true;
            self.queue_bytes(conn, http::HTTP11_100_CONTINUE.as_bytes());
        }
    }

    /// Body complete but 100 never went out (body raced the Expect): the
    /// interim still precedes the final response.
    fn finish_continue(&mut self, conn: &mut Connection, pending: &mut PendingBody) {
        self.maybe_send_continue(conn, pending);
    }

    /// Retry decode for a request parked on `waiting_for_body`.
    fn try_finish_pending_body(&mut self, conn: &mut Connection, pending: PendingBody) {
        // The head was left unconsumed in the input buffer along with the
        // partial body, so re-deriving its length is cheap.
        let head_len = conn.request.head_len();
        match self.decode_body_if_ready(conn, head_len, pending) {
            BodyDecodeStatus::Error => {
                conn.waiting_for_body = false;
                conn.pending_body = None;
            }
            BodyDecodeStatus::NeedMore(updated) => {
                conn.pending_body = Some(updated);
            }
            BodyDecodeStatus::Ready { .. } => {
                conn.waiting_for_body = false;
                conn.pending_body = None;
                conn.body_last_activity = None;
                if !self.decompress_request_body_if_needed(conn) {
                    return;
                }
                let routing = self
                    .router
                    .resolve(conn.request.method(), &conn.request.path().to_owned());
                let _ = self.dispatch_request(conn, routing);
            }
        }
    }

    fn decompress_request_body_if_needed(&mut self, conn: &mut Connection) -> bool {
        let coding = conn
            .request
            .header_value(http::H_CONTENT_ENCODING)
            .unwrap_or("")
            .to_owned();
        if coding.is_empty() || conn.request.body_len() == 0 {
            return true;
        }
        let body = std::mem::take(conn.request.body_storage_mut());
        match decompress_request_body(&coding, &body, &self.config.decompression) {
            Ok(Some(inflated)) => {
                conn.request.set_body(inflated);
                true
            }
            Ok(None) => {
                conn.request.set_body(body);
                true
            }
            Err((status, message)) => {
                self.emit_simple_error(conn, status, message);
                false
            }
        }
    }

    // ---- Expect handling ----------------------------------------------

    /// Returns true when a final response was queued and request
    /// processing must stop.
    fn handle_expect_header(
        &mut self,
        conn: &mut Connection,
        expect_header: &str,
        routing: &RoutingResult,
        found_100_continue: &mut bool,
    ) -> bool {
        for token in expect_header.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if token.eq_ignore_ascii_case("100-continue") {
                // Built-in: actual emission is deferred to body decoding.
                *found_100_continue = true;
                continue;
            }
            let Some(handler) = self.callbacks.expectation.clone() else {
                self.emit_simple_error(conn, http::STATUS_EXPECTATION_FAILED, "");
                return true;
            };
            let outcome =
                catch_unwind(AssertUnwindSafe(|| handler(&conn.request, token)));
            match outcome {
                Err(_) => {
                    error!("panic in expectation handler");
                    self.emit_simple_error(conn, http::STATUS_INTERNAL_SERVER_ERROR, "");
                    return true;
                }
                Ok(ExpectationResult::Continue) => {}
                Ok(ExpectationResult::Reject) => {
                    self.emit_simple_error(conn, http::STATUS_EXPECTATION_FAILED, "");
                    return true;
                }
                Ok(ExpectationResult::Interim(status)) => {
                    if !(100..200).contains(&status) {
                        self.emit_simple_error(
                            conn,
                            http::STATUS_INTERNAL_SERVER_ERROR,
                            "Invalid interim status (must be 1xx)",
                        );
                        return true;
                    }
                    let interim = match status {
                        100 => http::HTTP11_100_CONTINUE.to_owned(),
                        102 => http::HTTP11_102_PROCESSING.to_owned(),
                        other => format!("HTTP/1.1 {}\r\n\r\n", other),
                    };
                    self.queue_bytes(conn, interim.as_bytes());
                }
                Ok(ExpectationResult::FinalResponse(response)) => {
                    let consumed = conn.request.head_len();
                    conn.in_buf.consume(consumed);
                    self.finalize_and_send_response(conn, response, routing, Encoding::Identity);
                    return true;
                }
            }
        }
        false
    }

    // ---- upgrades ------------------------------------------------------

    fn try_h2c_upgrade(&mut self, conn: &mut Connection, head_len: usize) -> bool {
        let validation = upgrade::validate_h2c_upgrade(conn.request.headers());
        if !validation.valid {
            self.emit_simple_error(conn, http::STATUS_BAD_REQUEST, validation.error_message);
            return false;
        }
        let Some(factory) = self.http2_factory.clone() else {
            self.emit_simple_error(conn, http::STATUS_NOT_IMPLEMENTED, "HTTP/2 unavailable");
            return false;
        };

        conn.in_buf.consume(head_len);
        conn.handler = Some(factory());
        conn.protocol = ProtocolType::Http2;

        // 101 first, then the handler's SETTINGS.
        let response = upgrade::build_h2c_upgrade_response();
        self.queue_bytes(conn, &response);
        self.splice_handler_output(conn);

        conn.requests_served += 1;
        self.stats.total_requests_served += 1;
        debug!("h2c upgrade on fd {}", conn.fd());
        true
    }

    fn install_websocket(
        &mut self,
        conn: &mut Connection,
        endpoint: &crate::router::WebSocketEndpoint,
        validation: websocket::UpgradeValidation,
        head_len: usize,
    ) {
        conn.in_buf.consume(head_len);

        let callbacks = (endpoint.callbacks)(&conn.request);
        let handler = WebSocketHandler::new(
            endpoint.config.clone(),
            callbacks,
            true,
            validation.deflate.clone(),
        );
        conn.handler = Some(Box::new(handler));
        conn.protocol = ProtocolType::WebSocket;

        // Raw 101: the normal response builder refuses reserved headers.
        let response = websocket::build_upgrade_response(&validation);
        self.queue_bytes(conn, &response);

        conn.requests_served += 1;
        self.stats.total_requests_served += 1;
        debug!("websocket established on fd {}", conn.fd());
    }

    // ---- dispatch ------------------------------------------------------

    /// Returns true when the request loop must stop (streaming close,
    /// async parked, error).
    fn dispatch_request(&mut self, conn: &mut Connection, routing: RoutingResult) -> bool {
        // OPTIONS/TRACE short-circuits (RFC 7231 §4.3), incl. CORS
        // preflight.
        match conn.request.method() {
            Method::Options => {
                let response = self.options_response(conn, &routing);
                self.finalize_and_send_response(conn, response, &routing, Encoding::Identity);
                return false;
            }
            Method::Trace => {
                let response = trace_echo_response(&conn.request);
                self.finalize_and_send_response(conn, response, &routing, Encoding::Identity);
                return false;
            }
            _ => {}
        }

        conn.request.set_path_params(routing.path_params.clone());

        let negotiated = self
            .selector
            .negotiate(conn.request.header_value_or_empty(http::H_ACCEPT_ENCODING));

        // Request middleware can short-circuit the handler.
        for middleware in &routing.request_middleware {
            let middleware = middleware.clone();
            let mut request = std::mem::take(&mut conn.request);
            let outcome = catch_unwind(AssertUnwindSafe(|| middleware(&mut request)));
            conn.request = request;
            match outcome {
                Ok(Some(response)) => {
                    self.finalize_and_send_response(conn, response, &routing, negotiated.encoding);
                    return false;
                }
                Ok(None) => {}
                Err(_) => {
                    error!("panic in request middleware");
                    let response =
                        HttpResponse::with_text(http::STATUS_INTERNAL_SERVER_ERROR, "Middleware failure");
                    self.finalize_and_send_response(conn, response, &routing, negotiated.encoding);
                    return false;
                }
            }
        }

        // CORS origin rejection happens before any handler runs.
        if let Some(cors) = &routing.cors {
            if cors.denies(&conn.request) {
                let response =
                    HttpResponse::with_text(http::STATUS_FORBIDDEN, "Forbidden by CORS policy");
                self.finalize_and_send_response(conn, response, &routing, negotiated.encoding);
                return false;
            }
        }

        if let Some(handler) = routing.streaming.clone() {
            return self.call_streaming_handler(conn, handler, &routing);
        }

        if let Some(handler) = routing.async_handler.clone() {
            let pending = conn.pending_body.take().unwrap_or(PendingBody {
                chunked: false,
                expect_continue: false,
                continue_sent: true,
            });
            self.dispatch_async(conn, handler, &routing, true, pending);
            return conn.async_task.is_some();
        }

        if let Some(handler) = routing.handler.clone() {
            let mut request = std::mem::take(&mut conn.request);
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&mut request)));
            conn.request = request;
            let response = match outcome {
                Ok(response) => response,
                Err(_) => {
                    error!("panic in request handler for {}", conn.request.path());
                    HttpResponse::with_text(http::STATUS_INTERNAL_SERVER_ERROR, "Handler failure")
                }
            };
            self.finalize_and_send_response(conn, response, &routing, negotiated.encoding);
            return false;
        }

        // No handler matched: canonical-slash redirect, 405, or 404.
        let response = if routing.redirect != RedirectSlash::None {
            let path = conn.request.path();
            let location = match routing.redirect {
                RedirectSlash::AddSlash => format!("{}/", path),
                RedirectSlash::RemoveSlash => path[..path.len() - 1].to_owned(),
                RedirectSlash::None => unreachable!(),
            };
            HttpResponse::new(http::STATUS_MOVED_PERMANENTLY)
                .header(http::H_LOCATION, location)
                .body("Redirecting")
        } else if routing.method_not_allowed {
            HttpResponse::with_text(http::STATUS_METHOD_NOT_ALLOWED, "Method Not Allowed")
        } else {
            HttpResponse::new(http::STATUS_NOT_FOUND)
        };
        self.finalize_and_send_response(conn, response, &routing, negotiated.encoding);
        false
    }

    fn options_response(&self, conn: &mut Connection, routing: &RoutingResult) -> HttpResponse {
        // CORS preflight short-circuit.
        let is_preflight = conn.request.header_value(http::H_ORIGIN).is_some()
            && conn
                .request
                .header_value("Access-Control-Request-Method")
                .is_some();
        if is_preflight {
            if let Some(cors) = &routing.cors {
                if !cors.denies(&conn.request) {
                    return cors.preflight_response(&conn.request);
                }
                return HttpResponse::with_text(http::STATUS_FORBIDDEN, "Forbidden by CORS policy");
            }
        }
        HttpResponse::new(http::STATUS_NO_CONTENT).header(
            http::H_ALLOW,
            "GET, HEAD, POST, PUT, DELETE, OPTIONS, TRACE, PATCH",
        )
    }

    // ---- streaming -----------------------------------------------------

    fn call_streaming_handler(
        &mut self,
        conn: &mut Connection,
        handler: crate::handlers::StreamingHandler,
        _routing: &RoutingResult,
    ) -> bool {
        let mut request = std::mem::take(&mut conn.request);
        let want_close = request.wants_close();
        let is_head = request.method() == Method::Head;

        let mut sink = StreamingSink {
            server: &mut *self,
            conn: &mut *conn,
            status: http::STATUS_OK,
            headers: Vec::new(),
            started: false,
            finished: false,
            is_head,
            chunked: !want_close,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&mut request, &mut sink)));
        if outcome.is_err() {
            error!("panic in streaming handler");
        }
        if !sink.finished {
            sink.finish();
        }
        conn.request = request;

        conn.requests_served += 1;
        self.stats.total_requests_served += 1;
        self.emit_request_metrics(conn, http::STATUS_OK);

        let should_close = !self.config.enable_keep_alive
            || conn.request.version() != Version::Http11
            || want_close
            || conn.requests_served >= self.config.max_requests_per_connection
            || conn.close_requested()
            || self.lifecycle.state != LifecycleState::Running;
        if should_close {
            conn.request_drain_and_close();
        }
        should_close
    }

    // ---- async handlers ------------------------------------------------

    fn dispatch_async(
        &mut self,
        conn: &mut Connection,
        handler: crate::handlers::AsyncHandler,
        routing: &RoutingResult,
        body_ready: bool,
        pending: PendingBody,
    ) {
        let mut request = std::mem::take(&mut conn.request);
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&mut request)));
        conn.request = request;
        let task = match outcome {
            Ok(task) => task,
            Err(_) => {
                error!("panic constructing async task for {}", conn.request.path());
                let response =
                    HttpResponse::with_text(http::STATUS_INTERNAL_SERVER_ERROR, "Async handler inactive");
                self.finalize_and_send_response(conn, response, routing, Encoding::Identity);
                return;
            }
        };

        conn.async_task = Some(crate::connection::AsyncTaskState {
            task,
            await_reason: AwaitReason::WaitingForCallback,
            needs_body: !body_ready,
            pending,
        });
        self.poll_async_task(conn);
    }

    fn poll_async_task(&mut self, conn: &mut Connection) {
        let Some(mut state) = conn.async_task.take() else {
            return;
        };
        let body_ready = !state.needs_body;
        let mut request = std::mem::take(&mut conn.request);
        let mut context = TaskContext {
            request: &mut request,
            body_ready,
            connection_fd: conn.fd(),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| state.task.poll(&mut context)));
        conn.request = request;
        match outcome {
            Err(_) => {
                error!("panic in async task for fd {}", conn.fd());
                let routing = RoutingResult::default();
                let response =
                    HttpResponse::with_text(http::STATUS_INTERNAL_SERVER_ERROR, "Task failure");
                self.finalize_and_send_response(conn, response, &routing, Encoding::Identity);
            }
            Ok(TaskPoll::Ready(response)) => {
                let routing = self
                    .router
                    .resolve(conn.request.method(), &conn.request.path().to_owned());
                self.finalize_and_send_response(conn, response, &routing, Encoding::Identity);
            }
            Ok(TaskPoll::Pending(reason)) => {
                state.await_reason = reason;
                conn.async_task = Some(state);
            }
        }
    }

    fn handle_async_body_progress(&mut self, conn: &mut Connection) {
        let Some(state) = conn.async_task.as_mut() else {
            return;
        };
        if !state.needs_body {
            return;
        }
        let pending = state.pending;
        let head_len = conn.request.head_len();
        match self.decode_body_if_ready(conn, head_len, pending) {
            BodyDecodeStatus::Error => {
                conn.async_task = None;
            }
            BodyDecodeStatus::NeedMore(updated) => {
                if let Some(state) = conn.async_task.as_mut() {
                    state.pending = updated;
                }
            }
            BodyDecodeStatus::Ready { .. } => {
                conn.waiting_for_body = false;
                conn.body_last_activity = None;
                if !self.decompress_request_body_if_needed(conn) {
                    conn.async_task = None;
                    return;
                }
                if let Some(state) = conn.async_task.as_mut() {
                    state.needs_body = false;
                    if state.await_reason == AwaitReason::WaitingForBody {
                        self.poll_async_task(conn);
                    }
                }
            }
        }
    }

    fn resume_async_task(&mut self, fd: RawFd, reason: AwaitReason) {
        let Some(mut conn) = self.connections.remove(&fd) else {
            return;
        };
        let resumable = conn
            .async_task
            .as_ref()
            .is_some_and(|state| state.await_reason == reason);
        if resumable {
            self.poll_async_task(&mut conn);
        }
        let closed = matches!(self.flush_outbound(&mut conn), CloseStatus::Close);
        if closed || conn.can_close_immediately() {
            self.destroy_connection(conn);
        } else {
            self.connections.insert(fd, conn);
        }
    }

    // ---- response finalize & queueing ---------------------------------

    fn emit_simple_error(&mut self, conn: &mut Connection, status: StatusCode, message: &str) {
        let bytes = build_simple_error(status, &self.config.global_headers, message);
        self.queue_bytes(conn, &bytes);
        self.metrics.counter_add(names::PARSER_ERRORS, 1);
        if let Some(callback) = self.callbacks.parser_err.clone() {
            if catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
                error!("panic in parser error callback");
            }
        }
        conn.request_drain_and_close();
    }

    fn finalize_and_send_response(
        &mut self,
        conn: &mut Connection,
        mut response: HttpResponse,
        routing: &RoutingResult,
        encoding: Encoding,
    ) {
        for middleware in &routing.response_middleware {
            let middleware = middleware.clone();
            if catch_unwind(AssertUnwindSafe(|| middleware(&conn.request, &mut response))).is_err()
            {
                error!("panic in response middleware");
            }
        }
        if let Some(cors) = &routing.cors {
            cors.apply_to_response(&conn.request, &mut response);
        }

        conn.requests_served += 1;
        self.stats.total_requests_served += 1;

        let keep_alive = self.config.enable_keep_alive
            && conn.request.version() == Version::Http11
            && !conn.request.wants_close()
            && conn.requests_served < self.config.max_requests_per_connection
            && self.lifecycle.state == LifecycleState::Running
            && !conn.close_requested();

        let is_head = conn.request.method() == Method::Head;
        let status = response.status();

        let body = response.take_body();
        match body {
            ResponseBody::File(payload) => {
                let mut head = self.build_response_head(
                    &response,
                    Some(payload.length),
                    keep_alive,
                    None,
                );
                head.extend_from_slice(b"\r\n");
                self.stats.total_bytes_queued += head.len() as u64;
                conn.out_buf.extend_from_slice(&head);
                if is_head || payload.length == 0 {
                    conn.file_send = FileSendState::default();
                } else {
                    conn.file_send = FileSendState {
                        file: Some(payload.file),
                        active: true,
                        headers_pending: true,
                        offset: payload.offset,
                        remaining: payload.length,
                    };
                }
            }
            ResponseBody::Bytes(mut bytes) => {
                let mut content_encoding = None;
                if !is_head && encoding != Encoding::Identity {
                    if let Some(compressed) = self.selector.compress(encoding, &bytes) {
                        bytes = compressed;
                        content_encoding = Some(encoding.token());
                    }
                }
                let mut head = self.build_response_head(
                    &response,
                    Some(bytes.len() as u64),
                    keep_alive,
                    content_encoding,
                );
                head.extend_from_slice(b"\r\n");
                let body_bytes = if is_head { Vec::new() } else { bytes };
                self.write_response_direct(conn, head, body_bytes);
            }
            ResponseBody::Empty => {
                let mut head = self.build_response_head(&response, Some(0), keep_alive, None);
                head.extend_from_slice(b"\r\n");
                self.write_response_direct(conn, head, Vec::new());
            }
        }

        if !keep_alive {
            conn.request_drain_and_close();
        }
        let _ = self.flush_outbound(conn);
        self.emit_request_metrics(conn, status);
    }

    fn build_response_head(
        &self,
        response: &HttpResponse,
        content_length: Option<u64>,
        keep_alive: bool,
        content_encoding: Option<&str>,
    ) -> Vec<u8> {
        let mut head = Vec::with_capacity(192);
        write_status_line(&mut head, response.status(), response.reason());
        for (name, value) in &self.config.global_headers {
            if !is_reserved_header(name) {
                write_header(&mut head, name, value);
            }
        }
        for (name, value) in response.headers() {
            if !is_reserved_header(name) {
                write_header(&mut head, name, value);
            }
        }
        if let Some(encoding) = content_encoding {
            write_header(&mut head, http::H_CONTENT_ENCODING, encoding);
            write_header(&mut head, "Vary", http::H_ACCEPT_ENCODING);
        }
        if let Some(length) = content_length {
            write_header(&mut head, http::H_CONTENT_LENGTH, &length.to_string());
        }
        if !keep_alive {
            write_header(&mut head, http::H_CONNECTION, "close");
        }
        head
    }

    fn emit_request_metrics(&mut self, conn: &Connection, status: StatusCode) {
        let Some(callback) = self.callbacks.metrics.clone() else {
            return;
        };
        let metrics = RequestMetrics {
            method: conn.request.method(),
            path: conn.request.path().to_owned(),
            status,
            bytes_in: conn.request.body_len(),
            duration: conn
                .request
                .started_at
                .map(|start| self.now.duration_since(start))
                .unwrap_or_default(),
            reused_connection: conn.requests_served > 1,
        };
        if catch_unwind(AssertUnwindSafe(|| callback(&metrics))).is_err() {
            error!("panic in request metrics callback");
        }
    }

    /// Append opaque bytes (interim responses, 101s, handler frames) to
    /// the outbound buffer and try to flush.
    fn queue_bytes(&mut self, conn: &mut Connection, bytes: &[u8]) {
        self.stats.total_bytes_queued += bytes.len() as u64;
        conn.out_buf.extend_from_slice(bytes);
        let _ = self.flush_outbound(conn);
    }

    /// Fast path for complete responses: bypass the outbound buffer when
    /// it is empty, letting large bodies ride MSG_ZEROCOPY from their own
    /// stable allocations.
    fn write_response_direct(&mut self, conn: &mut Connection, head: Vec<u8>, body: Vec<u8>) {
        let total = head.len() + body.len();
        self.stats.total_bytes_queued += total as u64;

        if !conn.out_buf.is_empty() {
            // Strict FIFO with earlier queued bytes.
            conn.out_buf.extend_from_slice(&head);
            conn.out_buf.extend_from_slice(&body);
            let _ = self.flush_outbound(conn);
            return;
        }

        let result = conn.transport.write2(&head, &body);
        match result.hint {
            TransportHint::Error => {
                conn.request_immediate_close();
                return;
            }
            TransportHint::WriteReady => {
                self.stats.deferred_write_events += 1;
            }
            _ => {}
        }
        let sent = result.bytes;
        self.stats.total_bytes_written_immediate += sent as u64;

        if sent < total {
            let head_sent = sent.min(head.len());
            let body_sent = sent - head_sent;
            conn.out_buf.extend_from_slice(&head[head_sent..]);
            conn.out_buf.extend_from_slice(&body[body_sent..]);
        }
        // Buffers pinned by an in-flight zerocopy send must outlive it.
        conn.hold_if_zerocopy_pending([head, body]);

        self.stats.max_connection_outbound_buffer = self
            .stats
            .max_connection_outbound_buffer
            .max(conn.out_buf.len() as u64);

        let _ = self.flush_outbound(conn);
    }

    // ---- flush & writable interest (§ writable invariant) --------------

    /// Drain outbound buffer and file engine, then reconcile writable
    /// interest with what is left. Returns `Close` when the connection
    /// finished draining (or died trying).
    fn flush_outbound(&mut self, conn: &mut Connection) -> CloseStatus {
        self.stats.flush_cycles += 1;
        let mut want_writable = false;

        // 1. Buffered bytes, strictly before any file payload.
        loop {
            let result = conn.flush_out_buf();
            match result.hint {
                TransportHint::Error => {
                    conn.request_immediate_close();
                    return CloseStatus::Close;
                }
                TransportHint::WriteReady => {
                    want_writable = true;
                    break;
                }
                _ => {
                    self.stats.total_bytes_written_flush += result.bytes as u64;
                    if conn.out_buf.is_empty() || result.bytes == 0 {
                        break;
                    }
                }
            }
        }
        if conn.transport.has_buffered_output() {
            want_writable = true;
        }

        // 2. File engine.
        if conn.file_send.headers_pending && conn.out_buf.is_empty() && !want_writable {
            conn.file_send.headers_pending = false;
        }
        if conn.file_send.active && !conn.file_send.headers_pending && !want_writable {
            want_writable |= self.drive_file_send(conn);
            if conn.close_mode == CloseMode::Immediate {
                return CloseStatus::Close;
            }
        }

        // Staged TLS file bytes may remain after the engine ran.
        if !conn.tunnel_or_file_buf.is_empty() {
            let result = conn.flush_file_buf();
            match result.hint {
                TransportHint::Error => {
                    conn.request_immediate_close();
                    return CloseStatus::Close;
                }
                TransportHint::WriteReady => want_writable = true,
                _ => {}
            }
            if !conn.tunnel_or_file_buf.is_empty() {
                want_writable = true;
            }
        }

        // 3. Writable interest must mirror reality exactly.
        if want_writable || conn.file_send.active || !conn.out_buf.is_empty() {
            if !self.ensure_writable_interest(conn) {
                return CloseStatus::Keep; // drain-close already requested
            }
        } else if conn.waiting_writable && !self.disable_writable_interest(conn) {
            return CloseStatus::Keep;
        }

        // 4. Drain completion.
        if conn.can_close_for_drain() {
            return CloseStatus::Close;
        }
        CloseStatus::Keep
    }

    /// Run the file engine until done, blocked, or erroring. Returns true
    /// when writable interest is needed.
    fn drive_file_send(&mut self, conn: &mut Connection) -> bool {
        while conn.file_send.active {
            if conn.transport.sendfile_capable() {
                match conn.transport_file(FILE_CHUNK) {
                    FileProgress::Sent(n) => {
                        self.stats.total_bytes_written_flush += n as u64;
                    }
                    FileProgress::Read(_) => unreachable!("sendfile path never stages"),
                    FileProgress::WouldBlock { enable_writable } => return enable_writable,
                    FileProgress::Error => return false,
                }
            } else {
                // TLS path: stage then push through the transport.
                if conn.tunnel_or_file_buf.len() < FILE_CHUNK {
                    match conn.transport_file(FILE_CHUNK) {
                        FileProgress::Read(_) | FileProgress::Sent(_) => {}
                        FileProgress::WouldBlock { enable_writable } => {
                            if conn.tunnel_or_file_buf.is_empty() {
                                return enable_writable;
                            }
                        }
                        FileProgress::Error => return false,
                    }
                }
                let result = conn.flush_file_buf();
                match result.hint {
                    TransportHint::Error => {
                        conn.request_immediate_close();
                        return false;
                    }
                    TransportHint::WriteReady => return true,
                    _ => {
                        self.stats.total_bytes_written_flush += result.bytes as u64;
                        if result.bytes == 0 && !conn.tunnel_or_file_buf.is_empty() {
                            return true;
                        }
                    }
                }
            }
        }
        !conn.tunnel_or_file_buf.is_empty()
    }

    /// Arm EPOLLOUT if not already armed. Idempotent; a failed `mod`
    /// escalates to drain-and-close because the fd is no longer reachable.
    fn ensure_writable_interest(&mut self, conn: &mut Connection) -> bool {
        if conn.waiting_writable {
            return true;
        }
        if self.event_loop.modify(conn.fd(), EventMask::read_write()) {
            conn.waiting_writable = true;
            self.stats.deferred_write_events += 1;
            true
        } else {
            self.stats.epoll_mod_failures += 1;
            conn.request_drain_and_close();
            false
        }
    }

    fn disable_writable_interest(&mut self, conn: &mut Connection) -> bool {
        if !conn.waiting_writable {
            return true;
        }
        if self.event_loop.modify(conn.fd(), EventMask::readable()) {
            conn.waiting_writable = false;
            true
        } else {
            self.stats.epoll_mod_failures += 1;
            conn.request_drain_and_close();
            false
        }
    }

    // ---- maintenance ---------------------------------------------------

    fn run_maintenance(&mut self) {
        let active = self.connections.len();
        self.metrics
            .gauge(names::CONNECTIONS_ACTIVE, active as i64);
        self.metrics
            .gauge(names::EVENTS_CAPACITY, self.event_loop.capacity() as i64);

        self.sweep_connections();

        match self.lifecycle.state {
            LifecycleState::Stopping => {
                self.close_all_connections();
            }
            LifecycleState::Draining => {
                if self.connections.is_empty() {
                    self.lifecycle.state = LifecycleState::Stopping;
                } else if self
                    .lifecycle
                    .drain_deadline
                    .is_some_and(|deadline| self.now >= deadline)
                {
                    warn!(
                        "drain deadline reached with {} active connection(s); forcing close",
                        self.connections.len()
                    );
                    self.close_all_connections();
                    self.lifecycle.state = LifecycleState::Stopping;
                }
            }
            LifecycleState::Running => {
                if stop_requested() {
                    self.begin_drain(Some(Duration::from_secs(10)));
                }
            }
        }
    }

    fn sweep_connections(&mut self) {
        let now = self.now;
        let header_timeout = self.config.header_read_timeout;
        let body_timeout = self.config.body_read_timeout;
        let keep_alive_timeout = self.config.keep_alive_timeout;

        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            let Some(mut conn) = self.connections.remove(&fd) else {
                continue;
            };

            // Zerocopy completions first; they may unblock a drain close.
            conn.release_completed_zerocopy();

            let mut close = false;

            let handshake_timeout = conn
                .tls_keepalive
                .as_ref()
                .map(|context| context.handshake_timeout)
                .unwrap_or(Duration::ZERO);
            if conn.transport.is_tls()
                && !conn.tls_established
                && !handshake_timeout.is_zero()
                && now.duration_since(conn.accepted_at) > handshake_timeout
            {
                debug!("TLS handshake timeout on fd {}", fd);
                self.stats.tls_handshakes_failed += 1;
                self.metrics.counter_add(names::TLS_HANDSHAKES_FAILED, 1);
                conn.request_immediate_close();
                close = true;
            }

            if !close
                && !header_timeout.is_zero()
                && conn
                    .header_start
                    .is_some_and(|start| now.duration_since(start) > header_timeout)
            {
                self.emit_simple_error(&mut conn, http::STATUS_REQUEST_TIMEOUT, "Header timeout");
            }

            if !close
                && conn.waiting_for_body
                && !body_timeout.is_zero()
                && conn
                    .body_last_activity
                    .is_some_and(|last| now.duration_since(last) > body_timeout)
            {
                self.emit_simple_error(&mut conn, http::STATUS_REQUEST_TIMEOUT, "Body timeout");
            }

            if !close
                && conn.protocol == ProtocolType::Http11
                && self.config.enable_keep_alive
                && !keep_alive_timeout.is_zero()
                && conn.in_buf.is_empty()
                && !conn.waiting_for_body
                && conn.async_task.is_none()
                && conn.out_buf.is_empty()
                && !conn.file_send.active
                && now.duration_since(conn.last_activity) > keep_alive_timeout
            {
                trace!("keep-alive idle timeout on fd {}", fd);
                conn.request_immediate_close();
                close = true;
            }

            if !close
                && conn
                    .handler
                    .as_ref()
                    .is_some_and(|handler| handler.close_deadline_exceeded(now))
            {
                debug!("websocket close-handshake timeout on fd {}", fd);
                conn.request_immediate_close();
                close = true;
            }

            // Retry deferred writes: an edge may have been lost between an
            // EAGAIN and the interest change.
            if !close
                && (conn.waiting_writable
                    || !conn.out_buf.is_empty()
                    || conn.file_send.active
                    || !conn.tunnel_or_file_buf.is_empty())
            {
                close = matches!(self.flush_outbound(&mut conn), CloseStatus::Close);
            }

            conn.reclaim_oversized_buffers(BUFFER_RECLAIM_THRESHOLD);

            if close || conn.can_close_immediately() {
                self.destroy_connection(conn);
            } else {
                self.connections.insert(fd, conn);
            }
        }
    }

    // ---- close ---------------------------------------------------------

    fn destroy_connection(&mut self, mut conn: Connection) {
        let fd = conn.fd();
        if let Some(handler) = conn.handler.as_mut() {
            handler.on_transport_closing();
        }
        self.event_loop.del(fd);

        // Tunnel cascade: clear the peer's back-reference first so the
        // chain cannot recurse, then close the peer through the table.
        if conn.is_tunneling() {
            let peer_fd = conn.peer_fd;
            conn.peer_fd = -1;
            debug!(
                "tearing down tunnel fd {} (stream {}) with peer fd {}",
                fd, conn.peer_stream_id, peer_fd
            );
            if let Some(mut peer) = self.connections.remove(&peer_fd) {
                peer.peer_fd = -1;
                self.destroy_connection(peer);
            }
        }

        trace!("closing fd {} ({:?})", fd, conn.protocol);
        // Dropping the connection closes the socket; the kernel discards
        // any zerocopy completions still in flight for it.
        drop(conn);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close_all_connections();
    }
}

/// Immutable config fields captured before posted updates run and
/// silently restored after, since changing them would require rebinding
/// sockets or respawning workers.
struct ImmutableConfigSnapshot {
    bind_addr: std::net::IpAddr,
    port: u16,
    reuse_port: bool,
    worker_threads: u32,
    telemetry: TelemetryConfig,
}

impl ImmutableConfigSnapshot {
    fn capture(config: &HttpServerConfig) -> ImmutableConfigSnapshot {
        ImmutableConfigSnapshot {
            bind_addr: config.bind_addr,
            port: config.port,
            reuse_port: config.reuse_port,
            worker_threads: config.worker_threads,
            telemetry: config.telemetry.clone(),
        }
    }

    fn restore(self, config: &mut HttpServerConfig) {
        if config.port != self.port || config.bind_addr != self.bind_addr {
            config.port = self.port;
            config.bind_addr = self.bind_addr;
            warn!("attempted to modify immutable bind address at runtime; change ignored");
        }
        if config.reuse_port != self.reuse_port {
            config.reuse_port = self.reuse_port;
            warn!("attempted to modify immutable reuse_port at runtime; change ignored");
        }
        if config.worker_threads != self.worker_threads {
            config.worker_threads = self.worker_threads;
            warn!("attempted to modify immutable worker_threads at runtime; change ignored");
        }
        if config.telemetry != self.telemetry {
            config.telemetry = self.telemetry;
            warn!("attempted to modify immutable telemetry config at runtime; change ignored");
        }
    }
}

enum BodyDecodeStatus {
    Ready { consumed: usize },
    NeedMore(PendingBody),
    Error,
}

/// RFC 7231 §4.3.8: TRACE reflects the received request head.
fn trace_echo_response(request: &HttpRequest) -> HttpResponse {
    let mut echo = Vec::with_capacity(256);
    echo.extend_from_slice(request.method().as_str().as_bytes());
    echo.push(b' ');
    echo.extend_from_slice(request.path().as_bytes());
    if !request.query().is_empty() {
        echo.push(b'?');
        echo.extend_from_slice(request.query().as_bytes());
    }
    echo.extend_from_slice(b" ");
    echo.extend_from_slice(request.version().as_str().as_bytes());
    echo.extend_from_slice(b"\r\n");
    for (name, value) in request.headers() {
        write_header(&mut echo, name, value);
    }
    HttpResponse::new(http::STATUS_OK)
        .header("Content-Type", "message/http")
        .body(echo)
}

/// Streaming response writer: status/headers emitted lazily on the first
/// chunk, chunked transfer coding on keep-alive paths, HEAD suppresses
/// the body.
struct StreamingSink<'a, 'b> {
    server: &'a mut Server,
    conn: &'b mut Connection,
    status: StatusCode,
    headers: Vec<(String, String)>,
    started: bool,
    finished: bool,
    is_head: bool,
    chunked: bool,
}

impl StreamingSink<'_, '_> {
    fn emit_head(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let mut head = Vec::with_capacity(192);
        write_status_line(&mut head, self.status, http::reason_phrase(self.status));
        for (name, value) in &self.server.config.global_headers {
            if !is_reserved_header(name) {
                write_header(&mut head, name, value);
            }
        }
        for (name, value) in &self.headers {
            if !is_reserved_header(name) {
                write_header(&mut head, name, value);
            }
        }
        if self.chunked {
            write_header(&mut head, http::H_TRANSFER_ENCODING, "chunked");
        } else {
            write_header(&mut head, http::H_CONNECTION, "close");
        }
        head.extend_from_slice(b"\r\n");
        self.server.queue_bytes(self.conn, &head);
    }
}

impl ResponseStream for StreamingSink<'_, '_> {
    fn set_status(&mut self, status: StatusCode) {
        if !self.started {
            self.status = status;
        }
    }

    fn add_header(&mut self, name: &str, value: &str) {
        if !self.started {
            self.headers.push((name.to_owned(), value.to_owned()));
        }
    }

    fn write_chunk(&mut self, chunk: &[u8]) {
        if self.finished {
            return;
        }
        self.emit_head();
        if self.is_head || chunk.is_empty() {
            return;
        }
        if self.chunked {
            let mut framed = Vec::with_capacity(chunk.len() + 16);
            framed.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            framed.extend_from_slice(chunk);
            framed.extend_from_slice(b"\r\n");
            self.server.queue_bytes(self.conn, &framed);
        } else {
            self.server.queue_bytes(self.conn, chunk);
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.emit_head();
        self.finished = true;
        if self.chunked && !self.is_head {
            self.server.queue_bytes(self.conn, b"0\r\n\r\n");
        }
        if !self.chunked {
            // Length-less body: the close delimits it.
            self.conn.request_drain_and_close();
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }
}
