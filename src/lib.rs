//! Aeronet is an embeddable HTTP server library for Linux-class systems.
//!
//! It terminates TCP (optionally TLS via rustls, with kernel-TLS offload
//! where available), parses HTTP/1.1, negotiates upgrades to WebSocket
//! (RFC 6455) or HTTP/2 (h2c and ALPN, frames handled by an external
//! [`protocol::ProtocolHandler`]), and dispatches requests to registered
//! handlers.
//!
//! The core is a single-threaded, edge-triggered epoll reactor driving
//! per-connection state machines: the HTTP/1.1 pipeline, the transport
//! layer (plain, TLS, kTLS, with `MSG_ZEROCOPY`), the `sendfile` file
//! streaming path, the WebSocket frame engine, and the graceful-drain /
//! hot-reconfiguration lifecycle. [`MultiServer`] runs N such reactors
//! against one port via `SO_REUSEPORT`.
//!
//! # Example
//!
//! ```no_run
//! use aeronet::{HttpResponse, HttpServerConfig, Server};
//!
//! let config = HttpServerConfig::default().with_port(8080);
//! let mut server = Server::new(config).expect("bind");
//! server.router_mut().get("/hello", |_req| {
//!     HttpResponse::with_text(200, "hello from aeronet")
//! });
//! server.run();
//! ```

#[macro_use]
mod macros;

mod buf;
pub mod config;
mod connection;
pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod router;
mod multi;
mod server;
pub mod sys;
pub mod tls;
mod transport;
pub mod upgrade;
pub mod websocket;

pub use config::{
    CipherPolicy, ClientCertPolicy, CompressionConfig, DecompressionConfig, DeflateConfig,
    Http2Config, HttpServerConfig, KtlsMode, PemSource, SessionTicketConfig, TelemetryConfig,
    TlsConfig, TlsVersion, WebSocketConfig, ZeroCopyConfig, ZeroCopyMode,
};
pub use error::{ConfigError, ServerError, TlsSetupError};
pub use handlers::{
    AwaitReason, ExpectationResult, RequestMetrics, RequestTask, ResponseStream, TaskContext,
    TaskPoll, TlsHandshakeEvent,
};
pub use http::{FilePayload, HttpRequest, HttpResponse, Method, StatusCode, Version};
pub use metrics::{MetricsSink, NoopMetrics};
pub use multi::{MultiServer, WorkerSetup};
pub use router::{CorsPolicy, RedirectSlash, Router, RoutingResult, WebSocketEndpoint};
pub use server::{request_stop, stop_requested, Server, ServerHandle, ServerStats};
pub use transport::{KtlsOutcome, TlsInfo, Transport, TransportHint, TransportResult};
pub use websocket::{WebSocketCallbacks, WebSocketHandler, WebSocketSender};
