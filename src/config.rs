use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// PEM material, either on disk or already in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PemSource {
    File(PathBuf),
    Memory(String),
}

impl PemSource {
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            PemSource::File(path) => std::fs::read(path),
            PemSource::Memory(pem) => Ok(pem.clone().into_bytes()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Named cipher policies map to curated suite lists; `Explicit` pins the
/// exact (IANA-named) suites.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CipherPolicy {
    #[default]
    Default,
    Modern,
    Compatibility,
    Legacy,
    Explicit(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientCertPolicy {
    #[default]
    None,
    Request,
    Require,
}

/// Kernel TLS offload policy for the send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KtlsMode {
    #[default]
    Disabled,
    /// Try, fall back to user-space crypto silently.
    Auto,
    /// Try, log the fallback.
    Enabled,
    /// Close connections that cannot be offloaded.
    Required,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionTicketConfig {
    pub enabled: bool,
    pub lifetime: Duration,
    pub max_keys: usize,
    /// Fixed keys (32 bytes each) shared across workers or hosts. When
    /// empty, keys are generated and rotated in-process.
    pub static_keys: Vec<Vec<u8>>,
}

impl Default for SessionTicketConfig {
    fn default() -> SessionTicketConfig {
        SessionTicketConfig {
            enabled: true,
            lifetime: Duration::from_secs(12 * 60 * 60),
            max_keys: 4,
            static_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub cert: PemSource,
    pub key: PemSource,
    pub alpn: Vec<String>,
    /// Reject the handshake when the client offers ALPN but nothing we
    /// listed; otherwise the connection proceeds without a protocol.
    pub alpn_must_match: bool,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    pub cipher_policy: CipherPolicy,
    pub client_cert: ClientCertPolicy,
    /// Trusted roots (PEM) for client-certificate validation.
    pub client_roots: Vec<PemSource>,
    pub session_tickets: SessionTicketConfig,
    pub handshake_timeout: Duration,
    /// Max new handshakes per second; 0 disables the limit.
    pub handshake_rate_limit: u32,
    pub ktls: KtlsMode,
}

impl TlsConfig {
    pub fn new(cert: PemSource, key: PemSource) -> TlsConfig {
        TlsConfig {
            cert,
            key,
            alpn: vec!["http/1.1".to_owned()],
            alpn_must_match: false,
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_policy: CipherPolicy::Default,
            client_cert: ClientCertPolicy::None,
            client_roots: Vec::new(),
            session_tickets: SessionTicketConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            handshake_rate_limit: 0,
            ktls: KtlsMode::Disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Compression level per codec; `None` disables the codec.
    pub gzip_level: Option<u32>,
    pub deflate_level: Option<u32>,
    /// Responses smaller than this are never compressed.
    pub min_response_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> CompressionConfig {
        CompressionConfig {
            gzip_level: None,
            deflate_level: None,
            min_response_size: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompressionConfig {
    pub max_inflated_bytes: usize,
    pub allow_gzip: bool,
    pub allow_deflate: bool,
}

impl Default for DecompressionConfig {
    fn default() -> DecompressionConfig {
        DecompressionConfig {
            max_inflated_bytes: 8 << 20,
            allow_gzip: true,
            allow_deflate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroCopyMode {
    #[default]
    Disabled,
    /// Enable where it is likely profitable (off for loopback peers).
    Opportunistic,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroCopyConfig {
    pub mode: ZeroCopyMode,
    /// Payloads below this use ordinary sends even when enabled.
    pub threshold: usize,
}

impl Default for ZeroCopyConfig {
    fn default() -> ZeroCopyConfig {
        ZeroCopyConfig {
            mode: ZeroCopyMode::Disabled,
            threshold: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Http2Config {
    pub enabled: bool,
    /// Accept `h2c` upgrades and prior-knowledge prefaces on plaintext
    /// listeners. The frame machinery itself is an external handler.
    pub enable_h2c: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    pub enabled: bool,
    pub compression_level: u32,
    /// Reset the server compression context after every message.
    pub no_context_takeover: bool,
    /// Messages below this size are sent uncompressed.
    pub min_size: usize,
}

impl Default for DeflateConfig {
    fn default() -> DeflateConfig {
        DeflateConfig {
            enabled: false,
            compression_level: 6,
            no_context_takeover: false,
            min_size: 64,
        }
    }
}

/// Per-endpoint WebSocket settings; the router may override these per
/// registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Cap on a reassembled (and decompressed) message; 0 means unlimited.
    pub max_message_size: usize,
    /// Cap on a single frame payload; 0 means unlimited.
    pub max_frame_size: usize,
    pub close_timeout: Duration,
    pub deflate: DeflateConfig,
    /// Supported subprotocols in server preference order.
    pub subprotocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: 16 << 20,
            max_frame_size: 4 << 20,
            close_timeout: Duration::from_secs(10),
            deflate: DeflateConfig::default(),
            subprotocols: Vec::new(),
        }
    }
}

/// Telemetry export settings. Opaque to the core (exporters live outside);
/// immutable at runtime like anything that would respawn workers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub service_name: String,
    pub sample_rate: f64,
    pub dogstatsd_socket: Option<PathBuf>,
}

/// Complete server configuration.
///
/// `port`, `bind_addr`, `reuse_port`, `worker_threads` and `telemetry` are
/// immutable once the server runs; posted updates that touch them are
/// silently restored (with a warning).
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub reuse_port: bool,
    pub worker_threads: u32,

    pub enable_keep_alive: bool,
    pub max_requests_per_connection: u32,
    pub keep_alive_timeout: Duration,
    pub header_read_timeout: Duration,
    pub body_read_timeout: Duration,
    pub poll_interval: Duration,

    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub merge_unknown_request_headers: bool,

    /// Appended to every response; validated at config apply.
    pub global_headers: Vec<(String, String)>,

    pub tls: Option<TlsConfig>,
    pub compression: CompressionConfig,
    pub decompression: DecompressionConfig,
    pub zerocopy: ZeroCopyConfig,
    pub http2: Http2Config,
    pub websocket: WebSocketConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for HttpServerConfig {
    fn default() -> HttpServerConfig {
        HttpServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            reuse_port: false,
            worker_threads: 1,
            enable_keep_alive: true,
            max_requests_per_connection: 1000,
            keep_alive_timeout: Duration::from_secs(30),
            header_read_timeout: Duration::from_secs(10),
            body_read_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            max_header_bytes: 8 * 1024,
            max_body_bytes: 16 << 20,
            merge_unknown_request_headers: true,
            global_headers: Vec::new(),
            tls: None,
            compression: CompressionConfig::default(),
            decompression: DecompressionConfig::default(),
            zerocopy: ZeroCopyConfig::default(),
            http2: Http2Config::default(),
            websocket: WebSocketConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl HttpServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_worker_threads(mut self, workers: u32) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.enable_keep_alive = enabled;
        self
    }

    pub fn with_max_requests_per_connection(mut self, max: u32) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_global_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_zerocopy(mut self, zerocopy: ZeroCopyConfig) -> Self {
        self.zerocopy = zerocopy;
        self
    }

    pub fn with_http2(mut self, http2: Http2Config) -> Self {
        self.http2 = http2;
        self
    }

    pub fn with_websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::invalid("worker_threads", "must be at least 1"));
        }
        if self.worker_threads > 1 && !self.reuse_port {
            return Err(ConfigError::invalid(
                "reuse_port",
                "required when worker_threads > 1 (workers share the port via SO_REUSEPORT)",
            ));
        }
        if self.max_header_bytes == 0 {
            return Err(ConfigError::invalid("max_header_bytes", "must be nonzero"));
        }
        if self.max_requests_per_connection == 0 {
            return Err(ConfigError::invalid(
                "max_requests_per_connection",
                "must be nonzero",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be nonzero"));
        }
        for (name, value) in &self.global_headers {
            if name.is_empty()
                || name
                    .bytes()
                    .any(|byte| byte == b'\r' || byte == b'\n' || byte == b':' || byte == b' ')
            {
                return Err(ConfigError::invalid(
                    "global_headers",
                    format!("invalid header name {:?}", name),
                ));
            }
            if value.bytes().any(|byte| byte == b'\r' || byte == b'\n') {
                return Err(ConfigError::invalid(
                    "global_headers",
                    format!("invalid header value for {:?}", name),
                ));
            }
        }
        if let Some(tls) = &self.tls {
            if tls.min_version > tls.max_version {
                return Err(ConfigError::invalid(
                    "tls.min_version",
                    "exceeds tls.max_version",
                ));
            }
            for key in &tls.session_tickets.static_keys {
                if key.len() != 32 {
                    return Err(ConfigError::invalid(
                        "tls.session_tickets.static_keys",
                        "keys must be exactly 32 bytes",
                    ));
                }
            }
            if tls.session_tickets.max_keys == 0 {
                return Err(ConfigError::invalid(
                    "tls.session_tickets.max_keys",
                    "must be nonzero",
                ));
            }
        }
        let compression_level_ok = |level: Option<u32>| level.map_or(true, |lvl| lvl <= 9);
        if !compression_level_ok(self.compression.gzip_level)
            || !compression_level_ok(self.compression.deflate_level)
        {
            return Err(ConfigError::invalid(
                "compression",
                "levels must be within 0..=9",
            ));
        }
        if !(0.0..=1.0).contains(&self.telemetry.sample_rate) {
            return Err(ConfigError::invalid(
                "telemetry.sample_rate",
                "must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(HttpServerConfig::default().validate().is_ok());
    }

    #[test]
    fn multi_worker_requires_reuse_port() {
        let config = HttpServerConfig::default().with_worker_threads(4);
        assert!(config.validate().is_err());
        let config = config.with_reuse_port(true);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn global_header_validation() {
        let config = HttpServerConfig::default().with_global_header("X-Bad\r\n", "v");
        assert!(config.validate().is_err());
        let config = HttpServerConfig::default().with_global_header("Server", "aeronet");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tls_version_ordering_enforced() {
        let mut tls = TlsConfig::new(
            PemSource::Memory(String::new()),
            PemSource::Memory(String::new()),
        );
        tls.min_version = TlsVersion::Tls13;
        tls.max_version = TlsVersion::Tls12;
        let config = HttpServerConfig::default().with_tls(tls);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_compression_level_rejected() {
        let config = HttpServerConfig::default().with_compression(CompressionConfig {
            gzip_level: Some(42),
            ..CompressionConfig::default()
        });
        assert!(config.validate().is_err());
    }
}
