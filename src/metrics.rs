use std::time::Duration;

/// Stable metric names emitted by the core. Exporters (DogStatsD, OTLP,
/// Prometheus bridges) live outside the crate and key off these.
pub mod names {
    pub const EVENTS_PROCESSED: &str = "aeronet.events.processed";
    pub const EVENTS_ERRORS: &str = "aeronet.events.errors";
    pub const EVENTS_CAPACITY: &str = "aeronet.events.capacity_current_count";
    pub const CONNECTIONS_ACTIVE: &str = "aeronet.connections.active_count";
    pub const CONNECTIONS_ACCEPTED: &str = "aeronet.connections.accepted";
    pub const PARSER_ERRORS: &str = "aeronet.http.parser_errors";
    pub const TLS_HANDSHAKES_SUCCEEDED: &str = "aeronet.tls.handshakes_succeeded";
    pub const TLS_HANDSHAKES_FAILED: &str = "aeronet.tls.handshakes_failed";
    pub const TLS_HANDSHAKE_DURATION: &str = "aeronet.tls.handshake_duration_ns";
    pub const KTLS_ENABLED: &str = "aeronet.tls.ktls_send_enabled_connections";
    pub const KTLS_FALLBACKS: &str = "aeronet.tls.ktls_send_enable_fallbacks";
    pub const KTLS_FORCED_SHUTDOWNS: &str = "aeronet.tls.ktls_send_forced_shutdowns";
}

/// Telemetry boundary. The core calls this from the event-loop thread of
/// every worker, so implementations must be thread-safe and cheap.
pub trait MetricsSink: Send + Sync {
    fn counter_add(&self, name: &str, value: u64);
    fn gauge(&self, name: &str, value: i64);
    fn histogram(&self, _name: &str, _value: u64) {}
    fn timing(&self, _name: &str, _duration: Duration) {}
}

/// Default sink: drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter_add(&self, _name: &str, _value: u64) {}
    fn gauge(&self, _name: &str, _value: i64) {}
}
