use std::time::Instant;

/// Protocol currently driving a connection. `Http11` means the built-in
/// request pipeline; anything else means an installed [`ProtocolHandler`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ProtocolType {
    #[default]
    Http11,
    WebSocket,
    Http2,
}

/// What the server should do after a handler consumed input.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProtocolAction {
    /// More data needed or processing can continue.
    Continue,
    /// Output is pending in the handler's outbound queue.
    ResponseReady,
    /// Graceful close (e.g. completed WebSocket close handshake).
    Close,
    /// Protocol error; tear the connection down.
    CloseImmediate,
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessResult {
    pub action: ProtocolAction,
    pub consumed: usize,
}

impl ProcessResult {
    pub fn cont(consumed: usize) -> ProcessResult {
        ProcessResult {
            action: ProtocolAction::Continue,
            consumed,
        }
    }
}

/// A bytes-in / bytes-out state machine that supersedes the HTTP/1.1
/// pipeline after an upgrade (WebSocket, HTTP/2).
///
/// Handlers run on the owning event-loop thread and are not thread-safe by
/// design. Outbound bytes accumulate in an internal queue which the server
/// splices into the connection's outbound buffer each tick.
pub trait ProtocolHandler {
    fn protocol(&self) -> ProtocolType;

    /// Consume buffered input. The returned `consumed` count is erased from
    /// the connection's input buffer; a handler must not claim bytes it has
    /// not fully processed or stashed.
    fn process_input(&mut self, data: &[u8]) -> ProcessResult;

    fn has_pending_output(&self) -> bool;

    /// Current outbound queue contents. Paired with
    /// [`ProtocolHandler::on_output_written`] once the server has copied
    /// bytes out.
    fn pending_output(&self) -> &[u8];

    fn on_output_written(&mut self, written: usize);

    /// Start a graceful protocol-level shutdown (e.g. queue a Close frame).
    fn initiate_close(&mut self);

    /// The transport is about to be torn down; drop protocol state.
    fn on_transport_closing(&mut self);

    /// True when a protocol-level close was initiated long enough ago that
    /// the transport should be torn down without waiting for the peer.
    fn close_deadline_exceeded(&self, _now: Instant) -> bool {
        false
    }
}
