//! Handler and callback types the server invokes. Everything here runs on
//! the owning event-loop thread; registration happens through the router
//! or server setters, which is why the factories are `Send + Sync` while
//! the per-connection state they produce is not.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::http::{HttpRequest, HttpResponse, Method, StatusCode};
use crate::protocol::ProtocolHandler;
use crate::transport::TlsInfo;

/// Buffered handler: gets the complete request, returns the response.
pub type RequestHandler = Arc<dyn Fn(&mut HttpRequest) -> HttpResponse + Send + Sync>;

/// Streaming handler: writes status/headers lazily and body in chunks
/// through the writer.
pub type StreamingHandler =
    Arc<dyn Fn(&mut HttpRequest, &mut dyn ResponseStream) + Send + Sync>;

/// Factory for async (suspendable) handlers.
pub type AsyncHandler = Arc<dyn Fn(&mut HttpRequest) -> RequestTask + Send + Sync>;

/// Middleware run before routing dispatch; returning a response
/// short-circuits the handler.
pub type RequestMiddleware =
    Arc<dyn Fn(&mut HttpRequest) -> Option<HttpResponse> + Send + Sync>;

/// Middleware run over every produced response.
pub type ResponseMiddleware = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

/// Sink handed to streaming handlers.
pub trait ResponseStream {
    fn set_status(&mut self, status: StatusCode);
    fn add_header(&mut self, name: &str, value: &str);
    /// First write emits status + headers.
    fn write_chunk(&mut self, chunk: &[u8]);
    fn finish(&mut self);
    fn finished(&self) -> bool;
}

/// Why a task returned `Pending`. Body progress re-polls
/// `WaitingForBody` tasks; a posted completion re-polls
/// `WaitingForCallback` tasks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AwaitReason {
    WaitingForBody,
    WaitingForCallback,
}

pub enum TaskPoll {
    Pending(AwaitReason),
    Ready(HttpResponse),
}

/// Context a task polls against. Exposes the request (head pinned for the
/// suspension's lifetime), whether the full body has been decoded, and the
/// connection fd to key a posted completion
/// ([`crate::ServerHandle::post_async_completion`]).
pub struct TaskContext<'a> {
    pub request: &'a mut HttpRequest,
    pub body_ready: bool,
    pub connection_fd: std::os::fd::RawFd,
}

/// A suspendable handler invocation: polled to completion on the owning
/// event-loop thread, re-polled when body bytes arrive or a completion is
/// posted through the server handle.
pub struct RequestTask {
    poll: Box<dyn FnMut(&mut TaskContext<'_>) -> TaskPoll + Send>,
}

impl RequestTask {
    pub fn new(poll: impl FnMut(&mut TaskContext<'_>) -> TaskPoll + Send + 'static) -> RequestTask {
        RequestTask { poll: Box::new(poll) }
    }

    /// Immediately ready task.
    pub fn ready(response: HttpResponse) -> RequestTask {
        let mut response = Some(response);
        RequestTask::new(move |_| match response.take() {
            Some(response) => TaskPoll::Ready(response),
            None => TaskPoll::Ready(HttpResponse::new(crate::http::STATUS_INTERNAL_SERVER_ERROR)),
        })
    }

    pub fn poll(&mut self, context: &mut TaskContext<'_>) -> TaskPoll {
        (self.poll)(context)
    }
}

impl fmt::Debug for RequestTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestTask{..}")
    }
}

/// Resolution of a non-`100-continue` `Expect` token by the user handler.
pub enum ExpectationResult {
    /// Proceed with normal processing.
    Continue,
    /// Respond 417 and stop.
    Reject,
    /// Emit an interim 1xx and continue.
    Interim(StatusCode),
    /// Send this response instead of dispatching the request.
    FinalResponse(HttpResponse),
}

pub type ExpectationHandler =
    Arc<dyn Fn(&HttpRequest, &str) -> ExpectationResult + Send + Sync>;

/// Invoked whenever a parse-level error response is queued.
pub type ParserErrorCallback = Arc<dyn Fn(StatusCode) + Send + Sync>;

/// Per-request metrics emitted after a response is finalized.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub bytes_in: usize,
    pub duration: Duration,
    pub reused_connection: bool,
}

pub type MetricsCallback = Arc<dyn Fn(&RequestMetrics) + Send + Sync>;

/// TLS handshake completion event.
#[derive(Debug, Clone)]
pub struct TlsHandshakeEvent {
    pub info: TlsInfo,
    pub duration: Duration,
}

pub type TlsHandshakeCallback = Arc<dyn Fn(&TlsHandshakeEvent) + Send + Sync>;

/// Factory producing the external HTTP/2 protocol handler when an `h2c`
/// upgrade, prior-knowledge preface, or ALPN `h2` selects HTTP/2. The
/// frame and HPACK machinery live behind this boundary.
pub type Http2HandlerFactory = Arc<dyn Fn() -> Box<dyn ProtocolHandler> + Send + Sync>;
