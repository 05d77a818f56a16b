use std::fmt;
use std::time::{Duration, Instant};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::{debug, warn};

use crate::config::{DeflateConfig, WebSocketConfig};
use crate::protocol::{ProcessResult, ProtocolAction, ProtocolHandler, ProtocolType};
use crate::websocket::frame::{
    self, apply_mask, build_close_frame, build_frame, parse_close_payload, parse_frame, CloseCode,
    FrameParse, Opcode,
};
use crate::websocket::{self, MAX_CONTROL_PAYLOAD};

/// A deflate sync flush always ends with this tail; it is stripped before
/// framing and re-appended before inflating (RFC 7692 §7.2.1).
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Negotiated permessage-deflate parameters for one connection.
#[derive(Debug, Clone, Default)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl DeflateParams {
    /// Parse one offer from `Sec-WebSocket-Extensions`. `None` declines the
    /// offer: unknown parameters and reduced window sizes are not accepted,
    /// the client then falls back to another offer or none.
    pub fn parse_offer(offer: &str, config: &DeflateConfig) -> Option<DeflateParams> {
        let mut parts = offer.split(';');
        let name = parts.next()?.trim();
        if !name.eq_ignore_ascii_case(websocket::PERMESSAGE_DEFLATE) {
            return None;
        }

        let mut params = DeflateParams {
            server_no_context_takeover: config.no_context_takeover,
            client_no_context_takeover: false,
        };
        for param in parts {
            let param = param.trim();
            let (key, value) = match param.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim().trim_matches('"'))),
                None => (param, None),
            };
            match key.to_ascii_lowercase().as_str() {
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                // We only speak 32 KiB windows; a client demanding a smaller
                // server window gets the offer declined.
                "server_max_window_bits" => match value {
                    None => {}
                    Some(bits) if bits == "15" => {}
                    Some(_) => return None,
                },
                "client_max_window_bits" => {}
                _ => return None,
            }
        }
        Some(params)
    }

    /// Extension value echoed in the 101 response.
    pub fn response_value(&self) -> String {
        let mut value = String::from(websocket::PERMESSAGE_DEFLATE);
        if self.server_no_context_takeover {
            value.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        value
    }
}

/// Streaming (de)compression contexts for one connection. Context takeover
/// keeps the dictionary across messages unless negotiated away.
struct DeflateContext {
    params: DeflateParams,
    compress: Compress,
    decompress: Decompress,
}

impl fmt::Debug for DeflateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeflateContext")
            .field("params", &self.params)
            .finish()
    }
}

impl DeflateContext {
    fn new(params: DeflateParams, config: &DeflateConfig) -> DeflateContext {
        DeflateContext {
            params,
            compress: Compress::new(Compression::new(config.compression_level), false),
            decompress: Decompress::new(false),
        }
    }

    fn compress_message(&mut self, data: &[u8]) -> Result<Vec<u8>, &'static str> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let start_in = self.compress.total_in();
        loop {
            out.reserve(256);
            let consumed = (self.compress.total_in() - start_in) as usize;
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|_| "deflate failure")?;
            let consumed = (self.compress.total_in() - start_in) as usize;
            if consumed == data.len() && out.ends_with(&DEFLATE_TAIL) {
                break;
            }
        }
        out.truncate(out.len() - DEFLATE_TAIL.len());
        if self.params.server_no_context_takeover {
            self.compress.reset();
        }
        Ok(out)
    }

    fn decompress_message(&mut self, data: &[u8], cap: usize) -> Result<Vec<u8>, &'static str> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let start_in = self.decompress.total_in();
        loop {
            out.reserve(1024);
            let consumed = (self.decompress.total_in() - start_in) as usize;
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|_| "inflate failure")?;
            if cap > 0 && out.len() > cap {
                return Err("inflated message exceeds limit");
            }
            let consumed = (self.decompress.total_in() - start_in) as usize;
            // Done only when all input is consumed and the last call did not
            // stall on a full output buffer.
            if (consumed == input.len() && out.len() < out.capacity())
                || status == Status::StreamEnd
            {
                break;
            }
        }
        if self.params.client_no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

/// Close handshake state (RFC 6455 §7).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum CloseState {
    #[default]
    Open,
    CloseSent,
    CloseReceived,
    Closed,
}

/// Outbound side of a WebSocket connection, handed to message callbacks so
/// they can reply. Frames are queued into the handler's output buffer and
/// spliced to the transport by the server.
pub struct WebSocketSender<'a> {
    io: &'a mut WsIo,
}

impl WebSocketSender<'_> {
    pub fn send_text(&mut self, text: &str) -> bool {
        self.io.send_data(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> bool {
        self.io.send_data(Opcode::Binary, data)
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> bool {
        self.io.send_ping(payload)
    }

    pub fn send_close(&mut self, code: CloseCode, reason: &str) -> bool {
        self.io.send_close(code, reason)
    }
}

/// User hooks. All run on the event-loop thread; a missing hook is a no-op.
#[derive(Default)]
#[allow(clippy::type_complexity)]
pub struct WebSocketCallbacks {
    /// Complete (reassembled, decompressed) message; `true` means binary.
    pub on_message: Option<Box<dyn FnMut(&[u8], bool, &mut WebSocketSender<'_>)>>,
    pub on_ping: Option<Box<dyn FnMut(&[u8])>>,
    pub on_pong: Option<Box<dyn FnMut(&[u8])>>,
    pub on_close: Option<Box<dyn FnMut(CloseCode, &[u8])>>,
    pub on_error: Option<Box<dyn FnMut(CloseCode, &str)>>,
}

impl fmt::Debug for WebSocketCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebSocketCallbacks{..}")
    }
}

#[derive(Debug, Default)]
struct MessageAssembly {
    in_progress: bool,
    compressed: bool,
    opcode: Option<Opcode>,
    buffer: Vec<u8>,
}

impl MessageAssembly {
    fn reset(&mut self) {
        self.in_progress = false;
        self.compressed = false;
        self.opcode = None;
        self.buffer.clear();
    }
}

#[derive(Debug)]
struct WsIo {
    server_side: bool,
    output: Vec<u8>,
    output_offset: usize,
    deflate: Option<DeflateContext>,
    deflate_min_size: usize,
    close_state: CloseState,
    close_initiated_at: Option<Instant>,
}

impl WsIo {
    fn mask_key(&self) -> Option<[u8; 4]> {
        // Server frames are unmasked. A client-side handler masks; a fixed
        // zero key is legal on the wire, real clients randomize.
        if self.server_side {
            None
        } else {
            Some([0u8; 4])
        }
    }

    fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> bool {
        if self.close_state != CloseState::Open {
            return false;
        }
        let mask = self.mask_key();
        if let Some(deflate) = &mut self.deflate {
            if payload.len() >= self.deflate_min_size {
                if let Ok(compressed) = deflate.compress_message(payload) {
                    if compressed.len() < payload.len() {
                        build_frame(&mut self.output, opcode, &compressed, true, mask, true);
                        return true;
                    }
                }
            }
        }
        build_frame(&mut self.output, opcode, payload, true, mask, false);
        true
    }

    fn send_ping(&mut self, payload: &[u8]) -> bool {
        if self.close_state != CloseState::Open {
            return false;
        }
        let payload = &payload[..payload.len().min(MAX_CONTROL_PAYLOAD)];
        let mask = self.mask_key();
        build_frame(&mut self.output, Opcode::Ping, payload, true, mask, false);
        true
    }

    fn send_pong(&mut self, payload: &[u8]) -> bool {
        // Pong may still flow during the close handshake.
        if self.close_state == CloseState::Closed {
            return false;
        }
        let payload = &payload[..payload.len().min(MAX_CONTROL_PAYLOAD)];
        let mask = self.mask_key();
        build_frame(&mut self.output, Opcode::Pong, payload, true, mask, false);
        true
    }

    fn send_close(&mut self, code: CloseCode, reason: &str) -> bool {
        if matches!(self.close_state, CloseState::CloseSent | CloseState::Closed) {
            return false;
        }
        let mask = self.mask_key();
        build_close_frame(&mut self.output, code, reason, mask);
        if self.close_state == CloseState::Open {
            self.close_state = CloseState::CloseSent;
            self.close_initiated_at = Some(Instant::now());
        }
        true
    }
}

/// The per-connection WebSocket protocol engine.
///
/// Installed as the connection's [`ProtocolHandler`] after a successful
/// upgrade; from then on every inbound byte flows through
/// [`WebSocketHandler::process_input`].
#[derive(Debug)]
pub struct WebSocketHandler {
    config: WebSocketConfig,
    callbacks: WebSocketCallbacks,
    io: WsIo,
    message: MessageAssembly,
    // Carry-over for frames split across reads.
    input_carry: Vec<u8>,
}

impl WebSocketHandler {
    pub fn new(
        config: WebSocketConfig,
        callbacks: WebSocketCallbacks,
        server_side: bool,
        deflate_params: Option<DeflateParams>,
    ) -> WebSocketHandler {
        let deflate = deflate_params.map(|params| DeflateContext::new(params, &config.deflate));
        WebSocketHandler {
            io: WsIo {
                server_side,
                output: Vec::new(),
                output_offset: 0,
                deflate,
                deflate_min_size: config.deflate.min_size,
                close_state: CloseState::Open,
                close_initiated_at: None,
            },
            config,
            callbacks,
            message: MessageAssembly::default(),
            input_carry: Vec::new(),
        }
    }

    pub fn set_callbacks(&mut self, callbacks: WebSocketCallbacks) {
        self.callbacks = callbacks;
    }

    pub fn compression_negotiated(&self) -> bool {
        self.io.deflate.is_some()
    }

    /// Queue an outgoing text message (server push).
    pub fn send_text(&mut self, text: &str) -> bool {
        self.io.send_data(Opcode::Text, text.as_bytes())
    }

    /// Queue an outgoing binary message (server push).
    pub fn send_binary(&mut self, data: &[u8]) -> bool {
        self.io.send_data(Opcode::Binary, data)
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> bool {
        self.io.send_ping(payload)
    }

    pub fn send_close(&mut self, code: CloseCode, reason: &str) -> bool {
        self.io.send_close(code, reason)
    }

    fn protocol_failure(&mut self, code: CloseCode, message: &'static str) -> ProtocolAction {
        if let Some(on_error) = self.callbacks.on_error.as_mut() {
            on_error(code, message);
        }
        self.io.send_close(code, message);
        self.message.reset();
        ProtocolAction::Close
    }

    fn process_frame(&mut self, header: frame::FrameHeader, payload: &[u8]) -> ProtocolAction {
        // Unmask on a copy; the connection input buffer is immutable here.
        let unmasked;
        let payload: &[u8] = if header.masked {
            let mut copy = payload.to_vec();
            apply_mask(&mut copy, header.masking_key);
            unmasked = copy;
            &unmasked
        } else {
            payload
        };

        if header.opcode.is_control() {
            self.process_control_frame(header.opcode, payload)
        } else {
            self.process_data_frame(&header, payload)
        }
    }

    fn process_data_frame(&mut self, header: &frame::FrameHeader, payload: &[u8]) -> ProtocolAction {
        if header.opcode == Opcode::Continuation {
            if !self.message.in_progress {
                return self.protocol_failure(
                    CloseCode::ProtocolError,
                    "unexpected continuation frame",
                );
            }
        } else {
            if self.message.in_progress {
                return self.protocol_failure(
                    CloseCode::ProtocolError,
                    "expected continuation frame",
                );
            }
            self.message.in_progress = true;
            self.message.opcode = Some(header.opcode);
            self.message.buffer.clear();
            // RSV1 only on the first frame of a compressed message.
            self.message.compressed = header.rsv1;
        }

        let limit = self.config.max_message_size;
        if limit > 0 && self.message.buffer.len() + payload.len() > limit {
            return self.protocol_failure(CloseCode::MessageTooBig, "message too large");
        }
        self.message.buffer.extend_from_slice(payload);

        if header.fin {
            self.complete_message()
        } else {
            ProtocolAction::Continue
        }
    }

    fn complete_message(&mut self) -> ProtocolAction {
        let payload = if self.message.compressed {
            match self.io.deflate.as_mut() {
                Some(deflate) => {
                    match deflate
                        .decompress_message(&self.message.buffer, self.config.max_message_size)
                    {
                        Ok(inflated) => inflated,
                        Err(_) => {
                            return self.protocol_failure(
                                CloseCode::InvalidPayloadData,
                                "decompression failed",
                            )
                        }
                    }
                }
                // RSV1 on the first frame without negotiation is rejected by
                // the parser already.
                None => std::mem::take(&mut self.message.buffer),
            }
        } else {
            std::mem::take(&mut self.message.buffer)
        };

        let is_binary = self.message.opcode == Some(Opcode::Binary);
        if !is_binary && std::str::from_utf8(&payload).is_err() {
            return self.protocol_failure(
                CloseCode::InvalidPayloadData,
                "invalid UTF-8 in text message",
            );
        }

        if let Some(on_message) = self.callbacks.on_message.as_mut() {
            let mut sender = WebSocketSender { io: &mut self.io };
            on_message(&payload, is_binary, &mut sender);
        }

        self.message.reset();
        if self.io.output_offset < self.io.output.len() {
            ProtocolAction::ResponseReady
        } else {
            ProtocolAction::Continue
        }
    }

    fn process_control_frame(&mut self, opcode: Opcode, payload: &[u8]) -> ProtocolAction {
        match opcode {
            Opcode::Ping => {
                self.io.send_pong(payload);
                if let Some(on_ping) = self.callbacks.on_ping.as_mut() {
                    on_ping(payload);
                }
                ProtocolAction::ResponseReady
            }
            Opcode::Pong => {
                if let Some(on_pong) = self.callbacks.on_pong.as_mut() {
                    on_pong(payload);
                }
                ProtocolAction::Continue
            }
            Opcode::Close => {
                let (code, reason) = parse_close_payload(payload);
                let action = match self.io.close_state {
                    CloseState::Open => {
                        // Peer initiated: echo the code and reason back,
                        // then the handshake is done.
                        self.io.close_state = CloseState::CloseReceived;
                        let reason_text = String::from_utf8_lossy(reason).into_owned();
                        self.io.send_close(code, &reason_text);
                        self.io.close_state = CloseState::Closed;
                        ProtocolAction::ResponseReady
                    }
                    CloseState::CloseSent => {
                        // We initiated and the peer answered.
                        self.io.close_state = CloseState::Closed;
                        ProtocolAction::Close
                    }
                    _ => ProtocolAction::Continue,
                };
                if let Some(on_close) = self.callbacks.on_close.as_mut() {
                    on_close(code, reason);
                }
                action
            }
            _ => {
                debug_assert!(false, "data opcode routed to control dispatch");
                ProtocolAction::CloseImmediate
            }
        }
    }
}

impl ProtocolHandler for WebSocketHandler {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::WebSocket
    }

    fn process_input(&mut self, data: &[u8]) -> ProcessResult {
        // Splice carry-over from a previous partial frame in front of the
        // fresh bytes. Carried bytes were already counted as consumed.
        let carried = std::mem::take(&mut self.input_carry);
        let owned;
        let view: &[u8] = if carried.is_empty() {
            data
        } else {
            let mut joined = carried;
            joined.extend_from_slice(data);
            owned = joined;
            &owned
        };

        let mut offset = 0usize;
        let consumed_new = data.len();
        let mut final_action = ProtocolAction::Continue;

        while offset < view.len() {
            let allow_rsv1 = self.io.deflate.is_some();
            let parsed = parse_frame(
                &view[offset..],
                self.config.max_frame_size,
                self.io.server_side,
                allow_rsv1,
            );
            match parsed {
                FrameParse::Incomplete => {
                    // Stash the remainder; report all fresh bytes consumed.
                    self.input_carry.extend_from_slice(&view[offset..]);
                    return ProcessResult {
                        action: final_action,
                        consumed: consumed_new,
                    };
                }
                FrameParse::ProtocolError(message) => {
                    warn!("websocket protocol error: {}", message);
                    let action = self.protocol_failure(CloseCode::ProtocolError, message);
                    return ProcessResult {
                        action,
                        consumed: consumed_new,
                    };
                }
                FrameParse::PayloadTooLarge => {
                    let action =
                        self.protocol_failure(CloseCode::MessageTooBig, "frame payload too large");
                    return ProcessResult {
                        action,
                        consumed: consumed_new,
                    };
                }
                FrameParse::Complete {
                    header,
                    payload,
                    consumed,
                } => {
                    offset += consumed;
                    let action = self.process_frame(header, payload);
                    match action {
                        ProtocolAction::Close | ProtocolAction::CloseImmediate => {
                            self.input_carry.clear();
                            return ProcessResult {
                                action,
                                consumed: consumed_new,
                            };
                        }
                        ProtocolAction::ResponseReady => final_action = ProtocolAction::ResponseReady,
                        _ => {}
                    }
                }
            }
        }

        ProcessResult {
            action: final_action,
            consumed: consumed_new,
        }
    }

    fn has_pending_output(&self) -> bool {
        self.io.output_offset < self.io.output.len()
    }

    fn pending_output(&self) -> &[u8] {
        &self.io.output[self.io.output_offset..]
    }

    fn on_output_written(&mut self, written: usize) {
        self.io.output_offset += written;
        if self.io.output_offset >= self.io.output.len() {
            self.io.output.clear();
            self.io.output_offset = 0;
        }
    }

    fn initiate_close(&mut self) {
        if self.io.close_state == CloseState::Open {
            debug!("initiating websocket close handshake");
            self.io.send_close(CloseCode::GoingAway, "server shutting down");
        }
    }

    fn on_transport_closing(&mut self) {
        self.io.close_state = CloseState::Closed;
        self.message.reset();
        self.input_carry.clear();
    }

    fn close_deadline_exceeded(&self, now: Instant) -> bool {
        if self.io.close_state != CloseState::CloseSent {
            return false;
        }
        match self.io.close_initiated_at {
            Some(initiated) => {
                now.duration_since(initiated) > close_timeout(self.config.close_timeout)
            }
            None => false,
        }
    }
}

fn close_timeout(configured: Duration) -> Duration {
    if configured.is_zero() {
        Duration::from_secs(10)
    } else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn masked_text_frame(text: &str) -> Vec<u8> {
        let mut wire = Vec::new();
        build_frame(
            &mut wire,
            Opcode::Text,
            text.as_bytes(),
            true,
            Some([0x11, 0x22, 0x33, 0x44]),
            false,
        );
        wire
    }

    fn server_handler(callbacks: WebSocketCallbacks) -> WebSocketHandler {
        WebSocketHandler::new(WebSocketConfig::default(), callbacks, true, None)
    }

    fn echo_callbacks(seen: Rc<RefCell<Vec<Vec<u8>>>>) -> WebSocketCallbacks {
        WebSocketCallbacks {
            on_message: Some(Box::new(
                move |payload: &[u8], _binary: bool, sender: &mut WebSocketSender<'_>| {
                    seen.borrow_mut().push(payload.to_vec());
                    let text = std::str::from_utf8(payload).unwrap().to_owned();
                    sender.send_text(&text);
                },
            )),
            ..WebSocketCallbacks::default()
        }
    }

    #[test]
    fn echoes_masked_text() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut handler = server_handler(echo_callbacks(seen.clone()));

        let wire = masked_text_frame("Hello, WebSocket!");
        let result = handler.process_input(&wire);
        assert_eq!(result.consumed, wire.len());
        assert_eq!(result.action, ProtocolAction::ResponseReady);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0], b"Hello, WebSocket!");

        // Outgoing echo is unmasked.
        let out = handler.pending_output().to_vec();
        match parse_frame(&out, 0, false, false) {
            FrameParse::Complete {
                header, payload, ..
            } => {
                assert_eq!(header.opcode, Opcode::Text);
                assert!(!header.masked);
                assert_eq!(payload, b"Hello, WebSocket!");
            }
            other => panic!("unexpected: {:?}", other),
        }
        let len = handler.pending_output().len();
        handler.on_output_written(len);
        assert!(!handler.has_pending_output());
    }

    #[test]
    fn partial_frames_reassemble() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut handler = server_handler(echo_callbacks(seen.clone()));

        let wire = masked_text_frame("split across reads");
        let first = &wire[..5];
        let second = &wire[5..];

        let result = handler.process_input(first);
        assert_eq!(result.consumed, first.len());
        assert!(seen.borrow().is_empty());

        let result = handler.process_input(second);
        assert_eq!(result.consumed, second.len());
        assert_eq!(seen.borrow()[0], b"split across reads");
    }

    #[test]
    fn fragmented_message_reassembles() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut handler = server_handler(echo_callbacks(seen.clone()));

        let key = [9, 9, 9, 9];
        let mut wire = Vec::new();
        build_frame(&mut wire, Opcode::Text, b"Hel", false, Some(key), false);
        build_frame(&mut wire, Opcode::Continuation, b"lo", true, Some(key), false);
        handler.process_input(&wire);
        assert_eq!(seen.borrow()[0], b"Hello");
    }

    #[test]
    fn interleaved_ping_does_not_break_fragmentation() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut handler = server_handler(echo_callbacks(seen.clone()));

        let key = [1, 2, 3, 4];
        let mut wire = Vec::new();
        build_frame(&mut wire, Opcode::Text, b"a", false, Some(key), false);
        build_frame(&mut wire, Opcode::Ping, b"pp", true, Some(key), false);
        build_frame(&mut wire, Opcode::Continuation, b"b", true, Some(key), false);
        handler.process_input(&wire);
        assert_eq!(seen.borrow()[0], b"ab");

        // First queued frame is the pong reply with the ping payload.
        let out = handler.pending_output().to_vec();
        match parse_frame(&out, 0, false, false) {
            FrameParse::Complete {
                header, payload, ..
            } => {
                assert_eq!(header.opcode, Opcode::Pong);
                assert_eq!(payload, b"pp");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn new_text_frame_during_fragmentation_is_protocol_error() {
        let mut handler = server_handler(WebSocketCallbacks::default());
        let key = [1, 2, 3, 4];
        let mut wire = Vec::new();
        build_frame(&mut wire, Opcode::Text, b"a", false, Some(key), false);
        build_frame(&mut wire, Opcode::Text, b"b", true, Some(key), false);
        let result = handler.process_input(&wire);
        assert_eq!(result.action, ProtocolAction::Close);

        // Outbound close carries 1002.
        let out = handler.pending_output().to_vec();
        match parse_frame(&out, 0, false, false) {
            FrameParse::Complete { payload, .. } => {
                let (code, _) = parse_close_payload(payload);
                assert_eq!(code, CloseCode::ProtocolError);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn bare_continuation_is_protocol_error() {
        let mut handler = server_handler(WebSocketCallbacks::default());
        let mut wire = Vec::new();
        build_frame(
            &mut wire,
            Opcode::Continuation,
            b"x",
            true,
            Some([0; 4]),
            false,
        );
        let result = handler.process_input(&wire);
        assert_eq!(result.action, ProtocolAction::Close);
    }

    #[test]
    fn invalid_utf8_text_closes_1007() {
        let mut handler = server_handler(WebSocketCallbacks::default());
        let mut wire = Vec::new();
        build_frame(
            &mut wire,
            Opcode::Text,
            &[0xFF, 0xFE, 0xFD],
            true,
            Some([0; 4]),
            false,
        );
        let result = handler.process_input(&wire);
        assert_eq!(result.action, ProtocolAction::Close);
        let out = handler.pending_output().to_vec();
        match parse_frame(&out, 0, false, false) {
            FrameParse::Complete { payload, .. } => {
                let (code, _) = parse_close_payload(payload);
                assert_eq!(code, CloseCode::InvalidPayloadData);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn close_handshake_echoes_code_and_reason() {
        let mut handler = server_handler(WebSocketCallbacks::default());
        let mut close_payload = Vec::new();
        close_payload.extend_from_slice(&1000u16.to_be_bytes());
        close_payload.extend_from_slice(b"goodbye");
        let mut wire = Vec::new();
        build_frame(
            &mut wire,
            Opcode::Close,
            &close_payload,
            true,
            Some([5, 6, 7, 8]),
            false,
        );
        let result = handler.process_input(&wire);
        assert_eq!(result.action, ProtocolAction::ResponseReady);

        let out = handler.pending_output().to_vec();
        match parse_frame(&out, 0, false, false) {
            FrameParse::Complete {
                header, payload, ..
            } => {
                assert_eq!(header.opcode, Opcode::Close);
                let (code, reason) = parse_close_payload(payload);
                assert_eq!(code, CloseCode::Normal);
                assert_eq!(reason, b"goodbye");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn server_initiated_close_completes_on_reply() {
        let mut handler = server_handler(WebSocketCallbacks::default());
        handler.initiate_close();
        assert!(handler.has_pending_output());
        let len = handler.pending_output().len();
        handler.on_output_written(len);

        let mut wire = Vec::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&1001u16.to_be_bytes());
        build_frame(&mut wire, Opcode::Close, &payload, true, Some([0; 4]), false);
        let result = handler.process_input(&wire);
        assert_eq!(result.action, ProtocolAction::Close);
    }

    #[test]
    fn close_deadline() {
        let mut handler = server_handler(WebSocketCallbacks::default());
        handler.initiate_close();
        let now = Instant::now();
        assert!(!handler.close_deadline_exceeded(now));
        assert!(handler.close_deadline_exceeded(now + Duration::from_secs(60)));
    }

    #[test]
    fn deflate_roundtrip_via_handler() {
        let config = WebSocketConfig {
            deflate: DeflateConfig {
                enabled: true,
                ..DeflateConfig::default()
            },
            ..WebSocketConfig::default()
        };
        let params = DeflateParams::default();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut server = WebSocketHandler::new(
            config.clone(),
            echo_callbacks(seen.clone()),
            true,
            Some(params.clone()),
        );
        let mut client =
            WebSocketHandler::new(config, WebSocketCallbacks::default(), false, Some(params));

        // Client compresses a repetitive message and masks it.
        let message = "repeat ".repeat(100);
        assert!(client.send_text(&message));
        let wire = client.pending_output().to_vec();

        server.process_input(&wire);
        assert_eq!(seen.borrow()[0], message.as_bytes());
    }
}
