//! WebSocket (RFC 6455) frame engine: parse/build/mask, message assembly
//! with fragmentation and permessage-deflate, control frames, and the
//! close handshake.

pub mod frame;
pub mod handler;
pub mod upgrade;

pub use self::frame::{
    apply_mask, build_close_frame, build_frame, parse_close_payload, parse_frame, CloseCode,
    FrameHeader, FrameParse, Opcode,
};
pub use self::handler::{DeflateParams, WebSocketCallbacks, WebSocketHandler, WebSocketSender};
pub use self::upgrade::{
    build_upgrade_response, compute_accept_key, is_valid_key, validate_upgrade, UpgradeValidation,
};

/// GUID concatenated with the client key to derive `Sec-WebSocket-Accept`.
pub const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const UPGRADE_TOKEN: &str = "websocket";
pub const SUPPORTED_VERSION: &str = "13";

pub const H_SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
pub const H_SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
pub const H_SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const H_SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
pub const H_SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Control frame payloads are capped at 125 bytes (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;
