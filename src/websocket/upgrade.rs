use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest;

use crate::config::WebSocketConfig;
use crate::http::{self, response};
use crate::websocket::{self, handler::DeflateParams};

/// Outcome of validating a client's upgrade request against an endpoint.
#[derive(Debug, Default)]
pub struct UpgradeValidation {
    pub valid: bool,
    pub error_message: &'static str,
    pub accept_key: String,
    pub selected_protocol: Option<String>,
    pub deflate: Option<DeflateParams>,
}

/// A key is 16 random bytes base64-encoded: exactly 24 characters ending
/// in `==`.
pub fn is_valid_key(key: &str) -> bool {
    if key.len() != 24 {
        return false;
    }
    if !key.bytes().all(|byte| {
        byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'/' || byte == b'='
    }) {
        return false;
    }
    key.as_bytes()[22] == b'=' && key.as_bytes()[23] == b'='
}

/// `base64(SHA1(key + GUID))` per RFC 6455 §4.2.2.
pub fn compute_accept_key(key: &str) -> String {
    let mut material = Vec::with_capacity(key.len() + websocket::ACCEPT_GUID.len());
    material.extend_from_slice(key.as_bytes());
    material.extend_from_slice(websocket::ACCEPT_GUID.as_bytes());
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &material);
    BASE64.encode(hash.as_ref())
}

/// Validate the upgrade head and negotiate subprotocol and
/// permessage-deflate.
pub fn validate_upgrade(
    headers: &[(String, String)],
    config: &WebSocketConfig,
) -> UpgradeValidation {
    let mut result = UpgradeValidation::default();

    let header = |name: &str| {
        headers
            .iter()
            .find(|(header_name, _)| http::header_name_eq(header_name, name))
            .map(|(_, value)| value.as_str())
    };

    match header(http::H_UPGRADE) {
        None => {
            result.error_message = "Missing Upgrade header";
            return result;
        }
        Some(value) if !value.eq_ignore_ascii_case(websocket::UPGRADE_TOKEN) => {
            result.error_message = "Upgrade header is not 'websocket'";
            return result;
        }
        Some(_) => {}
    }

    match header(http::H_CONNECTION) {
        Some(value) if http::header_list_contains(value, "upgrade") => {}
        _ => {
            result.error_message = "Connection header does not contain 'upgrade'";
            return result;
        }
    }

    match header(websocket::H_SEC_WEBSOCKET_VERSION) {
        None => {
            result.error_message = "Missing Sec-WebSocket-Version header";
            return result;
        }
        Some(value) if value != websocket::SUPPORTED_VERSION => {
            result.error_message = "Unsupported Sec-WebSocket-Version (expected 13)";
            return result;
        }
        Some(_) => {}
    }

    let key = match header(websocket::H_SEC_WEBSOCKET_KEY) {
        None => {
            result.error_message = "Missing Sec-WebSocket-Key header";
            return result;
        }
        Some(key) => key,
    };
    if !is_valid_key(key) {
        result.error_message = "Invalid Sec-WebSocket-Key format";
        return result;
    }
    result.accept_key = compute_accept_key(key);

    // Subprotocol: first server-preferred protocol the client offered.
    if let Some(offered) = header(websocket::H_SEC_WEBSOCKET_PROTOCOL) {
        result.selected_protocol = config
            .subprotocols
            .iter()
            .find(|supported| {
                offered
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case(supported))
            })
            .cloned();
    }

    // Extensions: take the first acceptable permessage-deflate offer.
    if config.deflate.enabled {
        if let Some(extensions) = header(websocket::H_SEC_WEBSOCKET_EXTENSIONS) {
            result.deflate = extensions
                .split(',')
                .filter_map(|offer| DeflateParams::parse_offer(offer.trim(), &config.deflate))
                .next();
        }
    }

    result.valid = true;
    result
}

/// Raw 101 emitted straight into the outbound buffer, bypassing the normal
/// response builder (which refuses reserved headers like `Upgrade`).
pub fn build_upgrade_response(validation: &UpgradeValidation) -> Vec<u8> {
    let mut out = Vec::with_capacity(192);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    response::write_header(&mut out, http::H_UPGRADE, websocket::UPGRADE_TOKEN);
    response::write_header(&mut out, http::H_CONNECTION, "Upgrade");
    response::write_header(
        &mut out,
        websocket::H_SEC_WEBSOCKET_ACCEPT,
        &validation.accept_key,
    );
    if let Some(protocol) = &validation.selected_protocol {
        response::write_header(&mut out, websocket::H_SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    if let Some(deflate) = &validation.deflate {
        response::write_header(
            &mut out,
            websocket::H_SEC_WEBSOCKET_EXTENSIONS,
            &deflate.response_value(),
        );
    }
    out.extend_from_slice(b"\r\n");
    out
}
