//! Upgrade detection and h2c validation. WebSocket-specific validation
//! lives in [`crate::websocket::upgrade`]; this module covers the shared
//! plumbing the HTTP/1.1 pipeline consults before handing a connection to
//! an installed protocol handler.

use crate::http::{self, response};
use crate::protocol::ProtocolType;
use crate::websocket;

/// HTTP/2 prior-knowledge client connection preface (RFC 9113 §3.4).
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Classify the `Upgrade` header target. Unknown targets stay on HTTP/1.1
/// (and will typically 400 downstream).
pub fn detect_upgrade_target(upgrade_header: &str) -> ProtocolType {
    let value = upgrade_header.trim();
    if value.eq_ignore_ascii_case("h2c") {
        return ProtocolType::Http2;
    }
    if value.eq_ignore_ascii_case(websocket::UPGRADE_TOKEN) {
        return ProtocolType::WebSocket;
    }
    ProtocolType::Http11
}

/// Result of validating an `h2c` upgrade head.
#[derive(Debug, Default)]
pub struct H2cValidation {
    pub valid: bool,
    pub error_message: &'static str,
}

/// Validate the h2c upgrade headers (RFC 9113 §3.2).
///
/// `HTTP2-Settings` must be present and non-empty; its base64url payload
/// is decoded by the HTTP/2 handler itself, not here.
pub fn validate_h2c_upgrade(headers: &[(String, String)]) -> H2cValidation {
    let mut result = H2cValidation::default();

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
        Some(value) if !value.trim().eq_ignore_ascii_case("h2c") => {
            result.error_message = "Upgrade header is not 'h2c'";
            return result;
        }
        Some(_) => {}
    }

    match header(http::H_CONNECTION) {
        None => {
            result.error_message = "Missing Connection header";
            return result;
        }
        Some(value) => {
            if !http::header_list_contains(value, "upgrade") {
                result.error_message = "Connection header does not contain 'upgrade'";
                return result;
            }
            if !http::header_list_contains(value, "http2-settings") {
                result.error_message = "Connection header does not contain 'HTTP2-Settings'";
                return result;
            }
        }
    }

    match header(http::H_HTTP2_SETTINGS) {
        None => {
            result.error_message = "Missing HTTP2-Settings header";
            return result;
        }
        Some(value) if value.is_empty() => {
            result.error_message = "Empty HTTP2-Settings header";
            return result;
        }
        Some(_) => {}
    }

    result.valid = true;
    result
}

/// Raw 101 for a successful h2c upgrade. The HTTP/2 handler sends its own
/// SETTINGS immediately after.
pub fn build_h2c_upgrade_response() -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    response::write_header(&mut out, http::H_UPGRADE, "h2c");
    response::write_header(&mut out, http::H_CONNECTION, "Upgrade");
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn detect_targets() {
        assert_eq!(detect_upgrade_target("h2c"), ProtocolType::Http2);
        assert_eq!(detect_upgrade_target("H2C"), ProtocolType::Http2);
        assert_eq!(detect_upgrade_target("websocket"), ProtocolType::WebSocket);
        assert_eq!(detect_upgrade_target("WebSocket"), ProtocolType::WebSocket);
        assert_eq!(detect_upgrade_target("tls/1.0"), ProtocolType::Http11);
        assert_eq!(detect_upgrade_target(""), ProtocolType::Http11);
    }

    #[test]
    fn valid_h2c() {
        let request_headers = headers(&[
            ("Upgrade", "h2c"),
            ("Connection", "Upgrade, HTTP2-Settings"),
            ("HTTP2-Settings", "AAMAAABkAAQAoAAAAAIAAAAA"),
        ]);
        let validation = validate_h2c_upgrade(&request_headers);
        assert!(validation.valid, "{}", validation.error_message);
    }

    #[test]
    fn h2c_requires_settings_header() {
        let request_headers = headers(&[
            ("Upgrade", "h2c"),
            ("Connection", "Upgrade, HTTP2-Settings"),
        ]);
        assert!(!validate_h2c_upgrade(&request_headers).valid);

        let request_headers = headers(&[
            ("Upgrade", "h2c"),
            ("Connection", "Upgrade, HTTP2-Settings"),
            ("HTTP2-Settings", ""),
        ]);
        assert!(!validate_h2c_upgrade(&request_headers).valid);
    }

    #[test]
    fn h2c_requires_both_connection_tokens() {
        let request_headers = headers(&[
            ("Upgrade", "h2c"),
            ("Connection", "Upgrade"),
            ("HTTP2-Settings", "AAMAAABkAAQAoAAAAAIAAAAA"),
        ]);
        assert!(!validate_h2c_upgrade(&request_headers).valid);
    }

    #[test]
    fn h2c_response_shape() {
        let text = String::from_utf8(build_h2c_upgrade_response()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: h2c\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn preface_constant() {
        assert_eq!(HTTP2_PREFACE.len(), 24);
        assert!(HTTP2_PREFACE.starts_with(b"PRI "));
    }
}
