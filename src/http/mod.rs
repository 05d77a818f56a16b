//! HTTP/1.1 wire layer: request head parsing, body decoding, response
//! building, and content-coding negotiation.

pub mod body;
pub mod encoding;
pub mod request;
pub mod response;

use std::fmt;

pub use self::request::{HeadParse, HttpRequest};
pub use self::response::{FilePayload, HttpResponse, ResponseBody};

pub const CRLF: &str = "\r\n";
pub const DOUBLE_CRLF: &str = "\r\n\r\n";

/// Interim responses emitted verbatim.
pub const HTTP11_100_CONTINUE: &str = "HTTP/1.1 100 Continue\r\n\r\n";
pub const HTTP11_102_PROCESSING: &str = "HTTP/1.1 102 Processing\r\n\r\n";

/// Shortest possible request line: `GET / HTTP/1.1\r\n`.
pub const MIN_REQUEST_LINE_LEN: usize = 16;

// Header names the core inspects. Comparison is case-insensitive on the
// wire; these are the canonical spellings used when emitting.
pub const H_CONNECTION: &str = "Connection";
pub const H_CONTENT_LENGTH: &str = "Content-Length";
pub const H_CONTENT_ENCODING: &str = "Content-Encoding";
pub const H_TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const H_ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const H_EXPECT: &str = "Expect";
pub const H_UPGRADE: &str = "Upgrade";
pub const H_HOST: &str = "Host";
pub const H_LOCATION: &str = "Location";
pub const H_ALLOW: &str = "Allow";
pub const H_ORIGIN: &str = "Origin";
pub const H_HTTP2_SETTINGS: &str = "HTTP2-Settings";

pub type StatusCode = u16;

pub const STATUS_OK: StatusCode = 200;
pub const STATUS_NO_CONTENT: StatusCode = 204;
pub const STATUS_MOVED_PERMANENTLY: StatusCode = 301;
pub const STATUS_BAD_REQUEST: StatusCode = 400;
pub const STATUS_FORBIDDEN: StatusCode = 403;
pub const STATUS_NOT_FOUND: StatusCode = 404;
pub const STATUS_METHOD_NOT_ALLOWED: StatusCode = 405;
pub const STATUS_NOT_ACCEPTABLE: StatusCode = 406;
pub const STATUS_REQUEST_TIMEOUT: StatusCode = 408;
pub const STATUS_PAYLOAD_TOO_LARGE: StatusCode = 413;
pub const STATUS_EXPECTATION_FAILED: StatusCode = 417;
pub const STATUS_HEADERS_TOO_LARGE: StatusCode = 431;
pub const STATUS_INTERNAL_SERVER_ERROR: StatusCode = 500;
pub const STATUS_NOT_IMPLEMENTED: StatusCode = 501;

pub fn reason_phrase(status: StatusCode) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
}

impl Method {
    pub fn parse(token: &str) -> Option<Method> {
        // Methods are case-sensitive on the wire (RFC 7231 §4.1).
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "OPTIONS" => Some(Method::Options),
            "TRACE" => Some(Method::Trace),
            "CONNECT" => Some(Method::Connect),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Case-insensitive ASCII comparison, the only kind header handling needs.
pub fn header_name_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// True when a comma-separated header value contains `token`
/// (case-insensitive). Empty list items are tolerated: `",upgrade,"`
/// matches `upgrade`.
pub fn header_list_contains(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_is_case_sensitive() {
        assert_eq!(Method::parse("GET"), Some(Method::Get));
        assert_eq!(Method::parse("get"), None);
        assert_eq!(Method::parse("PATCH"), Some(Method::Patch));
    }

    #[test]
    fn header_list_tolerates_empty_tokens() {
        assert!(header_list_contains(",upgrade,", "upgrade"));
        assert!(header_list_contains("keep-alive, Upgrade", "upgrade"));
        assert!(!header_list_contains("keep-alive", "upgrade"));
        assert!(header_list_contains("Upgrade, HTTP2-Settings", "http2-settings"));
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(431), "Request Header Fields Too Large");
        assert_eq!(reason_phrase(999), "Unknown");
    }
}
