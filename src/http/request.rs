use std::time::Instant;

use crate::http::{self, Method, StatusCode, Version};

const MAX_HEADERS: usize = 96;

/// Result of attempting to parse a request head from buffered input.
#[derive(Debug, PartialEq, Eq)]
pub enum HeadParse {
    /// The head is not complete yet; wait for more bytes.
    NeedMoreData,
    /// Head parsed; `head_len` bytes of input were the request line and
    /// headers, including the terminating blank line.
    Ok { head_len: usize },
    /// The head is malformed or over limits; respond with this status and
    /// drain-close.
    Fail(StatusCode),
}

/// Error returned by the streaming body accessor once the aggregated view
/// has been taken, and vice versa. The two access styles are mutually
/// exclusive on one request.
#[derive(Debug, PartialEq, Eq)]
pub struct BodyAccessConflict;

/// One parsed request, reused across all requests of a connection.
///
/// Parsing copies the head out of the connection's input buffer into owned
/// storage, so the input buffer can be consumed and refilled while a
/// handler (possibly suspended) still holds the request.
#[derive(Default, Debug)]
pub struct HttpRequest {
    method: Option<Method>,
    version: Version,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    body: Vec<u8>,
    path_params: Vec<(String, String)>,
    head_len: usize,
    aggregated_taken: bool,
    stream_offset: usize,
    pub(crate) started_at: Option<Instant>,
}

impl HttpRequest {
    /// Parse a request head from `input`.
    ///
    /// On success the head fields are stored on `self`; body handling is a
    /// separate step driven by the connection pipeline.
    pub fn try_set_head(
        &mut self,
        input: &[u8],
        max_header_bytes: usize,
        merge_unknown_headers: bool,
    ) -> HeadParse {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_storage);

        let head_len = match parsed.parse(input) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if input.len() > max_header_bytes {
                    return HeadParse::Fail(http::STATUS_HEADERS_TOO_LARGE);
                }
                return HeadParse::NeedMoreData;
            }
            Err(httparse::Error::TooManyHeaders) => {
                return HeadParse::Fail(http::STATUS_HEADERS_TOO_LARGE)
            }
            Err(_) => return HeadParse::Fail(http::STATUS_BAD_REQUEST),
        };

        if head_len > max_header_bytes {
            return HeadParse::Fail(http::STATUS_HEADERS_TOO_LARGE);
        }

        let method = match parsed.method.and_then(Method::parse) {
            Some(method) => method,
            None => return HeadParse::Fail(http::STATUS_NOT_IMPLEMENTED),
        };
        let version = match parsed.version {
            Some(0) => Version::Http10,
            Some(1) => Version::Http11,
            _ => return HeadParse::Fail(http::STATUS_BAD_REQUEST),
        };
        let target = match parsed.path {
            Some(path) => path,
            None => return HeadParse::Fail(http::STATUS_BAD_REQUEST),
        };

        self.reset();
        self.method = Some(method);
        self.version = version;
        self.head_len = head_len;
        match target.split_once('?') {
            Some((path, query)) => {
                self.path.push_str(path);
                self.query.push_str(query);
            }
            None => self.path.push_str(target),
        }

        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            let value = value.trim();
            if let Some(existing) = self
                .headers
                .iter_mut()
                .find(|(name, _)| http::header_name_eq(name, header.name))
            {
                // Duplicate singleton framing headers are a smuggling vector;
                // everything else follows the configured merge policy.
                if http::header_name_eq(header.name, http::H_CONTENT_LENGTH) {
                    if existing.1 != value {
                        return HeadParse::Fail(http::STATUS_BAD_REQUEST);
                    }
                    continue;
                }
                if merge_unknown_headers {
                    existing.1.push_str(", ");
                    existing.1.push_str(value);
                } else {
                    self.headers.push((header.name.to_owned(), value.to_owned()));
                }
            } else {
                self.headers.push((header.name.to_owned(), value.to_owned()));
            }
        }

        HeadParse::Ok { head_len }
    }

    /// Clear everything while keeping allocations for the next request on
    /// the same connection.
    pub fn reset(&mut self) {
        self.method = None;
        self.version = Version::Http11;
        self.path.clear();
        self.query.clear();
        self.headers.clear();
        self.trailers.clear();
        self.body.clear();
        self.path_params.clear();
        self.head_len = 0;
        self.aggregated_taken = false;
        self.stream_offset = 0;
        self.started_at = None;
    }

    pub fn method(&self) -> Method {
        self.method.unwrap_or(Method::Get)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Length of the request line + headers in the connection input buffer.
    pub fn head_len(&self) -> usize {
        self.head_len
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header_name, _)| http::header_name_eq(header_name, name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_value_or_empty(&self, name: &str) -> &str {
        self.header_value(name).unwrap_or("")
    }

    /// Parsed `Content-Length`, or a 400 for anything non-numeric.
    pub fn content_length(&self) -> Result<Option<u64>, StatusCode> {
        match self.header_value(http::H_CONTENT_LENGTH) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| http::STATUS_BAD_REQUEST),
        }
    }

    /// Whether the client asked to tear the connection down after this
    /// exchange. HTTP/1.0 closes by default unless keep-alive is requested.
    pub fn wants_close(&self) -> bool {
        let connection = self.header_value_or_empty(http::H_CONNECTION);
        match self.version {
            Version::Http11 => http::header_list_contains(connection, "close"),
            Version::Http10 => !http::header_list_contains(connection, "keep-alive"),
        }
    }

    /// The aggregated request body as one contiguous view. Taking it makes
    /// the streaming accessor unusable for this request.
    pub fn body(&mut self) -> &[u8] {
        self.aggregated_taken = true;
        &self.body
    }

    /// Body length without flipping to aggregated access.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Streaming accessor: hand out up to `max` unread body bytes, or an
    /// error once `body()` has been called on this request.
    pub fn read_body(&mut self, max: usize) -> Result<&[u8], BodyAccessConflict> {
        if self.aggregated_taken {
            return Err(BodyAccessConflict);
        }
        let end = (self.stream_offset + max).min(self.body.len());
        let chunk = &self.body[self.stream_offset..end];
        self.stream_offset = end;
        Ok(chunk)
    }

    pub fn trailers(&self) -> &[(String, String)] {
        &self.trailers
    }

    pub fn trailer_value(&self, name: &str) -> Option<&str> {
        self.trailers
            .iter()
            .find(|(trailer_name, _)| http::header_name_eq(trailer_name, name))
            .map(|(_, value)| value.as_str())
    }

    pub fn path_params(&self) -> &[(String, String)] {
        &self.path_params
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
        self.stream_offset = 0;
    }

    pub(crate) fn body_storage_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    pub(crate) fn set_trailers(&mut self, trailers: Vec<(String, String)>) {
        self.trailers = trailers;
    }

    pub(crate) fn set_path_params(&mut self, params: Vec<(String, String)>) {
        self.path_params = params;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> (HttpRequest, HeadParse) {
        let mut request = HttpRequest::default();
        let outcome = request.try_set_head(input, 8192, true);
        (request, outcome)
    }

    #[test]
    fn simple_get() {
        let (request, outcome) =
            parse(b"GET /echo?x=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n");
        assert!(matches!(outcome, HeadParse::Ok { .. }));
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/echo");
        assert_eq!(request.query(), "x=1");
        assert_eq!(request.version(), Version::Http11);
        assert_eq!(request.header_value("host"), Some("h"));
        assert_eq!(request.content_length().unwrap(), Some(0));
    }

    #[test]
    fn partial_head_wants_more() {
        let (_, outcome) = parse(b"GET / HTTP/1.1\r\nHost: h");
        assert_eq!(outcome, HeadParse::NeedMoreData);
    }

    #[test]
    fn malformed_request_line_is_400() {
        let (_, outcome) = parse(b"GET\r\n\r\n");
        assert_eq!(outcome, HeadParse::Fail(http::STATUS_BAD_REQUEST));
    }

    #[test]
    fn unknown_method_is_501() {
        let (_, outcome) = parse(b"BREW / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(outcome, HeadParse::Fail(http::STATUS_NOT_IMPLEMENTED));
    }

    #[test]
    fn oversized_head_is_431() {
        let mut request = HttpRequest::default();
        let mut input = b"GET / HTTP/1.1\r\n".to_vec();
        input.extend_from_slice(b"X-Filler: ");
        input.extend_from_slice(&vec![b'a'; 9000]);
        let outcome = request.try_set_head(&input, 8192, true);
        assert_eq!(outcome, HeadParse::Fail(http::STATUS_HEADERS_TOO_LARGE));
    }

    #[test]
    fn conflicting_content_length_is_400() {
        let (_, outcome) =
            parse(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(outcome, HeadParse::Fail(http::STATUS_BAD_REQUEST));
    }

    #[test]
    fn duplicate_headers_merge() {
        let (request, outcome) = parse(b"GET / HTTP/1.1\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n");
        assert!(matches!(outcome, HeadParse::Ok { .. }));
        assert_eq!(request.header_value("x-tag"), Some("a, b"));
    }

    #[test]
    fn http10_close_semantics() {
        let (request, _) = parse(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n");
        assert!(request.wants_close());
        let (request, _) = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!request.wants_close());
        let (request, _) = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(request.wants_close());
    }

    #[test]
    fn aggregated_body_excludes_streaming() {
        let mut request = HttpRequest::default();
        request.set_body(b"hello".to_vec());
        assert_eq!(request.read_body(2).unwrap(), b"he");
        assert_eq!(request.body(), b"hello");
        // Aggregated view taken: streaming now conflicts.
        assert_eq!(request.read_body(2), Err(BodyAccessConflict));
        // The aggregated view itself is idempotent.
        assert_eq!(request.body(), b"hello");
    }
}
