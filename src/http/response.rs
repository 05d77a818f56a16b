use std::fmt::Write as _;
use std::fs::File;
use std::io;

use crate::http::{self, StatusCode};

/// A large response body served from an open file through the file-send
/// engine (`sendfile` on plain/kTLS transports, `pread` staging on TLS).
#[derive(Debug)]
pub struct FilePayload {
    pub file: File,
    pub offset: u64,
    pub length: u64,
}

impl FilePayload {
    pub fn new(file: File, offset: u64, length: u64) -> FilePayload {
        FilePayload {
            file,
            offset,
            length,
        }
    }

    /// Serve the whole file, length taken from its metadata.
    pub fn whole(file: File) -> io::Result<FilePayload> {
        let length = file.metadata()?.len();
        Ok(FilePayload {
            file,
            offset: 0,
            length,
        })
    }
}

#[derive(Debug, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    File(FilePayload),
}

/// Response produced by handlers and finalized by the server.
///
/// Framing headers (`Content-Length`, `Connection`, `Transfer-Encoding`,
/// `Content-Encoding`) are owned by the server; user-supplied values for
/// them are dropped at finalize time.
#[derive(Debug, Default)]
pub struct HttpResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    body: ResponseBody,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> HttpResponse {
        HttpResponse {
            status,
            reason: None,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn with_text(status: StatusCode, body: impl Into<Vec<u8>>) -> HttpResponse {
        let mut response = HttpResponse::new(status);
        response.set_body(body);
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| http::reason_phrase(self.status))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> HttpResponse {
        self.add_header(name, value);
        self
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
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

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> HttpResponse {
        self.set_body(body);
        self
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = ResponseBody::Bytes(body.into());
    }

    pub fn file(mut self, payload: FilePayload) -> HttpResponse {
        self.body = ResponseBody::File(payload);
        self
    }

    pub fn body_ref(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            ResponseBody::Bytes(bytes) => bytes,
            _ => &[],
        }
    }

    pub fn body_bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.body {
            ResponseBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub(crate) fn take_body(&mut self) -> ResponseBody {
        std::mem::take(&mut self.body)
    }
}

/// Headers the finalize step owns; user copies are dropped.
pub(crate) fn is_reserved_header(name: &str) -> bool {
    http::header_name_eq(name, http::H_CONTENT_LENGTH)
        || http::header_name_eq(name, http::H_CONNECTION)
        || http::header_name_eq(name, http::H_TRANSFER_ENCODING)
        || http::header_name_eq(name, http::H_CONTENT_ENCODING)
}

pub(crate) fn write_status_line(out: &mut Vec<u8>, status: StatusCode, reason: &str) {
    let mut line = String::with_capacity(16 + reason.len());
    let _ = write!(line, "HTTP/1.1 {} {}\r\n", status, reason);
    out.extend_from_slice(line.as_bytes());
}

pub(crate) fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Server-generated error response: short body, `Connection: close`, no
/// stack traces.
pub(crate) fn build_simple_error(
    status: StatusCode,
    global_headers: &[(String, String)],
    message: &str,
) -> Vec<u8> {
    let body = if message.is_empty() {
        http::reason_phrase(status).as_bytes()
    } else {
        message.as_bytes()
    };

    let mut out = Vec::with_capacity(128 + body.len());
    write_status_line(&mut out, status, http::reason_phrase(status));
    for (name, value) in global_headers {
        if !is_reserved_header(name) {
            write_header(&mut out, name, value);
        }
    }
    write_header(&mut out, "Content-Type", "text/plain");
    write_header(&mut out, http::H_CONTENT_LENGTH, &body.len().to_string());
    write_header(&mut out, http::H_CONNECTION, "close");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}
