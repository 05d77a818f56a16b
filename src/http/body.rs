use crate::http::{self, StatusCode};

const MAX_TRAILER_HEADERS: usize = 32;
// Longest accepted chunk-size line (hex digits plus extensions).
const MAX_CHUNK_SIZE_LINE: usize = 128;

/// Outcome of decoding a chunked request body from buffered input.
#[derive(Debug)]
pub enum ChunkedDecode {
    /// The terminating 0-chunk (and its trailer section) has not arrived.
    NeedMore,
    /// Fully decoded. `consumed` counts raw input bytes, including the
    /// terminator and trailers.
    Ready {
        consumed: usize,
        body: Vec<u8>,
        trailers: Vec<(String, String)>,
    },
    Fail(StatusCode),
}

/// Decode a complete chunked body (RFC 7230 §4.1), trailers included.
///
/// Decoding is all-or-nothing: a partially received body returns
/// `NeedMore` and is retried when more bytes arrive. The body-read timeout
/// bounds how long a slow client can keep the decoder waiting.
pub fn decode_chunked(input: &[u8], max_body_bytes: usize) -> ChunkedDecode {
    let mut pos = 0usize;
    let mut body = Vec::new();

    loop {
        let line_end = match find_crlf(&input[pos..]) {
            Some(offset) => pos + offset,
            None => {
                if input.len() - pos > MAX_CHUNK_SIZE_LINE {
                    return ChunkedDecode::Fail(http::STATUS_BAD_REQUEST);
                }
                return ChunkedDecode::NeedMore;
            }
        };

        let size_line = &input[pos..line_end];
        let chunk_size = match parse_chunk_size(size_line) {
            Some(size) => size,
            None => return ChunkedDecode::Fail(http::STATUS_BAD_REQUEST),
        };

        pos = line_end + 2;

        if chunk_size == 0 {
            // Trailer section: zero or more header lines, then a blank line.
            let mut storage = [httparse::EMPTY_HEADER; MAX_TRAILER_HEADERS];
            return match httparse::parse_headers(&input[pos..], &mut storage) {
                Ok(httparse::Status::Complete((trailer_len, parsed))) => {
                    let trailers = parsed
                        .iter()
                        .map(|header| {
                            (
                                header.name.to_owned(),
                                String::from_utf8_lossy(header.value).trim().to_owned(),
                            )
                        })
                        .collect();
                    ChunkedDecode::Ready {
                        consumed: pos + trailer_len,
                        body,
                        trailers,
                    }
                }
                Ok(httparse::Status::Partial) => ChunkedDecode::NeedMore,
                Err(_) => ChunkedDecode::Fail(http::STATUS_BAD_REQUEST),
            };
        }

        if body.len() + chunk_size > max_body_bytes {
            return ChunkedDecode::Fail(http::STATUS_PAYLOAD_TOO_LARGE);
        }

        // chunk data + trailing CRLF
        if input.len() < pos + chunk_size + 2 {
            return ChunkedDecode::NeedMore;
        }
        body.extend_from_slice(&input[pos..pos + chunk_size]);
        if &input[pos + chunk_size..pos + chunk_size + 2] != b"\r\n" {
            return ChunkedDecode::Fail(http::STATUS_BAD_REQUEST);
        }
        pos += chunk_size + 2;
    }
}

/// Chunk size is hex, optionally followed by `;extension` which we ignore.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let digits_end = line
        .iter()
        .position(|&byte| byte == b';')
        .unwrap_or(line.len());
    let digits = std::str::from_utf8(&line[..digits_end]).ok()?;
    let digits = digits.trim();
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    usize::from_str_radix(digits, 16).ok()
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|pair| pair == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_chunks_with_trailer() {
        let input = b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: v\r\n\r\n";
        match decode_chunked(input, 1 << 20) {
            ChunkedDecode::Ready {
                consumed,
                body,
                trailers,
            } => {
                assert_eq!(consumed, input.len());
                assert_eq!(body, b"hello world");
                assert_eq!(trailers, vec![("X-Trailer".to_owned(), "v".to_owned())]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn no_trailers() {
        let input = b"3\r\nabc\r\n0\r\n\r\n";
        match decode_chunked(input, 1 << 20) {
            ChunkedDecode::Ready {
                consumed,
                body,
                trailers,
            } => {
                assert_eq!(consumed, input.len());
                assert_eq!(body, b"abc");
                assert!(trailers.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn incomplete_needs_more() {
        assert!(matches!(
            decode_chunked(b"5\r\nhel", 1 << 20),
            ChunkedDecode::NeedMore
        ));
        assert!(matches!(
            decode_chunked(b"5\r\nhello\r\n0\r\n", 1 << 20),
            ChunkedDecode::NeedMore
        ));
    }

    #[test]
    fn bad_chunk_size_is_400() {
        assert!(matches!(
            decode_chunked(b"zz\r\nhello\r\n", 1 << 20),
            ChunkedDecode::Fail(http::STATUS_BAD_REQUEST)
        ));
    }

    #[test]
    fn missing_chunk_crlf_is_400() {
        assert!(matches!(
            decode_chunked(b"3\r\nabcXX0\r\n\r\n", 1 << 20),
            ChunkedDecode::Fail(http::STATUS_BAD_REQUEST)
        ));
    }

    #[test]
    fn oversized_body_is_413() {
        assert!(matches!(
            decode_chunked(b"ffffff\r\n", 16),
            ChunkedDecode::Fail(http::STATUS_PAYLOAD_TOO_LARGE)
        ));
    }

    #[test]
    fn chunk_extension_is_ignored() {
        let input = b"3;name=val\r\nabc\r\n0\r\n\r\n";
        match decode_chunked(input, 1 << 20) {
            ChunkedDecode::Ready { body, .. } => assert_eq!(body, b"abc"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
