use std::io::Read;

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::Write;

use crate::config::{CompressionConfig, DecompressionConfig};
use crate::http::{self, StatusCode};

/// Content-codings the core itself can apply. Anything richer (zstd,
/// brotli) plugs in outside the core.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Encoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn token(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

/// Outcome of `Accept-Encoding` negotiation. `reject` is set when the
/// client explicitly forbids identity and no alternative can be offered,
/// which maps to a 406 without invoking the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    pub encoding: Encoding,
    pub reject: bool,
}

/// Chooses the response content-coding from the client's `Accept-Encoding`
/// and the server's configured codecs. Rebuilt on every config apply.
#[derive(Debug, Clone)]
pub struct EncodingSelector {
    gzip_level: Option<u32>,
    deflate_level: Option<u32>,
    pub min_response_size: usize,
}

impl EncodingSelector {
    pub fn new(config: &CompressionConfig) -> EncodingSelector {
        EncodingSelector {
            gzip_level: config.gzip_level,
            deflate_level: config.deflate_level,
            min_response_size: config.min_response_size,
        }
    }

    pub fn negotiate(&self, accept_encoding: &str) -> Negotiation {
        if accept_encoding.is_empty() {
            return Negotiation {
                encoding: Encoding::Identity,
                reject: false,
            };
        }

        let mut q_gzip: Option<f32> = None;
        let mut q_deflate: Option<f32> = None;
        let mut q_identity: Option<f32> = None;
        let mut q_wildcard: Option<f32> = None;

        for item in accept_encoding.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (token, q) = parse_coding(item);
            if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
                q_gzip = Some(q);
            } else if token.eq_ignore_ascii_case("deflate") {
                q_deflate = Some(q);
            } else if token.eq_ignore_ascii_case("identity") {
                q_identity = Some(q);
            } else if token == "*" {
                q_wildcard = Some(q);
            }
        }

        // Unlisted codings inherit the wildcard q. Identity additionally
        // defaults to acceptable: it is the fallback, never a preference.
        let effective = |explicit: Option<f32>| explicit.or(q_wildcard).unwrap_or(0.0);
        let gzip_q = if self.gzip_level.is_some() {
            effective(q_gzip)
        } else {
            0.0
        };
        let deflate_q = if self.deflate_level.is_some() {
            effective(q_deflate)
        } else {
            0.0
        };
        let identity_q = q_identity.or(q_wildcard).unwrap_or(1.0);

        // Pick the best compressed coding first; on ties the server prefers
        // gzip over deflate.
        if gzip_q > 0.0 && gzip_q >= deflate_q {
            return Negotiation {
                encoding: Encoding::Gzip,
                reject: false,
            };
        }
        if deflate_q > 0.0 {
            return Negotiation {
                encoding: Encoding::Deflate,
                reject: false,
            };
        }
        Negotiation {
            encoding: Encoding::Identity,
            reject: identity_q <= 0.0,
        }
    }

    /// Compress `body` with the negotiated coding. Returns `None` when the
    /// payload is under the configured threshold or compression is not
    /// worthwhile (output not smaller).
    pub fn compress(&self, encoding: Encoding, body: &[u8]) -> Option<Vec<u8>> {
        if body.len() < self.min_response_size {
            return None;
        }
        let compressed = match encoding {
            Encoding::Identity => return None,
            Encoding::Gzip => {
                let level = Compression::new(self.gzip_level?);
                let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), level);
                encoder.write_all(body).ok()?;
                encoder.finish().ok()?
            }
            Encoding::Deflate => {
                let level = Compression::new(self.deflate_level?);
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), level);
                encoder.write_all(body).ok()?;
                encoder.finish().ok()?
            }
        };
        if compressed.len() < body.len() {
            Some(compressed)
        } else {
            None
        }
    }
}

/// Decompress a request body according to its `Content-Encoding`.
///
/// Returns `Ok(None)` when the body is identity-coded and can be used as
/// is. Policy failures carry the status the pipeline should emit.
pub fn decompress_request_body(
    content_encoding: &str,
    body: &[u8],
    config: &DecompressionConfig,
) -> Result<Option<Vec<u8>>, (StatusCode, &'static str)> {
    let coding = content_encoding.trim();
    if coding.is_empty() || coding.eq_ignore_ascii_case("identity") {
        return Ok(None);
    }

    let is_gzip = coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip");
    let is_deflate = coding.eq_ignore_ascii_case("deflate");
    if !is_gzip && !is_deflate {
        return Err((
            http::STATUS_NOT_IMPLEMENTED,
            "Unsupported Content-Encoding",
        ));
    }
    let allowed = if is_gzip {
        config.allow_gzip
    } else {
        config.allow_deflate
    };
    if !allowed {
        return Err((
            http::STATUS_NOT_IMPLEMENTED,
            "Content-Encoding disabled by policy",
        ));
    }

    // Read one byte past the cap to detect violations without inflating an
    // unbounded stream into memory.
    let cap = config.max_inflated_bytes as u64;
    let mut inflated = Vec::new();
    let read = if is_gzip {
        MultiGzDecoder::new(body)
            .take(cap + 1)
            .read_to_end(&mut inflated)
    } else {
        ZlibDecoder::new(body).take(cap + 1).read_to_end(&mut inflated)
    };

    match read {
        Ok(_) if inflated.len() as u64 > cap => Err((
            http::STATUS_PAYLOAD_TOO_LARGE,
            "Decompressed body exceeds limit",
        )),
        Ok(_) => Ok(Some(inflated)),
        Err(_) => Err((http::STATUS_BAD_REQUEST, "Malformed compressed body")),
    }
}

fn parse_coding(item: &str) -> (&str, f32) {
    match item.split_once(';') {
        None => (item.trim(), 1.0),
        Some((token, params)) => {
            let q = params
                .split(';')
                .filter_map(|param| param.trim().strip_prefix("q="))
                .next()
                .and_then(|value| value.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (token.trim(), q)
        }
    }
}
