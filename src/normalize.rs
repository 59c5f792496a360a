use once_cell::sync::Lazy;
use regex::Regex;

use crate::classify::DeviceClass;
use crate::request::RequestMeta;

/// The three compression variants a URL may be cached under. Collapsing
/// Accept-Encoding to one of these bounds cache key fan-out to at most
/// three entries per URL instead of the full header value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingVariant {
    Gzip,
    Deflate,
    Identity,
}

impl EncodingVariant {
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            EncodingVariant::Gzip => Some("gzip"),
            EncodingVariant::Deflate => Some("deflate"),
            EncodingVariant::Identity => None,
        }
    }

    fn key_tag(&self) -> &'static str {
        match self {
            EncodingVariant::Gzip => "gzip",
            EncodingVariant::Deflate => "deflate",
            EncodingVariant::Identity => "none",
        }
    }

    pub const ALL: [EncodingVariant; 3] = [
        EncodingVariant::Gzip,
        EncodingVariant::Deflate,
        EncodingVariant::Identity,
    ];
}

/// Headers the engine forwards to the origin after normalization.
#[derive(Debug, Clone)]
pub struct NormalizedHeaders {
    pub encoding: EncodingVariant,
    /// Existing chain with the client IP appended; observability only,
    /// never part of the cache key.
    pub forwarded_for: String,
    /// Synthetic device marker for the origin.
    pub device: DeviceClass,
}

/// Browsers known to mishandle compressed responses; they get the
/// identity variant no matter what they advertise.
static LEGACY_ENCODING_UA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"MSIE [1-6]\.|Netscape/[1-4]\.").unwrap());

/// Canonicalize the cache-relevant request headers.
pub fn normalize(req: &RequestMeta, device: DeviceClass) -> NormalizedHeaders {
    NormalizedHeaders {
        encoding: collapse_accept_encoding(req),
        forwarded_for: append_forwarded_for(req),
        device,
    }
}

fn collapse_accept_encoding(req: &RequestMeta) -> EncodingVariant {
    if LEGACY_ENCODING_UA.is_match(req.user_agent()) {
        return EncodingVariant::Identity;
    }
    match req.header("accept-encoding") {
        Some(value) if value.contains("gzip") => EncodingVariant::Gzip,
        Some(value) if value.contains("deflate") => EncodingVariant::Deflate,
        _ => EncodingVariant::Identity,
    }
}

fn append_forwarded_for(req: &RequestMeta) -> String {
    match req.header("x-forwarded-for") {
        Some(existing) if !existing.is_empty() => {
            format!("{}, {}", existing, req.client_ip)
        }
        _ => req.client_ip.to_string(),
    }
}

/// Cache key for one URL under one encoding variant.
pub fn cache_key(path_and_query: &str, variant: EncodingVariant) -> String {
    format!("{}#enc={}", path_and_query, variant.key_tag())
}

/// Every key the URL may be stored under; the purge/ban path must
/// invalidate all of them.
pub fn all_variants(path_and_query: &str) -> Vec<String> {
    EncodingVariant::ALL
        .iter()
        .map(|v| cache_key(path_and_query, *v))
        .collect()
}
