use std::time::Duration;

use axum::http::HeaderMap;
use tracing::debug;

use crate::classify::{Category, Classification};
use crate::normalize::{cache_key, NormalizedHeaders};
use crate::request::RequestMeta;

/// What to do with a request before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreDecision {
    /// PURGE request; the caller must check the purge ACL.
    Purge,
    /// Bypass cache lookup and pooled admission. When `ban_first` is set
    /// the client explicitly refused cached content, so the stored
    /// variants are invalidated first and the next response is freshly
    /// stored rather than merely bypassed once.
    Pass { ban_first: bool },
    /// Cacheable path: look the key up, fetch and store on miss.
    Hash { key: String },
}

/// Whether an origin response may be stored, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostDecision {
    Cacheable { ttl: Duration },
    Uncacheable { reason: UncacheableReason },
}

/// Not an error: the response is still delivered, only storage is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncacheableReason {
    ServerError,
    PartialContent,
    ZeroFreshness,
    SetCookie,
    AuthorizedResponse,
}

/// Origin response fields the post-decision consumes.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: HeaderMap,
}

impl ResponseMeta {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Status codes that must never be cached regardless of freshness headers.
const UNCACHEABLE_STATUS: &[u16] = &[500, 502, 503, 504];

/// The cacheable/pass/purge decision engine. Both decisions are pure
/// functions of the request/response fields plus the configured default
/// TTL; all side effects (ban, fetch, store) belong to the pipeline.
pub struct CachePolicyEngine {
    default_ttl: Duration,
}

impl CachePolicyEngine {
    pub fn new(default_ttl: Duration) -> Self {
        Self { default_ttl }
    }

    /// Decide hash/pass/purge before dispatch.
    pub fn pre_decide(
        &self,
        req: &RequestMeta,
        classification: &Classification,
        normalized: &NormalizedHeaders,
    ) -> PreDecision {
        if classification.category == Category::Purge {
            return PreDecision::Purge;
        }

        let pass_category = matches!(
            classification.category,
            Category::Sitemap | Category::Asset | Category::Api
        );
        if pass_category
            || classification.authenticated
            || (req.method != "GET" && req.method != "HEAD")
        {
            return PreDecision::Pass { ban_first: false };
        }

        // Range requests bypass the cache: a partial body must never be
        // stored under the key plain GETs for the same URL share.
        if req.headers.contains_key("range") {
            return PreDecision::Pass { ban_first: false };
        }

        if client_refuses_cache(req) {
            debug!("Client cache-control forces refresh for {}", req.path);
            return PreDecision::Pass { ban_first: true };
        }

        PreDecision::Hash {
            key: cache_key(&req.path_and_query(), normalized.encoding),
        }
    }

    /// Decide whether an origin response may be stored. Never blocks
    /// delivery; idempotent over the same response fields.
    pub fn post_decide(&self, response: &ResponseMeta) -> PostDecision {
        if UNCACHEABLE_STATUS.contains(&response.status) {
            return PostDecision::Uncacheable {
                reason: UncacheableReason::ServerError,
            };
        }

        // A 206 is a fragment; serving it later as the full URL would
        // hand truncated bodies to plain GETs.
        if response.status == 206 {
            return PostDecision::Uncacheable {
                reason: UncacheableReason::PartialContent,
            };
        }

        if response.headers.contains_key("set-cookie") {
            return PostDecision::Uncacheable {
                reason: UncacheableReason::SetCookie,
            };
        }

        let cache_control = response.header("cache-control");
        if response.headers.contains_key("authorization")
            && !cache_control.map_or(false, |cc| cc.contains("public"))
        {
            return PostDecision::Uncacheable {
                reason: UncacheableReason::AuthorizedResponse,
            };
        }

        let ttl = self.freshness_lifetime(cache_control);
        if ttl.is_zero() {
            PostDecision::Uncacheable {
                reason: UncacheableReason::ZeroFreshness,
            }
        } else {
            PostDecision::Cacheable { ttl }
        }
    }

    /// Effective freshness lifetime from the origin's Cache-Control,
    /// falling back to the configured default when the origin is silent.
    fn freshness_lifetime(&self, cache_control: Option<&str>) -> Duration {
        let cc = match cache_control {
            Some(cc) => cc,
            None => return self.default_ttl,
        };

        if cc.contains("no-cache") || cc.contains("no-store") || cc.contains("private") {
            return Duration::ZERO;
        }

        // s-maxage takes precedence over max-age for a shared cache.
        for directive_name in ["s-maxage=", "max-age="] {
            for directive in cc.split(',') {
                let directive = directive.trim();
                if let Some(value) = directive.strip_prefix(directive_name) {
                    if let Ok(secs) = value.parse::<u64>() {
                        return Duration::from_secs(secs);
                    }
                }
            }
        }

        self.default_ttl
    }
}

/// Client-supplied directives that refuse any cached response.
fn client_refuses_cache(req: &RequestMeta) -> bool {
    if let Some(cc) = req.header("cache-control") {
        if cc.contains("no-cache") || cc.contains("no-store") || cc.contains("max-age=0") {
            return true;
        }
    }
    matches!(req.header("pragma"), Some(p) if p.contains("no-cache"))
}
