use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::classify::{Category, Classification};
use crate::config;
use crate::pool::{BackendPool, PoolRegistry};
use crate::request::RequestMeta;

/// Indexed special/history/action endpoints: the expensive, rarely-cached
/// page variants anonymous crawlers hammer.
static SPECIAL_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(wiki/)?Special:|/index\.php").unwrap());

/// Action or revision queries on normal pages count as special traffic.
static SPECIAL_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|&)(action=|oldid=|diff=)").unwrap());

/// The login page is exempted from the special pool: logging in must not
/// be starved by anonymous special-page storms.
static LOGIN_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"Special:UserLogin").unwrap());

/// Where a request goes and whether pooled admission applies.
pub struct RouteDecision {
    pub pool: Arc<BackendPool>,
    /// False for pass-through traffic: it is forwarded on the default
    /// pool's origin at full network-level concurrency.
    pub admission: bool,
}

/// Maps a classified request to one backend pool.
pub struct BackendRouter {
    default_pool: Arc<BackendPool>,
    anon_view: Arc<BackendPool>,
    anon_special: Arc<BackendPool>,
    suspicious: Arc<BackendPool>,
}

impl BackendRouter {
    /// Build from the registry. Fails at startup when a required pool is
    /// missing (config validation should have caught this already).
    pub fn new(registry: &PoolRegistry) -> Result<Self> {
        let get = |name: &str| {
            registry
                .get(name)
                .with_context(|| format!("Missing required pool: '{}'", name))
        };
        Ok(Self {
            default_pool: get(config::POOL_DEFAULT)?,
            anon_view: get(config::POOL_ANON_VIEW)?,
            anon_special: get(config::POOL_ANON_SPECIAL)?,
            suspicious: get(config::POOL_SUSPICIOUS)?,
        })
    }

    /// Select the pool for a request. Admission pooling exists to shield
    /// the origin from anonymous cacheable-page storms, so authenticated
    /// traffic, non-GET/HEAD methods, and sitemap/asset/api requests pass
    /// straight through the default pool with no ceiling. The suspicious
    /// flag is evaluated last and overrides category-based routing.
    pub fn route(&self, req: &RequestMeta, classification: &Classification) -> RouteDecision {
        let pass_through = classification.authenticated
            || (req.method != "GET" && req.method != "HEAD")
            || matches!(
                classification.category,
                Category::Sitemap | Category::Asset | Category::Api
            );

        if pass_through {
            debug!("Routing {} {} as pass-through", req.method, req.path);
            return RouteDecision {
                pool: self.default_pool.clone(),
                admission: false,
            };
        }

        let mut pool = if self.is_special(req) {
            self.anon_special.clone()
        } else {
            self.anon_view.clone()
        };

        if classification.suspicious {
            pool = self.suspicious.clone();
        }

        debug!("Routing {} {} to pool '{}'", req.method, req.path, pool.name());
        RouteDecision {
            pool,
            admission: true,
        }
    }

    fn is_special(&self, req: &RequestMeta) -> bool {
        if LOGIN_PATH.is_match(&req.path) {
            return false;
        }
        SPECIAL_PATH.is_match(&req.path) || SPECIAL_QUERY.is_match(&req.query)
    }

    pub fn default_pool(&self) -> &Arc<BackendPool> {
        &self.default_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::config::{PoolConfig, POOL_ANON_SPECIAL, POOL_ANON_VIEW, POOL_DEFAULT, POOL_SUSPICIOUS};
    use crate::request::test_support::RequestBuilder;
    use std::time::Duration;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn router() -> BackendRouter {
        let pools: Vec<PoolConfig> = [POOL_DEFAULT, POOL_ANON_VIEW, POOL_ANON_SPECIAL, POOL_SUSPICIOUS]
            .iter()
            .map(|name| PoolConfig {
                name: name.to_string(),
                host: "127.0.0.1".to_string(),
                port: 8080,
                connect_timeout: Duration::from_secs(1),
                first_byte_timeout: Duration::from_secs(1),
                between_bytes_timeout: Duration::from_secs(1),
                max_connections: 4,
                wait_limit: 4,
                wait_timeout: Duration::from_secs(1),
            })
            .collect();
        BackendRouter::new(&PoolRegistry::from_config(&pools)).unwrap()
    }

    fn route_name(req: &RequestMeta) -> (String, bool) {
        let router = router();
        let decision = router.route(req, &classify(req));
        (decision.pool.name().to_string(), decision.admission)
    }

    #[test]
    fn anonymous_view_goes_to_view_pool() {
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("user-agent", CHROME_UA)
            .build();
        assert_eq!(route_name(&req), (POOL_ANON_VIEW.to_string(), true));
    }

    #[test]
    fn special_pages_go_to_special_pool() {
        let req = RequestBuilder::get("/wiki/Special:RecentChanges")
            .header("user-agent", CHROME_UA)
            .build();
        assert_eq!(route_name(&req), (POOL_ANON_SPECIAL.to_string(), true));

        let req = RequestBuilder::get("/index.php?title=Foo&action=history")
            .header("user-agent", CHROME_UA)
            .build();
        assert_eq!(route_name(&req), (POOL_ANON_SPECIAL.to_string(), true));
    }

    #[test]
    fn login_page_is_exempt_from_special_pool() {
        let req = RequestBuilder::get("/wiki/Special:UserLogin")
            .header("user-agent", CHROME_UA)
            .build();
        assert_eq!(route_name(&req), (POOL_ANON_VIEW.to_string(), true));
    }

    #[test]
    fn authenticated_traffic_passes_through() {
        let req = RequestBuilder::get("/wiki/Special:RecentChanges")
            .header("user-agent", CHROME_UA)
            .header("cookie", "session=abc123")
            .build();
        assert_eq!(route_name(&req), (POOL_DEFAULT.to_string(), false));
    }

    #[test]
    fn non_get_head_passes_through() {
        let req = RequestBuilder::with_method("POST", "/w/index.php")
            .header("user-agent", CHROME_UA)
            .build();
        assert_eq!(route_name(&req), (POOL_DEFAULT.to_string(), false));
    }

    #[test]
    fn asset_and_api_pass_through() {
        for path in ["/images/logo.png", "/w/api.php?action=query", "/sitemap.xml"] {
            let req = RequestBuilder::get(path).header("user-agent", CHROME_UA).build();
            assert_eq!(route_name(&req), (POOL_DEFAULT.to_string(), false), "path {}", path);
        }
    }

    #[test]
    fn suspicious_flag_overrides_category_routing() {
        // No user agent at all: fails the modern-browser allow-list.
        let view = RequestBuilder::get("/wiki/Main_Page").build();
        assert_eq!(route_name(&view), (POOL_SUSPICIOUS.to_string(), true));

        let special = RequestBuilder::get("/wiki/Special:RecentChanges").build();
        assert_eq!(route_name(&special), (POOL_SUSPICIOUS.to_string(), true));
    }

    #[test]
    fn suspicious_does_not_override_pass_through() {
        let req = RequestBuilder::get("/images/logo.png").build();
        assert_eq!(route_name(&req), (POOL_DEFAULT.to_string(), false));
    }
}
