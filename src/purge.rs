use std::collections::HashSet;
use std::net::IpAddr;

use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::PurgeConfig;
use crate::error::{GateError, Result};

/// Authorizes and executes explicit cache invalidation. The ACL is loaded
/// at startup and never mutated at runtime; an unauthorized purge is
/// rejected once, never queued or retried.
pub struct PurgeAuthority {
    allowed: HashSet<IpAddr>,
}

impl PurgeAuthority {
    pub fn new(config: &PurgeConfig) -> Self {
        Self {
            allowed: config.allowed_ips.iter().copied().collect(),
        }
    }

    pub fn authorize(&self, client_ip: IpAddr) -> bool {
        self.allowed.contains(&client_ip)
    }

    /// Authorize and ban every normalized variant of the URL. Returns how
    /// many cached entries were invalidated.
    pub async fn execute(
        &self,
        client_ip: IpAddr,
        path_and_query: &str,
        cache: &CacheStore,
    ) -> Result<usize> {
        if !self.authorize(client_ip) {
            warn!("Purge denied for {} from {}", path_and_query, client_ip);
            return Err(GateError::PurgeDenied {
                client_ip: client_ip.to_string(),
            });
        }

        let removed = cache.ban(path_and_query).await;
        info!(
            "Purged {} from {} ({} entries)",
            path_and_query, client_ip, removed
        );
        Ok(removed)
    }
}
