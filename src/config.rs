use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pools: Vec<PoolConfig>,
    pub cache: CacheConfig,
    pub purge: PurgeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// One backend pool: a named concurrency class sharing one origin target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub first_byte_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub between_bytes_timeout: Duration,
    /// Hard ceiling on simultaneous in-flight requests. Zero disables the
    /// ceiling entirely (pass-through pools).
    pub max_connections: usize,
    /// How many requests may queue once the ceiling is reached.
    pub wait_limit: usize,
    /// How long a queued request may wait before rejection.
    #[serde(with = "duration_serde")]
    pub wait_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub default_ttl: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PurgeConfig {
    /// Source addresses allowed to issue PURGE requests.
    pub allowed_ips: Vec<IpAddr>,
}

/// Pool names the router requires to exist in the configuration.
pub const POOL_DEFAULT: &str = "default";
pub const POOL_ANON_VIEW: &str = "anon_view";
pub const POOL_ANON_SPECIAL: &str = "anon_special";
pub const POOL_SUSPICIOUS: &str = "suspicious";

const REQUIRED_POOLS: &[&str] = &[
    POOL_DEFAULT,
    POOL_ANON_VIEW,
    POOL_ANON_SPECIAL,
    POOL_SUSPICIOUS,
];

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Errors here are fatal: the process must not
    /// serve traffic with a malformed pool set or an empty purge ACL.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        for pool in &self.pools {
            if pool.name.is_empty() {
                anyhow::bail!("Pool name cannot be empty");
            }
            if pool.host.is_empty() {
                anyhow::bail!("Pool '{}' host cannot be empty", pool.name);
            }
            if pool.port == 0 {
                anyhow::bail!("Pool '{}' port cannot be zero", pool.name);
            }
            if pool.max_connections > 0 && pool.wait_timeout.is_zero() {
                anyhow::bail!(
                    "Pool '{}' wait_timeout cannot be zero when max_connections is set",
                    pool.name
                );
            }
        }

        for required in REQUIRED_POOLS {
            if !self.pools.iter().any(|p| p.name == *required) {
                anyhow::bail!("Missing required pool definition: '{}'", required);
            }
        }

        let mut names: Vec<&str> = self.pools.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.pools.len() {
            anyhow::bail!("Duplicate pool names in configuration");
        }

        if self.purge.allowed_ips.is_empty() {
            anyhow::bail!("Purge ACL cannot be empty");
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(num.parse::<u64>()? * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(num.parse::<u64>()? * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            connect_timeout: Duration::from_secs(5),
            first_byte_timeout: Duration::from_secs(30),
            between_bytes_timeout: Duration::from_secs(10),
            max_connections: 10,
            wait_limit: 20,
            wait_timeout: Duration::from_secs(5),
        }
    }

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            pools: vec![
                pool(POOL_DEFAULT),
                pool(POOL_ANON_VIEW),
                pool(POOL_ANON_SPECIAL),
                pool(POOL_SUSPICIOUS),
            ],
            cache: CacheConfig {
                enabled: true,
                default_ttl: Duration::from_secs(300),
            },
            purge: PurgeConfig {
                allowed_ips: vec!["127.0.0.1".parse().unwrap()],
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_purge_acl_is_fatal() {
        let mut config = valid_config();
        config.purge.allowed_ips.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_required_pool_is_fatal() {
        let mut config = valid_config();
        config.pools.retain(|p| p.name != POOL_SUSPICIOUS);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_wait_timeout_on_limited_pool_is_fatal() {
        let mut config = valid_config();
        config.pools[0].wait_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_strings_parse() {
        let yaml = r#"
name: default
host: origin.internal
port: 8080
connect_timeout: 3s
first_byte_timeout: 2m
between_bytes_timeout: 500ms
max_connections: 50
wait_limit: 100
wait_timeout: 10s
"#;
        let parsed: PoolConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.connect_timeout, Duration::from_secs(3));
        assert_eq!(parsed.first_byte_timeout, Duration::from_secs(120));
        assert_eq!(parsed.between_bytes_timeout, Duration::from_millis(500));
    }
}
