//! Process configuration read from the environment (`.env` supported).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use storyforge_jobs::CachePolicy;

/// Which job store backs the services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Prefix for the `pollingUrl` returned on job creation.
    pub public_base_url: String,
    pub store: StoreBackend,
    /// How long a claim, progress report or heartbeat keeps a worker's lease alive.
    pub lease_ttl: Duration,
    pub reap_interval: Duration,
    pub cache: CachePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_base_url: String::new(),
            store: StoreBackend::InMemory,
            lease_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            cache: CachePolicy::default(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment, after reading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside development.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store = match get("STORE_BACKEND").as_deref().unwrap_or("memory") {
            "memory" => StoreBackend::InMemory,
            "postgres" => StoreBackend::Postgres {
                database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: parse_or("DB_MAX_CONNECTIONS", get("DB_MAX_CONNECTIONS"), 10)?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    reason: format!("expected 'memory' or 'postgres', got '{other}'"),
                })
            }
        };

        let lease_ttl = secs("JOB_LEASE_TTL_SECS", get("JOB_LEASE_TTL_SECS"), defaults.lease_ttl)?;
        let reap_interval = secs(
            "JOB_REAP_INTERVAL_SECS",
            get("JOB_REAP_INTERVAL_SECS"),
            defaults.reap_interval,
        )?;
        let terminal_max_age = Duration::from_secs(parse_or(
            "STATUS_CACHE_MAX_AGE_SECS",
            get("STATUS_CACHE_MAX_AGE_SECS"),
            defaults.cache.terminal_max_age.as_secs(),
        )?);

        Ok(Self {
            bind_addr: parse_or("BIND_ADDR", get("BIND_ADDR"), defaults.bind_addr)?,
            public_base_url: get("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_base_url),
            store,
            lease_ttl,
            reap_interval,
            cache: CachePolicy { terminal_max_age },
        })
    }

    pub fn polling_url(&self, job_id: impl std::fmt::Display) -> String {
        format!("{}/jobs/{}", self.public_base_url, job_id)
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{raw}': {e}"),
        }),
    }
}

fn secs(key: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_or(key, raw, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
