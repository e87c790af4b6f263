use std::{str::FromStr, time::Duration};

use anyhow::{bail, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("unknown store backend {other:?} (expected postgres|memory)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    pub max_connections: u32,
    /// Upper bound on a single persistence call made while resolving a request.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub activation_ttl: time::Duration,
    pub authentication_ttl: time::Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
    pub database: DatabaseConfig,
    pub tokens: TokenConfig,
    pub cors_trusted_origins: Vec<String>,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    pub fn from_source<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend: StoreBackend = parse_or(&get, "STORE_BACKEND", StoreBackend::Postgres)?;
        let url = get("DATABASE_URL").filter(|v| !v.is_empty());
        if backend == StoreBackend::Postgres && url.is_none() {
            bail!("DATABASE_URL must be set when STORE_BACKEND=postgres");
        }

        let database = DatabaseConfig {
            backend,
            url,
            max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 25)?,
            timeout: Duration::from_secs(parse_or(&get, "DB_TIMEOUT_SECS", 3)?),
        };
        let tokens = TokenConfig {
            activation_ttl: time::Duration::hours(parse_or(&get, "ACTIVATION_TOKEN_TTL_HOURS", 24)?),
            authentication_ttl: time::Duration::hours(parse_or(&get, "AUTH_TOKEN_TTL_HOURS", 24)?),
        };

        Ok(Self {
            env: get("APP_ENV").unwrap_or_else(|| "development".into()),
            host: get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "APP_PORT", 8080)?,
            database,
            tokens,
            cors_trusted_origins: get("CORS_TRUSTED_ORIGINS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE_SECS", 5)?),
        })
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {key}")),
    }
}
