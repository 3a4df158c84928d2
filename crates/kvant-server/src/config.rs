use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use kvant_gateway::SessionConfig;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Single allowed origin; permissive CORS when unset.
    pub cors_origin: Option<String>,
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source. Unset keys take their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = get("KVANT_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("KVANT_JWT_SECRET is unset or still a placeholder; it must match the token issuer's secret");
        }

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            outbound_capacity: parse_or(&get, "KVANT_OUTBOUND_QUEUE", defaults.outbound_capacity)?,
            max_frame_bytes: parse_or(&get, "KVANT_MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
            ping_interval: Duration::from_secs(parse_or(
                &get,
                "KVANT_PING_INTERVAL_SECS",
                defaults.ping_interval.as_secs(),
            )?),
            pong_timeout: Duration::from_secs(parse_or(
                &get,
                "KVANT_PONG_TIMEOUT_SECS",
                defaults.pong_timeout.as_secs(),
            )?),
            write_timeout: defaults.write_timeout,
        };
        if session.outbound_capacity == 0 || session.ping_interval.is_zero() {
            bail!("KVANT_OUTBOUND_QUEUE and KVANT_PING_INTERVAL_SECS must be positive");
        }

        Ok(Self {
            jwt_secret,
            db_path: get("KVANT_DB_PATH").unwrap_or_else(|| "kvant.db".into()).into(),
            host: get("KVANT_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "KVANT_PORT", 8080)?,
            cors_origin: get("KVANT_CORS_ORIGIN").filter(|origin| !origin.trim().is_empty()),
            session,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}
