//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `PARLEY_BIND_ADDR`: HTTP listen address. Default: `0.0.0.0:8080`
//! - `PARLEY_DB_PATH`: libSQL database file. Unset means in-memory
//! - `PARLEY_SESSION_TTL_SECS`: Session cache entry lifetime. Default: `3600`
//! - `PARLEY_RECENT_CAPACITY`: Recent-message log cap. Default: `1000`
//! - `PARLEY_CACHE_CAPACITY`: Session cache key cap. Default: `10000`
//! - `PARLEY_IDLE_TIMEOUT_SECS`: Close connections with no traffic in either
//!   direction for this long, `0` disables. Default: `300`
//! - `PARLEY_KEEPALIVE_SECS`: WebSocket ping interval, `0` disables. Default: `30`
//! - `PARLEY_WRITE_TIMEOUT_SECS`: Wait on a full recipient queue, `0` waits
//!   forever. Default: `5`
//! - `PARLEY_OUTBOUND_BUFFER`: Per-connection outbound queue. Default: `64`
//! - `PARLEY_LOG_JSON`: Emit JSON logs when `1` or `true`
//!
//! Command-line flags (see `main.rs`) override the matching variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_relay::RelayConfig;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
pub const DEFAULT_RECENT_CAPACITY: usize = 1000;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Database file; `None` runs against an in-memory database
    pub db_path: Option<PathBuf>,
    /// Lifetime of `user:{id}:session` cache entries
    pub session_ttl: Duration,
    /// Maximum entries kept in the recent-message log
    pub recent_capacity: usize,
    /// Maximum keys kept in the session cache
    pub cache_capacity: usize,
    /// Close connections with no traffic in either direction for this long
    pub idle_timeout: Option<Duration>,
    /// Interval between WebSocket pings
    pub keepalive: Option<Duration>,
    /// How long a sender waits on a recipient's full queue
    pub write_timeout: Option<Duration>,
    /// Frames queued per connection before senders wait
    pub outbound_buffer: usize,
    /// Emit JSON logs instead of the pretty console format
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            db_path: None,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            recent_capacity: DEFAULT_RECENT_CAPACITY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            keepalive: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
            write_timeout: Some(Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS)),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            log_json: false,
        }
    }
}

impl ServerConfig {
    /// Load server configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = parse_var(&lookup, "PARLEY_BIND_ADDR")?
            .unwrap_or_else(|| ServerConfig::default().bind_addr);

        let db_path = lookup("PARLEY_DB_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let session_ttl = parse_var(&lookup, "PARLEY_SESSION_TTL_SECS")?
            .unwrap_or(DEFAULT_SESSION_TTL_SECS);

        let idle_timeout = parse_var(&lookup, "PARLEY_IDLE_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let keepalive =
            parse_var(&lookup, "PARLEY_KEEPALIVE_SECS")?.unwrap_or(DEFAULT_KEEPALIVE_SECS);
        let write_timeout = parse_var(&lookup, "PARLEY_WRITE_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_WRITE_TIMEOUT_SECS);

        let log_json = lookup("PARLEY_LOG_JSON")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            bind_addr,
            db_path,
            session_ttl: Duration::from_secs(session_ttl),
            recent_capacity: parse_var(&lookup, "PARLEY_RECENT_CAPACITY")?
                .unwrap_or(DEFAULT_RECENT_CAPACITY),
            cache_capacity: parse_var(&lookup, "PARLEY_CACHE_CAPACITY")?
                .unwrap_or(DEFAULT_CACHE_CAPACITY),
            idle_timeout: seconds(idle_timeout),
            keepalive: seconds(keepalive),
            write_timeout: seconds(write_timeout),
            outbound_buffer: parse_var(&lookup, "PARLEY_OUTBOUND_BUFFER")?
                .unwrap_or(DEFAULT_OUTBOUND_BUFFER),
            log_json,
        })
    }

    /// Relay settings derived from this configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            outbound_buffer: self.outbound_buffer,
            idle_timeout: self.idle_timeout,
            keepalive: self.keepalive,
            write_timeout: self.write_timeout,
        }
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Listening address: {}", self.bind_addr);
        match &self.db_path {
            Some(path) => info!("Database: {}", path.display()),
            None => info!("Database: in-memory (data is lost on exit)"),
        }
        info!(
            session_ttl_secs = self.session_ttl.as_secs(),
            cache_capacity = self.cache_capacity,
            recent_capacity = self.recent_capacity,
            "Session cache configured"
        );
        info!(
            idle_timeout_secs = self.idle_timeout.map(|d| d.as_secs()),
            keepalive_secs = self.keepalive.map(|d| d.as_secs()),
            write_timeout_secs = self.write_timeout.map(|d| d.as_secs()),
            outbound_buffer = self.outbound_buffer,
            "Relay configured"
        );
    }
}

/// Zero disables.
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw,
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert!(config.db_path.is_none());
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.recent_capacity, 1000);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.keepalive, Some(Duration::from_secs(30)));
        assert_eq!(config.write_timeout, Some(Duration::from_secs(5)));
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PARLEY_BIND_ADDR", "127.0.0.1:9000"),
            ("PARLEY_DB_PATH", "/var/lib/parley/parley.db"),
            ("PARLEY_SESSION_TTL_SECS", "60"),
            ("PARLEY_RECENT_CAPACITY", "5"),
            ("PARLEY_OUTBOUND_BUFFER", "8"),
            ("PARLEY_LOG_JSON", "true"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(
            config.db_path.as_deref(),
            Some(std::path::Path::new("/var/lib/parley/parley.db"))
        );
        assert_eq!(config.session_ttl, Duration::from_secs(60));
        assert_eq!(config.recent_capacity, 5);
        assert_eq!(config.relay_config().outbound_buffer, 8);
        assert!(config.log_json);
    }

    #[test]
    fn test_zero_idle_timeout_disables_it() {
        let config =
            ServerConfig::from_lookup(lookup_from(&[("PARLEY_IDLE_TIMEOUT_SECS", "0")])).unwrap();
        assert!(config.idle_timeout.is_none());
        assert!(config.relay_config().idle_timeout.is_none());
    }

    #[test]
    fn test_liveness_settings_reach_relay() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PARLEY_KEEPALIVE_SECS", "10"),
            ("PARLEY_WRITE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap();

        let relay = config.relay_config();
        assert_eq!(relay.keepalive, Some(Duration::from_secs(10)));
        assert!(relay.write_timeout.is_none());
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let err = ServerConfig::from_lookup(lookup_from(&[("PARLEY_RECENT_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "PARLEY_RECENT_CAPACITY",
                ..
            }
        ));
    }
}
