//! Server configuration, read from the environment at startup.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use fieldsync_ledger::LedgerConfig;

pub const BIND_ADDR_ENV: &str = "FIELDSYNC_BIND_ADDR";
pub const JWT_SECRET_ENV: &str = "JWT_SECRET";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const IDEMPOTENCY_TTL_ENV: &str = "FIELDSYNC_IDEMPOTENCY_TTL_SECS";
pub const LEDGER_SWEEP_ENV: &str = "FIELDSYNC_LEDGER_SWEEP_SECS";

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// Postgres ledger when set; in-memory ledger otherwise.
    pub database_url: Option<String>,
    pub ledger: LedgerConfig,
    /// How often expired ledger records are physically purged.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            database_url: None,
            ledger: LedgerConfig::default(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(BIND_ADDR_ENV) {
            config.bind_addr = raw.trim().parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid {
                    var: BIND_ADDR_ENV,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        match lookup(JWT_SECRET_ENV).filter(|s| !s.trim().is_empty()) {
            Some(secret) => config.jwt_secret = secret,
            None => warn!("{JWT_SECRET_ENV} not set; using insecure dev default"),
        }

        config.database_url = lookup(DATABASE_URL_ENV).filter(|s| !s.trim().is_empty());

        if let Some(secs) = parse_secs(&lookup, IDEMPOTENCY_TTL_ENV)? {
            config.ledger = config.ledger.with_ttl(secs);
        }
        if let Some(secs) = parse_secs(&lookup, LEDGER_SWEEP_ENV)? {
            config.sweep_interval = secs;
        }

        Ok(config)
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let secs: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Some(Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.jwt_secret, DEV_JWT_SECRET);
        assert!(config.database_url.is_none());
        assert_eq!(config.ledger.ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            (BIND_ADDR_ENV, "127.0.0.1:9000"),
            (JWT_SECRET_ENV, "s3cret"),
            (DATABASE_URL_ENV, "postgres://localhost/fieldsync"),
            (IDEMPOTENCY_TTL_ENV, "3600"),
            (LEDGER_SWEEP_ENV, "30"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.jwt_secret, "s3cret");
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/fieldsync"));
        assert_eq!(config.ledger.ttl, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = ServerConfig::from_lookup(lookup(&[(IDEMPOTENCY_TTL_ENV, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: IDEMPOTENCY_TTL_ENV, .. }));

        let err = ServerConfig::from_lookup(lookup(&[(LEDGER_SWEEP_ENV, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: LEDGER_SWEEP_ENV, .. }));

        assert!(ServerConfig::from_lookup(lookup(&[(BIND_ADDR_ENV, "nowhere")])).is_err());
    }
}
