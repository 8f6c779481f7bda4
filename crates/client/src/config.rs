//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

pub const API_URL_ENV: &str = "FIELDSYNC_API_URL";
pub const DATA_DIR_ENV: &str = "FIELDSYNC_DATA_DIR";
pub const BATCH_SIZE_ENV: &str = "FIELDSYNC_BATCH_SIZE";
pub const MAX_RETRIES_ENV: &str = "FIELDSYNC_MAX_RETRIES";
pub const BACKOFF_BASE_ENV: &str = "FIELDSYNC_BACKOFF_BASE_MS";
pub const BACKOFF_MAX_ENV: &str = "FIELDSYNC_BACKOFF_MAX_MS";
pub const BACKOFF_JITTER_ENV: &str = "FIELDSYNC_BACKOFF_JITTER";

const DEFAULT_API_URL: &str = "http://localhost:8080";
const QUEUE_FILE: &str = "queue.db";
const BLOB_DIR: &str = "blobs";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("could not resolve a data directory; set {DATA_DIR_ENV}")]
    NoDataDir,
}

/// What to do with 4xx responses other than 401/408/409/429.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// Drop the item immediately; the server will never accept it.
    #[default]
    FailFast,
    /// Treat like a transient error until `max_retries` is used up.
    ExhaustRetries,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Items submitted concurrently per batch.
    pub batch_size: usize,
    /// Retries allowed before an item is dropped as permanently failed.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub rejection_policy: RejectionPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 5,
            backoff: BackoffPolicy::default(),
            rejection_policy: RejectionPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }

    /// Whether an item that has already failed `retries` times may try again.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_url: String,
    /// Holds the queue database and the blob directory.
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub sync: SyncConfig,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_url: api_url.into(),
            data_dir: data_dir.into(),
            request_timeout: Duration::from_secs(30),
            sync: SyncConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup(API_URL_ENV)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let data_dir = match lookup(DATA_DIR_ENV).filter(|s| !s.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };

        let mut config = Self::new(api_url, data_dir);

        if let Some(size) = parse_num::<usize>(&lookup, BATCH_SIZE_ENV)? {
            if size == 0 {
                return Err(ConfigError::Invalid {
                    var: BATCH_SIZE_ENV,
                    value: size.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.sync = config.sync.with_batch_size(size);
        }
        if let Some(retries) = parse_num::<u32>(&lookup, MAX_RETRIES_ENV)? {
            config.sync = config.sync.with_max_retries(retries);
        }

        let mut backoff = config.sync.backoff.clone();
        if let Some(ms) = parse_num::<u64>(&lookup, BACKOFF_BASE_ENV)? {
            backoff = backoff.with_base_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_num::<u64>(&lookup, BACKOFF_MAX_ENV)? {
            backoff = backoff.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(jitter) = parse_num::<f64>(&lookup, BACKOFF_JITTER_ENV)? {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::Invalid {
                    var: BACKOFF_JITTER_ENV,
                    value: jitter.to_string(),
                    reason: "must be between 0.0 and 1.0".to_string(),
                });
            }
            backoff = backoff.with_jitter_factor(jitter);
        }
        config.sync = config.sync.with_backoff(backoff);

        Ok(config)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join(BLOB_DIR)
    }
}

/// `{os data dir}/fieldsync`, falling back to `~/.local/share/fieldsync`.
fn default_data_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .ok_or(ConfigError::NoDataDir)?;
    Ok(base.join("fieldsync"))
}

fn parse_num<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
