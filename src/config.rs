//! Configuration types.
//!
//! Everything is read from environment variables. Each `from_env()` delegates
//! to a `from_lookup()` taking a key → value function so tests can supply a map
//! instead of mutating the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Which loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Producer, consumers, and recovery sweep in one process.
    All,
    /// Ingestion only.
    Producer,
    /// Consumers and recovery sweep only, sharing the store with other workers.
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Producer => "producer",
            Self::Worker => "worker",
        }
    }

    pub fn runs_producer(&self) -> bool {
        matches!(self, Self::All | Self::Producer)
    }

    pub fn runs_consumers(&self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "producer" => Ok(Self::Producer),
            "worker" => Ok(Self::Worker),
            other => Err(format!("expected all|producer|worker, got '{other}'")),
        }
    }
}

/// When an item is given another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Claims allowed per item before a stale or failed item stays failed.
    pub max_attempts: u32,
    /// Re-admit failed items after this long. `None` keeps `failed` terminal
    /// until an explicit retry.
    pub failed_retry_after: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            failed_retry_after: None,
        }
    }
}

/// Scheduling and recovery settings for the pipeline loops.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub role: Role,
    /// Producer cadence after a successful cycle.
    pub fetch_interval: Duration,
    /// Producer cadence after a failed cycle.
    pub fetch_error_interval: Duration,
    /// Consumer sleep when nothing is claimable.
    pub idle_interval: Duration,
    /// Upper bound on each enrichment call.
    pub enrich_timeout: Duration,
    /// Number of consumer loops in this process.
    pub consumer_workers: usize,
    pub sweep_interval: Duration,
    /// A `processing` row claimed longer ago than this is considered orphaned.
    pub stale_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            role: Role::All,
            fetch_interval: Duration::from_secs(60),
            fetch_error_interval: Duration::from_secs(30),
            idle_interval: Duration::from_secs(1),
            enrich_timeout: Duration::from_secs(60),
            consumer_workers: 1,
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let consumer_workers: usize = parse_or(
            &lookup,
            "MAILROOM_CONSUMER_WORKERS",
            defaults.consumer_workers,
        )?;
        if consumer_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAILROOM_CONSUMER_WORKERS".into(),
                message: "must be at least 1".into(),
            });
        }

        let max_attempts: u32 = parse_or(
            &lookup,
            "MAILROOM_MAX_ATTEMPTS",
            defaults.retry.max_attempts,
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAILROOM_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        let failed_retry_after = parse_opt::<u64>(&lookup, "MAILROOM_FAILED_RETRY_AFTER_SECS")?
            .map(Duration::from_secs);

        Ok(Self {
            role: parse_or(&lookup, "MAILROOM_ROLE", defaults.role)?,
            fetch_interval: secs_or(&lookup, "MAILROOM_FETCH_INTERVAL_SECS", defaults.fetch_interval)?,
            fetch_error_interval: secs_or(
                &lookup,
                "MAILROOM_FETCH_ERROR_INTERVAL_SECS",
                defaults.fetch_error_interval,
            )?,
            idle_interval: Duration::from_millis(parse_or(
                &lookup,
                "MAILROOM_IDLE_INTERVAL_MS",
                defaults.idle_interval.as_millis() as u64,
            )?),
            enrich_timeout: secs_or(&lookup, "MAILROOM_ENRICH_TIMEOUT_SECS", defaults.enrich_timeout)?,
            consumer_workers,
            sweep_interval: secs_or(&lookup, "MAILROOM_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            stale_after: secs_or(&lookup, "MAILROOM_STALE_AFTER_SECS", defaults.stale_after)?,
            retry: RetryPolicy {
                max_attempts,
                failed_retry_after,
            },
        })
    }
}

/// Where the item store lives.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Local libSQL/SQLite file. Several processes may share it.
    Local(PathBuf),
    /// Remote libSQL server, for workers on different hosts.
    Remote { url: String, token: SecretString },
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("MAILROOM_DB_URL").filter(|u| !u.is_empty()) {
            let token = lookup("MAILROOM_DB_TOKEN").unwrap_or_default();
            return Self::Remote {
                url,
                token: SecretString::from(token),
            };
        }
        let path = lookup("MAILROOM_DB_PATH").unwrap_or_else(|| "./data/mailroom.db".to_string());
        Self::Local(PathBuf::from(path))
    }
}

/// Port for the read/trigger HTTP surface.
pub fn api_port_from_env() -> Result<u16, ConfigError> {
    parse_or(&|key: &str| std::env::var(key).ok(), "API_PORT", 8080)
}

// ── Helpers ─────────────────────────────────────────────────────────

pub(crate) fn parse_opt<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

pub(crate) fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_or(lookup, key, default.as_secs())?))
}
