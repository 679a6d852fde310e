//! Transaction engine settings.
//!
//! Settings can be built in code, loaded from a JSON or TOML file, or read
//! from environment variables. Durations are written in human-readable form
//! such as `"5s"` or `"250ms"`.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml};
use figment::{Figment, Metadata, Provider};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{TransactionError, TransactionResult};

/// What a read does when it finds a sweep sentinel that is not orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadSentinelBehavior {
    /// Treat the cell as absent.
    Ignore,
    /// Fail the read with a lock-expired error.
    #[default]
    ThrowException,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConstraintCheckingMode {
    /// Reject the commit.
    #[default]
    Throw,
    /// Log the violation and commit anyway.
    LogOnly,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How long to wait for commit locks, and for other committers' locks.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub lock_acquire_timeout: Duration,

    /// Lease of locks granted by the in-memory timelock service.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub lock_lease: Duration,

    /// Bound on the rounds of version resolution a single read may take.
    pub max_post_filter_iterations: usize,

    pub read_sentinel_behavior: ReadSentinelBehavior,

    pub constraint_checking_mode: ConstraintCheckingMode,

    /// Number of decided commit index entries kept in memory. `0` disables the cache.
    pub commit_timestamp_cache_capacity: usize,

    /// Number of garbage deletions that may wait for the cleaner.
    pub cleaner_queue_capacity: usize,

    /// Re-validate the immutable timestamp lock after reads of thoroughly
    /// swept tables.
    pub validate_locks_on_reads: bool,

    /// How often a retrying task is re-run after a retriable failure.
    pub max_retries: usize,

    /// Base delay between retries, doubled on every attempt and jittered.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_backoff: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_acquire_timeout: Duration::from_secs(5),
            lock_lease: Duration::from_secs(60),
            max_post_filter_iterations: 200,
            read_sentinel_behavior: ReadSentinelBehavior::default(),
            constraint_checking_mode: ConstraintCheckingMode::default(),
            commit_timestamp_cache_capacity: 10_000,
            cleaner_queue_capacity: 1024,
            validate_locks_on_reads: true,
            max_retries: 5,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

impl TransactionConfig {
    /// Loads settings from a `.json` or `.toml` file on top of the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> TransactionResult<Self> {
        let path = path.as_ref();
        let builder = Figment::from(TransactionConfig::default());
        let builder = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => builder.merge(Json::file(path)),
            Some("toml") => builder.merge(Toml::file(path)),
            _ => {
                return Err(TransactionError::InvalidArgument(format!(
                    "unknown configuration format: {}",
                    path.display()
                )));
            }
        };
        Self::extract(builder)
    }

    /// Loads settings from environment variables starting with `prefix`, for
    /// example `SNAPKV_LOCK_ACQUIRE_TIMEOUT=1s`.
    pub fn from_env(prefix: &str) -> TransactionResult<Self> {
        Self::extract(Figment::from(TransactionConfig::default()).merge(Env::prefixed(prefix)))
    }

    fn extract(figment: Figment) -> TransactionResult<Self> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TransactionResult<()> {
        if self.max_post_filter_iterations == 0 {
            return Err(TransactionError::InvalidArgument(
                "max_post_filter_iterations must be positive".into(),
            ));
        }
        if self.lock_lease.is_zero() {
            return Err(TransactionError::InvalidArgument(
                "lock_lease must be positive".into(),
            ));
        }
        if self.cleaner_queue_capacity == 0 {
            return Err(TransactionError::InvalidArgument(
                "cleaner_queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Provider for TransactionConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("snapkv transaction settings")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.max_post_filter_iterations, 200);
        assert_eq!(config.read_sentinel_behavior, ReadSentinelBehavior::ThrowException);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SNAPKV_LOCK_ACQUIRE_TIMEOUT", "250ms");
            jail.set_env("SNAPKV_MAX_RETRIES", "2");
            jail.set_env("SNAPKV_READ_SENTINEL_BEHAVIOR", "Ignore");

            let config = TransactionConfig::from_env("SNAPKV_").expect("failed to load from env");
            assert_eq!(config.lock_acquire_timeout, Duration::from_millis(250));
            assert_eq!(config.max_retries, 2);
            assert_eq!(config.read_sentinel_behavior, ReadSentinelBehavior::Ignore);
            assert_eq!(config.retry_backoff, Duration::from_millis(10));
            Ok(())
        });
    }

    #[test]
    fn test_load_from_toml_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "snapkv.toml",
                r#"
retry_backoff = "1s"
constraint_checking_mode = "LogOnly"
commit_timestamp_cache_capacity = 0
"#,
            )?;
            let config = TransactionConfig::from_file("snapkv.toml").expect("failed to load toml");
            assert_eq!(config.retry_backoff, Duration::from_secs(1));
            assert_eq!(config.constraint_checking_mode, ConstraintCheckingMode::LogOnly);
            assert_eq!(config.commit_timestamp_cache_capacity, 0);
            Ok(())
        });
    }

    #[test]
    fn test_load_from_json_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("snapkv.json", r#"{ "max_post_filter_iterations": 7 }"#)?;
            let config = TransactionConfig::from_file("snapkv.json").expect("failed to load json");
            assert_eq!(config.max_post_filter_iterations, 7);
            Ok(())
        });
    }

    #[test]
    fn test_rejects_invalid_settings() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("bad.toml", "max_post_filter_iterations = 0")?;
            let err = TransactionConfig::from_file("bad.toml").unwrap_err();
            assert!(matches!(err, TransactionError::InvalidArgument(_)));

            jail.create_file("bad.yaml", "")?;
            assert!(TransactionConfig::from_file("bad.yaml").is_err());
            Ok(())
        });
    }

    #[test]
    fn test_serialized_durations_are_human_readable() {
        let json = serde_json::to_value(TransactionConfig::default()).unwrap();
        assert_eq!(json["lock_acquire_timeout"], "5s");
        assert_eq!(json["lock_lease"], "1m");
        assert_eq!(json["retry_backoff"], "10ms");
    }
}
