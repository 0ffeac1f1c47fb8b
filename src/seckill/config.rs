//! Runtime configuration for the seckill engine and its worker.

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default TTL for cached activity metadata, in milliseconds.
pub const DEFAULT_ACTIVITY_CACHE_TTL_MS: u64 = 1_000;

/// Default number of attempts the worker makes before dead-lettering.
pub const DEFAULT_WORKER_MAX_ATTEMPTS: u32 = 5;

/// Base delay for the worker's exponential backoff, in milliseconds.
pub const DEFAULT_WORKER_BASE_BACKOFF_MS: u64 = 10;

/// Ceiling for a single backoff delay, in milliseconds.
pub const DEFAULT_WORKER_MAX_BACKOFF_MS: u64 = 30_000;

/// Largest accepted `worker_max_attempts`.
pub const MAX_WORKER_ATTEMPTS: u32 = 100;

/// Default journal segment size in bytes (64 MB).
pub const DEFAULT_JOURNAL_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Configuration shared by the engine, the oracle and the worker.
///
/// Every field has a default, so a JSON document only needs the values it
/// overrides:
///
/// ```
/// use seckill_rs::SeckillConfig;
///
/// let config = SeckillConfig::from_json_str(r#"{ "worker_max_attempts": 8 }"#).unwrap();
/// assert_eq!(config.worker_max_attempts, 8);
/// assert_eq!(config.activity_cache_ttl_ms, 1_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeckillConfig {
    /// How long activity metadata is served from cache before refetching.
    pub activity_cache_ttl_ms: u64,
    /// Attempts per reservation before it is dead-lettered.
    pub worker_max_attempts: u32,
    /// Base backoff between attempts; doubles on each retry.
    pub worker_base_backoff_ms: u64,
    /// Upper bound on any single backoff delay.
    pub worker_max_backoff_ms: u64,
    /// Directory of the order queue journal. `None` keeps the queue in memory.
    pub journal_dir: Option<PathBuf>,
    /// Size of each journal segment file in bytes.
    pub journal_segment_size: usize,
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            activity_cache_ttl_ms: DEFAULT_ACTIVITY_CACHE_TTL_MS,
            worker_max_attempts: DEFAULT_WORKER_MAX_ATTEMPTS,
            worker_base_backoff_ms: DEFAULT_WORKER_BASE_BACKOFF_MS,
            worker_max_backoff_ms: DEFAULT_WORKER_MAX_BACKOFF_MS,
            journal_dir: None,
            journal_segment_size: DEFAULT_JOURNAL_SEGMENT_SIZE,
        }
    }
}

impl SeckillConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// same errors as [`from_json_str`](Self::from_json_str).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&contents)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if self.worker_max_attempts > MAX_WORKER_ATTEMPTS {
            return Err(ConfigError::Invalid {
                field: "worker_max_attempts",
                message: format!(
                    "{} exceeds {MAX_WORKER_ATTEMPTS}",
                    self.worker_max_attempts
                ),
            });
        }
        if self.worker_base_backoff_ms > 60_000 {
            return Err(ConfigError::Invalid {
                field: "worker_base_backoff_ms",
                message: format!("{} exceeds 60000", self.worker_base_backoff_ms),
            });
        }
        if self.worker_max_backoff_ms < self.worker_base_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "worker_max_backoff_ms",
                message: format!(
                    "{} is below the base backoff {}",
                    self.worker_max_backoff_ms, self.worker_base_backoff_ms
                ),
            });
        }
        if self.journal_segment_size < 4096 {
            return Err(ConfigError::Invalid {
                field: "journal_segment_size",
                message: format!("{} is below 4096 bytes", self.journal_segment_size),
            });
        }
        Ok(())
    }

    /// Set the activity cache TTL.
    #[must_use = "builders do nothing unless consumed"]
    #[inline]
    pub fn with_activity_cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.activity_cache_ttl_ms = ttl_ms;
        self
    }

    /// Set the number of worker attempts per reservation.
    #[must_use = "builders do nothing unless consumed"]
    #[inline]
    pub fn with_worker_max_attempts(mut self, attempts: u32) -> Self {
        self.worker_max_attempts = attempts;
        self
    }

    /// Set the worker's base backoff.
    #[must_use = "builders do nothing unless consumed"]
    #[inline]
    pub fn with_worker_base_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.worker_base_backoff_ms = backoff_ms;
        self
    }

    /// Set the ceiling on a single backoff delay.
    #[must_use = "builders do nothing unless consumed"]
    #[inline]
    pub fn with_worker_max_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.worker_max_backoff_ms = backoff_ms;
        self
    }

    /// Set the journal directory.
    #[must_use = "builders do nothing unless consumed"]
    #[inline]
    pub fn with_journal_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Set the journal segment size.
    #[must_use = "builders do nothing unless consumed"]
    #[inline]
    pub fn with_journal_segment_size(mut self, bytes: usize) -> Self {
        self.journal_segment_size = bytes;
        self
    }

    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `worker_max_backoff_ms`.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.worker_base_backoff_ms
            .saturating_mul(factor)
            .min(self.worker_max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SeckillConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_max_attempts, DEFAULT_WORKER_MAX_ATTEMPTS);
        assert!(config.journal_dir.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SeckillConfig::from_json_str(
            r#"{ "activity_cache_ttl_ms": 250, "journal_dir": "/var/lib/seckill" }"#,
        );
        assert!(config.is_ok());
        let config = config.unwrap_or_default();
        assert_eq!(config.activity_cache_ttl_ms, 250);
        assert_eq!(config.journal_dir, Some(PathBuf::from("/var/lib/seckill")));
        assert_eq!(config.worker_base_backoff_ms, DEFAULT_WORKER_BASE_BACKOFF_MS);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = SeckillConfig::from_json_str(r#"{ "worker_max_attempts": 0 }"#);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "worker_max_attempts",
                ..
            })
        ));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let result = SeckillConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
        let path = dir.path().join("seckill.json");
        std::fs::write(&path, r#"{ "worker_max_attempts": 2 }"#).unwrap_or_default();

        let config = SeckillConfig::from_file(&path);
        assert!(config.is_ok());
        assert_eq!(config.unwrap_or_default().worker_max_attempts, 2);

        let missing = SeckillConfig::from_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_backoff_doubles() {
        let config = SeckillConfig::default().with_worker_base_backoff_ms(10);
        assert_eq!(config.backoff_ms(0), 10);
        assert_eq!(config.backoff_ms(1), 20);
        assert_eq!(config.backoff_ms(3), 80);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = SeckillConfig::default().with_worker_base_backoff_ms(10);
        assert_eq!(config.backoff_ms(11), 20_480);
        assert_eq!(config.backoff_ms(12), DEFAULT_WORKER_MAX_BACKOFF_MS);
        assert_eq!(config.backoff_ms(38), DEFAULT_WORKER_MAX_BACKOFF_MS);
        assert_eq!(config.backoff_ms(80), DEFAULT_WORKER_MAX_BACKOFF_MS);

        let tight = config.with_worker_max_backoff_ms(50);
        assert_eq!(tight.backoff_ms(2), 40);
        assert_eq!(tight.backoff_ms(3), 50);
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let cap_below_base = SeckillConfig::default()
            .with_worker_base_backoff_ms(100)
            .with_worker_max_backoff_ms(10);
        assert!(matches!(
            cap_below_base.validate(),
            Err(ConfigError::Invalid {
                field: "worker_max_backoff_ms",
                ..
            })
        ));

        let result = SeckillConfig::from_json_str(r#"{ "worker_max_attempts": 101 }"#);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "worker_max_attempts",
                ..
            })
        ));
    }
}
