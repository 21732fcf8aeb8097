use bar_structure::InsidePolicy;
use market_data::{MarketDataConfig, RetryPolicy};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: &'static str },
}

/// Scan and data-access settings, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub polygon_api_key: Option<String>,
    /// Requests per minute; the Polygon client picks its own default when unset
    pub polygon_rate_limit: Option<usize>,
    /// Worker count; derived from the universe size when unset
    pub concurrency: Option<usize>,
    /// Bars handed to the classifier per series
    pub tail_bars: usize,
    /// Window positions the combo matcher searches back from the newest bar
    pub combo_span: usize,
    pub inside_policy: InsidePolicy,
    pub continuity: bool,
    pub resample_from_daily: bool,

    pub fetch_max_attempts: u32,
    pub fetch_retry_delay: Duration,
    pub fetch_timeout: Duration,
    pub cache_ttl_short: Duration,
    pub cache_ttl_long: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            polygon_api_key: None,
            polygon_rate_limit: None,
            concurrency: None,
            tail_bars: 60,
            combo_span: 3,
            inside_policy: InsidePolicy::Strict,
            continuity: false,
            resample_from_daily: false,
            fetch_max_attempts: 3,
            fetch_retry_delay: Duration::from_millis(1000),
            fetch_timeout: Duration::from_secs(20),
            cache_ttl_short: Duration::from_secs(3600),
            cache_ttl_long: Duration::from_secs(14400),
        }
    }
}

fn parse<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

impl ScanConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let config = Self {
            polygon_api_key: lookup("POLYGON_API_KEY").filter(|k| !k.trim().is_empty()),
            polygon_rate_limit: parse("POLYGON_RATE_LIMIT", lookup("POLYGON_RATE_LIMIT"))?,
            concurrency: parse("SCAN_CONCURRENCY", lookup("SCAN_CONCURRENCY"))?,
            tail_bars: parse("SCAN_TAIL_BARS", lookup("SCAN_TAIL_BARS"))?.unwrap_or(d.tail_bars),
            combo_span: parse("SCAN_COMBO_SPAN", lookup("SCAN_COMBO_SPAN"))?.unwrap_or(d.combo_span),
            inside_policy: parse("SCAN_INSIDE_POLICY", lookup("SCAN_INSIDE_POLICY"))?
                .unwrap_or(d.inside_policy),
            continuity: parse("SCAN_CONTINUITY", lookup("SCAN_CONTINUITY"))?.unwrap_or(d.continuity),
            resample_from_daily: parse("SCAN_RESAMPLE_FROM_DAILY", lookup("SCAN_RESAMPLE_FROM_DAILY"))?
                .unwrap_or(d.resample_from_daily),
            fetch_max_attempts: parse("FETCH_MAX_ATTEMPTS", lookup("FETCH_MAX_ATTEMPTS"))?
                .unwrap_or(d.fetch_max_attempts),
            fetch_retry_delay: parse("FETCH_RETRY_DELAY_MS", lookup("FETCH_RETRY_DELAY_MS"))?
                .map(Duration::from_millis)
                .unwrap_or(d.fetch_retry_delay),
            fetch_timeout: parse("FETCH_TIMEOUT_SECS", lookup("FETCH_TIMEOUT_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(d.fetch_timeout),
            cache_ttl_short: parse("CACHE_TTL_SHORT_SECS", lookup("CACHE_TTL_SHORT_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(d.cache_ttl_short),
            cache_ttl_long: parse("CACHE_TTL_LONG_SECS", lookup("CACHE_TTL_LONG_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(d.cache_ttl_long),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == Some(0) {
            return Err(ConfigError::OutOfRange {
                key: "SCAN_CONCURRENCY",
                reason: "must be at least 1",
            });
        }
        if self.polygon_rate_limit == Some(0) {
            return Err(ConfigError::OutOfRange {
                key: "POLYGON_RATE_LIMIT",
                reason: "must be at least 1",
            });
        }
        if self.fetch_max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                key: "FETCH_MAX_ATTEMPTS",
                reason: "must be at least 1",
            });
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: "FETCH_TIMEOUT_SECS",
                reason: "must be positive",
            });
        }
        if self.tail_bars < 2 {
            return Err(ConfigError::OutOfRange {
                key: "SCAN_TAIL_BARS",
                reason: "must be at least 2",
            });
        }
        if self.combo_span == 0 {
            return Err(ConfigError::OutOfRange {
                key: "SCAN_COMBO_SPAN",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    pub fn market_data(&self) -> MarketDataConfig {
        let ttl = |d: Duration| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX);
        MarketDataConfig {
            retry: RetryPolicy {
                max_attempts: self.fetch_max_attempts,
                delay: self.fetch_retry_delay,
                attempt_timeout: self.fetch_timeout,
            },
            short_ttl: ttl(self.cache_ttl_short),
            long_ttl: ttl(self.cache_ttl_long),
            resample_from_daily: self.resample_from_daily,
        }
    }
}
