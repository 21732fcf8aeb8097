use async_trait::async_trait;
use bar_structure::sanitize_series;
use chrono::{Duration, NaiveDate};
use multi_timeframe::{aggregate, bucket_start, period_in_progress};
use polygon_client::{AggregatesQuery, ProviderError};
use scan_core::{DataError, Series, SeriesSource, Timeframe};
use std::sync::Arc;
use tracing::{debug, warn};

pub mod cache;
pub mod normalize;
pub mod retry;
pub mod transport;

pub use cache::{Clock, ManualClock, SystemClock, TtlCache};
pub use normalize::{normalize_rows, Normalized};
pub use retry::RetryPolicy;
pub use transport::AggregatesTransport;

#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub retry: RetryPolicy,
    /// TTL for Daily and Weekly series
    pub short_ttl: Duration,
    /// TTL for Monthly and coarser series
    pub long_ttl: Duration,
    /// Build Weekly and Monthly from daily bars instead of the provider's
    /// native intervals
    pub resample_from_daily: bool,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            short_ttl: Duration::hours(1),
            long_ttl: Duration::hours(4),
            resample_from_daily: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: String,
    timeframe: Timeframe,
    period_days: i64,
}

/// Where a timeframe's bars come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourcePlan {
    timespan: &'static str,
    period_days: i64,
    /// Set when daily bars are fetched and folded into this timeframe
    aggregate_to: Option<Timeframe>,
}

impl SourcePlan {
    fn for_timeframe(timeframe: Timeframe, resample_from_daily: bool) -> Self {
        let period_days = timeframe.lookback_days();
        let native = |timespan| Self {
            timespan,
            period_days,
            aggregate_to: None,
        };
        let from_daily = Self {
            timespan: "day",
            period_days,
            aggregate_to: Some(timeframe),
        };

        match timeframe {
            Timeframe::Daily => native("day"),
            Timeframe::Weekly if !resample_from_daily => native("week"),
            Timeframe::Monthly if !resample_from_daily => native("month"),
            _ => from_daily,
        }
    }
}

/// A native weekly or monthly bar is still forming while today sits inside
/// its calendar period and that period's last session has not passed.
fn native_tail_provisional(series: &Series, today: NaiveDate) -> bool {
    let timeframe = series.timeframe;
    if timeframe == Timeframe::Daily {
        return false;
    }
    let Some(last) = series.last() else {
        return false;
    };

    // Polygon stamps weekly bars on the Sunday before the trading week.
    let covers_today = match timeframe {
        Timeframe::Weekly => (today - last.date()).num_days() < 7,
        _ => bucket_start(last.date(), timeframe) == bucket_start(today, timeframe),
    };
    covers_today && period_in_progress(bucket_start(today, timeframe), timeframe, today)
}

fn to_data_error(symbol: &str, err: ProviderError) -> DataError {
    if err.is_transient() {
        DataError::Transient {
            symbol: symbol.to_string(),
            message: err.to_string(),
        }
    } else {
        DataError::Permanent {
            symbol: symbol.to_string(),
            message: err.to_string(),
        }
    }
}

/// Data access layer: retrying, normalizing, caching bar source.
pub struct MarketData {
    transport: Arc<dyn AggregatesTransport>,
    cache: TtlCache<CacheKey, Series>,
    clock: Arc<dyn Clock>,
    config: MarketDataConfig,
}

impl MarketData {
    pub fn new(transport: Arc<dyn AggregatesTransport>, config: MarketDataConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn AggregatesTransport>,
        config: MarketDataConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            cache: TtlCache::new(Arc::clone(&clock)),
            clock,
            config,
        }
    }

    pub fn cached_series(&self) -> usize {
        self.cache.len()
    }

    fn ttl_for(&self, timeframe: Timeframe) -> Duration {
        if timeframe.is_long() {
            self.config.long_ttl
        } else {
            self.config.short_ttl
        }
    }

    async fn load(&self, symbol: &str, timeframe: Timeframe, plan: SourcePlan) -> Result<Series, DataError> {
        let today = self.clock.now().date_naive();
        let query = AggregatesQuery {
            symbol: symbol.to_string(),
            multiplier: 1,
            timespan: plan.timespan,
            from: today - Duration::days(plan.period_days),
            to: today,
        };

        let transport = &self.transport;
        let query = &query;
        let rows = self
            .config
            .retry
            .run(symbol, move |attempt| async move {
                debug!("{} {}: fetch attempt {}", query.symbol, query.timespan, attempt);
                transport.fetch_rows(query).await.and_then(|rows| {
                    if rows.is_empty() {
                        Err(ProviderError::Empty)
                    } else {
                        Ok(rows)
                    }
                })
            })
            .await
            .map_err(|e| to_data_error(symbol, e))?;

        let normalized = normalize_rows(&rows);
        if normalized.dropped > 0 {
            warn!(
                "{} {}: dropped {} of {} malformed rows",
                symbol,
                timeframe,
                normalized.dropped,
                rows.len()
            );
        }

        let series = match plan.aggregate_to {
            Some(target) => {
                let daily = Series::new(symbol, Timeframe::Daily, normalized.bars);
                aggregate(&sanitize_series(&daily), target, today)
            }
            None => {
                let series = Series::new(symbol, timeframe, normalized.bars);
                let provisional = native_tail_provisional(&series, today);
                series.with_provisional_tail(provisional)
            }
        };
        Ok(series)
    }
}

#[async_trait]
impl SeriesSource for MarketData {
    async fn fetch(&self, symbol: &str, timeframe: Timeframe) -> Result<Series, DataError> {
        let symbol = symbol.trim().to_uppercase();
        let plan = SourcePlan::for_timeframe(timeframe, self.config.resample_from_daily);
        let key = CacheKey {
            symbol: symbol.clone(),
            timeframe,
            period_days: plan.period_days,
        };

        if let Some(series) = self.cache.get(&key) {
            debug!("{} {}: cache hit", symbol, timeframe);
            return Ok(series);
        }

        let series = self.load(&symbol, timeframe, plan).await?;
        // An all-malformed response is not cached so the next scan retries it.
        if !series.is_empty() {
            self.cache.insert(key, series.clone(), self.ttl_for(timeframe));
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use polygon_client::RawRow;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Replays scripted responses, then keeps returning the last one.
    struct ScriptedTransport {
        responses: Vec<Result<Vec<RawRow>, ProviderError>>,
        calls: AtomicUsize,
        queries: Mutex<Vec<AggregatesQuery>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Vec<RawRow>, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                responses,
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AggregatesTransport for ScriptedTransport {
        async fn fetch_rows(&self, query: &AggregatesQuery) -> Result<Vec<RawRow>, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.clone());
            let idx = n.min(self.responses.len() - 1);
            self.responses[idx].clone()
        }
    }

    fn rows(values: Value) -> Vec<RawRow> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    /// Mon 2024-03-04 .. Fri 2024-03-08 at 05:00 UTC
    fn week_of_rows() -> Vec<RawRow> {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 5, 0, 0).unwrap().timestamp_millis();
        let day = 86_400_000i64;
        rows(json!([
            {"t": base,           "o": 10.0, "h": 12.0, "l": 9.0,  "c": 11.0, "v": 100},
            {"t": base + day,     "o": 11.0, "h": 13.0, "l": 10.0, "c": 9.0,  "v": 100},
            {"t": base + 2 * day, "o": 9.0,  "h": 11.0, "l": 8.0,  "c": 12.0, "v": 100},
            {"t": base + 3 * day, "o": 12.0, "h": 14.0, "l": 11.0, "c": 13.0, "v": 100},
            {"t": base + 4 * day, "o": 13.0, "h": 15.0, "l": 12.0, "c": 14.0, "v": 100}
        ]))
    }

    fn market_data(
        transport: Arc<ScriptedTransport>,
        config: MarketDataConfig,
    ) -> (Arc<ManualClock>, MarketData) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 11, 12, 0, 0).unwrap()));
        let md = MarketData::with_clock(transport, config, clock.clone() as Arc<dyn Clock>);
        (clock, md)
    }

    fn fast_config() -> MarketDataConfig {
        MarketDataConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                delay: std::time::Duration::ZERO,
                attempt_timeout: std::time::Duration::from_secs(1),
            },
            ..MarketDataConfig::default()
        }
    }

    #[tokio::test]
    async fn test_daily_fetch_normalizes_and_caches() {
        let transport = ScriptedTransport::new(vec![Ok(week_of_rows())]);
        let (_, md) = market_data(transport.clone(), fast_config());

        let series = assert_ok!(md.fetch("aapl", Timeframe::Daily).await);
        assert_eq!(series.symbol, "AAPL");
        assert_eq!(series.len(), 5);

        let again = assert_ok!(md.fetch("AAPL", Timeframe::Daily).await);
        assert_eq!(again.len(), 5);
        assert_eq!(transport.calls(), 1);

        let query = transport.queries.lock().unwrap()[0].clone();
        assert_eq!(query.timespan, "day");
        assert_eq!(query.to, NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
        assert_eq!((query.to - query.from).num_days(), 180);
    }

    #[tokio::test]
    async fn test_cache_expires_with_clock() {
        let transport = ScriptedTransport::new(vec![Ok(week_of_rows())]);
        let (clock, md) = market_data(transport.clone(), fast_config());

        assert_ok!(md.fetch("AAPL", Timeframe::Daily).await);
        clock.advance(Duration::minutes(61));
        assert_ok!(md.fetch("AAPL", Timeframe::Daily).await);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_recover_within_budget() {
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::Timeout),
            Ok(Vec::new()),
            Ok(week_of_rows()),
        ]);
        let (_, md) = market_data(transport.clone(), fast_config());

        let series = assert_ok!(md.fetch("AAPL", Timeframe::Daily).await);
        assert_eq!(series.len(), 5);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_transient_data_errors() {
        let transport = ScriptedTransport::new(vec![Err(ProviderError::Network("reset".into()))]);
        let (_, md) = market_data(transport.clone(), fast_config());

        let err = assert_err!(md.fetch("AAPL", Timeframe::Daily).await);
        assert!(err.is_transient());
        assert_eq!(err.symbol(), "AAPL");
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_permanent_and_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(ProviderError::NotFound("ZZZZ".into()))]);
        let (_, md) = market_data(transport.clone(), fast_config());

        let err = assert_err!(md.fetch("ZZZZ", Timeframe::Weekly).await);
        assert!(!err.is_transient());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_quarterly_is_aggregated_from_daily() {
        let transport = ScriptedTransport::new(vec![Ok(week_of_rows())]);
        let (_, md) = market_data(transport.clone(), fast_config());

        let quarterly = assert_ok!(md.fetch("AAPL", Timeframe::Quarterly).await);
        assert_eq!(quarterly.timeframe, Timeframe::Quarterly);
        assert_eq!(quarterly.len(), 1);
        let bar = quarterly.bars()[0];
        assert_eq!((bar.open, bar.high, bar.low, bar.close, bar.volume), (10.0, 15.0, 8.0, 14.0, 500.0));
        assert!(quarterly.is_provisional_tail());

        let query = transport.queries.lock().unwrap()[0].clone();
        assert_eq!(query.timespan, "day");
        assert_eq!((query.to - query.from).num_days(), 3650);
    }

    #[tokio::test]
    async fn test_resampled_weekly_matches_week_bucket() {
        let transport = ScriptedTransport::new(vec![Ok(week_of_rows())]);
        let config = MarketDataConfig {
            resample_from_daily: true,
            ..fast_config()
        };
        let (_, md) = market_data(transport.clone(), config);

        let weekly = assert_ok!(md.fetch("AAPL", Timeframe::Weekly).await);
        assert_eq!(weekly.len(), 1);
        assert!(!weekly.is_provisional_tail());
        assert_eq!(transport.queries.lock().unwrap()[0].timespan, "day");
    }

    #[tokio::test]
    async fn test_all_malformed_rows_give_empty_uncached_series() {
        let transport = ScriptedTransport::new(vec![Ok(rows(json!([{"t": 1, "o": "x"}])))]);
        let (_, md) = market_data(transport.clone(), fast_config());

        let series = assert_ok!(md.fetch("AAPL", Timeframe::Monthly).await);
        assert!(series.is_empty());
        assert_eq!(md.cached_series(), 0);
    }

    #[test]
    fn test_native_monthly_tail_is_provisional_mid_month() {
        let bar = scan_core::Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 1.0,
        };
        let series = Series::new("AAPL", Timeframe::Monthly, vec![bar]);
        assert!(native_tail_provisional(&series, NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()));
        assert!(!native_tail_provisional(&series, NaiveDate::from_ymd_opt(2024, 4, 2).unwrap()));
    }
}
