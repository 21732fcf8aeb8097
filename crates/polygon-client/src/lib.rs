use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

mod error;

pub use error::ProviderError;

const BASE_URL: &str = "https://api.polygon.io";

/// One provider row, field names exactly as the provider sent them.
pub type RawRow = Map<String, Value>;

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests: max_requests.max(1),
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            // Remove timestamps outside the window
            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            // Wait until the oldest request falls out of the window
            let sleep_dur = match ts.front() {
                Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
                None => Duration::ZERO,
            } + Duration::from_millis(50);
            drop(ts);
            tracing::debug!(
                "Rate limiter: waiting {:.1}s for Polygon API slot",
                sleep_dur.as_secs_f64()
            );
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

/// Query for aggregate bars: `multiplier` × `timespan` bars between two dates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregatesQuery {
    pub symbol: String,
    pub multiplier: u32,
    pub timespan: &'static str,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Clone)]
pub struct PolygonClient {
    api_key: String,
    client: Client,
    rate_limiter: RateLimiter,
}

impl PolygonClient {
    pub fn new(api_key: String) -> Self {
        // Default 500 req/min for Starter plan. Free tier users should set POLYGON_RATE_LIMIT=5.
        let rate_limit: usize = std::env::var("POLYGON_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        Self::with_rate_limit(api_key, rate_limit)
    }

    pub fn with_rate_limit(api_key: String, requests_per_minute: usize) -> Self {
        // Per-attempt timeouts are enforced by the caller; this is only a backstop.
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            client,
            rate_limiter: RateLimiter::new(requests_per_minute, Duration::from_secs(60)),
        }
    }

    /// Fetch aggregate rows for one symbol. Rows are returned unparsed so the
    /// caller decides how to treat odd or missing fields.
    pub async fn get_aggregates(&self, query: &AggregatesQuery) -> Result<Vec<RawRow>, ProviderError> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            BASE_URL,
            query.symbol,
            query.multiplier,
            query.timespan,
            query.from.format("%Y-%m-%d"),
            query.to.format("%Y-%m-%d")
        );

        self.rate_limiter.acquire().await;
        let response = self
            .client
            .get(&url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", "50000"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(query.symbol.clone()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!("Polygon 429 rate limited on {}", query.symbol);
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        parse_aggregates(&query.symbol, body)
    }
}

/// Pull the `results` rows out of an aggregates response body.
fn parse_aggregates(symbol: &str, body: Value) -> Result<Vec<RawRow>, ProviderError> {
    let Value::Object(mut envelope) = body else {
        return Err(ProviderError::Decode("expected a JSON object".to_string()));
    };

    if let Some(Value::String(status)) = envelope.get("status") {
        if status.eq_ignore_ascii_case("NOT_FOUND") {
            return Err(ProviderError::NotFound(symbol.to_string()));
        }
    }

    match envelope.remove("results") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(rows)) => Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()),
        Some(other) => Err(ProviderError::Decode(format!(
            "results is not an array: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_results_rows() {
        let body = json!({
            "ticker": "AAPL",
            "status": "OK",
            "results": [
                {"t": 1709510400000i64, "o": 10.0, "h": 12.0, "l": 9.0, "c": 11.0, "v": 1000.0},
                "garbage",
                {"t": 1709596800000i64, "o": 11.0, "h": 13.0, "l": 10.0, "c": 9.0}
            ]
        });

        let rows = parse_aggregates("AAPL", body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["o"], json!(10.0));
        assert!(rows[1].get("v").is_none());
    }

    #[test]
    fn test_missing_results_is_empty() {
        let rows = parse_aggregates("ZZZZ", json!({"status": "OK", "resultsCount": 0})).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_not_found_status_is_permanent() {
        let err = parse_aggregates("ZZZZ", json!({"status": "NOT_FOUND"})).unwrap_err();
        assert_eq!(err, ProviderError::NotFound("ZZZZ".to_string()));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_non_object_body_is_decode_error() {
        let err = parse_aggregates("AAPL", json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[tokio::test]
    async fn test_rate_limiter_admits_up_to_limit_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.timestamps.lock().await.len(), 3);
    }
}
