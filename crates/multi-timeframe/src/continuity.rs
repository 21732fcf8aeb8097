use scan_core::{Bar, Direction, SeriesSource, Timeframe};
use std::sync::Arc;
use tracing::debug;

/// `Up` when the bar closed above its open, otherwise `Down`.
pub fn bar_direction(bar: &Bar) -> Direction {
    if bar.close > bar.open {
        Direction::Up
    } else {
        Direction::Down
    }
}

/// The shared direction, or `None` if the inputs disagree or are empty.
pub fn common_direction<I>(directions: I) -> Option<Direction>
where
    I: IntoIterator<Item = Direction>,
{
    let mut iter = directions.into_iter();
    let first = iter.next()?;
    iter.all(|d| d == first).then_some(first)
}

const CONTINUITY_TIMEFRAMES: [Timeframe; 3] = [Timeframe::Daily, Timeframe::Weekly, Timeframe::Monthly];

/// Full timeframe continuity: do the latest bars of several timeframes
/// point the same way?
#[derive(Clone)]
pub struct ContinuityEvaluator {
    source: Arc<dyn SeriesSource>,
}

impl ContinuityEvaluator {
    pub fn new(source: Arc<dyn SeriesSource>) -> Self {
        Self { source }
    }

    /// Fetches every timeframe concurrently. Any failed or empty fetch makes
    /// the answer `None`; errors are never propagated.
    pub async fn check(&self, symbol: &str) -> Option<Direction> {
        let fetches = CONTINUITY_TIMEFRAMES.iter().map(|&timeframe| {
            let source = Arc::clone(&self.source);
            async move {
                match source.fetch(symbol, timeframe).await {
                    Ok(series) => series.last().map(bar_direction),
                    Err(e) => {
                        debug!("continuity: {} {} unavailable: {}", symbol, timeframe, e);
                        None
                    }
                }
            }
        });

        let directions: Option<Vec<Direction>> = futures::future::join_all(fetches)
            .await
            .into_iter()
            .collect();

        common_direction(directions?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use scan_core::{DataError, Series};
    use std::collections::HashMap;

    struct FixedSource {
        last_bars: HashMap<Timeframe, (f64, f64)>,
    }

    #[async_trait]
    impl SeriesSource for FixedSource {
        async fn fetch(&self, symbol: &str, timeframe: Timeframe) -> Result<Series, DataError> {
            let (open, close) = self.last_bars.get(&timeframe).copied().ok_or_else(|| {
                DataError::Transient {
                    symbol: symbol.to_string(),
                    message: "timeout".to_string(),
                }
            })?;
            let bar = Bar {
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: 10.0,
            };
            Ok(Series::new(symbol, timeframe, vec![bar]))
        }
    }

    fn evaluator(bars: &[(Timeframe, (f64, f64))]) -> ContinuityEvaluator {
        ContinuityEvaluator::new(Arc::new(FixedSource {
            last_bars: bars.iter().copied().collect(),
        }))
    }

    #[tokio::test]
    async fn test_all_green_is_up() {
        let eval = evaluator(&[
            (Timeframe::Daily, (10.0, 11.0)),
            (Timeframe::Weekly, (9.0, 11.0)),
            (Timeframe::Monthly, (8.0, 11.0)),
        ]);
        assert_eq!(eval.check("AAPL").await, Some(Direction::Up));
    }

    #[tokio::test]
    async fn test_red_month_breaks_continuity() {
        let eval = evaluator(&[
            (Timeframe::Daily, (10.0, 11.0)),
            (Timeframe::Weekly, (9.0, 11.0)),
            (Timeframe::Monthly, (12.0, 11.0)),
        ]);
        assert_eq!(eval.check("AAPL").await, None);
    }

    #[tokio::test]
    async fn test_all_red_is_down() {
        let eval = evaluator(&[
            (Timeframe::Daily, (11.0, 10.0)),
            (Timeframe::Weekly, (11.0, 9.0)),
            (Timeframe::Monthly, (11.0, 8.0)),
        ]);
        assert_eq!(eval.check("TSLA").await, Some(Direction::Down));
    }

    #[tokio::test]
    async fn test_fetch_failure_fails_soft() {
        let eval = evaluator(&[
            (Timeframe::Daily, (10.0, 11.0)),
            (Timeframe::Weekly, (9.0, 11.0)),
        ]);
        assert_eq!(eval.check("AAPL").await, None);
    }

    #[test]
    fn test_flat_bar_counts_as_down() {
        let bar = Bar {
            timestamp: Utc::now(),
            open: 5.0,
            high: 6.0,
            low: 4.0,
            close: 5.0,
            volume: 0.0,
        };
        assert_eq!(bar_direction(&bar), Direction::Down);
        assert_eq!(common_direction(Vec::new()), None);
    }
}
