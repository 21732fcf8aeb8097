use async_trait::async_trait;
use crate::{ClassifiedSeries, DataError, Series, SetupHit, Timeframe};

/// Anything that can hand back a bar series for a symbol/timeframe pair
#[async_trait]
pub trait SeriesSource: Send + Sync {
    async fn fetch(&self, symbol: &str, timeframe: Timeframe) -> Result<Series, DataError>;
}

/// A setup recognizer run against the classified tail of a series
pub trait SetupDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Bars required before `detect` is worth calling
    fn min_bars(&self) -> usize {
        2
    }

    fn detect(&self, input: &ClassifiedSeries) -> Option<SetupHit>;
}
