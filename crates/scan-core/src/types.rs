use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::ParseTimeframeError;

/// OHLCV bar data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Closed above its open
    pub fn is_green(&self) -> bool {
        self.close > self.open
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }
}

/// Whether the sanitizer had to repair a bar's high/low bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarQuality {
    #[default]
    Ok,
    Adjusted,
}

/// Bar aggregation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Timeframe {
    /// Calendar days of daily history needed to source this timeframe.
    pub fn lookback_days(&self) -> i64 {
        match self {
            Timeframe::Daily => 180,
            Timeframe::Weekly => 730,
            Timeframe::Monthly => 1_825,
            Timeframe::Quarterly => 3_650,
            Timeframe::Yearly => 7_300,
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Timeframe::Daily => "daily",
            Timeframe::Weekly => "weekly",
            Timeframe::Monthly => "monthly",
            Timeframe::Quarterly => "quarterly",
            Timeframe::Yearly => "yearly",
        }
    }

    /// Monthly and coarser
    pub fn is_long(&self) -> bool {
        matches!(
            self,
            Timeframe::Monthly | Timeframe::Quarterly | Timeframe::Yearly
        )
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "d" | "1d" | "day" | "daily" => Ok(Timeframe::Daily),
            "w" | "1wk" | "week" | "weekly" => Ok(Timeframe::Weekly),
            "m" | "1mo" | "month" | "monthly" => Ok(Timeframe::Monthly),
            "q" | "3mo" | "quarter" | "quarterly" => Ok(Timeframe::Quarterly),
            "y" | "1y" | "year" | "yearly" => Ok(Timeframe::Yearly),
            _ => Err(ParseTimeframeError(s.to_string())),
        }
    }
}

/// Structural relationship of a bar to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarLabel {
    /// "1": range contained in the previous bar's range
    Inside,
    /// "2U": took out the previous high only
    DirectionalUp,
    /// "2D": took out the previous low only
    DirectionalDown,
    /// "3": took out both sides
    Outside,
}

impl BarLabel {
    pub fn code(&self) -> &'static str {
        match self {
            BarLabel::Inside => "1",
            BarLabel::DirectionalUp => "2U",
            BarLabel::DirectionalDown => "2D",
            BarLabel::Outside => "3",
        }
    }
}

impl fmt::Display for BarLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Join labels the way traders write them, e.g. `2U-1-2U`.
pub fn label_key(labels: &[BarLabel]) -> String {
    labels
        .iter()
        .map(BarLabel::code)
        .collect::<Vec<_>>()
        .join("-")
}

/// Candle direction used for timeframe continuity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

/// Ordered, timestamp-deduplicated bars for one symbol and timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SeriesParts")]
pub struct Series {
    pub symbol: String,
    pub timeframe: Timeframe,
    bars: Vec<Bar>,
    quality: Vec<BarQuality>,
    /// The last bar is a calendar bucket that is still accumulating
    provisional_tail: bool,
}

/// Wire form of a `Series`; deserialized input is re-sorted and deduplicated.
#[derive(Deserialize)]
struct SeriesParts {
    symbol: String,
    timeframe: Timeframe,
    bars: Vec<Bar>,
    #[serde(default)]
    quality: Vec<BarQuality>,
    #[serde(default)]
    provisional_tail: bool,
}

impl From<SeriesParts> for Series {
    fn from(parts: SeriesParts) -> Self {
        let mut quality = parts.quality;
        quality.resize(parts.bars.len(), BarQuality::Ok);
        Self::from_flagged(parts.symbol, parts.timeframe, parts.bars.into_iter().zip(quality).collect())
            .with_provisional_tail(parts.provisional_tail)
    }
}

impl Series {
    /// Sorts by timestamp and keeps the last bar for any repeated timestamp.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, bars: Vec<Bar>) -> Self {
        let flagged = bars.into_iter().map(|bar| (bar, BarQuality::Ok)).collect();
        Self::from_flagged(symbol, timeframe, flagged)
    }

    fn from_flagged(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        mut bars: Vec<(Bar, BarQuality)>,
    ) -> Self {
        // stable sort: among equal timestamps the later input stays later
        bars.sort_by_key(|(b, _)| b.timestamp);

        let mut deduped: Vec<(Bar, BarQuality)> = Vec::with_capacity(bars.len());
        for entry in bars {
            match deduped.last_mut() {
                Some(last) if last.0.timestamp == entry.0.timestamp => *last = entry,
                _ => deduped.push(entry),
            }
        }

        let (bars, quality) = deduped.into_iter().unzip();
        Self {
            symbol: symbol.into(),
            timeframe,
            bars,
            quality,
            provisional_tail: false,
        }
    }

    pub fn empty(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self::new(symbol, timeframe, Vec::new())
    }

    pub fn with_provisional_tail(mut self, provisional: bool) -> Self {
        self.provisional_tail = provisional && !self.bars.is_empty();
        self
    }

    /// Replace per-bar quality flags. Ignored when the lengths disagree.
    pub fn with_quality(mut self, quality: Vec<BarQuality>) -> Self {
        if quality.len() == self.bars.len() {
            self.quality = quality;
        }
        self
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn quality(&self) -> &[BarQuality] {
        &self.quality
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn is_provisional_tail(&self) -> bool {
        self.provisional_tail
    }

    /// True when the bar at `index` is the in-progress bucket.
    pub fn is_provisional(&self, index: usize) -> bool {
        self.provisional_tail && index + 1 == self.bars.len()
    }

    /// Any bar in `range` was repaired by the sanitizer.
    pub fn any_adjusted(&self, range: Range<usize>) -> bool {
        let end = range.end.min(self.quality.len());
        let start = range.start.min(end);
        self.quality[start..end]
            .iter()
            .any(|q| *q == BarQuality::Adjusted)
    }

    /// The most recent `n` bars as a new series.
    pub fn tail(&self, n: usize) -> Series {
        let start = self.bars.len().saturating_sub(n);
        Series {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            bars: self.bars[start..].to_vec(),
            quality: self.quality[start..].to_vec(),
            provisional_tail: self.provisional_tail,
        }
    }

    /// Produce a new series by rewriting each bar. Timestamps must be kept;
    /// an `Adjusted` flag already on a bar is never cleared.
    pub fn map_bars<F>(&self, mut f: F) -> Series
    where
        F: FnMut(&Bar) -> (Bar, BarQuality),
    {
        let (bars, quality) = self
            .bars
            .iter()
            .zip(&self.quality)
            .map(|(bar, prior)| {
                let (fixed, quality) = f(bar);
                let quality = if *prior == BarQuality::Adjusted {
                    BarQuality::Adjusted
                } else {
                    quality
                };
                (fixed, quality)
            })
            .unzip();

        Series {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            bars,
            quality,
            provisional_tail: self.provisional_tail,
        }
    }
}

/// A series with one structural label per bar; index 0 is always `None`.
#[derive(Debug, Clone)]
pub struct ClassifiedSeries {
    pub series: Series,
    pub labels: Vec<Option<BarLabel>>,
}

impl ClassifiedSeries {
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn last_label(&self) -> Option<BarLabel> {
        self.labels.last().copied().flatten()
    }

    /// The last two bars as (previous, current).
    pub fn last_pair(&self) -> Option<(&Bar, &Bar)> {
        match self.series.bars() {
            [.., previous, current] => Some((previous, current)),
            _ => None,
        }
    }
}

/// Setup-specific figures reported alongside a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetupDetails {
    InsideBar {
        change_pct: f64,
        volume: f64,
    },
    Hammer {
        recovery_pct: f64,
        broke_level: f64,
        volume: f64,
    },
    TwoDownGreen {
        change_pct: f64,
        previous_low: f64,
        previous_high: f64,
        current_low: f64,
        current_high: f64,
        break_amount: f64,
        volume: f64,
    },
    Combo {
        labels: String,
        end_index: usize,
    },
}

/// What a detector found, before the orchestrator attaches symbol context.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupHit {
    pub setup_name: String,
    pub bias: Bias,
    pub reference_price: f64,
    pub reference_date: DateTime<Utc>,
    /// Bars the detector looked at; `span.end - 1` is the reference bar.
    pub span: Range<usize>,
    pub details: SetupDetails,
}

/// One reported setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMatch {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub setup_name: String,
    pub bias: Bias,
    pub reference_price: f64,
    pub reference_date: DateTime<Utc>,
    pub details: SetupDetails,
    /// A bar in the detection window was repaired by the sanitizer
    pub degraded: bool,
    /// The reference bar is an in-progress aggregated bucket
    pub provisional: bool,
    #[serde(default)]
    pub continuity: Option<Direction>,
}

impl ScanMatch {
    pub fn from_hit(series: &Series, hit: SetupHit, continuity: Option<Direction>) -> Self {
        let reference_index = hit.span.end.saturating_sub(1);
        Self {
            symbol: series.symbol.clone(),
            timeframe: series.timeframe,
            degraded: series.any_adjusted(hit.span.clone()),
            provisional: series.is_provisional(reference_index),
            setup_name: hit.setup_name,
            bias: hit.bias,
            reference_price: hit.reference_price,
            reference_date: hit.reference_date,
            details: hit.details,
            continuity,
        }
    }
}
