use scan_core::{Bar, BarLabel, ClassifiedSeries, Series};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// How the Inside test treats a side that exactly matches the previous bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsidePolicy {
    /// Both sides strictly inside the previous range
    #[default]
    Strict,
    /// Both sides within the previous range, at least one strictly
    Inclusive,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown inside policy: {0} (expected strict or inclusive)")]
pub struct ParsePolicyError(pub String);

impl FromStr for InsidePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(InsidePolicy::Strict),
            "inclusive" => Ok(InsidePolicy::Inclusive),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

fn is_inside(current: &Bar, previous: &Bar, policy: InsidePolicy) -> bool {
    match policy {
        InsidePolicy::Strict => current.high < previous.high && current.low > previous.low,
        InsidePolicy::Inclusive => {
            current.high <= previous.high
                && current.low >= previous.low
                && (current.high < previous.high || current.low > previous.low)
        }
    }
}

/// Label `current` against the bar right before it.
///
/// First match wins: Outside, Inside, DirectionalUp, DirectionalDown.
/// `None` when the bar neither expanded nor contracted the previous range.
pub fn classify(current: &Bar, previous: &Bar, policy: InsidePolicy) -> Option<BarLabel> {
    let higher_high = current.high > previous.high;
    let lower_low = current.low < previous.low;

    if higher_high && lower_low {
        Some(BarLabel::Outside)
    } else if is_inside(current, previous, policy) {
        Some(BarLabel::Inside)
    } else if higher_high {
        Some(BarLabel::DirectionalUp)
    } else if lower_low {
        Some(BarLabel::DirectionalDown)
    } else {
        None
    }
}

/// Label every bar of a (sanitized) series. The first bar has no label.
pub fn classify_series(series: &Series, policy: InsidePolicy) -> ClassifiedSeries {
    let bars = series.bars();
    let mut labels = Vec::with_capacity(bars.len());
    if !bars.is_empty() {
        labels.push(None);
    }
    labels.extend(bars.windows(2).map(|w| classify(&w[1], &w[0], policy)));

    ClassifiedSeries {
        series: series.clone(),
        labels,
    }
}
