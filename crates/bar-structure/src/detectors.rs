use scan_core::{
    label_key, Bar, BarLabel, Bias, ClassifiedSeries, SetupDetails, SetupDetector, SetupHit,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::classify::{classify, InsidePolicy};
use crate::combos::{find_combo, ComboTable};

fn pct_change(from: f64, to: f64) -> f64 {
    if from == 0.0 {
        0.0
    } else {
        (to - from) / from * 100.0
    }
}

/// Span covering the last two bars of the input
fn last_pair_span(input: &ClassifiedSeries) -> std::ops::Range<usize> {
    input.len().saturating_sub(2)..input.len()
}

/// Last bar's range sits inside the previous bar's range.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsideBarDetector {
    pub policy: InsidePolicy,
}

impl InsideBarDetector {
    pub fn new(policy: InsidePolicy) -> Self {
        Self { policy }
    }
}

impl SetupDetector for InsideBarDetector {
    fn name(&self) -> &str {
        "Inside Bar"
    }

    fn detect(&self, input: &ClassifiedSeries) -> Option<SetupHit> {
        let (previous, current) = input.last_pair()?;
        if classify(current, previous, self.policy) != Some(BarLabel::Inside) {
            return None;
        }

        Some(SetupHit {
            setup_name: self.name().to_string(),
            bias: Bias::Neutral,
            reference_price: current.close,
            reference_date: current.timestamp,
            span: last_pair_span(input),
            details: SetupDetails::InsideBar {
                change_pct: pct_change(previous.close, current.close),
                volume: current.volume,
            },
        })
    }
}

/// Broke the previous low, then closed back above it on a hammer-shaped candle.
#[derive(Debug, Clone, Copy, Default)]
pub struct HammerDetector;

impl HammerDetector {
    /// Small body near the top, long lower wick.
    fn has_hammer_shape(bar: &Bar) -> bool {
        let range = bar.range();
        if range <= 0.0 {
            return false;
        }
        let body = bar.body();
        let lower_shadow = bar.open.min(bar.close) - bar.low;
        let upper_shadow = bar.high - bar.open.max(bar.close);

        body / range < 0.3 && lower_shadow > 2.0 * body && upper_shadow <= body.max(range * 0.1)
    }
}

impl SetupDetector for HammerDetector {
    fn name(&self) -> &str {
        "Hammer Setup"
    }

    fn detect(&self, input: &ClassifiedSeries) -> Option<SetupHit> {
        let (previous, current) = input.last_pair()?;
        let broke_level = previous.low;
        if !(current.low < broke_level && current.close > broke_level) {
            return None;
        }
        if !Self::has_hammer_shape(current) {
            return None;
        }

        let recovery_pct = if current.low > 0.0 {
            (current.close - current.low) / current.low * 100.0
        } else {
            0.0
        };

        Some(SetupHit {
            setup_name: self.name().to_string(),
            bias: Bias::Bullish,
            reference_price: current.close,
            reference_date: current.timestamp,
            span: last_pair_span(input),
            details: SetupDetails::Hammer {
                recovery_pct,
                broke_level,
                volume: current.volume,
            },
        })
    }
}

/// A 2D bar (took out only the previous low) that still closed green.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwoDownGreenDetector;

impl SetupDetector for TwoDownGreenDetector {
    fn name(&self) -> &str {
        "2-Down-Green"
    }

    fn detect(&self, input: &ClassifiedSeries) -> Option<SetupHit> {
        let (previous, current) = input.last_pair()?;
        // the Inside policy has no bearing on a 2D label
        if classify(current, previous, InsidePolicy::Strict) != Some(BarLabel::DirectionalDown) {
            return None;
        }
        if !current.is_green() {
            return None;
        }

        Some(SetupHit {
            setup_name: self.name().to_string(),
            bias: Bias::Bullish,
            reference_price: current.close,
            reference_date: current.timestamp,
            span: last_pair_span(input),
            details: SetupDetails::TwoDownGreen {
                change_pct: pct_change(current.open, current.close),
                previous_low: previous.low,
                previous_high: previous.high,
                current_low: current.low,
                current_high: current.high,
                break_amount: previous.low - current.low,
                volume: current.volume,
            },
        })
    }
}

/// Runs the combo matcher over the classified labels.
#[derive(Debug, Clone)]
pub struct ComboDetector {
    window: usize,
    search_span: usize,
    table: Arc<ComboTable>,
    name: String,
}

impl ComboDetector {
    pub fn new(window: usize, search_span: usize, table: Arc<ComboTable>) -> Self {
        Self {
            window,
            search_span: search_span.max(1),
            table,
            name: format!("Combo ({}-bar)", window),
        }
    }
}

impl SetupDetector for ComboDetector {
    fn name(&self) -> &str {
        &self.name
    }

    /// The first bar of the window needs its own predecessor to be labeled
    fn min_bars(&self) -> usize {
        self.window + 1
    }

    fn detect(&self, input: &ClassifiedSeries) -> Option<SetupHit> {
        if input.len() < self.min_bars() {
            return None;
        }
        let found = find_combo(&input.labels, self.window, self.search_span, &self.table)?;
        let bar = input.series.bars().get(found.end_index)?;

        Some(SetupHit {
            setup_name: found.pattern.name.to_string(),
            bias: found.pattern.bias,
            reference_price: bar.close,
            reference_date: bar.timestamp,
            span: found.end_index.saturating_sub(self.window)..found.end_index + 1,
            details: SetupDetails::Combo {
                labels: label_key(&found.labels),
                end_index: found.end_index,
            },
        })
    }
}

/// Setups that can be switched on by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupKind {
    InsideBar,
    Hammer,
    TwoDownGreen,
    Combo2,
    Combo3,
}

impl SetupKind {
    pub fn all() -> Vec<SetupKind> {
        vec![
            SetupKind::InsideBar,
            SetupKind::Hammer,
            SetupKind::TwoDownGreen,
            SetupKind::Combo2,
            SetupKind::Combo3,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            SetupKind::InsideBar => "inside",
            SetupKind::Hammer => "hammer",
            SetupKind::TwoDownGreen => "2d-green",
            SetupKind::Combo2 => "combo2",
            SetupKind::Combo3 => "combo3",
        }
    }
}

impl fmt::Display for SetupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown setup: {0}")]
pub struct ParseSetupError(pub String);

impl FromStr for SetupKind {
    type Err = ParseSetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inside" | "inside-bar" | "insidebar" => Ok(SetupKind::InsideBar),
            "hammer" => Ok(SetupKind::Hammer),
            "2d-green" | "2dgreen" | "two-down-green" => Ok(SetupKind::TwoDownGreen),
            "combo2" | "combo-2" => Ok(SetupKind::Combo2),
            "combo3" | "combo-3" | "combo" => Ok(SetupKind::Combo3),
            _ => Err(ParseSetupError(s.to_string())),
        }
    }
}

/// Instantiate the detectors for the requested setups, in request order.
pub fn build_detectors(
    kinds: &[SetupKind],
    policy: InsidePolicy,
    combo_span: usize,
    table: Arc<ComboTable>,
) -> Vec<Arc<dyn SetupDetector>> {
    let mut seen = Vec::new();
    kinds
        .iter()
        .filter(|kind| {
            if seen.contains(*kind) {
                false
            } else {
                seen.push(**kind);
                true
            }
        })
        .map(|kind| -> Arc<dyn SetupDetector> {
            match kind {
                SetupKind::InsideBar => Arc::new(InsideBarDetector::new(policy)),
                SetupKind::Hammer => Arc::new(HammerDetector),
                SetupKind::TwoDownGreen => Arc::new(TwoDownGreenDetector),
                SetupKind::Combo2 => Arc::new(ComboDetector::new(2, combo_span, Arc::clone(&table))),
                SetupKind::Combo3 => Arc::new(ComboDetector::new(3, combo_span, Arc::clone(&table))),
            }
        })
        .collect()
}
