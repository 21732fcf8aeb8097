use scan_core::{label_key, Bias, BarLabel};
use std::collections::HashMap;
use thiserror::Error;

use scan_core::BarLabel::{DirectionalDown as D2, DirectionalUp as U2, Inside as I1, Outside as O3};

/// Named multi-bar structure
#[derive(Debug, Clone, PartialEq)]
pub struct ComboPattern {
    pub name: &'static str,
    pub bias: Bias,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComboTableError {
    #[error("pattern {0} is defined more than once")]
    DuplicatePattern(String),

    #[error("pattern {0} has {1} bars; combos span 2 or 3 bars")]
    UnsupportedLength(String, usize),
}

/// Built-in strat combos: (labels, name, bias)
pub const STANDARD_COMBOS: &[(&[BarLabel], &str, Bias)] = &[
    // three-bar
    (&[U2, I1, U2], "Bullish continuation", Bias::Bullish),
    (&[D2, I1, D2], "Bearish continuation", Bias::Bearish),
    (&[D2, I1, U2], "Bullish reversal", Bias::Bullish),
    (&[U2, I1, D2], "Bearish reversal", Bias::Bearish),
    (&[O3, I1, U2], "3-1-2 Bullish reversal", Bias::Bullish),
    (&[O3, I1, D2], "3-1-2 Bearish reversal", Bias::Bearish),
    (&[I1, D2, U2], "Bullish RevStrat", Bias::Bullish),
    (&[I1, U2, D2], "Bearish RevStrat", Bias::Bearish),
    // two-bar
    (&[D2, U2], "2-2 Bullish reversal", Bias::Bullish),
    (&[U2, D2], "2-2 Bearish reversal", Bias::Bearish),
    (&[O3, U2], "3-2 Bullish", Bias::Bullish),
    (&[O3, D2], "3-2 Bearish", Bias::Bearish),
    (&[I1, U2], "1-2 Bullish breakout", Bias::Bullish),
    (&[I1, D2], "1-2 Bearish breakout", Bias::Bearish),
];

/// Immutable lookup from a label tuple to its pattern.
#[derive(Debug, Clone)]
pub struct ComboTable {
    patterns: HashMap<Vec<BarLabel>, ComboPattern>,
}

impl ComboTable {
    /// Build a table, rejecting duplicate keys and unsupported lengths.
    pub fn new<I>(entries: I) -> Result<Self, ComboTableError>
    where
        I: IntoIterator<Item = (Vec<BarLabel>, ComboPattern)>,
    {
        let mut patterns = HashMap::new();
        for (labels, pattern) in entries {
            let key = label_key(&labels);
            if !(2..=3).contains(&labels.len()) {
                return Err(ComboTableError::UnsupportedLength(key, labels.len()));
            }
            if patterns.insert(labels, pattern).is_some() {
                return Err(ComboTableError::DuplicatePattern(key));
            }
        }
        Ok(Self { patterns })
    }

    pub fn standard() -> Result<Self, ComboTableError> {
        Self::new(STANDARD_COMBOS.iter().map(|(labels, name, bias)| {
            (
                labels.to_vec(),
                ComboPattern {
                    name: *name,
                    bias: *bias,
                },
            )
        }))
    }

    pub fn lookup(&self, labels: &[BarLabel]) -> Option<&ComboPattern> {
        self.patterns.get(labels)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComboMatch {
    pub pattern: ComboPattern,
    pub labels: Vec<BarLabel>,
    /// Index of the last bar in the matching window
    pub end_index: usize,
}

/// Find the most recent combo of `window` bars among the last `search_span`
/// window positions. Windows containing an unlabeled bar are skipped.
pub fn find_combo(
    labels: &[Option<BarLabel>],
    window: usize,
    search_span: usize,
    table: &ComboTable,
) -> Option<ComboMatch> {
    if window == 0 || labels.len() < window || search_span == 0 {
        return None;
    }

    let last_end = labels.len() - 1;
    let first_end = (window - 1).max(last_end.saturating_sub(search_span - 1));

    (first_end..=last_end).rev().find_map(|end| {
        let slice = &labels[end + 1 - window..=end];
        let window_labels: Option<Vec<BarLabel>> = slice.iter().copied().collect();
        let window_labels = window_labels?;
        table.lookup(&window_labels).map(|pattern| ComboMatch {
            pattern: pattern.clone(),
            labels: window_labels,
            end_index: end,
        })
    })
}
