use scan_core::{Bar, BarQuality, Series};

/// Widen a bar's high/low so that both open and close fall inside the range.
///
/// Total and idempotent. Returns `BarQuality::Adjusted` whenever a bound moved,
/// which callers surface as degraded data for that bar.
pub fn sanitize(bar: &Bar) -> (Bar, BarQuality) {
    let mut fixed = *bar;
    for price in [bar.open, bar.close] {
        if price > fixed.high {
            fixed.high = price;
        }
        if price < fixed.low {
            fixed.low = price;
        }
    }

    let quality = if fixed.high != bar.high || fixed.low != bar.low {
        BarQuality::Adjusted
    } else {
        BarQuality::Ok
    };
    (fixed, quality)
}

/// Sanitize every bar, returning a new series with per-bar quality flags.
pub fn sanitize_series(series: &Series) -> Series {
    let sanitized = series.map_bars(sanitize);
    let adjusted = sanitized
        .quality()
        .iter()
        .filter(|q| **q == BarQuality::Adjusted)
        .count();
    if adjusted > 0 {
        tracing::debug!(
            "{} {}: repaired {} of {} bars",
            series.symbol,
            series.timeframe,
            adjusted,
            series.len()
        );
    }
    sanitized
}
