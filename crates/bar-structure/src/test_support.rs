use chrono::{Duration, TimeZone, Utc};
use scan_core::{Bar, Series, Timeframe};

/// Bar with only a high/low range; open and close sit at the midpoint.
pub fn range_bar(day: i64, high: f64, low: f64) -> Bar {
    let mid = (high + low) / 2.0;
    ohlc_bar(day, mid, high, low, mid)
}

pub fn ohlc_bar(day: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
        open,
        high,
        low,
        close,
        volume: 1_000.0,
    }
}

pub fn series_of(bars: Vec<Bar>) -> Series {
    Series::new("TEST", Timeframe::Daily, bars)
}
