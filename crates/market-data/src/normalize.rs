use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use polygon_client::RawRow;
use scan_core::Bar;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Open,
    High,
    Low,
    Close,
    Volume,
    Timestamp,
}

fn field_for(part: &str) -> Option<Field> {
    match part.trim().to_ascii_lowercase().as_str() {
        "o" => Some(Field::Open),
        "h" => Some(Field::High),
        "l" => Some(Field::Low),
        "c" => Some(Field::Close),
        "v" => Some(Field::Volume),
        "t" => Some(Field::Timestamp),
        long => field_for_level(long),
    }
}

// Single-letter aliases are not accepted inside multi-level labels, where
// they would collide with one-letter tickers ("('Adj Close', 'T')").
fn field_for_level(part: &str) -> Option<Field> {
    match part.trim().to_ascii_lowercase().as_str() {
        "open" => Some(Field::Open),
        "high" => Some(Field::High),
        "low" => Some(Field::Low),
        "close" => Some(Field::Close),
        "volume" => Some(Field::Volume),
        "timestamp" | "date" | "datetime" | "time" => Some(Field::Timestamp),
        _ => None,
    }
}

fn levels(key: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = key
        .split(|c| matches!(c, ',' | '|' | '/'))
        .map(|part| part.trim_matches(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '\'' | '"')))
        .collect();
    (parts.len() > 1).then_some(parts)
}

/// Position of the level that names the field in a row's multi-level labels.
///
/// The field level is the one that spells out several distinct fields across
/// the row (`Open`, `High`, ...); the ticker level repeats one value, which can
/// itself read as a field name (`LOW`, `OPEN`).
fn field_level<'a>(keys: impl Iterator<Item = &'a String>) -> Option<usize> {
    let mut seen: Vec<Vec<Field>> = Vec::new();
    for parts in keys.filter_map(|k| levels(k)) {
        if seen.len() < parts.len() {
            seen.resize(parts.len(), Vec::new());
        }
        for (pos, field) in parts.iter().enumerate().filter_map(|(i, p)| Some((i, field_for_level(p)?))) {
            if !seen[pos].contains(&field) {
                seen[pos].push(field);
            }
        }
    }
    seen.iter()
        .enumerate()
        .filter(|(_, fields)| fields.len() > 1)
        .max_by_key(|(_, fields)| fields.len())
        .map(|(pos, _)| pos)
}

/// Map a provider column name onto a bar field.
///
/// Handles plain names (`"o"`, `"Open"`) and multi-level labels such as
/// `"('Open', 'AAPL')"`, `"('AAPL', 'Open')"` or `"Open|AAPL"`. With a known
/// field level only that level is read, apart from a date column labelled on
/// another level; otherwise the first level naming a field wins.
fn canonical_field(key: &str, field_pos: Option<usize>) -> Option<Field> {
    if let Some(field) = field_for(key) {
        return Some(field);
    }
    let parts = levels(key)?;
    match field_pos {
        Some(pos) => parts.get(pos).and_then(|p| field_for_level(p)).or_else(|| {
            parts
                .iter()
                .filter_map(|p| field_for_level(p))
                .find(|f| *f == Field::Timestamp)
        }),
        None => parts.iter().find_map(|p| field_for_level(p)),
    }
}

/// Numbers and numeric strings; anything else is missing.
fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n >= 0.0).then_some(n)
}

fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(ms).single()
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(ts.and_utc());
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Some(date.and_time(NaiveTime::MIN).and_utc());
            }
            s.parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        }
        _ => None,
    }
}

#[derive(Debug, Default)]
struct RowFields {
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
}

fn read_row(row: &RawRow) -> RowFields {
    let mut fields = RowFields::default();
    let field_pos = field_level(row.keys());
    for (key, value) in row {
        match canonical_field(key, field_pos) {
            Some(Field::Open) => fields.open = fields.open.or(as_number(value)),
            Some(Field::High) => fields.high = fields.high.or(as_number(value)),
            Some(Field::Low) => fields.low = fields.low.or(as_number(value)),
            Some(Field::Close) => fields.close = fields.close.or(as_number(value)),
            Some(Field::Volume) => fields.volume = fields.volume.or(as_number(value)),
            Some(Field::Timestamp) => fields.timestamp = fields.timestamp.or(as_timestamp(value)),
            None => {}
        }
    }
    fields
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub bars: Vec<Bar>,
    /// Rows discarded for a missing timestamp or OHLC value
    pub dropped: usize,
}

/// Turn provider rows into bars. A row missing its timestamp or any OHLC
/// value is dropped; a missing volume reads as zero.
pub fn normalize_rows(rows: &[RawRow]) -> Normalized {
    let mut bars = Vec::with_capacity(rows.len());
    let mut dropped = 0;

    for row in rows {
        let f = read_row(row);
        match (f.timestamp, f.open, f.high, f.low, f.close) {
            (Some(timestamp), Some(open), Some(high), Some(low), Some(close)) => bars.push(Bar {
                timestamp,
                open,
                high,
                low,
                close,
                volume: f.volume.unwrap_or(0.0),
            }),
            _ => dropped += 1,
        }
    }

    Normalized { bars, dropped }
}
