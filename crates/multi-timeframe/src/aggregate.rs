use chrono::{Datelike, Duration, Months, NaiveDate, NaiveTime, Weekday};
use scan_core::{Bar, BarQuality, Series, Timeframe};

/// First calendar day of the bucket containing `date`.
///
/// Weekly buckets are ISO weeks (Monday start).
pub fn bucket_start(date: NaiveDate, target: Timeframe) -> NaiveDate {
    let month_start = date - Duration::days(date.day0() as i64);
    match target {
        Timeframe::Daily => date,
        Timeframe::Weekly => date - Duration::days(date.weekday().num_days_from_monday() as i64),
        Timeframe::Monthly => month_start,
        Timeframe::Quarterly => {
            let back = Months::new(date.month0() % 3);
            month_start.checked_sub_months(back).unwrap_or(month_start)
        }
        Timeframe::Yearly => {
            let back = Months::new(date.month0());
            month_start.checked_sub_months(back).unwrap_or(month_start)
        }
    }
}

/// Last weekday (trading session) of the bucket starting at `start`.
fn bucket_last_session(start: NaiveDate, target: Timeframe) -> Option<NaiveDate> {
    let next_start = match target {
        Timeframe::Daily => start.succ_opt()?,
        Timeframe::Weekly => start + Duration::days(7),
        Timeframe::Monthly => start.checked_add_months(Months::new(1))?,
        Timeframe::Quarterly => start.checked_add_months(Months::new(3))?,
        Timeframe::Yearly => start.checked_add_months(Months::new(12))?,
    };

    let mut day = next_start.pred_opt()?;
    while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) && day > start {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Whether the bucket starting at `start` is the calendar period containing
/// `today` and its last session has not yet passed.
pub fn period_in_progress(start: NaiveDate, target: Timeframe, today: NaiveDate) -> bool {
    bucket_start(today, target) == start
        && bucket_last_session(start, target).is_some_and(|last| today <= last)
}

struct Bucket {
    start: NaiveDate,
    bar: Bar,
    quality: BarQuality,
}

impl Bucket {
    fn open(start: NaiveDate, bar: &Bar, quality: BarQuality) -> Self {
        Self {
            start,
            bar: Bar {
                timestamp: start.and_time(NaiveTime::MIN).and_utc(),
                ..*bar
            },
            quality,
        }
    }

    fn absorb(&mut self, bar: &Bar, quality: BarQuality) {
        self.bar.high = self.bar.high.max(bar.high);
        self.bar.low = self.bar.low.min(bar.low);
        self.bar.close = bar.close;
        self.bar.volume += bar.volume;
        if quality == BarQuality::Adjusted {
            self.quality = BarQuality::Adjusted;
        }
    }
}

/// Fold daily bars into calendar buckets of `target`.
///
/// Buckets without source bars are omitted. The newest bucket is kept even
/// when its calendar period (judged against `today`) has not finished; it is
/// then flagged as the series' provisional tail. A period that ended early on
/// a holiday, or the last bucket of a stale series, is complete.
pub fn aggregate(series: &Series, target: Timeframe, today: NaiveDate) -> Series {
    if target == Timeframe::Daily {
        return series.clone();
    }

    let mut buckets: Vec<Bucket> = Vec::new();
    for (bar, quality) in series.bars().iter().zip(series.quality()) {
        let start = bucket_start(bar.date(), target);
        match buckets.last_mut() {
            Some(bucket) if bucket.start == start => bucket.absorb(bar, *quality),
            _ => buckets.push(Bucket::open(start, bar, *quality)),
        }
    }

    let provisional = buckets.last().is_some_and(|bucket| {
        series.is_provisional_tail() || period_in_progress(bucket.start, target, today)
    });

    let quality = buckets.iter().map(|b| b.quality).collect();
    let bars = buckets.into_iter().map(|b| b.bar).collect();

    Series::new(series.symbol.clone(), target, bars)
        .with_quality(quality)
        .with_provisional_tail(provisional)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn daily(y: i32, m: u32, d: u32, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_full_iso_week() {
        // Mon 2024-03-04 .. Fri 2024-03-08
        let opens = [10.0, 11.0, 9.0, 12.0, 13.0];
        let highs = [12.0, 13.0, 11.0, 14.0, 15.0];
        let lows = [9.0, 10.0, 8.0, 11.0, 12.0];
        let closes = [11.0, 9.0, 12.0, 13.0, 14.0];
        let bars = (0..5)
            .map(|i| daily(2024, 3, 4 + i as u32, opens[i], highs[i], lows[i], closes[i]))
            .collect();
        let series = Series::new("AAPL", Timeframe::Daily, bars);

        let weekly = aggregate(&series, Timeframe::Weekly, ymd(2024, 3, 11));
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly.timeframe, Timeframe::Weekly);
        let bar = weekly.bars()[0];
        assert_eq!(
            (bar.open, bar.high, bar.low, bar.close),
            (10.0, 15.0, 8.0, 14.0)
        );
        assert_eq!(bar.volume, 500.0);
        assert_eq!(bar.date(), ymd(2024, 3, 4));
        assert!(!weekly.is_provisional_tail());
    }

    #[test]
    fn test_partial_week_is_provisional() {
        let series = Series::new(
            "AAPL",
            Timeframe::Daily,
            vec![
                daily(2024, 3, 4, 10.0, 12.0, 9.0, 11.0),
                daily(2024, 3, 5, 11.0, 13.0, 10.0, 9.0),
            ],
        );
        // Tuesday evening, week still running
        let weekly = aggregate(&series, Timeframe::Weekly, ymd(2024, 3, 5));
        assert!(weekly.is_provisional_tail());
        assert!(weekly.is_provisional(0));
    }

    #[test]
    fn test_holiday_shortened_periods_are_complete() {
        // Good Friday 2024-03-29: the week and Q1 end on Thursday
        let series = Series::new(
            "AAPL",
            Timeframe::Daily,
            (25..=28).map(|d| daily(2024, 3, d, 10.0, 12.0, 9.0, 11.0)).collect(),
        );
        let today = ymd(2024, 4, 2);

        let weekly = aggregate(&series, Timeframe::Weekly, today);
        assert!(!weekly.is_provisional_tail());
        let quarterly = aggregate(&series, Timeframe::Quarterly, today);
        assert!(!quarterly.is_provisional_tail());

        // Before the holiday the quarter is still running
        let quarterly = aggregate(&series, Timeframe::Quarterly, ymd(2024, 3, 28));
        assert!(quarterly.is_provisional_tail());
    }

    #[test]
    fn test_stale_series_tail_is_complete() {
        let series = Series::new(
            "DLST",
            Timeframe::Daily,
            vec![
                daily(2023, 6, 12, 10.0, 12.0, 9.0, 11.0),
                daily(2023, 6, 13, 11.0, 13.0, 10.0, 12.0),
            ],
        );
        let monthly = aggregate(&series, Timeframe::Monthly, ymd(2024, 3, 11));
        assert!(!monthly.is_provisional_tail());
    }

    #[test]
    fn test_period_in_progress() {
        let week = ymd(2024, 3, 4);
        assert!(period_in_progress(week, Timeframe::Weekly, ymd(2024, 3, 8)));
        // Saturday after the last session
        assert!(!period_in_progress(week, Timeframe::Weekly, ymd(2024, 3, 9)));
        assert!(!period_in_progress(week, Timeframe::Weekly, ymd(2024, 3, 11)));
    }

    #[test]
    fn test_empty_buckets_are_omitted() {
        let series = Series::new(
            "MSFT",
            Timeframe::Daily,
            vec![
                daily(2024, 1, 15, 1.0, 2.0, 0.5, 1.5),
                daily(2024, 1, 31, 1.5, 3.0, 1.0, 2.5),
                daily(2024, 4, 2, 2.5, 4.0, 2.0, 3.0),
            ],
        );

        let monthly = aggregate(&series, Timeframe::Monthly, ymd(2024, 6, 1));
        let starts: Vec<NaiveDate> = monthly.bars().iter().map(|b| b.date()).collect();
        assert_eq!(starts, vec![ymd(2024, 1, 1), ymd(2024, 4, 1)]);
        assert_eq!(monthly.bars()[0].high, 3.0);
        assert_eq!(monthly.bars()[0].low, 0.5);
        assert_eq!(monthly.bars()[0].close, 2.5);
        assert_eq!(monthly.bars()[0].volume, 200.0);
    }

    #[test]
    fn test_extremes_and_volume_preserved_across_quarters() {
        let bars: Vec<Bar> = (1..=28)
            .flat_map(|d| {
                [1u32, 2, 3, 4, 5, 6].map(|m| {
                    let base = (m * 10 + d) as f64;
                    daily(2023, m, d, base, base + 2.0 + (d % 5) as f64, base - 1.0 - (d % 3) as f64, base + 0.5)
                })
            })
            .collect();
        let series = Series::new("SPY", Timeframe::Daily, bars);

        let quarterly = aggregate(&series, Timeframe::Quarterly, ymd(2024, 1, 2));
        assert_eq!(quarterly.len(), 2);

        for agg in quarterly.bars() {
            let start = agg.date();
            let members: Vec<&Bar> = series
                .bars()
                .iter()
                .filter(|b| bucket_start(b.date(), Timeframe::Quarterly) == start)
                .collect();
            let max_high = members.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let min_low = members.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            let volume: f64 = members.iter().map(|b| b.volume).sum();
            assert_eq!(agg.high, max_high);
            assert_eq!(agg.low, min_low);
            assert_eq!(agg.volume, volume);
            assert_eq!(agg.open, members[0].open);
            assert_eq!(agg.close, members[members.len() - 1].close);
        }
    }

    #[test]
    fn test_bucket_boundaries() {
        let d = ymd(2024, 8, 14); // Wednesday
        assert_eq!(bucket_start(d, Timeframe::Weekly), ymd(2024, 8, 12));
        assert_eq!(bucket_start(d, Timeframe::Monthly), ymd(2024, 8, 1));
        assert_eq!(bucket_start(d, Timeframe::Quarterly), ymd(2024, 7, 1));
        assert_eq!(bucket_start(d, Timeframe::Yearly), ymd(2024, 1, 1));

        // August 2024 ends on a Saturday
        assert_eq!(
            bucket_last_session(ymd(2024, 8, 1), Timeframe::Monthly),
            Some(ymd(2024, 8, 30))
        );
        assert_eq!(
            bucket_last_session(ymd(2024, 10, 1), Timeframe::Quarterly),
            Some(ymd(2024, 12, 31))
        );
    }

    #[test]
    fn test_adjusted_flag_carries_into_bucket() {
        let series = Series::new(
            "X",
            Timeframe::Daily,
            vec![
                daily(2024, 3, 4, 10.0, 12.0, 9.0, 11.0),
                daily(2024, 3, 11, 10.0, 12.0, 9.0, 11.0),
            ],
        )
        .with_quality(vec![BarQuality::Ok, BarQuality::Adjusted]);

        let weekly = aggregate(&series, Timeframe::Weekly, ymd(2024, 3, 18));
        assert_eq!(weekly.quality(), &[BarQuality::Ok, BarQuality::Adjusted]);
    }
}
