use bar_structure::{
    build_detectors, classify_series, sanitize_series, ComboTable, ComboTableError, InsidePolicy,
    SetupKind,
};
use chrono::{DateTime, Utc};
use multi_timeframe::ContinuityEvaluator;
use scan_core::{DataError, ScanMatch, SeriesSource, SetupDetector, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub mod config;
pub mod job;
pub mod progress;

pub use config::{ConfigError, ScanConfig};
pub use job::{InvalidTransition, JobStatus, ScanJob};
pub use progress::{cancellation, CancelHandle, CancelSignal, ScanProgress};

/// Worker count for a universe of `symbols`: one per five symbols, between 4 and 16.
pub fn default_concurrency(symbols: usize) -> usize {
    symbols.div_ceil(5).clamp(4, 16)
}

/// Newest reference date first, then symbol, then setup name.
pub fn sort_matches(matches: &mut [ScanMatch]) {
    matches.sort_by(|a, b| {
        b.reference_date
            .cmp(&a.reference_date)
            .then_with(|| a.symbol.cmp(&b.symbol))
            .then_with(|| a.setup_name.cmp(&b.setup_name))
    });
}

fn unique_symbols(symbols: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub tail_bars: usize,
    pub combo_span: usize,
    pub inside_policy: InsidePolicy,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            tail_bars: 60,
            combo_span: 3,
            inside_policy: InsidePolicy::Strict,
        }
    }
}

impl From<&ScanConfig> for ScanSettings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            tail_bars: config.tail_bars,
            combo_span: config.combo_span,
            inside_policy: config.inside_policy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub setups: Vec<SetupKind>,
    /// Defaults to `default_concurrency(symbols.len())`
    pub concurrency: Option<usize>,
}

impl ScanRequest {
    /// Scan `symbols` on `timeframe` for every known setup.
    pub fn new(symbols: Vec<String>, timeframe: Timeframe) -> Self {
        Self {
            symbols,
            timeframe,
            setups: SetupKind::all(),
            concurrency: None,
        }
    }

    pub fn with_setups(mut self, setups: Vec<SetupKind>) -> Self {
        self.setups = setups;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Option<usize>) -> Self {
        self.concurrency = concurrency;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub timeframe: Timeframe,
    pub matches: Vec<ScanMatch>,
    pub total: usize,
    /// Jobs that completed, including skipped ones
    pub processed: usize,
    /// Jobs that ended in a data error
    pub errors: usize,
    /// Series too short for any enabled detector
    pub skipped: usize,
    pub found: usize,
    pub cancelled: bool,
    pub jobs: Vec<ScanJob>,
    pub timestamp: DateTime<Utc>,
}

enum JobOutcome {
    Matched(Vec<ScanMatch>),
    Skipped { bars: usize, needed: usize },
    Failed(DataError),
    Cancelled,
}

enum JobEvent {
    Started(usize),
    Finished(usize, JobOutcome),
}

/// Runs setup detection over a symbol universe with bounded concurrency.
#[derive(Clone)]
pub struct ScanOrchestrator {
    source: Arc<dyn SeriesSource>,
    continuity: Option<Arc<ContinuityEvaluator>>,
    combos: Arc<ComboTable>,
    settings: ScanSettings,
}

impl ScanOrchestrator {
    pub fn new(source: Arc<dyn SeriesSource>, settings: ScanSettings) -> Result<Self, ComboTableError> {
        Ok(Self::with_combo_table(
            source,
            settings,
            Arc::new(ComboTable::standard()?),
        ))
    }

    pub fn with_combo_table(
        source: Arc<dyn SeriesSource>,
        settings: ScanSettings,
        combos: Arc<ComboTable>,
    ) -> Self {
        Self {
            source,
            continuity: None,
            combos,
            settings,
        }
    }

    /// Attach a continuity direction to every match.
    pub fn with_continuity(mut self, evaluator: ContinuityEvaluator) -> Self {
        self.continuity = Some(Arc::new(evaluator));
        self
    }

    /// Scan every symbol once. Per-symbol failures are counted, never
    /// propagated; `progress` receives a snapshot each time a job settles.
    pub async fn scan(
        &self,
        request: ScanRequest,
        progress: Option<mpsc::UnboundedSender<ScanProgress>>,
        cancel: CancelSignal,
    ) -> ScanReport {
        let symbols = unique_symbols(&request.symbols);
        let total = symbols.len();
        let timeframe = request.timeframe;
        let detectors = Arc::new(build_detectors(
            &request.setups,
            self.settings.inside_policy,
            self.settings.combo_span,
            Arc::clone(&self.combos),
        ));
        let concurrency = request
            .concurrency
            .unwrap_or_else(|| default_concurrency(total))
            .max(1);

        info!(
            "Starting {} scan: {} symbols, {} setups, concurrency={}",
            timeframe,
            total,
            detectors.len(),
            concurrency
        );

        let mut jobs: Vec<ScanJob> = symbols.iter().map(|s| ScanJob::new(s.as_str())).collect();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for (idx, symbol) in symbols.into_iter().enumerate() {
            let this = self.clone();
            let detectors = Arc::clone(&detectors);
            let semaphore = Arc::clone(&semaphore);
            let events_tx = events_tx.clone();
            let mut cancel = cancel.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else { return };
                if cancel.is_cancelled() {
                    return;
                }

                let _ = events_tx.send(JobEvent::Started(idx));
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => JobOutcome::Cancelled,
                    outcome = this.run_job(&symbol, timeframe, &detectors) => outcome,
                };
                let _ = events_tx.send(JobEvent::Finished(idx, outcome));
            });
        }
        drop(events_tx);

        let mut matches = Vec::new();
        let (mut processed, mut errors, mut skipped) = (0usize, 0usize, 0usize);

        // Ends once every worker has dropped its sender.
        while let Some(event) = events.recv().await {
            let (idx, outcome) = match event {
                JobEvent::Started(idx) => {
                    if let Err(e) = jobs[idx].start() {
                        debug!("{}", e);
                    }
                    continue;
                }
                JobEvent::Finished(idx, outcome) => (idx, outcome),
            };

            let job = &mut jobs[idx];
            let settled = processed + errors + 1;
            let transition = match outcome {
                JobOutcome::Matched(found) => {
                    processed += 1;
                    debug!("[{}/{}] {} => {} matches", settled, total, job.symbol, found.len());
                    matches.extend(found);
                    job.finish()
                }
                JobOutcome::Skipped { bars, needed } => {
                    processed += 1;
                    skipped += 1;
                    debug!(
                        "[{}/{}] {} skipped: {} bars, need {}",
                        settled, total, job.symbol, bars, needed
                    );
                    job.finish()
                }
                JobOutcome::Failed(e) => {
                    errors += 1;
                    warn!("[{}/{}] {} failed: {}", settled, total, job.symbol, e);
                    job.fail(e.to_string())
                }
                JobOutcome::Cancelled => job.fail("cancelled"),
            };
            if let Err(e) = transition {
                debug!("{}", e);
            }

            if let Some(tx) = &progress {
                let settled = processed + errors;
                let _ = tx.send(ScanProgress {
                    processed,
                    found: matches.len(),
                    errors,
                    skipped,
                    total,
                    percent: if total == 0 {
                        100.0
                    } else {
                        settled as f64 / total as f64 * 100.0
                    },
                    symbol: job.symbol.clone(),
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Scan task error: {}", e);
            }
        }
        for job in jobs.iter_mut().filter(|j| j.status() == JobStatus::Running) {
            let _ = job.fail("worker aborted");
        }

        sort_matches(&mut matches);
        let cancelled = cancel.is_cancelled();
        let found = matches.len();

        info!(
            "Scan complete: {} matches, {}/{} processed, {} errors, {} skipped{}",
            found,
            processed,
            total,
            errors,
            skipped,
            if cancelled { " (cancelled)" } else { "" }
        );

        ScanReport {
            timeframe,
            matches,
            total,
            processed,
            errors,
            skipped,
            found,
            cancelled,
            jobs,
            timestamp: Utc::now(),
        }
    }

    async fn run_job(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        detectors: &[Arc<dyn SetupDetector>],
    ) -> JobOutcome {
        let series = match self.source.fetch(symbol, timeframe).await {
            Ok(series) => sanitize_series(&series),
            Err(e) => return JobOutcome::Failed(e),
        };

        let needed = detectors.iter().map(|d| d.min_bars()).min().unwrap_or(2);
        if series.len() < needed {
            return JobOutcome::Skipped {
                bars: series.len(),
                needed,
            };
        }

        let widest = detectors.iter().map(|d| d.min_bars()).max().unwrap_or(needed);
        let tail = series.tail(self.settings.tail_bars.max(widest));
        let classified = classify_series(&tail, self.settings.inside_policy);

        let hits: Vec<_> = detectors
            .iter()
            .filter(|d| classified.len() >= d.min_bars())
            .filter_map(|d| d.detect(&classified))
            .collect();
        if hits.is_empty() {
            return JobOutcome::Matched(Vec::new());
        }

        let continuity = match &self.continuity {
            Some(evaluator) => evaluator.check(symbol).await,
            None => None,
        };

        JobOutcome::Matched(
            hits.into_iter()
                .map(|hit| ScanMatch::from_hit(&classified.series, hit, continuity))
                .collect(),
        )
    }
}
