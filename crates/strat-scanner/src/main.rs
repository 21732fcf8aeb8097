//! strat-scanner: scan a symbol universe for bar-structure setups.
//!
//! Usage:
//!   cargo run -p strat-scanner -- --symbols AAPL,MSFT,NVDA
//!   cargo run -p strat-scanner -- --timeframe weekly --setups inside,combo3
//!   cargo run -p strat-scanner -- --timeframe monthly --continuity --json

use anyhow::{Context, Result};
use bar_structure::{InsidePolicy, SetupKind};
use clap::Parser;
use market_data::MarketData;
use multi_timeframe::ContinuityEvaluator;
use polygon_client::PolygonClient;
use scan_core::{ScanMatch, SeriesSource, SetupDetails, Timeframe};
use scan_orchestrator::{
    cancellation, ScanConfig, ScanOrchestrator, ScanProgress, ScanReport, ScanRequest, ScanSettings,
};
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_SYMBOLS: &[&str] = &[
    // Indexes
    "SPY", "QQQ", "IWM", "DIA",
    // Technology
    "AAPL", "MSFT", "GOOGL", "NVDA", "META", "AVGO", "ORCL", "CRM", "AMD", "ADBE",
    "INTC", "CSCO", "QCOM",
    // Healthcare
    "JNJ", "UNH", "PFE", "ABBV", "MRK", "LLY",
    // Financials
    "JPM", "BAC", "GS", "V", "MA", "WFC",
    // Energy
    "XOM", "CVX", "COP",
    // Consumer
    "AMZN", "TSLA", "HD", "NKE", "MCD", "COST", "WMT", "PG", "KO", "PEP",
    // Industrials
    "CAT", "BA", "GE", "UPS",
    // Communications
    "NFLX", "DIS", "T", "VZ",
];

#[derive(Parser, Debug)]
#[command(version, about = "Scan a symbol universe for bar-structure setups")]
struct Cli {
    /// Comma-separated symbols; defaults to the built-in universe
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// daily, weekly, monthly, quarterly or yearly
    #[arg(long, short, default_value = "daily")]
    timeframe: Timeframe,

    /// Comma-separated setups (inside, hammer, 2d-green, combo2, combo3); all when omitted
    #[arg(long, value_delimiter = ',')]
    setups: Vec<SetupKind>,

    /// Parallel symbol fetches (overrides SCAN_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Attach daily/weekly/monthly continuity to each match
    #[arg(long)]
    continuity: bool,

    /// strict or inclusive (overrides SCAN_INSIDE_POLICY)
    #[arg(long)]
    inside_policy: Option<InsidePolicy>,

    /// Build weekly and monthly bars from daily data
    #[arg(long)]
    resample: bool,

    /// Print one JSON object per match instead of a table
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "strat_scanner=info,scan_orchestrator=info,market_data=warn".into()
        })
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr so --json output stays machine-readable
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = ScanConfig::from_env().context("invalid scan configuration")?;
    if cli.concurrency.is_some() {
        config.concurrency = cli.concurrency;
    }
    if let Some(policy) = cli.inside_policy {
        config.inside_policy = policy;
    }
    config.continuity |= cli.continuity;
    config.resample_from_daily |= cli.resample;
    config.validate().context("invalid scan configuration")?;

    let api_key = config
        .polygon_api_key
        .clone()
        .context("POLYGON_API_KEY not set")?;
    let polygon = match config.polygon_rate_limit {
        Some(per_minute) => PolygonClient::with_rate_limit(api_key, per_minute),
        None => PolygonClient::new(api_key),
    };
    let source: Arc<dyn SeriesSource> =
        Arc::new(MarketData::new(Arc::new(polygon), config.market_data()));

    let mut orchestrator = ScanOrchestrator::new(Arc::clone(&source), ScanSettings::from(&config))
        .context("combo table is invalid")?;
    if config.continuity {
        orchestrator = orchestrator.with_continuity(ContinuityEvaluator::new(source));
    }

    let symbols = if cli.symbols.is_empty() {
        DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
    } else {
        cli.symbols
    };
    let setups = if cli.setups.is_empty() {
        SetupKind::all()
    } else {
        cli.setups
    };
    let request = ScanRequest::new(symbols, cli.timeframe)
        .with_setups(setups)
        .with_concurrency(config.concurrency);

    let (cancel, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received SIGINT, cancelling scan");
            cancel.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ScanProgress>();
    let printer = tokio::spawn(async move {
        while let Some(p) = progress_rx.recv().await {
            tracing::info!(
                "[{}/{}] {:.0}% {} (found {}, errors {})",
                p.settled(),
                p.total,
                p.percent,
                p.symbol,
                p.found,
                p.errors
            );
        }
    });

    let report = orchestrator.scan(request, Some(progress_tx), signal).await;
    let _ = printer.await;

    if cli.json {
        for m in &report.matches {
            println!("{}", serde_json::to_string(m)?);
        }
    } else {
        print_summary(&report);
    }

    Ok(())
}

fn detail_text(m: &ScanMatch) -> String {
    match &m.details {
        SetupDetails::InsideBar { change_pct, volume } => {
            format!("change {:+.2}%  vol {:.0}", change_pct, volume)
        }
        SetupDetails::Hammer {
            recovery_pct,
            broke_level,
            ..
        } => format!("broke {:.2}, recovered {:.2}%", broke_level, recovery_pct),
        SetupDetails::TwoDownGreen {
            change_pct,
            break_amount,
            ..
        } => format!("change {:+.2}%  broke by {:.2}", change_pct, break_amount),
        SetupDetails::Combo { labels, .. } => labels.clone(),
    }
}

fn print_summary(report: &ScanReport) {
    println!(
        "{} scan: {} matches across {} symbols ({} processed, {} errors, {} skipped){}",
        report.timeframe,
        report.found,
        report.total,
        report.processed,
        report.errors,
        report.skipped,
        if report.cancelled { " [cancelled]" } else { "" }
    );

    for m in &report.matches {
        let mut flags = Vec::new();
        if m.provisional {
            flags.push("provisional".to_string());
        }
        if m.degraded {
            flags.push("degraded".to_string());
        }
        if let Some(direction) = m.continuity {
            flags.push(format!("continuity {:?}", direction));
        }

        println!(
            "{}  {:<6} {:<28} {:<8} {:>10.2}  {}{}",
            m.reference_date.format("%Y-%m-%d"),
            m.symbol,
            m.setup_name,
            format!("{:?}", m.bias),
            m.reference_price,
            detail_text(m),
            if flags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", flags.join(", "))
            }
        );
    }
}
