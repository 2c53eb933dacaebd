use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trindex_core::calendar;
use trindex_core::config::Settings;
use trindex_core::ingest::limiter::RateLimiter;
use trindex_core::ingest::provider::HttpEodProvider;
use trindex_core::ingest::runner::{self, IngestOptions};
use trindex_core::stats;
use trindex_core::storage::{self, index_store, lock, trading_days};

mod orchestrator;

// Exit codes consumed by the scheduler: 0 = completed (budget stops are a
// normal outcome), 2 = preflight failure (config or database unreachable),
// 1 = anything else.
const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_PREFLIGHT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "trindex_worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Full daily pipeline: calendar refresh, ingest, reconcile, index
    /// calculation, and stats for every missing trading day.
    RunDaily {
        /// Also alert when the run stops on budget exhaustion (normally a
        /// silent, expected outcome).
        #[arg(long)]
        alert_on_budget_stop: bool,
    },

    /// Ad hoc raw-price ingest for an explicit date or range.
    Ingest {
        /// Single trading date (YYYY-MM-DD). Mutually exclusive with --start/--end.
        #[arg(long, conflicts_with_all = ["start", "end"])]
        date: Option<String>,

        #[arg(long, requires = "end")]
        start: Option<String>,

        #[arg(long, requires = "start")]
        end: Option<String>,

        /// Comma-separated tickers. Defaults to the current index universe.
        #[arg(long)]
        tickers: Option<String>,

        /// Hard cap on provider calls for this invocation.
        #[arg(long)]
        max_provider_calls: Option<u32>,

        /// Refetch the whole range, ignoring per-ticker resume points.
        #[arg(long)]
        backfill: bool,
    },

    /// Refresh the trading-day calendar from the probe symbol.
    UpdateTradingDays {
        /// Seed from this date (YYYY-MM-DD) through today instead of the
        /// recent-window probe.
        #[arg(long, conflicts_with = "auto")]
        start: Option<String>,

        /// Probe the recent window. This is also the default when --start is
        /// absent.
        #[arg(long)]
        auto: bool,
    },

    /// Recompute derived stats over already-computed index levels.
    RecomputeStats {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(EXIT_PREFLIGHT);
        }
    };
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let cli = Cli::parse();

    let pool = match preflight(&settings).await {
        Ok(pool) => pool,
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "preflight failed");
            return ExitCode::from(EXIT_PREFLIGHT);
        }
    };

    let code = match cli.command {
        Command::RunDaily { alert_on_budget_stop } => {
            run_daily_cmd(&pool, &settings, alert_on_budget_stop).await
        }
        Command::Ingest {
            date,
            start,
            end,
            tickers,
            max_provider_calls,
            backfill,
        } => to_exit(
            ingest_cmd(&pool, &settings, date, start, end, tickers, max_provider_calls, backfill)
                .await,
        ),
        Command::UpdateTradingDays { start, auto: _ } => {
            to_exit(update_trading_days_cmd(&pool, &settings, start).await)
        }
        Command::RecomputeStats { start, end } => {
            to_exit(recompute_stats_cmd(&pool, &settings, &start, &end).await)
        }
    };
    ExitCode::from(code)
}

/// Config and database checks that must pass before any command runs. A
/// migration failure is alerted through the suppressor (the pool is alive at
/// that point); a connect failure can only reach sentry.
async fn preflight(settings: &Settings) -> Result<sqlx::PgPool> {
    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    if let Err(err) = storage::migrate(&pool).await {
        let detail = format!("{err:#}");
        match storage::alerts::should_send_alert_once_per_day(
            &pool,
            "preflight_failed",
            "ERROR",
            Some(&detail),
            Utc::now(),
        )
        .await
        {
            Ok(true) => {
                sentry::capture_message(&detail, sentry::Level::Error);
            }
            Ok(false) => {
                tracing::info!("preflight alert suppressed (already sent today)");
            }
            Err(gate_err) => {
                tracing::warn!(error = %gate_err, "alert gate unavailable during preflight");
                sentry::capture_message(&detail, sentry::Level::Error);
            }
        }
        return Err(err);
    }
    Ok(pool)
}

async fn run_daily_cmd(pool: &sqlx::PgPool, settings: &Settings, alert_on_budget_stop: bool) -> u8 {
    let today = Utc::now().date_naive();

    let acquired = match lock::try_acquire_run_date_lock(pool, today).await {
        Ok(a) => a,
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "run-date lock check failed");
            return EXIT_ERROR;
        }
    };
    if !acquired {
        tracing::warn!(%today, "run-date lock not acquired; another run in progress");
        return EXIT_OK;
    }

    let cfg = orchestrator::DailyRunConfig { alert_on_budget_stop };
    let outcome = orchestrator::run_daily(pool, settings, &cfg).await;
    let _ = lock::release_run_date_lock(pool, today).await;

    match outcome {
        orchestrator::RunOutcome::Completed | orchestrator::RunOutcome::BudgetStop => EXIT_OK,
        orchestrator::RunOutcome::Error(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "daily run failed");
            EXIT_ERROR
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingest_cmd(
    pool: &sqlx::PgPool,
    settings: &Settings,
    date: Option<String>,
    start: Option<String>,
    end: Option<String>,
    tickers: Option<String>,
    max_provider_calls: Option<u32>,
    backfill: bool,
) -> Result<()> {
    let (range_start, range_end) = match (date, start, end) {
        (Some(d), _, _) => {
            let d = parse_date(&d)?;
            (Some(d), d)
        }
        (None, Some(a), Some(b)) => (Some(parse_date(&a)?), parse_date(&b)?),
        _ => anyhow::bail!("either --date or both --start and --end are required"),
    };

    let mut limiter = RateLimiter::new(
        &settings.provider_name,
        settings.calls_per_window,
        settings.window_secs,
    )?
    .with_pool(pool.clone());
    if let Some(cap) = max_provider_calls {
        limiter = limiter.with_run_cap(cap);
    }
    let provider = HttpEodProvider::from_settings(settings, Arc::new(limiter))?;

    let tickers: Vec<String> = match tickers {
        Some(list) => list
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        None => index_store::tickers_for_day(pool, &settings.index_code, range_end).await?,
    };
    anyhow::ensure!(!tickers.is_empty(), "no tickers to ingest");

    let opts = IngestOptions {
        end_date: range_end,
        start_override: range_start,
        backfill,
    };
    let outcome = runner::ingest_tickers(pool, &provider, &tickers, &opts).await?;
    tracing::info!(
        ok = outcome.tickers_ok,
        failed = outcome.tickers_failed,
        skipped = outcome.tickers_skipped,
        rows = outcome.rows_upserted,
        budget_exhausted = outcome.budget_exhausted,
        "ingest finished"
    );
    Ok(())
}

async fn update_trading_days_cmd(
    pool: &sqlx::PgPool,
    settings: &Settings,
    start: Option<String>,
) -> Result<()> {
    let limiter = RateLimiter::new(
        &settings.provider_name,
        settings.calls_per_window,
        settings.window_secs,
    )?
    .with_pool(pool.clone());
    let provider = HttpEodProvider::from_settings(settings, Arc::new(limiter))?;

    match start {
        Some(s) => {
            let start = parse_date(&s)?;
            let today = Utc::now().date_naive();
            let inserted =
                calendar::seed_trading_days(pool, &provider, &settings.probe_symbol, start, today)
                    .await?;
            tracing::info!(%start, %today, inserted, "trading days seeded");
        }
        None => {
            let days =
                calendar::refresh_trading_days(pool, &provider, &settings.probe_symbol).await?;
            tracing::info!(known_days = days.len(), "trading days refreshed");
        }
    }
    Ok(())
}

async fn recompute_stats_cmd(
    pool: &sqlx::PgPool,
    settings: &Settings,
    start: &str,
    end: &str,
) -> Result<()> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    anyhow::ensure!(start <= end, "start {start} must be <= end {end}");

    let days = trading_days::load_all(pool).await?;
    let mut recomputed = 0usize;
    for day in days.range(start..=end) {
        let row = stats::compute_for_day(pool, &settings.index_code, *day).await?;
        tracing::debug!(day = %day, level = row.level_tr, "stats recomputed");
        recomputed += 1;
    }
    tracing::info!(recomputed, %start, %end, "stats recompute finished");
    Ok(())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date: {s}"))
}

fn to_exit(result: Result<()>) -> u8 {
    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "command failed");
            EXIT_ERROR
        }
    }
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_trading_days_takes_start_or_auto_not_both() {
        assert!(Cli::try_parse_from(["trindex_worker", "update-trading-days"]).is_ok());
        assert!(Cli::try_parse_from(["trindex_worker", "update-trading-days", "--auto"]).is_ok());
        assert!(Cli::try_parse_from([
            "trindex_worker",
            "update-trading-days",
            "--start",
            "2025-01-02"
        ])
        .is_ok());
        assert!(Cli::try_parse_from([
            "trindex_worker",
            "update-trading-days",
            "--start",
            "2025-01-02",
            "--auto"
        ])
        .is_err());
    }
}
