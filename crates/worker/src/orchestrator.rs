use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use trindex_core::calendar;
use trindex_core::config::Settings;
use trindex_core::domain::price::RawPriceObservation;
use trindex_core::index::IndexCalculator;
use trindex_core::ingest::limiter::RateLimiter;
use trindex_core::ingest::provider::{EodProvider, HttpEodProvider};
use trindex_core::ingest::runner::{self, IngestOptions};
use trindex_core::reconcile::{self, ReconcilePolicy};
use trindex_core::stats;
use trindex_core::storage::{
    alerts, canonical_prices, index_store, job_runs,
    job_runs::RunStatus,
    pipeline_state::{self, PipelineStateStore, STAGE_COMPLETED, STAGE_ERROR},
    raw_prices,
};
use uuid::Uuid;

const JOB_NAME: &str = "daily_index_run";
const ALERT_DAILY_RUN_FAILED: &str = "daily_run_failed";

const STAGE_INGEST: &str = "INGEST";
const STAGE_RECONCILE: &str = "RECONCILE";
const STAGE_INDEX_CALC: &str = "INDEX_CALC";
const STAGE_STATS: &str = "STATS";

// How many consecutive no-data sessions to probe backward before giving up
// on finding an end date the provider can actually serve.
const MAX_NO_DATA_PROBES: usize = 3;

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    BudgetStop,
    Error(anyhow::Error),
}

pub struct DailyRunConfig {
    pub alert_on_budget_stop: bool,
}

/// One invocation of the daily pipeline:
/// STARTED -> INGEST -> RECONCILE -> INDEX_CALC -> STATS per missing day,
/// ending COMPLETED, BUDGET_STOP, or ERROR. Every write along the way is a
/// natural-key upsert, so a killed run converges on restart.
pub async fn run_daily(
    pool: &sqlx::PgPool,
    settings: &Settings,
    cfg: &DailyRunConfig,
) -> RunOutcome {
    let now = Utc::now();
    let provider_name = settings.provider_name.clone();

    // Budget first: zero provider calls happen before this is known.
    let used_today = match job_runs::calls_used_today(pool, &provider_name, now).await {
        Ok(n) => n,
        Err(err) => return RunOutcome::Error(err),
    };
    let max_calls = job_runs::compute_max_provider_calls(
        settings.daily_call_limit,
        used_today,
        settings.daily_call_buffer,
    );

    let state_store = pipeline_state::select_store(pool, settings.pipeline_state_dir.as_deref()).await;

    let run_id = match resume_or_start(
        pool,
        state_store.as_ref(),
        settings,
        &provider_name,
        max_calls,
        used_today,
        now.date_naive(),
    )
    .await
    {
        Ok(id) => id,
        Err(err) => return RunOutcome::Error(err),
    };

    if max_calls == 0 {
        tracing::warn!(
            %run_id,
            used_today,
            daily_limit = settings.daily_call_limit,
            buffer = settings.daily_call_buffer,
            "provider call budget exhausted before start; stopping"
        );
        if let Err(err) = job_runs::finish_run(pool, run_id, RunStatus::BudgetStop, 0, None).await {
            return RunOutcome::Error(err);
        }
        if cfg.alert_on_budget_stop {
            send_alert_once(pool, "BUDGET_STOP", &format!("run {run_id}: budget stop at start"))
                .await;
        }
        return RunOutcome::BudgetStop;
    }

    let limiter = match RateLimiter::new(
        &provider_name,
        settings.calls_per_window,
        settings.window_secs,
    ) {
        Ok(l) => Arc::new(l.with_pool(pool.clone()).with_run_cap(max_calls)),
        Err(err) => return RunOutcome::Error(err),
    };
    let provider = match HttpEodProvider::from_settings(settings, limiter.clone()) {
        Ok(p) => p,
        Err(err) => {
            let _ = job_runs::finish_run(pool, run_id, RunStatus::Error, 0, None).await;
            return RunOutcome::Error(err);
        }
    };

    let result = drive_pipeline(pool, settings, &provider, state_store.as_ref(), run_id).await;
    let calls_used = limiter.calls_made();

    match result {
        Ok(days_processed) => {
            let status = if limiter.budget_exhausted() {
                RunStatus::BudgetStop
            } else {
                RunStatus::Completed
            };
            let summary = json!({"days_processed": days_processed, "calls_used": calls_used});
            if let Err(err) =
                job_runs::finish_run(pool, run_id, status, calls_used, Some(summary)).await
            {
                return RunOutcome::Error(err);
            }
            tracing::info!(%run_id, days_processed, calls_used, status = status.as_str(), "daily run finished");
            match status {
                RunStatus::BudgetStop => {
                    if cfg.alert_on_budget_stop {
                        send_alert_once(pool, "BUDGET_STOP", &format!("run {run_id}: budget stop mid-run"))
                            .await;
                    }
                    RunOutcome::BudgetStop
                }
                _ => RunOutcome::Completed,
            }
        }
        Err((stage, err)) => {
            let summary = json!({"failed_stage": stage, "error": format!("{err:#}")});
            let _ = job_runs::finish_run(pool, run_id, RunStatus::Error, calls_used, Some(summary))
                .await;
            let detail = format!("run {run_id} stage {stage}: {}", truncate(&format!("{err:#}"), 300));
            tracing::error!(%run_id, stage, error = %err, "daily run failed");
            send_alert_once(pool, "ERROR", &detail).await;
            RunOutcome::Error(err)
        }
    }
}

async fn resume_or_start(
    pool: &sqlx::PgPool,
    state_store: &dyn PipelineStateStore,
    settings: &Settings,
    provider_name: &str,
    max_calls: u32,
    used_today: u32,
    today: NaiveDate,
) -> Result<Uuid> {
    if let Some(run_id) = state_store.fetch_resume_run_id(today).await? {
        let stages = state_store.fetch_stage_statuses(run_id).await?;
        tracing::info!(%run_id, stages = stages.len(), "resuming unfinished run from earlier today");
        return Ok(run_id);
    }

    job_runs::start_run(
        pool,
        JOB_NAME,
        provider_name,
        max_calls,
        settings.daily_call_limit,
        used_today,
        settings.daily_call_buffer,
    )
    .await
}

/// Runs the per-day stage sequence for every missing trading day up to the
/// eligible end date. Returns the number of days fully processed, or the
/// failing stage name with its error.
async fn drive_pipeline(
    pool: &sqlx::PgPool,
    settings: &Settings,
    provider: &HttpEodProvider,
    state_store: &dyn PipelineStateStore,
    run_id: Uuid,
) -> std::result::Result<usize, (&'static str, anyhow::Error)> {
    let today = Utc::now().date_naive();

    let days = calendar::refresh_trading_days(pool, provider, &settings.probe_symbol)
        .await
        .map_err(|e| (STAGE_INGEST, e))?;

    let provider_latest = match days.iter().next_back() {
        Some(d) => *d,
        None => return Ok(0),
    };
    let eligible_end =
        match calendar::compute_eligible_end_date(provider_latest, today, &days) {
            Some(d) => d,
            None => {
                tracing::info!("no eligible end date; nothing to process");
                return Ok(0);
            }
        };

    let eligible_end = resolve_end_with_fallback(provider, settings, &days, eligible_end)
        .await
        .map_err(|e| (STAGE_INGEST, e))?;
    let Some(eligible_end) = eligible_end else {
        tracing::info!("provider has no data for recent sessions; nothing to process");
        return Ok(0);
    };

    let mut last_processed = index_store::latest_level_date(pool, &settings.index_code)
        .await
        .map_err(|e| (STAGE_INDEX_CALC, e))?;

    let mut days_processed = 0usize;
    while let Some(day) = calendar::select_next_missing_day(&days, last_processed) {
        if day > eligible_end {
            break;
        }
        if provider.budget_exhausted() {
            tracing::warn!(%day, "budget exhausted before processing day; stopping");
            break;
        }

        match process_one_day(pool, settings, provider, state_store, run_id, day, &days).await? {
            DayStatus::Processed => {
                days_processed += 1;
                last_processed = Some(day);
            }
            // No level was written, so the next run re-selects this day and
            // re-ingests the missing tickers before any index math runs.
            DayStatus::BudgetStopped => break,
        }
    }

    Ok(days_processed)
}

enum DayStatus {
    Processed,
    BudgetStopped,
}

async fn process_one_day(
    pool: &sqlx::PgPool,
    settings: &Settings,
    provider: &HttpEodProvider,
    state_store: &dyn PipelineStateStore,
    run_id: Uuid,
    day: NaiveDate,
    days: &BTreeSet<NaiveDate>,
) -> std::result::Result<DayStatus, (&'static str, anyhow::Error)> {
    let ingest = run_stage(state_store, run_id, STAGE_INGEST, day, async {
        let tickers = index_store::tickers_for_day(pool, &settings.index_code, day).await?;
        anyhow::ensure!(
            !tickers.is_empty(),
            "no constituent universe for {day}; seed index_universe_ranked"
        );
        let opts = IngestOptions {
            end_date: day,
            start_override: None,
            backfill: false,
        };
        let outcome = runner::ingest_tickers(pool, provider, &tickers, &opts).await?;
        tracing::info!(
            %day,
            ok = outcome.tickers_ok,
            failed = outcome.tickers_failed,
            rows = outcome.rows_upserted,
            "ingest stage done"
        );
        Ok(outcome)
    })
    .await?;

    // An incomplete ingest must not reach the index math: a level computed
    // from partial data would anchor the chain and never be recomputed.
    if ingest.budget_exhausted {
        tracing::warn!(%day, "ingest stopped on budget; deferring day to the next run");
        return Ok(DayStatus::BudgetStopped);
    }

    run_stage(
        state_store,
        run_id,
        STAGE_RECONCILE,
        day,
        reconcile_day(pool, settings, day),
    )
    .await?;

    run_stage(state_store, run_id, STAGE_INDEX_CALC, day, async {
        let rebalance = calendar::is_first_trading_day_of_month(day, days);
        let calc = IndexCalculator::new(pool.clone(), &settings.index_code);
        let result = calc.process_day(day, rebalance).await?;
        tracing::info!(
            %day,
            level = result.level_tr,
            n_imputed = result.n_imputed,
            rebalanced = result.rebalanced,
            "index calc stage done"
        );
        Ok(())
    })
    .await?;

    run_stage(state_store, run_id, STAGE_STATS, day, async {
        stats::compute_for_day(pool, &settings.index_code, day).await?;
        Ok(())
    })
    .await?;

    Ok(DayStatus::Processed)
}

pub async fn reconcile_day(
    pool: &sqlx::PgPool,
    settings: &Settings,
    day: NaiveDate,
) -> Result<()> {
    let raw = raw_prices::load_for_date(pool, day).await?;
    let policy = ReconcilePolicy::new(
        &settings.primary_provider,
        settings.divergence_tolerance,
        expected_provider_count(&raw),
    );

    let mut tickers: Vec<&str> = raw.iter().map(|r| r.ticker.as_str()).collect();
    tickers.sort_unstable();
    tickers.dedup();

    let mut canonical = Vec::with_capacity(tickers.len());
    for ticker in tickers {
        if let Some(row) = reconcile::reconcile(ticker, day, &raw, &policy) {
            canonical.push(row);
        }
    }

    let written = canonical_prices::upsert_canonical(pool, &canonical).await?;
    tracing::info!(%day, canonical = canonical.len(), written, "reconcile stage done");
    Ok(())
}

/// Coverage expectation for the day: every provider that reported anything,
/// including pure ERROR rows. A ticker covered by fewer providers than this
/// comes out LOW even when its single source looks clean.
fn expected_provider_count(rows: &[RawPriceObservation]) -> usize {
    let mut providers: Vec<&str> = rows.iter().map(|r| r.provider.as_str()).collect();
    providers.sort_unstable();
    providers.dedup();
    providers.len().max(1)
}

async fn run_stage<T, Fut>(
    state_store: &dyn PipelineStateStore,
    run_id: Uuid,
    stage: &'static str,
    day: NaiveDate,
    fut: Fut,
) -> std::result::Result<T, (&'static str, anyhow::Error)>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    let details = json!({"day": day});
    state_store
        .record_stage_start(run_id, stage, Some(details.clone()))
        .await
        .map_err(|e| (stage, e))?;

    match fut.await {
        Ok(val) => {
            state_store
                .record_stage_end(run_id, stage, STAGE_COMPLETED, Some(details))
                .await
                .map_err(|e| (stage, e))?;
            Ok(val)
        }
        Err(err) => {
            let detail = json!({"day": day, "error": truncate(&format!("{err:#}"), 300)});
            let _ = state_store
                .record_stage_end(run_id, stage, STAGE_ERROR, Some(detail))
                .await;
            Err((stage, err))
        }
    }
}

/// Probe-with-fallback for the end date: the provider sometimes lags the
/// calendar by a session or two, so walk backward through trading days until
/// a session it can serve, bounded by `MAX_NO_DATA_PROBES`.
async fn resolve_end_with_fallback(
    provider: &HttpEodProvider,
    settings: &Settings,
    days: &BTreeSet<NaiveDate>,
    candidate: NaiveDate,
) -> Result<Option<NaiveDate>> {
    let mut current = Some(candidate);
    for _ in 0..MAX_NO_DATA_PROBES {
        let Some(day) = current else { break };
        if provider.budget_exhausted() {
            return Ok(None);
        }
        match provider
            .fetch_single_day(&settings.probe_symbol, day)
            .await?
        {
            Some(_) => return Ok(Some(day)),
            None => {
                tracing::info!(%day, "provider has no data for session; falling back one day");
                current = days.range(..day).next_back().copied();
            }
        }
    }
    Ok(None)
}

async fn send_alert_once(pool: &sqlx::PgPool, status: &str, detail: &str) {
    match alerts::should_send_alert_once_per_day(
        pool,
        ALERT_DAILY_RUN_FAILED,
        status,
        Some(detail),
        Utc::now(),
    )
    .await
    {
        Ok(true) => {
            sentry::capture_message(detail, sentry::Level::Error);
            tracing::error!(alert = ALERT_DAILY_RUN_FAILED, detail, "alert sent");
        }
        Ok(false) => {
            tracing::info!(alert = ALERT_DAILY_RUN_FAILED, "alert suppressed (already sent today)");
        }
        Err(err) => {
            // Alerting must never turn a failed run into a crash loop.
            tracing::warn!(error = %err, "alert gate unavailable; capturing without suppression");
            sentry::capture_message(detail, sentry::Level::Error);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use trindex_core::domain::price::{Bar, ObservationStatus};

    fn obs(ticker: &str, provider: &str) -> RawPriceObservation {
        let bar = Bar {
            trade_date: NaiveDate::from_ymd_opt(2025, 6, 12).unwrap(),
            close: 10.0,
            adj_close: Some(10.0),
            volume: None,
            currency: None,
        };
        RawPriceObservation::from_bar(ticker, provider, &bar)
    }

    #[test]
    fn expected_coverage_counts_distinct_providers() {
        let rows = vec![
            obs("AAA", "alpha"),
            obs("BBB", "alpha"),
            obs("AAA", "beta"),
        ];
        assert_eq!(expected_provider_count(&rows), 2);
    }

    #[test]
    fn error_only_providers_still_count_toward_coverage() {
        let mut rows = vec![obs("AAA", "alpha")];
        rows.push(RawPriceObservation::error_row(
            "AAA",
            "beta",
            NaiveDate::from_ymd_opt(2025, 6, 12).unwrap(),
            "timeout",
        ));
        assert_eq!(rows[1].status, ObservationStatus::Error);
        assert_eq!(expected_provider_count(&rows), 2);
    }

    #[test]
    fn empty_day_still_expects_one_provider() {
        assert_eq!(expected_provider_count(&[]), 1);
    }
}
