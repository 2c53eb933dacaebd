use anyhow::Context;
use chrono::{DateTime, NaiveTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started,
    Completed,
    Error,
    BudgetStop,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "STARTED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Error => "ERROR",
            RunStatus::BudgetStop => "BUDGET_STOP",
        }
    }
}

/// Today's remaining provider-call budget. Zero means the run must not issue
/// a single provider call.
pub fn compute_max_provider_calls(daily_limit: u32, used_today: u32, buffer: u32) -> u32 {
    daily_limit.saturating_sub(used_today).saturating_sub(buffer)
}

/// Sum of provider calls across all runs started since 00:00 UTC.
pub async fn calls_used_today(
    pool: &sqlx::PgPool,
    provider: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<u32> {
    let midnight = now
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc();

    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT sum(provider_calls_used)::bigint FROM job_runs \
         WHERE provider = $1 AND started_at >= $2",
    )
    .persistent(false)
    .bind(provider)
    .bind(midnight)
    .fetch_one(pool)
    .await
    .context("calls_used_today query failed")?;

    Ok(row.0.unwrap_or(0).max(0) as u32)
}

/// Writes the immutable START row capturing the computed budget and the
/// usage snapshot it was derived from.
#[allow(clippy::too_many_arguments)]
pub async fn start_run(
    pool: &sqlx::PgPool,
    job_name: &str,
    provider: &str,
    max_provider_calls: u32,
    daily_limit: u32,
    used_before: u32,
    buffer: u32,
) -> anyhow::Result<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO job_runs \
         (run_id, job_name, provider, started_at, status, provider_calls_used, \
          max_provider_calls, usage_daily_limit, usage_used_before, usage_buffer) \
         VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9)",
    )
    .persistent(false)
    .bind(run_id)
    .bind(job_name)
    .bind(provider)
    .bind(Utc::now())
    .bind(RunStatus::Started.as_str())
    .bind(max_provider_calls as i32)
    .bind(daily_limit as i32)
    .bind(used_before as i32)
    .bind(buffer as i32)
    .execute(pool)
    .await
    .context("insert job_runs failed")?;
    Ok(run_id)
}

/// Terminal update of the START row. Never creates a second row.
pub async fn finish_run(
    pool: &sqlx::PgPool,
    run_id: Uuid,
    status: RunStatus,
    provider_calls_used: u32,
    summary: Option<Value>,
) -> anyhow::Result<()> {
    let res = sqlx::query(
        "UPDATE job_runs \
         SET status = $2, ended_at = $3, provider_calls_used = $4, summary = $5 \
         WHERE run_id = $1",
    )
    .persistent(false)
    .bind(run_id)
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(provider_calls_used as i32)
    .bind(summary)
    .execute(pool)
    .await
    .context("update job_runs failed")?;

    anyhow::ensure!(
        res.rows_affected() == 1,
        "finish_run updated {} rows for run_id {run_id}",
        res.rows_affected()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_math_clamps_at_zero() {
        // dailyLimit=800, used=780, buffer=25 -> 0, not negative.
        assert_eq!(compute_max_provider_calls(800, 780, 25), 0);
        assert_eq!(compute_max_provider_calls(800, 100, 25), 675);
        assert_eq!(compute_max_provider_calls(800, 900, 25), 0);
    }
}
