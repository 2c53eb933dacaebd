use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use std::time::Duration;

// Advisory locks are scoped to the Postgres session. Two uses here: a
// per-provider lock serializing rate-limit token bookkeeping across
// processes, and a best-effort guard against concurrent daily runs for the
// same trade date.
const LOCK_NAMESPACE: i64 = 0x5452_4944_58; // "TRIDX"

fn lock_key_for_provider(provider: &str) -> i64 {
    provider
        .bytes()
        .fold(LOCK_NAMESPACE, |acc, b| acc.wrapping_mul(31) ^ (b as i64))
}

fn lock_key_for_date(day: NaiveDate) -> i64 {
    LOCK_NAMESPACE ^ (day.num_days_from_ce() as i64)
}

async fn try_lock(pool: &sqlx::PgPool, key: i64) -> anyhow::Result<bool> {
    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(key)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;
    Ok(acquired.0)
}

async fn unlock(pool: &sqlx::PgPool, key: i64) -> anyhow::Result<()> {
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .persistent(false)
        .bind(key)
        .execute(pool)
        .await
        .with_context(|| format!("failed to release advisory lock (key={key})"))?;
    Ok(())
}

/// Blocking acquire of the provider token-bookkeeping lock. The critical
/// section is a single counter update, so contention is short; waiting is
/// still attempt-bounded to rule out an unbounded stall.
pub async fn acquire_provider_lock(pool: &sqlx::PgPool, provider: &str) -> anyhow::Result<()> {
    let key = lock_key_for_provider(provider);
    let max_attempts = 200;
    for _ in 0..max_attempts {
        if try_lock(pool, key).await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("provider lock for {provider} not acquired after {max_attempts} attempts")
}

pub async fn release_provider_lock(pool: &sqlx::PgPool, provider: &str) -> anyhow::Result<()> {
    unlock(pool, lock_key_for_provider(provider)).await
}

pub async fn try_acquire_run_date_lock(
    pool: &sqlx::PgPool,
    day: NaiveDate,
) -> anyhow::Result<bool> {
    try_lock(pool, lock_key_for_date(day)).await
}

pub async fn release_run_date_lock(pool: &sqlx::PgPool, day: NaiveDate) -> anyhow::Result<()> {
    unlock(pool, lock_key_for_date(day)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_keys_are_distinct_and_stable() {
        let a = lock_key_for_provider("twelvedata");
        let b = lock_key_for_provider("polygon");
        assert_ne!(a, b);
        assert_eq!(a, lock_key_for_provider("twelvedata"));
    }
}
