use crate::storage::lock;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Token-window limiter for provider calls: at most `calls_per_window` calls
/// per `window` across all processes sharing the same database. Token
/// bookkeeping is serialized by a Postgres advisory lock held only around the
/// counter update, never around the HTTP round-trip. Without a pool the
/// limiter degrades to in-process accounting behind the same API.
pub struct RateLimiter {
    provider: String,
    calls_per_window: u32,
    window_secs: u64,
    pool: Option<sqlx::PgPool>,
    run_cap: Option<u32>,
    used_this_run: AtomicU32,
    local: tokio::sync::Mutex<LocalWindow>,
}

#[derive(Debug, Default)]
struct LocalWindow {
    window_start: i64,
    calls_used: u32,
}

impl RateLimiter {
    pub fn new(provider: &str, calls_per_window: u32, window_secs: u64) -> Result<Self> {
        anyhow::ensure!(calls_per_window >= 1, "calls_per_window must be >= 1");
        anyhow::ensure!(window_secs >= 1, "window_secs must be >= 1");
        Ok(Self {
            provider: provider.to_string(),
            calls_per_window,
            window_secs,
            pool: None,
            run_cap: None,
            used_this_run: AtomicU32::new(0),
            local: tokio::sync::Mutex::new(LocalWindow::default()),
        })
    }

    pub fn with_pool(mut self, pool: sqlx::PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Hard per-run cap (the daily budget slice computed by the job ledger).
    pub fn with_run_cap(mut self, cap: u32) -> Self {
        self.run_cap = Some(cap);
        self
    }

    pub fn calls_made(&self) -> u32 {
        self.used_this_run.load(Ordering::Relaxed)
    }

    /// Remaining run budget, or `None` when uncapped.
    pub fn budget_remaining(&self) -> Option<u32> {
        self.run_cap
            .map(|cap| cap.saturating_sub(self.calls_made()))
    }

    pub fn budget_exhausted(&self) -> bool {
        self.budget_remaining() == Some(0)
    }

    /// Blocks until a token for the current window is free, then takes it.
    /// Callers are expected to check `budget_remaining` first; exceeding the
    /// run cap here is a caller bug and fails rather than over-spends.
    pub async fn acquire(&self) -> Result<()> {
        anyhow::ensure!(
            !self.budget_exhausted(),
            "provider call budget exhausted (cap={:?})",
            self.run_cap
        );

        loop {
            let now = Utc::now().timestamp();
            let granted = match self.pool.as_ref() {
                Some(pool) => self.try_take_shared(pool, now).await?,
                None => self.try_take_local(now).await,
            };

            if granted {
                self.used_this_run.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let wait = secs_until_window_reset(now, self.window_secs);
            tracing::debug!(
                provider = %self.provider,
                wait_secs = wait,
                "rate window exhausted; waiting for rollover"
            );
            tokio::time::sleep(Duration::from_secs(wait.max(1))).await;
        }
    }

    /// Seconds until the current window rolls over. Used by the HTTP client
    /// to sleep through an upstream 429 instead of generic backoff.
    pub fn secs_until_reset(&self) -> u64 {
        secs_until_window_reset(Utc::now().timestamp(), self.window_secs)
    }

    async fn try_take_shared(&self, pool: &sqlx::PgPool, now: i64) -> Result<bool> {
        let window_start = window_start_utc(now, self.window_secs)?;

        lock::acquire_provider_lock(pool, &self.provider).await?;
        let res = self.bump_window_row(pool, window_start).await;
        let unlock = lock::release_provider_lock(pool, &self.provider).await;
        let granted = res?;
        unlock?;
        Ok(granted)
    }

    async fn bump_window_row(
        &self,
        pool: &sqlx::PgPool,
        window_start: DateTime<Utc>,
    ) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "INSERT INTO provider_call_windows (provider, window_start, calls_used) \
             VALUES ($1, $2, 1) \
             ON CONFLICT (provider, window_start) DO UPDATE \
               SET calls_used = provider_call_windows.calls_used + 1 \
               WHERE provider_call_windows.calls_used < $3 \
             RETURNING calls_used",
        )
        .persistent(false)
        .bind(&self.provider)
        .bind(window_start)
        .bind(self.calls_per_window as i32)
        .fetch_optional(pool)
        .await
        .context("provider_call_windows bump failed")?;

        Ok(row.is_some())
    }

    async fn try_take_local(&self, now: i64) -> bool {
        let window_start = now - now.rem_euclid(self.window_secs as i64);
        let mut guard = self.local.lock().await;
        if guard.window_start != window_start {
            guard.window_start = window_start;
            guard.calls_used = 0;
        }
        if guard.calls_used >= self.calls_per_window {
            return false;
        }
        guard.calls_used += 1;
        true
    }
}

fn secs_until_window_reset(now: i64, window_secs: u64) -> u64 {
    let w = window_secs as i64;
    (w - now.rem_euclid(w)) as u64
}

fn window_start_utc(now: i64, window_secs: u64) -> Result<DateTime<Utc>> {
    let start = now - now.rem_euclid(window_secs as i64);
    Utc.timestamp_opt(start, 0)
        .single()
        .context("invalid window start timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reset_is_bounded_by_window() {
        assert_eq!(secs_until_window_reset(0, 60), 60);
        assert_eq!(secs_until_window_reset(59, 60), 1);
        assert_eq!(secs_until_window_reset(61, 60), 59);
    }

    #[tokio::test]
    async fn local_window_grants_up_to_limit_then_refuses() {
        let limiter = RateLimiter::new("test", 2, 60).unwrap();
        let now = 1_700_000_000;
        assert!(limiter.try_take_local(now).await);
        assert!(limiter.try_take_local(now).await);
        assert!(!limiter.try_take_local(now).await);

        // Next window refills.
        assert!(limiter.try_take_local(now + 60).await);
    }

    #[tokio::test]
    async fn run_cap_counts_down_to_zero() {
        let limiter = RateLimiter::new("test", 10, 60).unwrap().with_run_cap(2);
        assert_eq!(limiter.budget_remaining(), Some(2));
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert!(limiter.budget_exhausted());
        assert!(limiter.acquire().await.is_err());
    }

    #[test]
    fn uncapped_limiter_has_no_budget() {
        let limiter = RateLimiter::new("test", 10, 60).unwrap();
        assert_eq!(limiter.budget_remaining(), None);
        assert!(!limiter.budget_exhausted());
    }
}
