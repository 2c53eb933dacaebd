use crate::domain::price::RawPriceObservation;
use crate::ingest::provider::EodProvider;
use crate::ingest::types::FetchOutcome;
use crate::storage::raw_prices;
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};

const DEFAULT_BACKFILL_DAYS: i64 = 30;
const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub end_date: NaiveDate,
    /// Explicit range start. When unset, each ticker resumes from the day
    /// after its last OK observation for this provider.
    pub start_override: Option<NaiveDate>,
    /// Ignore stored resume points and refetch the whole range.
    pub backfill: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub tickers_ok: usize,
    pub tickers_failed: usize,
    pub tickers_skipped: usize,
    pub rows_upserted: u64,
    pub budget_exhausted: bool,
}

/// Fetches the missing delta for each ticker and upserts raw rows. A fetch
/// failure for one ticker records a single ERROR row (dated at the intended
/// start) and the batch continues; budget exhaustion stops the batch.
pub async fn ingest_tickers(
    pool: &sqlx::PgPool,
    provider: &dyn EodProvider,
    tickers: &[String],
    opts: &IngestOptions,
) -> Result<IngestOutcome> {
    anyhow::ensure!(!tickers.is_empty(), "ticker set must be non-empty");

    let provider_name = provider.provider_name().to_string();
    let mut out = IngestOutcome::default();
    let total = tickers.len();

    for (idx, ticker) in tickers.iter().enumerate() {
        let start = match resolve_start(pool, &provider_name, ticker, opts).await? {
            Some(d) => d,
            None => {
                out.tickers_skipped += 1;
                continue;
            }
        };

        match fetch_range(provider, ticker, start, opts.end_date).await {
            Ok(FetchOutcome::Bars(bars)) => {
                let rows: Vec<RawPriceObservation> = bars
                    .iter()
                    .map(|b| RawPriceObservation::from_bar(ticker, &provider_name, b))
                    .collect();
                out.rows_upserted += raw_prices::upsert_observations(pool, &rows)
                    .await
                    .with_context(|| format!("upsert raw rows failed for {ticker}"))?;
                out.tickers_ok += 1;
            }
            Ok(FetchOutcome::Empty) => {
                tracing::debug!(ticker, %start, end = %opts.end_date, "no provider data in range");
                out.tickers_ok += 1;
            }
            Err(err) => {
                // A fetch refused by the run cap is a deliberate stop, not a
                // ticker failure; no ERROR row, the ticker stays retryable.
                if provider.budget_exhausted() {
                    out.budget_exhausted = true;
                    tracing::warn!(
                        ticker,
                        processed = idx,
                        total,
                        "provider call budget exhausted; stopping batch"
                    );
                    break;
                }
                out.tickers_failed += 1;
                tracing::warn!(
                    ticker,
                    %start,
                    error = %err,
                    "ticker fetch failed; recording ERROR row and continuing"
                );
                let row = RawPriceObservation::error_row(
                    ticker,
                    &provider_name,
                    start,
                    &truncate(&format!("{err:#}"), 500),
                );
                raw_prices::upsert_observations(pool, &[row])
                    .await
                    .with_context(|| format!("record ERROR row failed for {ticker}"))?;
            }
        }

        let n = idx + 1;
        if n == total || n % PROGRESS_EVERY == 0 {
            tracing::info!(
                processed = n,
                total,
                ok = out.tickers_ok,
                failed = out.tickers_failed,
                rows = out.rows_upserted,
                "ingest progress"
            );
        }

        if provider.budget_exhausted() {
            out.budget_exhausted = true;
            tracing::warn!(processed = n, total, "provider call budget exhausted; stopping batch");
            break;
        }
    }

    Ok(out)
}

/// Resume point: the day after the max OK trade_date already stored for this
/// (ticker, provider), clamped to the requested range. `None` means caught up.
async fn resolve_start(
    pool: &sqlx::PgPool,
    provider_name: &str,
    ticker: &str,
    opts: &IngestOptions,
) -> Result<Option<NaiveDate>> {
    let range_start = opts
        .start_override
        .unwrap_or(opts.end_date - Duration::days(DEFAULT_BACKFILL_DAYS));

    if opts.backfill {
        return Ok(Some(range_start));
    }

    let resume = raw_prices::max_ok_date(pool, ticker, provider_name).await?;
    let start = match resume {
        Some(last) => (last + Duration::days(1)).max(range_start),
        None => range_start,
    };

    if start > opts.end_date {
        return Ok(None);
    }
    Ok(Some(start))
}

async fn fetch_range(
    provider: &dyn EodProvider,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<FetchOutcome> {
    if start == end {
        // Single-day requests go through the descending-window mode.
        return Ok(match provider.fetch_single_day(ticker, end).await? {
            Some(bar) => FetchOutcome::Bars(vec![bar]),
            None => FetchOutcome::Empty,
        });
    }
    provider.fetch_series(ticker, start, end).await
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

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "abc";
        assert_eq!(truncate(s, 10), "abc");
        let s = "aé";
        let t = truncate(s, 2);
        assert!(t.starts_with('a'));
    }

    // Provider whose run cap is already spent: every fetch is refused.
    struct ExhaustedProvider;

    #[async_trait::async_trait]
    impl EodProvider for ExhaustedProvider {
        fn provider_name(&self) -> &str {
            "test"
        }

        fn budget_exhausted(&self) -> bool {
            true
        }

        async fn fetch_series(
            &self,
            _symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<FetchOutcome> {
            anyhow::bail!("provider call budget exhausted (cap=Some(0))")
        }

        async fn fetch_descending(
            &self,
            _symbol: &str,
            _end: Option<NaiveDate>,
            _bars: u32,
        ) -> Result<FetchOutcome> {
            anyhow::bail!("provider call budget exhausted (cap=Some(0))")
        }
    }

    #[tokio::test]
    async fn budget_exhaustion_stops_batch_without_error_rows() {
        // Lazy pool: the budget-stop path must never touch the database.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();

        let end = NaiveDate::from_ymd_opt(2025, 6, 13).unwrap();
        let opts = IngestOptions {
            end_date: end,
            start_override: Some(end - Duration::days(5)),
            backfill: true,
        };
        let tickers = vec!["AAA".to_string(), "BBB".to_string()];

        let out = ingest_tickers(&pool, &ExhaustedProvider, &tickers, &opts)
            .await
            .unwrap();

        assert!(out.budget_exhausted);
        assert_eq!(out.tickers_failed, 0);
        assert_eq!(out.tickers_ok, 0);
        assert_eq!(out.rows_upserted, 0);
    }
}
