use crate::ingest::provider::EodProvider;
use crate::ingest::types::FetchOutcome;
use crate::storage::trading_days;
use anyhow::Result;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::ops::Bound;

const PROBE_LOOKBACK_BARS: u32 = 30;

/// Latest trading day eligible for processing: at most `provider_latest`,
/// and never today itself when the provider's latest session is today
/// (same-day data may be incomplete).
pub fn compute_eligible_end_date(
    provider_latest: NaiveDate,
    today_utc: NaiveDate,
    days: &BTreeSet<NaiveDate>,
) -> Option<NaiveDate> {
    days.range(..=provider_latest)
        .rev()
        .find(|d| **d != today_utc)
        .copied()
}

/// Smallest trading day strictly greater than `last_processed`, or the first
/// known trading day when nothing has been processed yet.
pub fn select_next_missing_day(
    days: &BTreeSet<NaiveDate>,
    last_processed: Option<NaiveDate>,
) -> Option<NaiveDate> {
    match last_processed {
        Some(last) => days
            .range((Bound::Excluded(last), Bound::Unbounded))
            .next()
            .copied(),
        None => days.iter().next().copied(),
    }
}

/// True when `day` is the first trading day of its month.
pub fn is_first_trading_day_of_month(day: NaiveDate, days: &BTreeSet<NaiveDate>) -> bool {
    use chrono::Datelike;
    days.range(..day)
        .next_back()
        .map(|prev| (prev.year(), prev.month()) != (day.year(), day.month()))
        .unwrap_or(true)
}

/// Extends the trading-day set by probing a reference symbol's recent EOD
/// availability. Probe failure degrades to the cached calendar with a
/// warning; it only fails hard when there is no cache to fall back to.
pub async fn refresh_trading_days(
    pool: &sqlx::PgPool,
    provider: &dyn EodProvider,
    probe_symbol: &str,
) -> Result<BTreeSet<NaiveDate>> {
    match provider
        .fetch_descending(probe_symbol, None, PROBE_LOOKBACK_BARS)
        .await
    {
        Ok(FetchOutcome::Bars(bars)) => {
            let dates: Vec<NaiveDate> = bars.iter().map(|b| b.trade_date).collect();
            let source = format!("probe:{probe_symbol}");
            trading_days::insert_days(pool, &dates, &source).await?;
        }
        Ok(FetchOutcome::Empty) => {
            tracing::warn!(probe_symbol, "calendar probe returned no data; using cached calendar");
        }
        Err(err) => {
            tracing::warn!(
                probe_symbol,
                error = %err,
                "calendar probe failed; degrading to cached calendar"
            );
        }
    }

    let cached = trading_days::load_all(pool).await?;
    anyhow::ensure!(
        !cached.is_empty(),
        "no trading days available: probe failed and calendar cache is empty"
    );
    Ok(cached)
}

/// Seeds the calendar over an explicit historical range via the probe symbol.
pub async fn seed_trading_days(
    pool: &sqlx::PgPool,
    provider: &dyn EodProvider,
    probe_symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<u64> {
    let out = provider.fetch_series(probe_symbol, start, end).await?;
    let bars = out.into_bars();
    if bars.is_empty() {
        return Ok(0);
    }
    let dates: Vec<NaiveDate> = bars.iter().map(|b| b.trade_date).collect();
    let source = format!("probe:{probe_symbol}");
    trading_days::insert_days(pool, &dates, &source).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn days(items: &[&str]) -> BTreeSet<NaiveDate> {
        items.iter().map(|s| d(s)).collect()
    }

    #[test]
    fn eligible_end_date_never_today() {
        let cal = days(&["2025-06-12", "2025-06-13"]);
        let today = d("2025-06-13");
        // Provider already has today's (possibly partial) session.
        let got = compute_eligible_end_date(today, today, &cal);
        assert_eq!(got, Some(d("2025-06-12")));
    }

    #[test]
    fn eligible_end_date_caps_at_provider_latest() {
        let cal = days(&["2025-06-11", "2025-06-12", "2025-06-13"]);
        let got = compute_eligible_end_date(d("2025-06-12"), d("2025-06-13"), &cal);
        assert_eq!(got, Some(d("2025-06-12")));
    }

    #[test]
    fn eligible_end_date_none_when_calendar_empty() {
        let cal = BTreeSet::new();
        assert_eq!(compute_eligible_end_date(d("2025-06-12"), d("2025-06-13"), &cal), None);
    }

    #[test]
    fn next_missing_day_crosses_year_boundary() {
        let cal = days(&["2025-12-31", "2026-01-02"]);
        assert_eq!(
            select_next_missing_day(&cal, Some(d("2025-12-31"))),
            Some(d("2026-01-02"))
        );
        assert_eq!(select_next_missing_day(&cal, Some(d("2026-01-02"))), None);
    }

    #[test]
    fn next_missing_day_starts_from_beginning_without_progress() {
        let cal = days(&["2025-12-31", "2026-01-02"]);
        assert_eq!(select_next_missing_day(&cal, None), Some(d("2025-12-31")));
    }

    #[test]
    fn first_trading_day_of_month_detection() {
        let cal = days(&["2025-05-30", "2025-06-02", "2025-06-03"]);
        assert!(is_first_trading_day_of_month(d("2025-06-02"), &cal));
        assert!(!is_first_trading_day_of_month(d("2025-06-03"), &cal));
        // First known day counts as a month start.
        assert!(is_first_trading_day_of_month(d("2025-05-30"), &cal));
    }
}
