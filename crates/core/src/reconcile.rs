use crate::domain::price::{CanonicalPrice, PriceQuality, RawPriceObservation};
use chrono::NaiveDate;

/// Reconciliation policy. `expected_providers` is the number of providers
/// the deployment is configured to ingest from; coverage below it marks the
/// canonical row LOW even when the single source looks clean.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub primary_provider: String,
    /// Max relative spread (fraction, e.g. 0.005) still considered agreement.
    pub divergence_tolerance: f64,
    pub expected_providers: usize,
}

impl ReconcilePolicy {
    pub fn new(primary_provider: &str, divergence_tolerance: f64, expected_providers: usize) -> Self {
        Self {
            primary_provider: primary_provider.to_string(),
            divergence_tolerance,
            expected_providers: expected_providers.max(1),
        }
    }
}

/// Merges all raw observations for one (ticker, trade_date) into a single
/// canonical price. Only OK rows with a usable price participate. Returns
/// `None` when zero providers contribute; downstream detects the gap.
///
/// Determinism: contributing providers are ordered by name and the primary
/// provider wins whenever it agrees, so re-running over the same raw rows
/// reproduces bit-identical canonical values.
pub fn reconcile(
    ticker: &str,
    trade_date: NaiveDate,
    rows: &[RawPriceObservation],
    policy: &ReconcilePolicy,
) -> Option<CanonicalPrice> {
    let mut contributors: Vec<(&RawPriceObservation, f64)> = rows
        .iter()
        .filter(|r| r.ticker == ticker && r.trade_date == trade_date)
        .filter_map(|r| r.usable_price().map(|p| (r, p)))
        .collect();
    if contributors.is_empty() {
        return None;
    }
    contributors.sort_by(|a, b| a.0.provider.cmp(&b.0.provider));

    let providers_ok = contributors.len();

    let min = contributors.iter().map(|(_, p)| *p).fold(f64::INFINITY, f64::min);
    let max = contributors.iter().map(|(_, p)| *p).fold(f64::NEG_INFINITY, f64::max);
    let divergence = if min > 0.0 { (max - min) / min } else { 0.0 };
    let within_tolerance = divergence <= policy.divergence_tolerance;

    let (chosen, canon_adj_close) = choose_provider(&contributors, policy, within_tolerance);
    let canon_close = chosen.close.unwrap_or(canon_adj_close);

    let quality = if within_tolerance && providers_ok >= policy.expected_providers {
        PriceQuality::Real
    } else {
        PriceQuality::Low
    };

    Some(CanonicalPrice {
        ticker: ticker.to_string(),
        trade_date,
        canon_close,
        canon_adj_close,
        chosen_provider: chosen.provider.clone(),
        providers_ok: providers_ok as i32,
        divergence_pct: divergence * 100.0,
        quality,
    })
}

fn choose_provider<'a>(
    contributors: &[(&'a RawPriceObservation, f64)],
    policy: &ReconcilePolicy,
    within_tolerance: bool,
) -> (&'a RawPriceObservation, f64) {
    // When providers agree, the configured primary wins. On disagreement
    // prefer a provider carrying a true adjusted close; ties break on the
    // name order established by the caller's sort.
    if within_tolerance {
        if let Some(primary) = contributors
            .iter()
            .copied()
            .find(|(r, _)| r.provider == policy.primary_provider)
        {
            return primary;
        }
    }
    contributors
        .iter()
        .copied()
        .find(|(r, _)| r.adj_close.is_some())
        .unwrap_or(contributors[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price::ObservationStatus;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn obs(provider: &str, close: Option<f64>, adj: Option<f64>) -> RawPriceObservation {
        RawPriceObservation {
            ticker: "XYZ".to_string(),
            trade_date: d("2025-01-02"),
            provider: provider.to_string(),
            close,
            adj_close: adj,
            volume: None,
            currency: None,
            status: ObservationStatus::Ok,
            error: None,
        }
    }

    fn err_obs(provider: &str) -> RawPriceObservation {
        RawPriceObservation::error_row("XYZ", provider, d("2025-01-02"), "boom")
    }

    fn policy(primary: &str, expected: usize) -> ReconcilePolicy {
        ReconcilePolicy::new(primary, 0.005, expected)
    }

    #[test]
    fn all_error_rows_produce_no_canonical() {
        let rows = vec![err_obs("alpha"), err_obs("beta")];
        assert!(reconcile("XYZ", d("2025-01-02"), &rows, &policy("alpha", 2)).is_none());
    }

    #[test]
    fn single_provider_is_real_when_expected_one() {
        let rows = vec![obs("alpha", Some(10.0), Some(10.0))];
        let c = reconcile("XYZ", d("2025-01-02"), &rows, &policy("alpha", 1)).unwrap();
        assert_eq!(c.providers_ok, 1);
        assert_eq!(c.quality, PriceQuality::Real);
        assert_eq!(c.canon_adj_close, 10.0);
        assert_eq!(c.chosen_provider, "alpha");
    }

    #[test]
    fn thin_coverage_is_low() {
        let rows = vec![obs("alpha", Some(10.0), Some(10.0))];
        let c = reconcile("XYZ", d("2025-01-02"), &rows, &policy("alpha", 2)).unwrap();
        assert_eq!(c.quality, PriceQuality::Low);
    }

    #[test]
    fn agreement_prefers_primary_provider() {
        let rows = vec![
            obs("alpha", Some(10.0), Some(10.01)),
            obs("beta", Some(10.0), Some(10.0)),
        ];
        let c = reconcile("XYZ", d("2025-01-02"), &rows, &policy("beta", 2)).unwrap();
        assert_eq!(c.chosen_provider, "beta");
        assert_eq!(c.quality, PriceQuality::Real);
        assert!(c.divergence_pct < 0.5);
    }

    #[test]
    fn divergence_beyond_tolerance_is_low() {
        let rows = vec![
            obs("alpha", Some(10.0), Some(10.0)),
            obs("beta", Some(11.0), Some(11.0)),
        ];
        let c = reconcile("XYZ", d("2025-01-02"), &rows, &policy("alpha", 2)).unwrap();
        assert_eq!(c.quality, PriceQuality::Low);
        assert!((c.divergence_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn adj_close_fallback_to_close() {
        let rows = vec![obs("alpha", Some(10.0), None)];
        let c = reconcile("XYZ", d("2025-01-02"), &rows, &policy("alpha", 1)).unwrap();
        assert_eq!(c.canon_adj_close, 10.0);
        assert_eq!(c.canon_close, 10.0);
    }

    #[test]
    fn input_order_does_not_change_result() {
        let a = obs("alpha", Some(10.0), Some(10.0));
        let b = obs("beta", Some(10.01), Some(10.01));
        let pol = policy("alpha", 2);

        let c1 = reconcile("XYZ", d("2025-01-02"), &[a.clone(), b.clone()], &pol).unwrap();
        let c2 = reconcile("XYZ", d("2025-01-02"), &[b, a], &pol).unwrap();
        assert_eq!(c1.chosen_provider, c2.chosen_provider);
        assert_eq!(c1.canon_adj_close, c2.canon_adj_close);
        assert_eq!(c1.divergence_pct, c2.divergence_pct);
    }

    #[test]
    fn error_rows_do_not_count_toward_providers_ok() {
        let rows = vec![obs("alpha", Some(10.0), Some(10.0)), err_obs("beta")];
        let c = reconcile("XYZ", d("2025-01-02"), &rows, &policy("alpha", 2)).unwrap();
        assert_eq!(c.providers_ok, 1);
        assert_eq!(c.quality, PriceQuality::Low);
    }
}
