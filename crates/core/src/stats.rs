use crate::domain::index::StatsDaily;
use crate::storage::{index_store, stats_store};
use anyhow::{Context, Result};
use chrono::NaiveDate;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const VOL_WINDOW: usize = 20;
const DRAWDOWN_WINDOW: usize = 252;

/// N-session lookback return from an ascending level series ending at the
/// day under computation. Null (None) when fewer than `n` prior sessions
/// exist, never zero.
pub fn ret_over(levels: &[f64], n: usize) -> Option<f64> {
    if n == 0 || levels.len() < n + 1 {
        return None;
    }
    let last = *levels.last()?;
    let base = levels[levels.len() - 1 - n];
    if base == 0.0 {
        return None;
    }
    Some(last / base - 1.0)
}

pub fn daily_returns(levels: &[f64]) -> Vec<f64> {
    levels
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Annualized stdev of daily returns over the trailing `window` sessions.
pub fn annualized_vol(levels: &[f64], window: usize) -> Option<f64> {
    if window < 2 || levels.len() < window + 1 {
        return None;
    }
    let rets = daily_returns(&levels[levels.len() - window - 1..]);
    if rets.len() < window {
        return None;
    }
    let mean = rets.iter().sum::<f64>() / rets.len() as f64;
    let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (rets.len() - 1) as f64;
    Some(var.sqrt() * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Worst peak-to-trough over the trailing `window` sessions:
/// min(level / running_peak - 1). Always <= 0.
pub fn max_drawdown(levels: &[f64], window: usize) -> Option<f64> {
    if levels.len() < window + 1 {
        return None;
    }
    let tail = &levels[levels.len() - window - 1..];
    let mut peak = f64::NEG_INFINITY;
    let mut worst: f64 = 0.0;
    for &level in tail {
        peak = peak.max(level);
        if peak > 0.0 {
            worst = worst.min(level / peak - 1.0);
        }
    }
    Some(worst)
}

/// Sum of the five largest weights.
pub fn top5_weight(weights: &[f64]) -> Option<f64> {
    if weights.is_empty() {
        return None;
    }
    let mut sorted = weights.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    Some(sorted.iter().take(5).sum())
}

/// Herfindahl concentration: sum of squared weights.
pub fn herfindahl(weights: &[f64]) -> Option<f64> {
    if weights.is_empty() {
        return None;
    }
    Some(weights.iter().map(|w| w * w).sum())
}

/// Computes and persists the daily stats row for `day`. Requires the level
/// for `day` to already exist.
pub async fn compute_for_day(
    pool: &sqlx::PgPool,
    index_code: &str,
    day: NaiveDate,
) -> Result<StatsDaily> {
    let window = stats_store::load_levels_through(pool, index_code, day, DRAWDOWN_WINDOW + 1)
        .await
        .context("load level window failed")?;

    let last = window
        .last()
        .with_context(|| format!("no level persisted for {index_code} on {day}"))?;
    anyhow::ensure!(
        last.0 == day,
        "level window ends at {} but stats requested for {day}",
        last.0
    );

    let level_today = last.1;
    let levels: Vec<f64> = window.iter().map(|(_, l)| *l).collect();
    let constituents = index_store::load_constituent_weights(pool, index_code, day).await?;
    let weights: Vec<f64> = constituents.iter().map(|(w, _)| *w).collect();
    let n_imputed = constituents
        .iter()
        .filter(|(_, quality)| quality == "IMPUTED")
        .count() as i32;

    let row = StatsDaily {
        trade_date: day,
        level_tr: level_today,
        ret_1d: ret_over(&levels, 1),
        ret_5d: ret_over(&levels, 5),
        ret_20d: ret_over(&levels, 20),
        vol_20d: annualized_vol(&levels, VOL_WINDOW),
        max_drawdown_252d: max_drawdown(&levels, DRAWDOWN_WINDOW),
        n_constituents: constituents.len() as i32,
        n_imputed,
        top5_weight: top5_weight(&weights),
        herfindahl: herfindahl(&weights),
    };

    stats_store::upsert_stats(pool, index_code, &row).await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_windows_are_null_not_zero() {
        let levels = vec![1000.0, 1010.0];
        assert!(ret_over(&levels, 1).is_some());
        assert!(ret_over(&levels, 5).is_none());
        assert!(annualized_vol(&levels, 20).is_none());
        assert!(max_drawdown(&levels, 252).is_none());
    }

    #[test]
    fn ret_1d_matches_level_ratio() {
        let levels = vec![1000.0, 1012.0];
        let r = ret_over(&levels, 1).unwrap();
        assert!((r - 0.012).abs() < 1e-12);
    }

    #[test]
    fn vol_of_constant_series_is_zero() {
        let levels = vec![1000.0; 21];
        let v = annualized_vol(&levels, 20).unwrap();
        assert_eq!(v, 0.0);
    }

    #[test]
    fn drawdown_catches_trough_after_peak() {
        // 253 levels: flat, spike to 1100, drop to 990.
        let mut levels = vec![1000.0; 251];
        levels.push(1100.0);
        levels.push(990.0);
        let dd = max_drawdown(&levels, 252).unwrap();
        assert!((dd - (990.0 / 1100.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn monotonic_series_has_zero_drawdown() {
        let levels: Vec<f64> = (0..253).map(|i| 1000.0 + i as f64).collect();
        assert_eq!(max_drawdown(&levels, 252).unwrap(), 0.0);
    }

    #[test]
    fn top5_and_herfindahl() {
        let weights = vec![0.3, 0.2, 0.15, 0.1, 0.1, 0.1, 0.05];
        let t5 = top5_weight(&weights).unwrap();
        assert!((t5 - 0.85).abs() < 1e-12);

        let h = herfindahl(&[0.5, 0.5]).unwrap();
        assert!((h - 0.5).abs() < 1e-12);

        assert!(top5_weight(&[]).is_none());
        assert!(herfindahl(&[]).is_none());
    }
}
