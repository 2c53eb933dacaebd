use crate::domain::index::{ConstituentDaily, ContributionDaily, IndexHolding, RankedConstituent};
use crate::domain::price::CanonicalPrice;
use crate::storage::{canonical_prices, index_store};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::BTreeMap;

pub const DEFAULT_TOP_K: usize = 25;
pub const BASE_LEVEL: f64 = 1000.0;

// Currency notional used to derive auditable share counts at each rebalance.
// Levels never depend on it; valuing the holdings through the recorded
// divisor recovers the level exactly.
const BASE_NOTIONAL: f64 = 1_000_000.0;

/// One-day chained total-return level:
/// level[t] = level[t-1] * (1 + sum_i weight_prev_i * ret_1d_i).
pub fn chain_level(prev_level: f64, legs: &[(f64, f64)]) -> f64 {
    let weighted: f64 = legs.iter().map(|(w, r)| w * r).sum();
    prev_level * (1.0 + weighted)
}

/// Top-K selection from the externally supplied ranked universe: positive
/// target weights only, renormalized over the selected set.
pub fn select_target_weights(
    ranked: &[RankedConstituent],
    top_k: usize,
) -> Result<Vec<(String, f64)>> {
    let mut by_rank: Vec<&RankedConstituent> =
        ranked.iter().filter(|r| r.target_weight > 0.0).collect();
    by_rank.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.ticker.cmp(&b.ticker)));
    by_rank.truncate(top_k);

    anyhow::ensure!(!by_rank.is_empty(), "ranked universe has no positive-weight rows");
    let total: f64 = by_rank.iter().map(|r| r.target_weight).sum();
    anyhow::ensure!(total > 0.0, "target weights sum to zero");

    Ok(by_rank
        .into_iter()
        .map(|r| (r.ticker.clone(), r.target_weight / total))
        .collect())
}

#[derive(Debug, Clone)]
pub struct DayResult {
    pub trade_date: NaiveDate,
    pub level_tr: f64,
    pub n_constituents: usize,
    pub n_imputed: usize,
    pub rebalanced: bool,
}

pub struct IndexCalculator {
    pool: sqlx::PgPool,
    index_code: String,
    top_k: usize,
}

impl IndexCalculator {
    pub fn new(pool: sqlx::PgPool, index_code: &str) -> Self {
        Self {
            pool,
            index_code: index_code.to_string(),
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Processes one trading day. `rebalance` is decided by the caller from
    /// the trading calendar. Re-running an already-computed day reproduces
    /// identical values: level[t] chains from the persisted level[t-1] and
    /// every write is a natural-key upsert.
    pub async fn process_day(&self, day: NaiveDate, rebalance: bool) -> Result<DayResult> {
        let prev = index_store::latest_level_before(&self.pool, &self.index_code, day).await?;
        let canonical = canonical_prices::load_for_date(&self.pool, day).await?;

        match prev {
            None => self.bootstrap_day(day, &canonical).await,
            Some((prev_date, prev_level)) => {
                self.chained_day(day, prev_date, prev_level, &canonical, rebalance)
                    .await
            }
        }
    }

    /// First-ever day: holdings from the ranked universe, level at base.
    async fn bootstrap_day(
        &self,
        day: NaiveDate,
        canonical: &BTreeMap<String, CanonicalPrice>,
    ) -> Result<DayResult> {
        let ranked = index_store::load_ranked_universe(&self.pool, &self.index_code, day)
            .await?
            .with_context(|| {
                format!("no ranked universe on or before {day}; seed index_universe_ranked first")
            })?;
        let targets = select_target_weights(&ranked, self.top_k)?;

        let priced = resolve_prices(&targets, canonical, &BTreeMap::new());
        anyhow::ensure!(
            !priced.is_empty(),
            "no canonical prices available for any bootstrap constituent on {day}"
        );

        let (holdings, constituents, divisor) = build_holdings(&priced, BASE_LEVEL, day);

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        index_store::upsert_holdings(&mut tx, &self.index_code, day, &holdings).await?;
        index_store::insert_divisor(&mut tx, &self.index_code, day, divisor, "initial").await?;
        index_store::upsert_level(&mut tx, &self.index_code, day, BASE_LEVEL).await?;
        index_store::upsert_constituent_daily(&mut tx, &self.index_code, &constituents).await?;
        tx.commit().await.context("commit transaction failed")?;

        tracing::info!(
            index_code = %self.index_code,
            %day,
            level = BASE_LEVEL,
            constituents = constituents.len(),
            "index bootstrapped"
        );

        Ok(DayResult {
            trade_date: day,
            level_tr: BASE_LEVEL,
            n_constituents: constituents.len(),
            n_imputed: 0,
            rebalanced: true,
        })
    }

    async fn chained_day(
        &self,
        day: NaiveDate,
        prev_date: NaiveDate,
        prev_level: f64,
        canonical: &BTreeMap<String, CanonicalPrice>,
        rebalance: bool,
    ) -> Result<DayResult> {
        anyhow::ensure!(
            prev_date < day,
            "previous level date {prev_date} is not before {day}"
        );

        let prev_cons =
            index_store::load_constituents(&self.pool, &self.index_code, prev_date).await?;
        anyhow::ensure!(
            !prev_cons.is_empty(),
            "no constituent state for {} on {prev_date}",
            self.index_code
        );

        // Return legs from the previous day's weights. A missing canonical
        // price carries the last used price forward instead of halting the
        // series; the substitution is counted, not hidden.
        let mut legs: Vec<(f64, f64)> = Vec::with_capacity(prev_cons.len());
        let mut contributions: Vec<ContributionDaily> = Vec::with_capacity(prev_cons.len());
        let mut n_imputed = 0usize;
        let mut prev_prices: BTreeMap<String, f64> = BTreeMap::new();

        for con in &prev_cons {
            prev_prices.insert(con.ticker.clone(), con.price_used);
            let (price_now, _quality) = match canonical.get(&con.ticker) {
                Some(c) => (c.canon_adj_close, c.quality.as_str()),
                None => {
                    n_imputed += 1;
                    (con.price_used, "IMPUTED")
                }
            };
            let ret_1d = if con.price_used > 0.0 {
                price_now / con.price_used - 1.0
            } else {
                0.0
            };
            legs.push((con.weight, ret_1d));
            contributions.push(ContributionDaily {
                trade_date: day,
                ticker: con.ticker.clone(),
                weight_prev: con.weight,
                ret_1d,
                contribution: con.weight * ret_1d,
            });
        }

        let level = chain_level(prev_level, &legs);

        // Post-level constituent state: reset holdings on a rebalance day,
        // drift shares forward otherwise.
        let (holdings, constituents, divisor, rebalanced) = if rebalance {
            match index_store::load_ranked_universe(&self.pool, &self.index_code, day).await? {
                Some(ranked) => {
                    let targets = select_target_weights(&ranked, self.top_k)?;
                    let priced = resolve_prices(&targets, canonical, &prev_prices);
                    anyhow::ensure!(
                        !priced.is_empty(),
                        "no prices available for any rebalance constituent on {day}"
                    );
                    let (h, c, d) = build_holdings(&priced, level, day);
                    (Some(h), c, Some(d), true)
                }
                None => {
                    tracing::warn!(
                        index_code = %self.index_code,
                        %day,
                        "rebalance day without ranked universe; carrying holdings forward"
                    );
                    (None, drift_constituents(&prev_cons, canonical, day), None, false)
                }
            }
        } else {
            (None, drift_constituents(&prev_cons, canonical, day), None, false)
        };

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        index_store::upsert_level(&mut tx, &self.index_code, day, level).await?;
        index_store::upsert_contribution_daily(&mut tx, &self.index_code, &contributions).await?;
        if let Some(holdings) = &holdings {
            index_store::upsert_holdings(&mut tx, &self.index_code, day, holdings).await?;
        }
        if let Some(divisor) = divisor {
            index_store::insert_divisor(&mut tx, &self.index_code, day, divisor, "rebalance")
                .await?;
        }
        index_store::upsert_constituent_daily(&mut tx, &self.index_code, &constituents).await?;
        tx.commit().await.context("commit transaction failed")?;

        tracing::info!(
            index_code = %self.index_code,
            %day,
            level,
            n_imputed,
            rebalanced,
            "index level updated"
        );

        Ok(DayResult {
            trade_date: day,
            level_tr: level,
            n_constituents: constituents.len(),
            n_imputed,
            rebalanced,
        })
    }
}

#[derive(Debug, Clone)]
struct PricedTarget {
    ticker: String,
    weight: f64,
    price: f64,
    quality: &'static str,
}

/// Pairs target weights with a usable positive price: canonical first, then
/// the previous day's used price (imputed). Unpriceable tickers are dropped
/// and the survivors renormalized.
fn resolve_prices(
    targets: &[(String, f64)],
    canonical: &BTreeMap<String, CanonicalPrice>,
    prev_prices: &BTreeMap<String, f64>,
) -> Vec<PricedTarget> {
    let mut priced: Vec<PricedTarget> = Vec::with_capacity(targets.len());
    for (ticker, weight) in targets {
        let hit = match canonical.get(ticker) {
            Some(c) if c.canon_adj_close > 0.0 => Some((c.canon_adj_close, c.quality.as_str())),
            _ => prev_prices
                .get(ticker)
                .filter(|p| **p > 0.0)
                .map(|p| (*p, "IMPUTED")),
        };
        match hit {
            Some((price, quality)) => priced.push(PricedTarget {
                ticker: ticker.clone(),
                weight: *weight,
                price,
                quality,
            }),
            None => {
                tracing::warn!(ticker, "constituent dropped: no usable price at rebalance");
            }
        }
    }

    let total: f64 = priced.iter().map(|p| p.weight).sum();
    if total > 0.0 {
        for p in &mut priced {
            p.weight /= total;
        }
    }
    priced
}

/// Shares, constituent rows, and the divisor for a (re)balanced book at
/// `level`. Shares are sized off a fixed currency notional so the recorded
/// divisor recovers the level from the holdings' market value.
fn build_holdings(
    priced: &[PricedTarget],
    level: f64,
    day: NaiveDate,
) -> (Vec<IndexHolding>, Vec<ConstituentDaily>, f64) {
    let mut holdings = Vec::with_capacity(priced.len());
    let mut constituents = Vec::with_capacity(priced.len());
    let mut market_value = 0.0;

    for p in priced {
        let shares = p.weight * BASE_NOTIONAL / p.price;
        let mv = shares * p.price;
        market_value += mv;
        holdings.push(IndexHolding {
            ticker: p.ticker.clone(),
            target_weight: p.weight,
            shares,
        });
        constituents.push(ConstituentDaily {
            trade_date: day,
            ticker: p.ticker.clone(),
            shares,
            price_used: p.price,
            market_value: mv,
            weight: p.weight,
            price_quality: p.quality.to_string(),
        });
    }

    (holdings, constituents, market_value / level)
}

/// Non-rebalance day: shares carry over, weights drift with prices.
fn drift_constituents(
    prev_cons: &[ConstituentDaily],
    canonical: &BTreeMap<String, CanonicalPrice>,
    day: NaiveDate,
) -> Vec<ConstituentDaily> {
    let mut rows: Vec<ConstituentDaily> = prev_cons
        .iter()
        .map(|con| {
            let (price, quality) = match canonical.get(&con.ticker) {
                Some(c) if c.canon_adj_close > 0.0 => {
                    (c.canon_adj_close, c.quality.as_str().to_string())
                }
                _ => (con.price_used, "IMPUTED".to_string()),
            };
            ConstituentDaily {
                trade_date: day,
                ticker: con.ticker.clone(),
                shares: con.shares,
                price_used: price,
                market_value: con.shares * price,
                weight: 0.0,
                price_quality: quality,
            }
        })
        .collect();

    let total_mv: f64 = rows.iter().map(|r| r.market_value).sum();
    if total_mv > 0.0 {
        for r in &mut rows {
            r.weight = r.market_value / total_mv;
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price::PriceQuality;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn chain_level_matches_weighted_return() {
        // weight_prev/ret_1d pairs summing to +1.2% on a 1000 base.
        let legs = vec![(0.5, 0.02), (0.3, 0.01), (0.2, -0.005)];
        let level = chain_level(1000.0, &legs);
        assert!((level - 1012.0).abs() < 1e-9);
    }

    #[test]
    fn chain_level_with_no_legs_is_flat() {
        assert_eq!(chain_level(1000.0, &[]), 1000.0);
    }

    fn ranked(rows: &[(i32, &str, f64)]) -> Vec<RankedConstituent> {
        rows.iter()
            .map(|(rank, t, w)| RankedConstituent {
                rank: *rank,
                ticker: t.to_string(),
                target_weight: *w,
            })
            .collect()
    }

    #[test]
    fn selection_takes_top_k_positive_and_renormalizes() {
        let universe = ranked(&[
            (1, "AAA", 0.4),
            (2, "BBB", 0.4),
            (3, "CCC", 0.0),
            (4, "DDD", 0.2),
        ]);
        let sel = select_target_weights(&universe, 2).unwrap();
        assert_eq!(sel.len(), 2);
        assert_eq!(sel[0].0, "AAA");
        assert!((sel[0].1 - 0.5).abs() < 1e-12);
        assert!((sel[1].1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn selection_rejects_all_zero_universe() {
        let universe = ranked(&[(1, "AAA", 0.0)]);
        assert!(select_target_weights(&universe, 5).is_err());
    }

    fn canon(ticker: &str, price: f64) -> (String, CanonicalPrice) {
        (
            ticker.to_string(),
            CanonicalPrice {
                ticker: ticker.to_string(),
                trade_date: d("2025-01-02"),
                canon_close: price,
                canon_adj_close: price,
                chosen_provider: "alpha".to_string(),
                providers_ok: 1,
                divergence_pct: 0.0,
                quality: PriceQuality::Real,
            },
        )
    }

    #[test]
    fn unpriceable_targets_are_dropped_and_renormalized() {
        let targets = vec![("AAA".to_string(), 0.6), ("BBB".to_string(), 0.4)];
        let canonical: BTreeMap<String, CanonicalPrice> = [canon("AAA", 50.0)].into();
        let priced = resolve_prices(&targets, &canonical, &BTreeMap::new());
        assert_eq!(priced.len(), 1);
        assert!((priced[0].weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn divisor_recovers_level_from_market_value() {
        let targets = vec![("AAA".to_string(), 0.5), ("BBB".to_string(), 0.5)];
        let canonical: BTreeMap<String, CanonicalPrice> =
            [canon("AAA", 50.0), canon("BBB", 20.0)].into();
        let priced = resolve_prices(&targets, &canonical, &BTreeMap::new());
        let (holdings, cons, divisor) = build_holdings(&priced, 1234.5, d("2025-01-02"));

        let mv: f64 = cons.iter().map(|c| c.market_value).sum();
        assert!((mv / divisor - 1234.5).abs() < 1e-6);
        assert_eq!(holdings.len(), 2);
    }

    #[test]
    fn drift_weights_follow_prices() {
        let prev = vec![
            ConstituentDaily {
                trade_date: d("2025-01-02"),
                ticker: "AAA".to_string(),
                shares: 10.0,
                price_used: 100.0,
                market_value: 1000.0,
                weight: 0.5,
                price_quality: "REAL".to_string(),
            },
            ConstituentDaily {
                trade_date: d("2025-01-02"),
                ticker: "BBB".to_string(),
                shares: 10.0,
                price_used: 100.0,
                market_value: 1000.0,
                weight: 0.5,
                price_quality: "REAL".to_string(),
            },
        ];
        // AAA doubles, BBB missing (carried forward).
        let canonical: BTreeMap<String, CanonicalPrice> = [canon("AAA", 200.0)].into();
        let rows = drift_constituents(&prev, &canonical, d("2025-01-03"));

        assert!((rows[0].weight - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(rows[1].price_quality, "IMPUTED");
        assert_eq!(rows[1].price_used, 100.0);
    }
}
