use crate::domain::index::{ConstituentDaily, ContributionDaily, IndexHolding, RankedConstituent};
use anyhow::Context;
use chrono::NaiveDate;

type Tx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

/// Latest persisted level strictly before `day`. The level chain never
/// re-derives from raw prices; this row is the sole continuity anchor.
pub async fn latest_level_before(
    pool: &sqlx::PgPool,
    index_code: &str,
    day: NaiveDate,
) -> anyhow::Result<Option<(NaiveDate, f64)>> {
    let row: Option<(NaiveDate, f64)> = sqlx::query_as(
        "SELECT trade_date, level_tr FROM index_levels \
         WHERE index_code = $1 AND trade_date < $2 \
         ORDER BY trade_date DESC LIMIT 1",
    )
    .persistent(false)
    .bind(index_code)
    .bind(day)
    .fetch_optional(pool)
    .await
    .context("latest level query failed")?;
    Ok(row)
}

pub async fn latest_level_date(
    pool: &sqlx::PgPool,
    index_code: &str,
) -> anyhow::Result<Option<NaiveDate>> {
    let row: (Option<NaiveDate>,) =
        sqlx::query_as("SELECT max(trade_date) FROM index_levels WHERE index_code = $1")
            .persistent(false)
            .bind(index_code)
            .fetch_one(pool)
            .await
            .context("latest level date query failed")?;
    Ok(row.0)
}

pub async fn upsert_level(
    tx: &mut Tx<'_>,
    index_code: &str,
    day: NaiveDate,
    level_tr: f64,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO index_levels (index_code, trade_date, level_tr) VALUES ($1, $2, $3) \
         ON CONFLICT (index_code, trade_date) DO UPDATE SET level_tr = EXCLUDED.level_tr",
    )
    .persistent(false)
    .bind(index_code)
    .bind(day)
    .bind(level_tr)
    .execute(&mut **tx)
    .await
    .context("upsert index_levels failed")?;
    Ok(())
}

/// The ranked membership input for the most recent rebalance date on or
/// before `day`. `None` when the external process has not published yet.
pub async fn load_ranked_universe(
    pool: &sqlx::PgPool,
    index_code: &str,
    day: NaiveDate,
) -> anyhow::Result<Option<Vec<RankedConstituent>>> {
    let rows: Vec<(i32, String, f64)> = sqlx::query_as(
        "SELECT rank, ticker, target_weight FROM index_universe_ranked \
         WHERE index_code = $1 AND rebalance_date = ( \
             SELECT max(rebalance_date) FROM index_universe_ranked \
             WHERE index_code = $1 AND rebalance_date <= $2) \
         ORDER BY rank, ticker",
    )
    .persistent(false)
    .bind(index_code)
    .bind(day)
    .fetch_all(pool)
    .await
    .context("load index_universe_ranked failed")?;

    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        rows.into_iter()
            .map(|(rank, ticker, target_weight)| RankedConstituent {
                rank,
                ticker,
                target_weight,
            })
            .collect(),
    ))
}

pub async fn upsert_holdings(
    tx: &mut Tx<'_>,
    index_code: &str,
    rebalance_date: NaiveDate,
    holdings: &[IndexHolding],
) -> anyhow::Result<()> {
    anyhow::ensure!(!holdings.is_empty(), "holdings must be non-empty");

    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO index_holdings (index_code, rebalance_date, ticker, target_weight, shares) ",
    );
    qb.push_values(holdings, |mut b, h| {
        b.push_bind(index_code)
            .push_bind(rebalance_date)
            .push_bind(&h.ticker)
            .push_bind(h.target_weight)
            .push_bind(h.shares);
    });
    qb.push(
        " ON CONFLICT (index_code, rebalance_date, ticker) DO UPDATE \
           SET target_weight = EXCLUDED.target_weight, shares = EXCLUDED.shares",
    );

    qb.build()
        .persistent(false)
        .execute(&mut **tx)
        .await
        .context("upsert index_holdings failed")?;
    Ok(())
}

pub async fn insert_divisor(
    tx: &mut Tx<'_>,
    index_code: &str,
    effective_date: NaiveDate,
    divisor: f64,
    reason: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO index_divisors (index_code, effective_date, divisor, reason) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (index_code, effective_date) DO UPDATE \
           SET divisor = EXCLUDED.divisor, reason = EXCLUDED.reason",
    )
    .persistent(false)
    .bind(index_code)
    .bind(effective_date)
    .bind(divisor)
    .bind(reason)
    .execute(&mut **tx)
    .await
    .context("upsert index_divisors failed")?;
    Ok(())
}

pub async fn upsert_constituent_daily(
    tx: &mut Tx<'_>,
    index_code: &str,
    rows: &[ConstituentDaily],
) -> anyhow::Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO constituent_daily \
         (index_code, trade_date, ticker, shares, price_used, market_value, weight, price_quality) ",
    );
    qb.push_values(rows, |mut b, r| {
        b.push_bind(index_code)
            .push_bind(r.trade_date)
            .push_bind(&r.ticker)
            .push_bind(r.shares)
            .push_bind(r.price_used)
            .push_bind(r.market_value)
            .push_bind(r.weight)
            .push_bind(&r.price_quality);
    });
    qb.push(
        " ON CONFLICT (index_code, trade_date, ticker) DO UPDATE \
           SET shares = EXCLUDED.shares, price_used = EXCLUDED.price_used, \
               market_value = EXCLUDED.market_value, weight = EXCLUDED.weight, \
               price_quality = EXCLUDED.price_quality",
    );

    qb.build()
        .persistent(false)
        .execute(&mut **tx)
        .await
        .context("upsert constituent_daily failed")?;
    Ok(())
}

pub async fn upsert_contribution_daily(
    tx: &mut Tx<'_>,
    index_code: &str,
    rows: &[ContributionDaily],
) -> anyhow::Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO contribution_daily \
         (index_code, trade_date, ticker, weight_prev, ret_1d, contribution) ",
    );
    qb.push_values(rows, |mut b, r| {
        b.push_bind(index_code)
            .push_bind(r.trade_date)
            .push_bind(&r.ticker)
            .push_bind(r.weight_prev)
            .push_bind(r.ret_1d)
            .push_bind(r.contribution);
    });
    qb.push(
        " ON CONFLICT (index_code, trade_date, ticker) DO UPDATE \
           SET weight_prev = EXCLUDED.weight_prev, ret_1d = EXCLUDED.ret_1d, \
               contribution = EXCLUDED.contribution",
    );

    qb.build()
        .persistent(false)
        .execute(&mut **tx)
        .await
        .context("upsert contribution_daily failed")?;
    Ok(())
}

pub async fn load_constituents(
    pool: &sqlx::PgPool,
    index_code: &str,
    trade_date: NaiveDate,
) -> anyhow::Result<Vec<ConstituentDaily>> {
    type Row = (NaiveDate, String, f64, f64, f64, f64, String);

    let rows: Vec<Row> = sqlx::query_as(
        "SELECT trade_date, ticker, shares, price_used, market_value, weight, price_quality \
         FROM constituent_daily \
         WHERE index_code = $1 AND trade_date = $2 \
         ORDER BY ticker",
    )
    .persistent(false)
    .bind(index_code)
    .bind(trade_date)
    .fetch_all(pool)
    .await
    .context("load constituent_daily failed")?;

    Ok(rows
        .into_iter()
        .map(
            |(trade_date, ticker, shares, price_used, market_value, weight, price_quality)| {
                ConstituentDaily {
                    trade_date,
                    ticker,
                    shares,
                    price_used,
                    market_value,
                    weight,
                    price_quality,
                }
            },
        )
        .collect())
}

/// (weight, price_quality) pairs for one day, for the stats engine.
pub async fn load_constituent_weights(
    pool: &sqlx::PgPool,
    index_code: &str,
    trade_date: NaiveDate,
) -> anyhow::Result<Vec<(f64, String)>> {
    let rows: Vec<(f64, String)> = sqlx::query_as(
        "SELECT weight, price_quality FROM constituent_daily \
         WHERE index_code = $1 AND trade_date = $2",
    )
    .persistent(false)
    .bind(index_code)
    .bind(trade_date)
    .fetch_all(pool)
    .await
    .context("load constituent weights failed")?;
    Ok(rows)
}

/// Tickers the ingest stage must cover for `day`: the current holdings set,
/// falling back to the ranked universe before the first rebalance.
pub async fn tickers_for_day(
    pool: &sqlx::PgPool,
    index_code: &str,
    day: NaiveDate,
) -> anyhow::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT ticker FROM index_holdings \
         WHERE index_code = $1 AND rebalance_date = ( \
             SELECT max(rebalance_date) FROM index_holdings \
             WHERE index_code = $1 AND rebalance_date <= $2) \
         ORDER BY ticker",
    )
    .persistent(false)
    .bind(index_code)
    .bind(day)
    .fetch_all(pool)
    .await
    .context("load holdings tickers failed")?;

    if !rows.is_empty() {
        return Ok(rows.into_iter().map(|(t,)| t).collect());
    }

    let ranked = load_ranked_universe(pool, index_code, day).await?;
    Ok(ranked
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.target_weight > 0.0)
        .map(|r| r.ticker)
        .collect())
}
