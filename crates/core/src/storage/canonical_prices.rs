use crate::domain::price::{CanonicalPrice, PriceQuality};
use anyhow::Context;
use chrono::NaiveDate;
use std::collections::BTreeMap;

const UPSERT_CHUNK: usize = 200;

pub async fn upsert_canonical(
    pool: &sqlx::PgPool,
    rows: &[CanonicalPrice],
) -> anyhow::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await.context("begin transaction failed")?;
    let mut affected: u64 = 0;

    for chunk in rows.chunks(UPSERT_CHUNK) {
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO canonical_prices_eod \
             (ticker, trade_date, canon_close, canon_adj_close, chosen_provider, \
              providers_ok, divergence_pct, quality) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.ticker)
                .push_bind(row.trade_date)
                .push_bind(row.canon_close)
                .push_bind(row.canon_adj_close)
                .push_bind(&row.chosen_provider)
                .push_bind(row.providers_ok)
                .push_bind(row.divergence_pct)
                .push_bind(row.quality.as_str());
        });
        qb.push(
            " ON CONFLICT (ticker, trade_date) DO UPDATE \
               SET canon_close = EXCLUDED.canon_close, \
                   canon_adj_close = EXCLUDED.canon_adj_close, \
                   chosen_provider = EXCLUDED.chosen_provider, \
                   providers_ok = EXCLUDED.providers_ok, \
                   divergence_pct = EXCLUDED.divergence_pct, \
                   quality = EXCLUDED.quality, \
                   computed_at = now()",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch upsert canonical_prices_eod failed")?;
        affected += res.rows_affected();
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

pub async fn load_for_date(
    pool: &sqlx::PgPool,
    trade_date: NaiveDate,
) -> anyhow::Result<BTreeMap<String, CanonicalPrice>> {
    type Row = (String, NaiveDate, f64, f64, String, i32, f64, String);

    let rows: Vec<Row> = sqlx::query_as(
        "SELECT ticker, trade_date, canon_close, canon_adj_close, chosen_provider, \
                providers_ok, divergence_pct, quality \
         FROM canonical_prices_eod \
         WHERE trade_date = $1",
    )
    .persistent(false)
    .bind(trade_date)
    .fetch_all(pool)
    .await
    .context("load canonical_prices_eod for date failed")?;

    let mut out = BTreeMap::new();
    for (ticker, trade_date, canon_close, canon_adj_close, chosen_provider, providers_ok, divergence_pct, quality) in
        rows
    {
        let quality = match quality.as_str() {
            "REAL" => PriceQuality::Real,
            "IMPUTED" => PriceQuality::Imputed,
            _ => PriceQuality::Low,
        };
        out.insert(
            ticker.clone(),
            CanonicalPrice {
                ticker,
                trade_date,
                canon_close,
                canon_adj_close,
                chosen_provider,
                providers_ok,
                divergence_pct,
                quality,
            },
        );
    }
    Ok(out)
}
