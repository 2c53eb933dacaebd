use crate::domain::price::{ObservationStatus, RawPriceObservation};
use anyhow::Context;
use chrono::NaiveDate;

const UPSERT_CHUNK: usize = 200;

/// MERGE-style upsert keyed by (ticker, trade_date, provider): update if
/// present, insert otherwise. Re-ingesting an already-stored row is a no-op
/// apart from the refreshed fetch timestamp.
pub async fn upsert_observations(
    pool: &sqlx::PgPool,
    rows: &[RawPriceObservation],
) -> anyhow::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await.context("begin transaction failed")?;
    let mut affected: u64 = 0;

    for chunk in rows.chunks(UPSERT_CHUNK) {
        let t0 = std::time::Instant::now();
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO raw_prices_eod \
             (ticker, trade_date, provider, close, adj_close, volume, currency, status, error) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.ticker)
                .push_bind(row.trade_date)
                .push_bind(&row.provider)
                .push_bind(row.close)
                .push_bind(row.adj_close)
                .push_bind(row.volume)
                .push_bind(&row.currency)
                .push_bind(row.status.as_str())
                .push_bind(&row.error);
        });
        qb.push(
            " ON CONFLICT (ticker, trade_date, provider) DO UPDATE \
               SET close = EXCLUDED.close, adj_close = EXCLUDED.adj_close, \
                   volume = EXCLUDED.volume, currency = EXCLUDED.currency, \
                   status = EXCLUDED.status, error = EXCLUDED.error, \
                   fetched_at = now()",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch upsert raw_prices_eod failed")?;
        affected += res.rows_affected();

        tracing::debug!(
            batch_size = chunk.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "raw_prices_eod batch upsert"
        );
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

/// Resume point for delta fetches: latest OK trade date stored for this
/// (ticker, provider).
pub async fn max_ok_date(
    pool: &sqlx::PgPool,
    ticker: &str,
    provider: &str,
) -> anyhow::Result<Option<NaiveDate>> {
    let row: (Option<NaiveDate>,) = sqlx::query_as(
        "SELECT max(trade_date) FROM raw_prices_eod \
         WHERE ticker = $1 AND provider = $2 AND status = 'OK'",
    )
    .persistent(false)
    .bind(ticker)
    .bind(provider)
    .fetch_one(pool)
    .await
    .context("max OK trade_date query failed")?;
    Ok(row.0)
}

/// All raw observations for one trade date, across providers and tickers.
pub async fn load_for_date(
    pool: &sqlx::PgPool,
    trade_date: NaiveDate,
) -> anyhow::Result<Vec<RawPriceObservation>> {
    type Row = (
        String,
        NaiveDate,
        String,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<String>,
        String,
        Option<String>,
    );

    let rows: Vec<Row> = sqlx::query_as(
        "SELECT ticker, trade_date, provider, close, adj_close, volume, currency, status, error \
         FROM raw_prices_eod \
         WHERE trade_date = $1 \
         ORDER BY ticker, provider",
    )
    .persistent(false)
    .bind(trade_date)
    .fetch_all(pool)
    .await
    .context("load raw_prices_eod for date failed")?;

    Ok(rows
        .into_iter()
        .map(
            |(ticker, trade_date, provider, close, adj_close, volume, currency, status, error)| {
                RawPriceObservation {
                    ticker,
                    trade_date,
                    provider,
                    close,
                    adj_close,
                    volume,
                    currency,
                    status: ObservationStatus::parse(&status).unwrap_or(ObservationStatus::Error),
                    error,
                }
            },
        )
        .collect())
}
