use anyhow::Context;
use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Append-only insert; an existing trade date is never touched.
pub async fn insert_days(
    pool: &sqlx::PgPool,
    dates: &[NaiveDate],
    source: &str,
) -> anyhow::Result<u64> {
    if dates.is_empty() {
        return Ok(0);
    }

    let mut qb = sqlx::QueryBuilder::new("INSERT INTO trading_days (trade_date, source) ");
    qb.push_values(dates, |mut b, date| {
        b.push_bind(date).push_bind(source);
    });
    qb.push(" ON CONFLICT (trade_date) DO NOTHING");

    let res = qb
        .build()
        .persistent(false)
        .execute(pool)
        .await
        .context("insert trading_days failed")?;
    Ok(res.rows_affected())
}

pub async fn load_all(pool: &sqlx::PgPool) -> anyhow::Result<BTreeSet<NaiveDate>> {
    let rows: Vec<(NaiveDate,)> =
        sqlx::query_as("SELECT trade_date FROM trading_days ORDER BY trade_date")
            .persistent(false)
            .fetch_all(pool)
            .await
            .context("load trading_days failed")?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}
