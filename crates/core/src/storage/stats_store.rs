use crate::domain::index::StatsDaily;
use anyhow::Context;
use chrono::NaiveDate;

/// Ascending level series ending at `day`, at most `max` rows.
pub async fn load_levels_through(
    pool: &sqlx::PgPool,
    index_code: &str,
    day: NaiveDate,
    max: usize,
) -> anyhow::Result<Vec<(NaiveDate, f64)>> {
    let mut rows: Vec<(NaiveDate, f64)> = sqlx::query_as(
        "SELECT trade_date, level_tr FROM index_levels \
         WHERE index_code = $1 AND trade_date <= $2 \
         ORDER BY trade_date DESC LIMIT $3",
    )
    .persistent(false)
    .bind(index_code)
    .bind(day)
    .bind(max as i64)
    .fetch_all(pool)
    .await
    .context("load level window failed")?;

    rows.reverse();
    Ok(rows)
}

pub async fn upsert_stats(
    pool: &sqlx::PgPool,
    index_code: &str,
    row: &StatsDaily,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO stats_daily \
         (index_code, trade_date, level_tr, ret_1d, ret_5d, ret_20d, vol_20d, \
          max_drawdown_252d, n_constituents, n_imputed, top5_weight, herfindahl) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT (index_code, trade_date) DO UPDATE \
           SET level_tr = EXCLUDED.level_tr, ret_1d = EXCLUDED.ret_1d, \
               ret_5d = EXCLUDED.ret_5d, ret_20d = EXCLUDED.ret_20d, \
               vol_20d = EXCLUDED.vol_20d, max_drawdown_252d = EXCLUDED.max_drawdown_252d, \
               n_constituents = EXCLUDED.n_constituents, n_imputed = EXCLUDED.n_imputed, \
               top5_weight = EXCLUDED.top5_weight, herfindahl = EXCLUDED.herfindahl",
    )
    .persistent(false)
    .bind(index_code)
    .bind(row.trade_date)
    .bind(row.level_tr)
    .bind(row.ret_1d)
    .bind(row.ret_5d)
    .bind(row.ret_20d)
    .bind(row.vol_20d)
    .bind(row.max_drawdown_252d)
    .bind(row.n_constituents)
    .bind(row.n_imputed)
    .bind(row.top5_weight)
    .bind(row.herfindahl)
    .execute(pool)
    .await
    .context("upsert stats_daily failed")?;
    Ok(())
}
