pub mod alerts;
pub mod canonical_prices;
pub mod index_store;
pub mod job_runs;
pub mod lock;
pub mod pipeline_state;
pub mod raw_prices;
pub mod stats_store;
pub mod trading_days;

use anyhow::Context;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}
