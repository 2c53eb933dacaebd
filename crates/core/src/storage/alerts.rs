use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};

/// Suppression predicate: due iff nothing was recorded as sent on `today`
/// yet. This is the same comparison the atomic gate's SQL runs server-side.
fn is_due(last_sent: Option<NaiveDate>, today: NaiveDate) -> bool {
    last_sent.map_or(true, |d| d < today)
}

/// True iff no alert with this name has been recorded as sent on the current
/// UTC date. Detail content never participates in the decision.
pub async fn should_send_alert(
    pool: &sqlx::PgPool,
    alert_name: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let row: Option<(NaiveDate,)> =
        sqlx::query_as("SELECT last_sent_utc_date FROM alert_state WHERE alert_name = $1")
            .persistent(false)
            .bind(alert_name)
            .fetch_optional(pool)
            .await
            .context("read alert_state failed")?;

    Ok(is_due(row.map(|(d,)| d), now.date_naive()))
}

/// Records today's send. The detail hash is audit-only.
pub async fn mark_alert_sent(
    pool: &sqlx::PgPool,
    alert_name: &str,
    status: &str,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO alert_state (alert_name, last_sent_utc_date, last_sent_at, last_status, last_detail_hash) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (alert_name) DO UPDATE \
           SET last_sent_utc_date = EXCLUDED.last_sent_utc_date, \
               last_sent_at = EXCLUDED.last_sent_at, \
               last_status = EXCLUDED.last_status, \
               last_detail_hash = EXCLUDED.last_detail_hash",
    )
    .persistent(false)
    .bind(alert_name)
    .bind(now.date_naive())
    .bind(now)
    .bind(status)
    .bind(detail.map(detail_hash))
    .execute(pool)
    .await
    .context("upsert alert_state failed")?;
    Ok(())
}

/// Atomic check-then-mark: returns true (and records the send) at most once
/// per (alert_name, UTC day), regardless of concurrent callers.
pub async fn should_send_alert_once_per_day(
    pool: &sqlx::PgPool,
    alert_name: &str,
    status: &str,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        "INSERT INTO alert_state (alert_name, last_sent_utc_date, last_sent_at, last_status, last_detail_hash) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (alert_name) DO UPDATE \
           SET last_sent_utc_date = EXCLUDED.last_sent_utc_date, \
               last_sent_at = EXCLUDED.last_sent_at, \
               last_status = EXCLUDED.last_status, \
               last_detail_hash = EXCLUDED.last_detail_hash \
           WHERE alert_state.last_sent_utc_date < EXCLUDED.last_sent_utc_date \
         RETURNING alert_name",
    )
    .persistent(false)
    .bind(alert_name)
    .bind(now.date_naive())
    .bind(now)
    .bind(status)
    .bind(detail.map(detail_hash))
    .fetch_optional(pool)
    .await
    .context("alert gate upsert failed")?;

    Ok(row.is_some())
}

pub fn detail_hash(detail: &str) -> String {
    hex::encode(Sha256::digest(detail.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_hash_is_stable_and_hex() {
        let h = detail_hash("stage=INGEST err=timeout");
        assert_eq!(h.len(), 64);
        assert_eq!(h, detail_hash("stage=INGEST err=timeout"));
        assert_ne!(h, detail_hash("stage=STATS err=timeout"));
    }

    #[test]
    fn gate_is_true_then_false_within_a_utc_day() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 12).unwrap();

        // No send recorded yet: first caller goes through.
        assert!(is_due(None, today));
        // After the send is recorded, the same UTC day is suppressed,
        // whatever the detail of the second alert.
        assert!(!is_due(Some(today), today));
        // The next UTC day opens the gate again.
        let tomorrow = today.succ_opt().unwrap();
        assert!(is_due(Some(today), tomorrow));
    }
}
