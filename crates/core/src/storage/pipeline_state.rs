use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const STAGE_STARTED: &str = "STARTED";
pub const STAGE_COMPLETED: &str = "COMPLETED";
pub const STAGE_ERROR: &str = "ERROR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub details: Option<Value>,
}

/// Per-stage resumability. Two implementations share this interface: the
/// durable Postgres store and a local file fallback scoped to the current
/// UTC date. The orchestrator never branches on which one is active.
#[async_trait::async_trait]
pub trait PipelineStateStore: Send + Sync {
    async fn record_stage_start(&self, run_id: Uuid, stage: &str, details: Option<Value>)
        -> Result<()>;

    async fn record_stage_end(
        &self,
        run_id: Uuid,
        stage: &str,
        status: &str,
        details: Option<Value>,
    ) -> Result<()>;

    async fn fetch_stage_statuses(&self, run_id: Uuid) -> Result<BTreeMap<String, StageRecord>>;

    /// An unfinished run started on `date` (UTC), if one exists, newest first.
    async fn fetch_resume_run_id(&self, date: NaiveDate) -> Result<Option<Uuid>>;
}

pub struct PgStateStore {
    pool: sqlx::PgPool,
}

impl PgStateStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PipelineStateStore for PgStateStore {
    async fn record_stage_start(
        &self,
        run_id: Uuid,
        stage: &str,
        details: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_stage_state (run_id, stage_name, status, started_at, details) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (run_id, stage_name) DO UPDATE \
               SET status = EXCLUDED.status, started_at = EXCLUDED.started_at, \
                   ended_at = NULL, details = EXCLUDED.details",
        )
        .persistent(false)
        .bind(run_id)
        .bind(stage)
        .bind(STAGE_STARTED)
        .bind(Utc::now())
        .bind(details)
        .execute(&self.pool)
        .await
        .context("record stage start failed")?;
        Ok(())
    }

    async fn record_stage_end(
        &self,
        run_id: Uuid,
        stage: &str,
        status: &str,
        details: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE pipeline_stage_state \
             SET status = $3, ended_at = $4, details = COALESCE($5, details) \
             WHERE run_id = $1 AND stage_name = $2",
        )
        .persistent(false)
        .bind(run_id)
        .bind(stage)
        .bind(status)
        .bind(Utc::now())
        .bind(details)
        .execute(&self.pool)
        .await
        .context("record stage end failed")?;
        Ok(())
    }

    async fn fetch_stage_statuses(&self, run_id: Uuid) -> Result<BTreeMap<String, StageRecord>> {
        type Row = (String, String, DateTime<Utc>, Option<DateTime<Utc>>, Option<Value>);

        let rows: Vec<Row> = sqlx::query_as(
            "SELECT stage_name, status, started_at, ended_at, details \
             FROM pipeline_stage_state WHERE run_id = $1",
        )
        .persistent(false)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch stage statuses failed")?;

        Ok(rows
            .into_iter()
            .map(|(stage_name, status, started_at, ended_at, details)| {
                (
                    stage_name.clone(),
                    StageRecord {
                        stage_name,
                        status,
                        started_at,
                        ended_at,
                        details,
                    },
                )
            })
            .collect())
    }

    async fn fetch_resume_run_id(&self, date: NaiveDate) -> Result<Option<Uuid>> {
        let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = start + chrono::Duration::days(1);

        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT run_id FROM job_runs \
             WHERE status = 'STARTED' AND started_at >= $1 AND started_at < $2 \
             ORDER BY started_at DESC LIMIT 1",
        )
        .persistent(false)
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await
        .context("fetch resume run failed")?;
        Ok(row.map(|(id,)| id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LocalStateFile {
    runs: Vec<LocalRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalRun {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    stages: BTreeMap<String, StageRecord>,
}

/// File-backed fallback, one JSON file per UTC date. Survives a process
/// restart on the same host, which is all the fallback promises.
pub struct LocalFileStateStore {
    dir: PathBuf,
    write_guard: tokio::sync::Mutex<()>,
}

impl LocalFileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_guard: tokio::sync::Mutex::new(()),
        }
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("trindex_pipeline_{date}.json"))
    }

    async fn load(&self, date: NaiveDate) -> Result<LocalStateFile> {
        let path = self.file_for(date);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("corrupt pipeline state file {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(LocalStateFile::default())
            }
            Err(err) => Err(err).context("read pipeline state file failed"),
        }
    }

    async fn save(&self, date: NaiveDate, state: &LocalStateFile) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("create pipeline state dir failed")?;
        let path = self.file_for(date);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(state).context("serialize pipeline state failed")?;
        tokio::fs::write(&tmp, text)
            .await
            .context("write pipeline state tmp failed")?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context("rename pipeline state file failed")?;
        Ok(())
    }

    async fn mutate<F>(&self, run_id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut LocalRun),
    {
        let _guard = self.write_guard.lock().await;
        let today = Utc::now().date_naive();
        let mut state = self.load(today).await?;

        let idx = match state.runs.iter().position(|r| r.run_id == run_id) {
            Some(idx) => idx,
            None => {
                state.runs.push(LocalRun {
                    run_id,
                    started_at: Utc::now(),
                    stages: BTreeMap::new(),
                });
                state.runs.len() - 1
            }
        };
        f(&mut state.runs[idx]);
        self.save(today, &state).await
    }
}

#[async_trait::async_trait]
impl PipelineStateStore for LocalFileStateStore {
    async fn record_stage_start(
        &self,
        run_id: Uuid,
        stage: &str,
        details: Option<Value>,
    ) -> Result<()> {
        let stage = stage.to_string();
        self.mutate(run_id, move |run| {
            run.stages.insert(
                stage.clone(),
                StageRecord {
                    stage_name: stage,
                    status: STAGE_STARTED.to_string(),
                    started_at: Utc::now(),
                    ended_at: None,
                    details,
                },
            );
        })
        .await
    }

    async fn record_stage_end(
        &self,
        run_id: Uuid,
        stage: &str,
        status: &str,
        details: Option<Value>,
    ) -> Result<()> {
        let stage = stage.to_string();
        let status = status.to_string();
        self.mutate(run_id, move |run| {
            if let Some(rec) = run.stages.get_mut(&stage) {
                rec.status = status;
                rec.ended_at = Some(Utc::now());
                if details.is_some() {
                    rec.details = details;
                }
            }
        })
        .await
    }

    async fn fetch_stage_statuses(&self, run_id: Uuid) -> Result<BTreeMap<String, StageRecord>> {
        let state = self.load(Utc::now().date_naive()).await?;
        Ok(state
            .runs
            .into_iter()
            .find(|r| r.run_id == run_id)
            .map(|r| r.stages)
            .unwrap_or_default())
    }

    async fn fetch_resume_run_id(&self, date: NaiveDate) -> Result<Option<Uuid>> {
        let state = self.load(date).await?;
        Ok(state
            .runs
            .iter()
            .rev()
            .find(|r| r.stages.values().any(|s| s.status == STAGE_STARTED))
            .map(|r| r.run_id))
    }
}

/// Picks the durable store when the database answers, the local fallback
/// otherwise. Callers hold a `Box<dyn PipelineStateStore>` either way.
pub async fn select_store(
    pool: &sqlx::PgPool,
    fallback_dir: Option<&str>,
) -> Box<dyn PipelineStateStore> {
    let probe = sqlx::query("SELECT 1").persistent(false).execute(pool).await;
    match probe {
        Ok(_) => Box::new(PgStateStore::new(pool.clone())),
        Err(err) => {
            let dir = fallback_dir
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir);
            tracing::warn!(
                error = %err,
                dir = %dir.display(),
                "durable state store unavailable; using local file fallback"
            );
            Box::new(LocalFileStateStore::new(dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips_stages() {
        let dir = std::env::temp_dir().join(format!("trindex-state-test-{}", Uuid::new_v4()));
        let store = LocalFileStateStore::new(&dir);
        let run_id = Uuid::new_v4();

        store
            .record_stage_start(run_id, "INGEST", None)
            .await
            .unwrap();
        let stages = store.fetch_stage_statuses(run_id).await.unwrap();
        assert_eq!(stages["INGEST"].status, STAGE_STARTED);

        store
            .record_stage_end(run_id, "INGEST", STAGE_COMPLETED, None)
            .await
            .unwrap();
        let stages = store.fetch_stage_statuses(run_id).await.unwrap();
        assert_eq!(stages["INGEST"].status, STAGE_COMPLETED);
        assert!(stages["INGEST"].ended_at.is_some());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn local_store_resumes_only_unfinished_runs() {
        let dir = std::env::temp_dir().join(format!("trindex-state-test-{}", Uuid::new_v4()));
        let store = LocalFileStateStore::new(&dir);
        let today = Utc::now().date_naive();

        let done = Uuid::new_v4();
        store.record_stage_start(done, "INGEST", None).await.unwrap();
        store
            .record_stage_end(done, "INGEST", STAGE_COMPLETED, None)
            .await
            .unwrap();
        assert_eq!(store.fetch_resume_run_id(today).await.unwrap(), None);

        let open = Uuid::new_v4();
        store.record_stage_start(open, "INGEST", None).await.unwrap();
        assert_eq!(store.fetch_resume_run_id(today).await.unwrap(), Some(open));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
