use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use super::JobStore;
use crate::errors::{StoreError, StoreResult};
use crate::jobs::model::{BatchId, JobId, JobRecord, JobState};
use crate::models::RedactionResult;

const COLUMNS: &str =
    "id, batch_id, source, state, result, error, attempts, created_at, updated_at";

/// Job store backed by a SQLite database file (WAL mode)
pub struct SqliteJobStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("path", &self.path)
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Unreachable(format!("{}: {}", parent.display(), e))
                })?;
            }
        }

        let connect_opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Job store opened at {}", path.display());
        Ok(Self { path, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the WAL and close every connection. Later calls fail as unreachable.
    pub async fn close(&self) {
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .execute(&self.pool)
            .await
        {
            warn!("WAL checkpoint failed: {}", e);
        }
        self.pool.close().await;
    }

    fn invalid_transition(id: JobId, to: JobState) -> StoreError {
        StoreError::InvalidTransition {
            job_id: id.to_string(),
            to: to.as_str(),
        }
    }
}

fn now() -> StoreResult<String> {
    format_time(OffsetDateTime::now_utc())
}

fn format_time(t: OffsetDateTime) -> StoreResult<String> {
    t.format(&Rfc3339)
        .map_err(|e| StoreError::Corrupt(format!("timestamp: {}", e)))
}

fn parse_time(s: &str) -> StoreResult<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", s, e)))
}

fn decode_row(row: &SqliteRow) -> StoreResult<JobRecord> {
    let id: String = row.try_get("id")?;
    let batch_id: Option<String> = row.try_get("batch_id")?;
    let state: i64 = row.try_get("state")?;
    let result: Option<String> = row.try_get("result")?;
    let attempts: i64 = row.try_get("attempts")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(JobRecord {
        id: id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("job id {:?}: {}", id, e)))?,
        batch_id: batch_id
            .map(|b| b.parse::<BatchId>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("batch id: {}", e)))?,
        source: row.try_get("source")?,
        state: JobState::try_from(state)?,
        result: result
            .map(|r| serde_json::from_str::<RedactionResult>(&r))
            .transpose()?,
        error: row.try_get("error")?,
        attempts: u32::try_from(attempts)
            .map_err(|_| StoreError::Corrupt(format!("attempts: {}", attempts)))?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

impl JobStore for SqliteJobStore {
    async fn insert(&self, jobs: &[JobRecord]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(&format!(
                "INSERT INTO redaction_job ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                COLUMNS
            ))
            .bind(job.id.to_string())
            .bind(job.batch_id.map(|b| b.to_string()))
            .bind(&job.source)
            .bind(i64::from(job.state))
            .bind(result)
            .bind(&job.error)
            .bind(i64::from(job.attempts))
            .bind(format_time(job.created_at)?)
            .bind(format_time(job.updated_at)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, id: JobId) -> StoreResult<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM redaction_job WHERE id = ?", COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn load_batch(&self, batch_id: BatchId) -> StoreResult<Vec<JobRecord>> {
        sqlx::query(&format!(
            "SELECT {} FROM redaction_job WHERE batch_id = ? ORDER BY created_at ASC, id ASC",
            COLUMNS
        ))
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(decode_row)
        .collect()
    }

    async fn mark_started(&self, id: JobId) -> StoreResult<u32> {
        let row = sqlx::query(
            "UPDATE redaction_job SET state = ?, attempts = attempts + 1, updated_at = ?
             WHERE id = ? AND state IN (?, ?) RETURNING attempts",
        )
        .bind(i64::from(JobState::Started))
        .bind(now()?)
        .bind(id.to_string())
        .bind(i64::from(JobState::Pending))
        .bind(i64::from(JobState::Started))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(Self::invalid_transition(id, JobState::Started));
        };
        let attempts: i64 = row.try_get("attempts")?;
        u32::try_from(attempts).map_err(|_| StoreError::Corrupt(format!("attempts: {}", attempts)))
    }

    async fn mark_success(&self, id: JobId, result: &RedactionResult) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE redaction_job SET state = ?, result = ?, error = NULL, updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(i64::from(JobState::Success))
        .bind(serde_json::to_string(result)?)
        .bind(now()?)
        .bind(id.to_string())
        .bind(i64::from(JobState::Started))
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(Self::invalid_transition(id, JobState::Success));
        }
        Ok(())
    }

    async fn mark_failure(&self, id: JobId, reason: &str) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE redaction_job SET state = ?, error = ?, updated_at = ?
             WHERE id = ? AND state IN (?, ?)",
        )
        .bind(i64::from(JobState::Failure))
        .bind(reason)
        .bind(now()?)
        .bind(id.to_string())
        .bind(i64::from(JobState::Pending))
        .bind(i64::from(JobState::Started))
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(Self::invalid_transition(id, JobState::Failure));
        }
        Ok(())
    }

    async fn fail_incomplete(&self, reason: &str) -> StoreResult<u64> {
        let done = sqlx::query(
            "UPDATE redaction_job SET state = ?, error = ?, updated_at = ? WHERE state IN (?, ?)",
        )
        .bind(i64::from(JobState::Failure))
        .bind(reason)
        .bind(now()?)
        .bind(i64::from(JobState::Pending))
        .bind(i64::from(JobState::Started))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn succeeded_artifacts(&self) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query("SELECT result FROM redaction_job WHERE state = ? AND result IS NOT NULL")
            .bind(i64::from(JobState::Success))
            .fetch_all(&self.pool)
            .await?;
        let mut artifacts = HashSet::with_capacity(rows.len());
        for row in &rows {
            let result: String = row.try_get("result")?;
            let result: RedactionResult = serde_json::from_str(&result)?;
            artifacts.insert(result.output_image);
        }
        Ok(artifacts)
    }

    async fn count(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM redaction_job")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}
