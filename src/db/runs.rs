//! Run records and the concurrency lock.
//!
//! The per-target lock is not a mutex: it is the partial unique index
//! `one_active_run_per_target` over non-terminal rows. Creating a run while
//! another is pending/running is rejected atomically by SQLite, and every
//! terminal transition releases the lock by making the row terminal.

use chrono::Utc;
use tokio_rusqlite::{Connection, params, rusqlite};
use tokio_rusqlite::rusqlite::TransactionBehavior;
use uuid::Uuid;

use crate::core::models::{Run, RunKind, RunStatus, Trigger};

/// How SQLite reports a violation of the `one_active_run_per_target` index.
/// The message names the indexed column, which no other unique constraint on
/// `runs` shares, so this is enough to tell lock contention apart from
/// unrelated integrity violations.
const ACTIVE_RUN_CONSTRAINT: &str = "UNIQUE constraint failed: runs.target_id";

const NON_TERMINAL: &str = "('pending', 'running')";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another pending/running run holds the lock for this target.
    #[error("an active run already exists for this target")]
    ActiveRunExists,
    #[error("run {0} not found")]
    NotFound(String),
    /// The run already reached a terminal status; terminal runs are immutable.
    #[error("run {0} is no longer active")]
    NotActive(String),
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub target_id: i64,
    pub kind: RunKind,
    pub backup_run_id: Option<String>,
    pub trigger: Trigger,
    pub triggered_by: String,
    pub storage_bucket: String,
}

/// Create a `pending` run, taking the per-target lock.
///
/// The existence check and the insert run inside a single immediate
/// transaction, so concurrent creators are serialized by SQLite's writer
/// lock; the unique index catches anything the check cannot see. Losing
/// either way maps to [`StoreError::ActiveRunExists`].
pub async fn create_pending(conn: &Connection, new: NewRun) -> Result<Run, StoreError> {
    let id = Uuid::now_v7().to_string();
    let started_at = Utc::now().to_rfc3339();
    let run_id = id.clone();

    let inserted = conn
        .call(move |c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let active: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM runs WHERE target_id = ?1 AND status IN {NON_TERMINAL}"
                ),
                params![new.target_id],
                |row| row.get(0),
            )?;
            if active > 0 {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO runs (id, target_id, kind, backup_run_id, status, trigger,
                                   triggered_by, storage_bucket, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)",
                params![
                    &id,
                    new.target_id,
                    new.kind.as_str(),
                    &new.backup_run_id,
                    new.trigger.as_str(),
                    &new.triggered_by,
                    &new.storage_bucket,
                    &started_at,
                ],
            )?;

            tx.commit()?;
            Ok::<bool, rusqlite::Error>(true)
        })
        .await
        .map_err(map_lock_error)?;

    if !inserted {
        return Err(StoreError::ActiveRunExists);
    }

    get(conn, run_id.clone())
        .await?
        .ok_or(StoreError::NotFound(run_id))
}

/// Narrow a unique-index rejection down to lock contention; any other
/// database failure keeps its own identity.
fn map_lock_error(err: tokio_rusqlite::Error) -> StoreError {
    if let tokio_rusqlite::Error::Error(rusqlite::Error::SqliteFailure(e, Some(msg))) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains(ACTIVE_RUN_CONSTRAINT)
        {
            return StoreError::ActiveRunExists;
        }
    }
    StoreError::Db(err)
}

pub async fn get(conn: &Connection, run_id: String) -> Result<Option<Run>, StoreError> {
    let run = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!("{SELECT_RUN} WHERE id = ?1"))?;
            let mut rows = stmt.query_map(params![run_id], run_from_row)?;
            rows.next().transpose()
        })
        .await?;
    Ok(run)
}

/// The run currently holding the lock for a target, if any.
pub async fn active_for_target(conn: &Connection, target_id: i64) -> Result<Option<Run>, StoreError> {
    let run = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "{SELECT_RUN} WHERE target_id = ?1 AND status IN {NON_TERMINAL}"
            ))?;
            let mut rows = stmt.query_map(params![target_id], run_from_row)?;
            rows.next().transpose()
        })
        .await?;
    Ok(run)
}

pub async fn list_for_target(conn: &Connection, target_id: i64) -> Result<Vec<Run>, StoreError> {
    let runs = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "{SELECT_RUN} WHERE target_id = ?1 ORDER BY started_at DESC"
            ))?;
            let rows = stmt.query_map(params![target_id], run_from_row)?;
            rows.collect()
        })
        .await?;
    Ok(runs)
}

/// pending -> running, recording the remote job id.
pub async fn set_running(conn: &Connection, run_id: String, remote_job_id: u64) -> Result<(), StoreError> {
    let id = run_id.clone();
    let affected = conn
        .call(move |c| {
            c.execute(
                "UPDATE runs SET status = 'running', remote_job_id = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, remote_job_id],
            )
        })
        .await?;
    require_transition(conn, run_id, affected).await
}

/// Terminal transition shared by failed/timeout. Logs are only written when
/// the caller collected any.
async fn finish_with_error(
    conn: &Connection,
    run_id: String,
    status: RunStatus,
    error_message: String,
    logs: Option<String>,
) -> Result<(), StoreError> {
    let id = run_id.clone();
    let finished_at = Utc::now().to_rfc3339();
    let affected = conn
        .call(move |c| {
            c.execute(
                &format!(
                    "UPDATE runs SET status = ?2, error_message = ?3,
                            logs = COALESCE(?4, logs), finished_at = ?5
                     WHERE id = ?1 AND status IN {NON_TERMINAL}"
                ),
                params![id, status.as_str(), error_message, logs, finished_at],
            )
        })
        .await?;
    require_transition(conn, run_id, affected).await
}

pub async fn mark_failed(
    conn: &Connection,
    run_id: String,
    error_message: String,
    logs: Option<String>,
) -> Result<(), StoreError> {
    finish_with_error(conn, run_id, RunStatus::Failed, error_message, logs).await
}

pub async fn mark_timeout(
    conn: &Connection,
    run_id: String,
    error_message: String,
    logs: Option<String>,
) -> Result<(), StoreError> {
    finish_with_error(conn, run_id, RunStatus::Timeout, error_message, logs).await
}

/// Outcome metadata extracted from a successful backup's result step.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub storage_bucket: String,
    pub storage_key: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    pub file_count: u64,
}

/// Terminal success for a backup run. `artifact` is None for the degraded
/// path where the remote job succeeded without reporting a result.
pub async fn finish_backup_success(
    conn: &Connection,
    run_id: String,
    artifact: Option<BackupArtifact>,
    logs: String,
) -> Result<(), StoreError> {
    let id = run_id.clone();
    let finished_at = Utc::now().to_rfc3339();
    let affected = conn
        .call(move |c| match artifact {
            Some(a) => c.execute(
                &format!(
                    "UPDATE runs SET status = 'success', storage_bucket = ?2, storage_key = ?3,
                            size_bytes = ?4, checksum_sha256 = ?5, file_count = ?6,
                            logs = ?7, finished_at = ?8
                     WHERE id = ?1 AND status IN {NON_TERMINAL}"
                ),
                params![
                    id,
                    a.storage_bucket,
                    a.storage_key,
                    a.size_bytes,
                    a.checksum_sha256,
                    a.file_count,
                    logs,
                    finished_at
                ],
            ),
            None => c.execute(
                &format!(
                    "UPDATE runs SET status = 'success', logs = ?2, finished_at = ?3
                     WHERE id = ?1 AND status IN {NON_TERMINAL}"
                ),
                params![id, logs, finished_at],
            ),
        })
        .await?;
    require_transition(conn, run_id, affected).await
}

pub async fn finish_restore_success(
    conn: &Connection,
    run_id: String,
    files_restored: u64,
    logs: String,
) -> Result<(), StoreError> {
    let id = run_id.clone();
    let finished_at = Utc::now().to_rfc3339();
    let affected = conn
        .call(move |c| {
            c.execute(
                &format!(
                    "UPDATE runs SET status = 'success', files_restored = ?2,
                            logs = ?3, finished_at = ?4
                     WHERE id = ?1 AND status IN {NON_TERMINAL}"
                ),
                params![id, files_restored, logs, finished_at],
            )
        })
        .await?;
    require_transition(conn, run_id, affected).await
}

/// Every transition UPDATE is guarded by the non-terminal predicate; zero
/// affected rows means the run is gone or already terminal.
async fn require_transition(
    conn: &Connection,
    run_id: String,
    affected: usize,
) -> Result<(), StoreError> {
    if affected == 1 {
        return Ok(());
    }
    match get(conn, run_id.clone()).await? {
        Some(_) => Err(StoreError::NotActive(run_id)),
        None => Err(StoreError::NotFound(run_id)),
    }
}

const SELECT_RUN: &str = "SELECT id, target_id, kind, backup_run_id, status, trigger,
        triggered_by, remote_job_id, storage_bucket, storage_key, size_bytes,
        checksum_sha256, file_count, files_restored, error_message, logs,
        started_at, finished_at
        FROM runs";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let kind: String = row.get(2)?;
    let status: String = row.get(4)?;
    let trigger: String = row.get(5)?;
    let finished_at: Option<String> = row.get(17)?;

    Ok(Run {
        id: row.get(0)?,
        target_id: row.get(1)?,
        kind: RunKind::parse(&kind).ok_or_else(|| bad_column(2, &kind))?,
        backup_run_id: row.get(3)?,
        status: RunStatus::parse(&status).ok_or_else(|| bad_column(4, &status))?,
        trigger: Trigger::parse(&trigger).ok_or_else(|| bad_column(5, &trigger))?,
        triggered_by: row.get(6)?,
        remote_job_id: row.get(7)?,
        storage_bucket: row.get(8)?,
        storage_key: row.get(9)?,
        size_bytes: row.get(10)?,
        checksum_sha256: row.get(11)?,
        file_count: row.get(12)?,
        files_restored: row.get(13)?,
        error_message: row.get(14)?,
        logs: row.get(15)?,
        started_at: super::targets::parse_timestamp(row, 16)?,
        finished_at: finished_at
            .map(|raw| {
                chrono::DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            17,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })
            })
            .transpose()?,
    })
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}
