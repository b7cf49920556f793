//! Run lifecycle controller.
//!
//! Drives a run from creation to a terminal status: take the per-target
//! lock, dispatch to the remote runner, poll to completion, reconcile the
//! reported result into the run record. Once a run record exists, every
//! failure path leaves it in a terminal, truthful status before the error
//! reaches the caller; a run is never abandoned in pending or running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rusqlite::Connection;
use tracing::{error, info, warn};

use crate::core::models::{Run, RunKind, RunStatus, Target, TargetStatus, Trigger};
use crate::core::poll::{PollOutcome, poll_until_finished};
use crate::core::report::{self, BackupReport, RestoreReport};
use crate::db::runs::{self, BackupArtifact, NewRun, StoreError};
use crate::remote::{JobStatus, RemoteError, RemoteRunner};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("another run is already active for target '{target}'")]
    LockContention { target: String },
    #[error("failed to dispatch remote job: {0}")]
    Dispatch(#[source] RemoteError),
    #[error("remote job lost during polling: {0}")]
    Remote(#[source] RemoteError),
    #[error("run timed out after {seconds} seconds")]
    TimedOut { seconds: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Engine {
    db: Connection,
    runner: Arc<dyn RemoteRunner>,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(db: Connection, runner: Arc<dyn RemoteRunner>, poll_interval: Duration) -> Self {
        Self {
            db,
            runner,
            poll_interval,
        }
    }

    /// Start a backup for `target` and drive it to a terminal status.
    ///
    /// `existing_run` is a pre-created `pending` run supplied by callers
    /// that insert the record synchronously so a concurrently-polling UI
    /// never misses it. It must belong to this target and still be pending;
    /// otherwise it is failed in place and the precondition error returned.
    pub async fn start_backup(
        &self,
        target: &Target,
        trigger: Trigger,
        triggered_by: &str,
        existing_run: Option<Run>,
    ) -> Result<Run, EngineError> {
        self.require_active(target, existing_run.as_ref()).await?;

        let run = match existing_run {
            Some(run) => {
                self.validate_existing(&run, target, RunKind::Backup, None)
                    .await?
            }
            None => self
                .acquire(NewRun {
                    target_id: target.id,
                    kind: RunKind::Backup,
                    backup_run_id: None,
                    trigger,
                    triggered_by: triggered_by.to_string(),
                    storage_bucket: target.storage_bucket.clone(),
                })
                .await
                .map_err(|e| contention_or(e, target))?,
        };
        info!(run_id = %run.id, target = %target.name, "Starting backup run");

        let context = backup_context(target, &run);
        self.execute(target, run, context).await
    }

    /// Start a restore of `backup_run` onto `target` and drive it to a
    /// terminal status. The source backup must have succeeded and must
    /// carry a checksum; a restore without integrity verification is
    /// refused outright.
    pub async fn start_restore(
        &self,
        target: &Target,
        backup_run: &Run,
        trigger: Trigger,
        triggered_by: &str,
        existing_run: Option<Run>,
    ) -> Result<Run, EngineError> {
        self.require_active(target, existing_run.as_ref()).await?;

        if backup_run.target_id != target.id {
            return Err(self
                .fail_precondition(
                    existing_run.as_ref(),
                    format!(
                        "backup run {} does not belong to target '{}'",
                        backup_run.id, target.name
                    ),
                )
                .await);
        }
        if backup_run.status != RunStatus::Success {
            return Err(self
                .fail_precondition(
                    existing_run.as_ref(),
                    format!(
                        "cannot restore from backup run {} with status '{}'",
                        backup_run.id, backup_run.status
                    ),
                )
                .await);
        }
        if backup_run.checksum_sha256.is_empty() {
            return Err(self
                .fail_precondition(
                    existing_run.as_ref(),
                    format!(
                        "cannot restore from backup run {}: missing checksum for integrity verification",
                        backup_run.id
                    ),
                )
                .await);
        }

        let run = match existing_run {
            Some(run) => {
                self.validate_existing(&run, target, RunKind::Restore, Some(&backup_run.id))
                    .await?
            }
            None => self
                .acquire(NewRun {
                    target_id: target.id,
                    kind: RunKind::Restore,
                    backup_run_id: Some(backup_run.id.clone()),
                    trigger,
                    triggered_by: triggered_by.to_string(),
                    storage_bucket: backup_run.storage_bucket.clone(),
                })
                .await
                .map_err(|e| contention_or(e, target))?,
        };
        info!(
            run_id = %run.id,
            target = %target.name,
            backup_run = %backup_run.id,
            "Starting restore run"
        );

        let context = restore_context(target, backup_run, &run);
        self.execute(target, run, context).await
    }

    /// Create the `pending` record synchronously, then drive the run on its
    /// own worker task. The returned run is already visible to any reader.
    pub async fn spawn_backup(
        self: &Arc<Self>,
        target: Target,
        trigger: Trigger,
        triggered_by: String,
    ) -> Result<(Run, JoinHandle<Result<Run, EngineError>>), EngineError> {
        if target.status != TargetStatus::Active {
            return Err(EngineError::Precondition(format!(
                "target '{}' is not active",
                target.name
            )));
        }
        let pending = self
            .acquire(NewRun {
                target_id: target.id,
                kind: RunKind::Backup,
                backup_run_id: None,
                trigger,
                triggered_by,
                storage_bucket: target.storage_bucket.clone(),
            })
            .await
            .map_err(|e| contention_or(e, &target))?;

        let engine = Arc::clone(self);
        let run = pending.clone();
        let handle = tokio::spawn(async move {
            let trigger = run.trigger;
            let triggered_by = run.triggered_by.clone();
            engine
                .start_backup(&target, trigger, &triggered_by, Some(run))
                .await
        });
        Ok((pending, handle))
    }

    pub async fn spawn_restore(
        self: &Arc<Self>,
        target: Target,
        backup_run: Run,
        trigger: Trigger,
        triggered_by: String,
    ) -> Result<(Run, JoinHandle<Result<Run, EngineError>>), EngineError> {
        if target.status != TargetStatus::Active {
            return Err(EngineError::Precondition(format!(
                "target '{}' is not active",
                target.name
            )));
        }
        let pending = self
            .acquire(NewRun {
                target_id: target.id,
                kind: RunKind::Restore,
                backup_run_id: Some(backup_run.id.clone()),
                trigger,
                triggered_by,
                storage_bucket: backup_run.storage_bucket.clone(),
            })
            .await
            .map_err(|e| contention_or(e, &target))?;

        let engine = Arc::clone(self);
        let run = pending.clone();
        let handle = tokio::spawn(async move {
            let trigger = run.trigger;
            let triggered_by = run.triggered_by.clone();
            engine
                .start_restore(&target, &backup_run, trigger, &triggered_by, Some(run))
                .await
        });
        Ok((pending, handle))
    }

    /// Dispatch, poll, reconcile. The run already exists and holds the lock.
    async fn execute(
        &self,
        target: &Target,
        run: Run,
        context: BTreeMap<String, String>,
    ) -> Result<Run, EngineError> {
        // The timeout is measured from dispatch, not from the first poll.
        let deadline = Instant::now() + Duration::from_secs(target.timeout_seconds);

        let job_id = match self.runner.dispatch(&target.service, &context).await {
            Ok(id) => id,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Dispatch failed");
                runs::mark_failed(
                    &self.db,
                    run.id.clone(),
                    format!("failed to dispatch remote job: {e}"),
                    None,
                )
                .await?;
                return Err(EngineError::Dispatch(e));
            }
        };

        runs::set_running(&self.db, run.id.clone(), job_id).await?;
        info!(run_id = %run.id, job_id, "Run dispatched, polling for completion");

        match poll_until_finished(self.runner.as_ref(), job_id, self.poll_interval, deadline).await
        {
            Ok(PollOutcome::Finished(status)) => self.reconcile(&run, status).await,
            Ok(PollOutcome::TimedOut { waited }) => {
                warn!(
                    run_id = %run.id,
                    job_id,
                    waited_secs = waited.as_secs(),
                    "Deadline exceeded; remote job cannot be cancelled and may still be running"
                );
                runs::mark_timeout(
                    &self.db,
                    run.id.clone(),
                    format!(
                        "{} timed out after {} seconds; the remote job was not cancelled",
                        run.kind, target.timeout_seconds
                    ),
                    None,
                )
                .await?;
                Err(EngineError::TimedOut {
                    seconds: target.timeout_seconds,
                })
            }
            Err(e) => {
                error!(run_id = %run.id, job_id, error = %e, "Remote job lost");
                runs::mark_failed(
                    &self.db,
                    run.id.clone(),
                    format!("remote job {job_id} disappeared during execution"),
                    None,
                )
                .await?;
                Err(EngineError::Remote(e))
            }
        }
    }

    /// Translate the remote job's terminal status into the run's terminal
    /// status and outcome fields.
    async fn reconcile(&self, run: &Run, status: JobStatus) -> Result<Run, EngineError> {
        let logs = status.collected_logs();

        if !status.is_successful() {
            let error_message = status
                .failed_step()
                .map(|s| s.message.clone())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "remote job failed".to_string());
            error!(run_id = %run.id, error = %error_message, "Remote job failed");
            runs::mark_failed(&self.db, run.id.clone(), error_message, Some(logs)).await?;
            return self.reload(&run.id).await;
        }

        match run.kind {
            RunKind::Backup => match report::decode_backup_report(&status.steps) {
                Ok(BackupReport::Completed {
                    bucket,
                    key,
                    size_bytes,
                    checksum_sha256,
                    file_count,
                }) => {
                    info!(
                        run_id = %run.id,
                        key = %key,
                        size_bytes,
                        file_count,
                        "Backup completed"
                    );
                    runs::finish_backup_success(
                        &self.db,
                        run.id.clone(),
                        Some(BackupArtifact {
                            storage_bucket: bucket,
                            storage_key: key,
                            size_bytes,
                            checksum_sha256,
                            file_count,
                        }),
                        logs,
                    )
                    .await?;
                }
                Ok(BackupReport::Failed { error }) => {
                    error!(run_id = %run.id, error = %error, "Backup reported failure");
                    runs::mark_failed(&self.db, run.id.clone(), error, Some(logs)).await?;
                }
                Err(e) => {
                    // Legacy scripts may not emit a result step; the job
                    // itself succeeded, so this is a degraded success with
                    // empty outcome fields.
                    warn!(run_id = %run.id, error = %e, "Backup succeeded without a decodable result");
                    runs::finish_backup_success(&self.db, run.id.clone(), None, logs).await?;
                }
            },
            RunKind::Restore => match report::decode_restore_report(&status.steps) {
                Ok(RestoreReport::Completed { files_restored }) => {
                    info!(run_id = %run.id, files_restored, "Restore completed");
                    runs::finish_restore_success(&self.db, run.id.clone(), files_restored, logs)
                        .await?;
                }
                Ok(RestoreReport::Failed { error }) => {
                    error!(run_id = %run.id, error = %error, "Restore reported failure");
                    runs::mark_failed(&self.db, run.id.clone(), error, Some(logs)).await?;
                }
                Err(e) => {
                    // A restore must positively confirm what it did; an
                    // unreported outcome could be hiding a partial
                    // materialization.
                    error!(run_id = %run.id, error = %e, "Restore finished without a decodable result");
                    runs::mark_failed(
                        &self.db,
                        run.id.clone(),
                        "restore completed but no result was reported - status unknown"
                            .to_string(),
                        Some(logs),
                    )
                    .await?;
                }
            },
        }

        self.reload(&run.id).await
    }

    async fn reload(&self, run_id: &str) -> Result<Run, EngineError> {
        runs::get(&self.db, run_id.to_string())
            .await?
            .ok_or_else(|| EngineError::Store(StoreError::NotFound(run_id.to_string())))
    }

    async fn acquire(&self, new: NewRun) -> Result<Run, StoreError> {
        runs::create_pending(&self.db, new).await
    }

    async fn require_active(
        &self,
        target: &Target,
        existing_run: Option<&Run>,
    ) -> Result<(), EngineError> {
        if target.status == TargetStatus::Active {
            return Ok(());
        }
        Err(self
            .fail_precondition(
                existing_run,
                format!("target '{}' is not active", target.name),
            )
            .await)
    }

    /// Validate a caller-supplied pending run; on any mismatch the run is
    /// failed in place so nothing is left stranded in `pending`.
    async fn validate_existing(
        &self,
        run: &Run,
        target: &Target,
        kind: RunKind,
        backup_run_id: Option<&str>,
    ) -> Result<Run, EngineError> {
        if run.target_id != target.id {
            return Err(self
                .fail_precondition(
                    Some(run),
                    format!(
                        "existing run {} belongs to target {}, not '{}'",
                        run.id, run.target_id, target.name
                    ),
                )
                .await);
        }
        if run.kind != kind {
            return Err(self
                .fail_precondition(
                    Some(run),
                    format!("existing run {} is a {}, expected {}", run.id, run.kind, kind),
                )
                .await);
        }
        if let Some(expected) = backup_run_id {
            if run.backup_run_id.as_deref() != Some(expected) {
                return Err(self
                    .fail_precondition(
                        Some(run),
                        format!(
                            "existing run {} restores from backup {:?}, not {}",
                            run.id, run.backup_run_id, expected
                        ),
                    )
                    .await);
            }
        }
        if run.status != RunStatus::Pending {
            return Err(self
                .fail_precondition(
                    Some(run),
                    format!(
                        "existing run {} has status '{}', expected 'pending'",
                        run.id, run.status
                    ),
                )
                .await);
        }
        Ok(run.clone())
    }

    /// Build the precondition error, first moving any pre-created run to
    /// `failed` with the reason. A failure to record that is logged but
    /// never masks the original error.
    async fn fail_precondition(&self, existing_run: Option<&Run>, reason: String) -> EngineError {
        if let Some(run) = existing_run {
            if let Err(e) =
                runs::mark_failed(&self.db, run.id.clone(), reason.clone(), None).await
            {
                error!(run_id = %run.id, error = %e, "Failed to fail pre-created run");
            }
        }
        EngineError::Precondition(reason)
    }
}

fn contention_or(err: StoreError, target: &Target) -> EngineError {
    match err {
        StoreError::ActiveRunExists => EngineError::LockContention {
            target: target.name.clone(),
        },
        other => EngineError::Store(other),
    }
}

fn backup_context(target: &Target, run: &Run) -> BTreeMap<String, String> {
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
    BTreeMap::from([
        ("ECHOPORT_TARGET".to_string(), target.name.clone()),
        ("ECHOPORT_RUN_ID".to_string(), run.id.clone()),
        ("ECHOPORT_DB_PATH".to_string(), target.db_path.clone()),
        (
            "ECHOPORT_BACKUP_FILES".to_string(),
            target.backup_files.join(","),
        ),
        (
            "ECHOPORT_BUCKET".to_string(),
            target.storage_bucket.clone(),
        ),
        (
            "ECHOPORT_KEY_PREFIX".to_string(),
            format!("{}/{}", target.name, timestamp),
        ),
        ("ECHOPORT_TIMESTAMP".to_string(), timestamp),
    ])
}

fn restore_context(target: &Target, backup_run: &Run, run: &Run) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("ECHOPORT_ACTION".to_string(), "restore".to_string()),
        ("ECHOPORT_TARGET".to_string(), target.name.clone()),
        ("ECHOPORT_RESTORE_ID".to_string(), run.id.clone()),
        ("ECHOPORT_DB_PATH".to_string(), target.db_path.clone()),
        (
            "ECHOPORT_BACKUP_FILES".to_string(),
            target.backup_files.join(","),
        ),
        (
            "ECHOPORT_BUCKET".to_string(),
            backup_run.storage_bucket.clone(),
        ),
        ("ECHOPORT_KEY".to_string(), backup_run.storage_key.clone()),
        (
            "ECHOPORT_CHECKSUM".to_string(),
            backup_run.checksum_sha256.clone(),
        ),
        (
            "ECHOPORT_SERVICE_NAME".to_string(),
            target.service_name.clone(),
        ),
    ])
}
