use std::sync::Arc;
use std::time::Duration;

use echoport::core::report::{self, RestoreReport};
use echoport::core::{Engine, EngineError, Run, RunKind, RunStatus, Target, Trigger};
use echoport::db::{self, runs, targets::NewTarget};
use echoport::remote::{SimulatedPlan, SimulatedRunner, Step, StepState};
use tokio_rusqlite::Connection;

async fn setup_db() -> (tempfile::TempDir, Connection) {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = db::init(&dir.path().join("echoport.db"))
        .await
        .expect("db init");
    (dir, conn)
}

async fn seed_target(conn: &Connection, name: &str) -> Target {
    db::targets::create(
        conn,
        NewTarget {
            name: name.to_string(),
            service: "echoport-backup".to_string(),
            db_path: "/home/nyxmon/site/db.sqlite3".to_string(),
            backup_files: vec!["media".to_string()],
            service_name: "nyxmon.service".to_string(),
            timeout_seconds: 600,
            storage_bucket: "backups".to_string(),
        },
    )
    .await
    .expect("create target")
}

/// Drive a backup run to terminal success through the store, as a finished
/// earlier run would have left it.
async fn seed_successful_backup(conn: &Connection, target: &Target, checksum: &str) -> Run {
    let run = runs::create_pending(
        conn,
        runs::NewRun {
            target_id: target.id,
            kind: RunKind::Backup,
            backup_run_id: None,
            trigger: Trigger::Manual,
            triggered_by: String::new(),
            storage_bucket: "backups".to_string(),
        },
    )
    .await
    .expect("create backup run");
    runs::set_running(conn, run.id.clone(), 7).await.expect("running");
    runs::finish_backup_success(
        conn,
        run.id.clone(),
        Some(runs::BackupArtifact {
            storage_bucket: "backups".to_string(),
            storage_key: "nyxmon/2026-01-01.tar.gz".to_string(),
            size_bytes: 45231,
            checksum_sha256: checksum.to_string(),
            file_count: 2,
        }),
        String::new(),
    )
    .await
    .expect("finish backup");
    runs::get(conn, run.id).await.expect("get").expect("exists")
}

fn make_engine(conn: &Connection, runner: SimulatedRunner) -> (Arc<Engine>, Arc<SimulatedRunner>) {
    let runner = Arc::new(runner);
    let engine = Arc::new(Engine::new(
        conn.clone(),
        runner.clone(),
        Duration::from_millis(10),
    ));
    (engine, runner)
}

fn result_step(message: &str) -> Step {
    Step {
        name: "result".to_string(),
        state: StepState::Success,
        message: message.to_string(),
    }
}

#[tokio::test]
async fn restore_runs_to_success_with_confirmed_outcome() {
    let (_dir, conn) = setup_db().await;
    let target = seed_target(&conn, "nyxmon").await;
    let backup = seed_successful_backup(&conn, &target, "abc123").await;

    let message = report::encode_restore(&RestoreReport::Completed { files_restored: 2 })
        .expect("encode");
    let (engine, runner) = make_engine(
        &conn,
        SimulatedRunner::new(SimulatedPlan::succeeding(vec![result_step(&message)])),
    );

    let run = engine
        .start_restore(&target, &backup, Trigger::Manual, "tester", None)
        .await
        .expect("restore succeeds");

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.kind, RunKind::Restore);
    assert_eq!(run.backup_run_id.as_deref(), Some(backup.id.as_str()));
    assert_eq!(run.files_restored, Some(2));

    // The restore environment points the remote job at the exact artifact.
    let dispatched = runner.dispatched_contexts().await;
    let (_, context) = &dispatched[0];
    assert_eq!(context["ECHOPORT_ACTION"], "restore");
    assert_eq!(context["ECHOPORT_KEY"], "nyxmon/2026-01-01.tar.gz");
    assert_eq!(context["ECHOPORT_CHECKSUM"], "abc123");
    assert_eq!(context["ECHOPORT_SERVICE_NAME"], "nyxmon.service");
}

#[tokio::test]
async fn restore_without_result_step_fails_hard() {
    let (_dir, conn) = setup_db().await;
    let target = seed_target(&conn, "nyxmon").await;
    let backup = seed_successful_backup(&conn, &target, "abc123").await;

    // Remote job succeeded but confirmed nothing.
    let steps = vec![Step {
        name: "extract".to_string(),
        state: StepState::Success,
        message: "done".to_string(),
    }];
    let (engine, _runner) =
        make_engine(&conn, SimulatedRunner::new(SimulatedPlan::succeeding(steps)));

    let run = engine
        .start_restore(&target, &backup, Trigger::Manual, "tester", None)
        .await
        .expect("run reaches terminal state");

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.contains("no result was reported"));
    assert_eq!(run.files_restored, None);
}

#[tokio::test]
async fn restore_from_unsuccessful_backup_is_refused() {
    let (_dir, conn) = setup_db().await;
    let target = seed_target(&conn, "nyxmon").await;

    let backup = runs::create_pending(
        &conn,
        runs::NewRun {
            target_id: target.id,
            kind: RunKind::Backup,
            backup_run_id: None,
            trigger: Trigger::Manual,
            triggered_by: String::new(),
            storage_bucket: "backups".to_string(),
        },
    )
    .await
    .expect("create");
    runs::mark_failed(&conn, backup.id.clone(), "boom".to_string(), None)
        .await
        .expect("fail it");
    let backup = runs::get(&conn, backup.id).await.expect("get").expect("exists");

    let (engine, _runner) =
        make_engine(&conn, SimulatedRunner::new(SimulatedPlan::succeeding(Vec::new())));

    let err = engine
        .start_restore(&target, &backup, Trigger::Manual, "tester", None)
        .await
        .expect_err("failed backup is not restorable");
    assert!(matches!(err, EngineError::Precondition(_)));
    assert!(err.to_string().contains("status 'failed'"));
}

#[tokio::test]
async fn restore_without_checksum_is_refused() {
    let (_dir, conn) = setup_db().await;
    let target = seed_target(&conn, "nyxmon").await;
    let backup = seed_successful_backup(&conn, &target, "").await;

    let (engine, _runner) =
        make_engine(&conn, SimulatedRunner::new(SimulatedPlan::succeeding(Vec::new())));

    let err = engine
        .start_restore(&target, &backup, Trigger::Manual, "tester", None)
        .await
        .expect_err("missing checksum");
    assert!(matches!(err, EngineError::Precondition(_)));
    assert!(err.to_string().contains("checksum"));
}

#[tokio::test]
async fn restore_is_blocked_while_backup_is_active() {
    let (_dir, conn) = setup_db().await;
    let target = seed_target(&conn, "nyxmon").await;
    let backup = seed_successful_backup(&conn, &target, "abc123").await;

    // A new backup takes the lock and stays non-terminal.
    let _active = runs::create_pending(
        &conn,
        runs::NewRun {
            target_id: target.id,
            kind: RunKind::Backup,
            backup_run_id: None,
            trigger: Trigger::Scheduled,
            triggered_by: "scheduler".to_string(),
            storage_bucket: "backups".to_string(),
        },
    )
    .await
    .expect("active backup");

    let (engine, _runner) =
        make_engine(&conn, SimulatedRunner::new(SimulatedPlan::succeeding(Vec::new())));

    let err = engine
        .start_restore(&target, &backup, Trigger::Manual, "tester", None)
        .await
        .expect_err("cross-lock");
    assert!(matches!(err, EngineError::LockContention { .. }));
}

#[tokio::test]
async fn backup_is_blocked_while_restore_is_active() {
    let (_dir, conn) = setup_db().await;
    let target = seed_target(&conn, "nyxmon").await;
    let backup = seed_successful_backup(&conn, &target, "abc123").await;

    let _active = runs::create_pending(
        &conn,
        runs::NewRun {
            target_id: target.id,
            kind: RunKind::Restore,
            backup_run_id: Some(backup.id.clone()),
            trigger: Trigger::Manual,
            triggered_by: String::new(),
            storage_bucket: "backups".to_string(),
        },
    )
    .await
    .expect("active restore");

    let (engine, _runner) =
        make_engine(&conn, SimulatedRunner::new(SimulatedPlan::succeeding(Vec::new())));

    let err = engine
        .start_backup(&target, Trigger::Manual, "tester", None)
        .await
        .expect_err("cross-lock");
    assert!(matches!(err, EngineError::LockContention { .. }));
}

#[tokio::test]
async fn existing_run_for_wrong_backup_is_failed_in_place() {
    let (_dir, conn) = setup_db().await;
    let target = seed_target(&conn, "nyxmon").await;
    let backup_a = seed_successful_backup(&conn, &target, "aaa111").await;
    let backup_b = seed_successful_backup(&conn, &target, "bbb222").await;

    // Pre-created restore references backup A, but the caller asks to
    // restore backup B.
    let pending = runs::create_pending(
        &conn,
        runs::NewRun {
            target_id: target.id,
            kind: RunKind::Restore,
            backup_run_id: Some(backup_a.id.clone()),
            trigger: Trigger::Manual,
            triggered_by: "ui".to_string(),
            storage_bucket: "backups".to_string(),
        },
    )
    .await
    .expect("pre-create");

    let (engine, _runner) =
        make_engine(&conn, SimulatedRunner::new(SimulatedPlan::succeeding(Vec::new())));

    let err = engine
        .start_restore(&target, &backup_b, Trigger::Manual, "ui", Some(pending.clone()))
        .await
        .expect_err("mismatched source backup");
    assert!(matches!(err, EngineError::Precondition(_)));

    let pending = runs::get(&conn, pending.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(pending.status, RunStatus::Failed);
    assert!(pending.finished_at.is_some());
}
