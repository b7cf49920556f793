use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use echoport::core::report::{self, BackupReport, RestoreReport};
use echoport::core::{Engine, RunKind, Trigger};
use echoport::db::targets::NewTarget;
use echoport::remote::{
    HttpRunner, RemoteRunner, SimulatedPlan, SimulatedRunner, Step, StepState,
};
use echoport::{config, context::AppContext, db, logging};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "echoport")]
#[command(about = "Remote backup and restore orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage backup targets
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Run a backup for a target and wait for it to finish
    Backup { target: String },
    /// Restore a target from one of its successful backups
    Restore {
        target: String,
        /// Backup run id to restore from
        #[arg(long)]
        from: String,
    },
    /// Show run history for a target
    Runs { target: String },
}

#[derive(Subcommand)]
enum TargetCommands {
    Add(AddTargetArgs),
    List,
}

#[derive(Args)]
struct AddTargetArgs {
    name: String,
    /// Remote runner service that executes this target's jobs
    service: String,
    #[arg(long, default_value = "")]
    db_path: String,
    /// Additional files/directories to capture
    #[arg(long = "file")]
    files: Vec<String>,
    /// Unit to stop while restoring
    #[arg(long, default_value = "")]
    service_name: String,
    #[arg(long, default_value_t = 600)]
    timeout_seconds: u64,
    #[arg(long, default_value = "backups")]
    storage_bucket: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::AppConfig::new(Some(&cli.overrides))?;

    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let conn = db::init(&config.database_path)
        .await
        .context("Failed to open database")?;
    let ctx = AppContext::new(config, conn);
    let conn = ctx.db.clone();

    match cli.command {
        Commands::Target { command } => match command {
            TargetCommands::Add(args) => {
                let target = db::targets::create(
                    &conn,
                    NewTarget {
                        name: args.name,
                        service: args.service,
                        db_path: args.db_path,
                        backup_files: args.files,
                        service_name: args.service_name,
                        timeout_seconds: args.timeout_seconds,
                        storage_bucket: args.storage_bucket,
                    },
                )
                .await?;
                println!("Registered target '{}' (id {})", target.name, target.id);
            }
            TargetCommands::List => {
                for target in db::targets::list(&conn).await? {
                    println!(
                        "{:<20} {:<10} service={} bucket={}",
                        target.name,
                        target.status.as_str(),
                        target.service,
                        target.storage_bucket
                    );
                }
            }
        },
        Commands::Backup { target } => {
            let target = db::targets::get_by_name(&conn, target.clone())
                .await?
                .with_context(|| format!("unknown target '{target}'"))?;

            let runner = build_runner(&ctx.config, RunKind::Backup)?;
            let engine = Arc::new(Engine::new(
                conn.clone(),
                runner,
                Duration::from_secs(ctx.config.runner.poll_interval_secs),
            ));

            let run = engine
                .start_backup(&target, Trigger::Manual, "cli", None)
                .await
                .context("Backup failed")?;
            println!(
                "Backup {} finished: {} ({} bytes, {} files) -> {}/{}",
                run.id,
                run.status,
                run.size_bytes.unwrap_or(0),
                run.file_count.unwrap_or(0),
                run.storage_bucket,
                run.storage_key
            );
        }
        Commands::Restore { target, from } => {
            let target = db::targets::get_by_name(&conn, target.clone())
                .await?
                .with_context(|| format!("unknown target '{target}'"))?;
            let Some(backup_run) = db::runs::get(&conn, from.clone()).await? else {
                bail!("unknown backup run '{from}'");
            };

            let runner = build_runner(&ctx.config, RunKind::Restore)?;
            let engine = Arc::new(Engine::new(
                conn.clone(),
                runner,
                Duration::from_secs(ctx.config.runner.poll_interval_secs),
            ));

            let run = engine
                .start_restore(&target, &backup_run, Trigger::Manual, "cli", None)
                .await
                .context("Restore failed")?;
            println!(
                "Restore {} finished: {} ({} files restored)",
                run.id,
                run.status,
                run.files_restored.unwrap_or(0)
            );
        }
        Commands::Runs { target } => {
            let target = db::targets::get_by_name(&conn, target.clone())
                .await?
                .with_context(|| format!("unknown target '{target}'"))?;
            for run in db::runs::list_for_target(&conn, target.id).await? {
                println!(
                    "{}  {:<7} {:<8} {:<9} {}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.kind,
                    run.status,
                    run.trigger.as_str(),
                    if run.error_message.is_empty() {
                        run.storage_key
                    } else {
                        run.error_message
                    }
                );
            }
        }
    }

    Ok(())
}

/// Pick the real HTTP runner or, under `--simulation`, a scripted runner
/// whose job succeeds with a plausible result step.
fn build_runner(config: &config::AppConfig, kind: RunKind) -> Result<Arc<dyn RemoteRunner>> {
    if !config.simulation {
        let runner = HttpRunner::new(
            config.runner.base_url.clone(),
            config.runner.service_token.clone(),
            Duration::from_secs(config.runner.request_timeout_secs),
        )
        .context("Failed to build remote runner client")?;
        return Ok(Arc::new(runner));
    }

    let message = match kind {
        RunKind::Backup => report::encode_backup(&BackupReport::Completed {
            bucket: "backups".to_string(),
            key: "simulated/backup.tar.gz".to_string(),
            size_bytes: 1024,
            checksum_sha256: "0".repeat(64),
            file_count: 1,
        }),
        RunKind::Restore => {
            report::encode_restore(&RestoreReport::Completed { files_restored: 1 })
        }
    }
    .context("Failed to encode simulated result")?;

    let plan = SimulatedPlan::succeeding(vec![
        Step {
            name: "execute".to_string(),
            state: StepState::Success,
            message: String::new(),
        },
        Step {
            name: report::RESULT_STEP_NAME.to_string(),
            state: StepState::Success,
            message,
        },
    ]);
    Ok(Arc::new(SimulatedRunner::new(plan)))
}
