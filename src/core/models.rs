use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured backup subject. Operator-managed; the engine only reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    /// Remote runner service that executes backups/restores for this target.
    pub service: String,
    pub db_path: String,
    /// Additional files/directories to capture, beyond the database.
    pub backup_files: Vec<String>,
    /// Unit to stop while a restore materializes files (may be empty).
    pub service_name: String,
    pub status: TargetStatus,
    pub retention_days: u32,
    pub timeout_seconds: u64,
    pub storage_bucket: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Active,
    Paused,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Active => "active",
            TargetStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TargetStatus::Active),
            "paused" => Some(TargetStatus::Paused),
            _ => None,
        }
    }
}

/// One execution attempt against a target. Backup and restore runs share the
/// same shape; a restore additionally references the backup it restores from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub target_id: i64,
    pub kind: RunKind,
    /// Source backup run for restores, None for backups.
    pub backup_run_id: Option<String>,
    pub status: RunStatus,
    pub trigger: Trigger,
    pub triggered_by: String,
    /// Assigned once dispatch to the remote runner succeeds.
    pub remote_job_id: Option<u64>,
    pub storage_bucket: String,
    pub storage_key: String,
    pub size_bytes: Option<u64>,
    pub checksum_sha256: String,
    pub file_count: Option<u64>,
    pub files_restored: Option<u64>,
    pub error_message: String,
    pub logs: String,
    pub started_at: DateTime<Utc>,
    /// None while the run is non-terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Backup,
    Restore,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Backup => "backup",
            RunKind::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(RunKind::Backup),
            "restore" => Some(RunKind::Restore),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl RunStatus {
    /// Terminal statuses are immutable; only pending/running runs hold the
    /// per-target lock.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "timeout" => Some(RunStatus::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Trigger::Manual),
            "scheduled" => Some(Trigger::Scheduled),
            _ => None,
        }
    }
}
