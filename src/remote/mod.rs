//! Client side of the remote job-execution API.
//!
//! The engine never performs backup or restore I/O itself; it submits a unit
//! of work with an environment-style context, then observes progress by
//! polling. [`RemoteRunner`] is the seam: [`http::HttpRunner`] talks to the
//! real API, [`simulated::SimulatedRunner`] replays a scripted plan.

mod http;
mod simulated;

pub use http::HttpRunner;
pub use simulated::{SimulatedPlan, SimulatedRunner};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The runner accepted no job (non-2xx on dispatch).
    #[error("dispatch rejected: HTTP {status}: {body}")]
    Dispatch { status: u16, body: String },
    /// The job id is unknown to the runner.
    #[error("remote job {0} not found")]
    NotFound(u64),
    /// Non-2xx while polling an existing job.
    #[error("status request failed: HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// Connection-level failure; retryable while the deadline allows.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RemoteError {
    /// Whether a poll loop should retry instead of failing the run. A job
    /// that vanished is not transient; a network hiccup or server error is.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Http { .. } => true,
            RemoteError::Dispatch { .. } | RemoteError::NotFound(_) => false,
        }
    }
}

/// Externally-owned snapshot of a remote job, fetched once per poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: u64,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub finished: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn is_successful(&self) -> bool {
        self.is_finished()
            && self
                .steps
                .iter()
                .all(|s| matches!(s.state, StepState::Success | StepState::Skipped))
    }

    pub fn failed_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.state == StepState::Failure)
    }

    /// Flatten the step sequence into the log text stored on the run.
    pub fn collected_logs(&self) -> String {
        let mut parts = Vec::new();
        for step in &self.steps {
            parts.push(format!("[{}] ({})", step.name, step.state.as_str()));
            if !step.message.is_empty() {
                parts.push(step.message.clone());
            }
        }
        parts.join("\n")
    }
}

/// One named step of a remote job. `message` is free text, capped at 4096
/// bytes by the remote side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub state: StepState,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Success,
    Skipped,
    Failure,
    #[serde(other)]
    Unknown,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Success => "success",
            StepState::Skipped => "skipped",
            StepState::Failure => "failure",
            StepState::Unknown => "unknown",
        }
    }
}

/// Dispatch-and-poll contract against the remote runner. No cancellation is
/// offered because the remote side has no cancellation primitive; a caller
/// that gives up simply stops polling.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Submit a unit of work, returning the job id once the runner accepts it.
    async fn dispatch(
        &self,
        service: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<u64, RemoteError>;

    /// Fetch the current status and step log of a job.
    async fn poll(&self, job_id: u64) -> Result<JobStatus, RemoteError>;
}
