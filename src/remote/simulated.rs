use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{JobStatus, RemoteError, RemoteRunner, Step, StepState};

/// Scripted behavior for one simulated job. Every dispatched job follows the
/// same plan, which is enough for dry runs and for driving the engine through
/// a chosen path in tests.
#[derive(Debug, Clone)]
pub struct SimulatedPlan {
    /// Reject dispatch outright with this body instead of accepting a job.
    pub fail_dispatch: Option<String>,
    /// Number of polls that report the job still running before it finishes.
    pub polls_until_finished: u32,
    /// Inject this many transient transport failures before the first
    /// successful poll response.
    pub transient_poll_failures: u32,
    /// Report the job as unknown on every poll (it vanished after dispatch).
    pub vanish_after_dispatch: bool,
    /// Step list reported once the job finishes.
    pub final_steps: Vec<Step>,
}

impl SimulatedPlan {
    /// A job that finishes successfully after one in-flight poll, reporting
    /// the given steps.
    pub fn succeeding(final_steps: Vec<Step>) -> Self {
        Self {
            fail_dispatch: None,
            polls_until_finished: 1,
            transient_poll_failures: 0,
            vanish_after_dispatch: false,
            final_steps,
        }
    }

    /// A job whose named step fails with the given message.
    pub fn failing(step_name: &str, message: &str) -> Self {
        Self::succeeding(vec![Step {
            name: step_name.to_string(),
            state: StepState::Failure,
            message: message.to_string(),
        }])
    }

    /// A job that never finishes; polling runs into the caller's deadline.
    pub fn never_finishing() -> Self {
        Self {
            fail_dispatch: None,
            polls_until_finished: u32::MAX,
            transient_poll_failures: 0,
            vanish_after_dispatch: false,
            final_steps: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct SimulatedState {
    next_job_id: u64,
    poll_counts: BTreeMap<u64, u32>,
    transient_failures_left: u32,
    dispatched: Vec<(String, BTreeMap<String, String>)>,
}

/// In-memory stand-in for the remote runner. Records every dispatched
/// context so tests can assert the exact environment a job would receive.
pub struct SimulatedRunner {
    plan: SimulatedPlan,
    state: Mutex<SimulatedState>,
}

impl SimulatedRunner {
    pub fn new(plan: SimulatedPlan) -> Self {
        let transient_failures_left = plan.transient_poll_failures;
        Self {
            plan,
            state: Mutex::new(SimulatedState {
                next_job_id: 42,
                poll_counts: BTreeMap::new(),
                transient_failures_left,
                dispatched: Vec::new(),
            }),
        }
    }

    /// Every (service, context) pair dispatched so far, in order.
    pub async fn dispatched_contexts(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.state.lock().await.dispatched.clone()
    }

    pub async fn poll_count(&self, job_id: u64) -> u32 {
        self.state
            .lock()
            .await
            .poll_counts
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteRunner for SimulatedRunner {
    async fn dispatch(
        &self,
        service: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<u64, RemoteError> {
        let mut state = self.state.lock().await;
        state
            .dispatched
            .push((service.to_string(), context.clone()));

        if let Some(body) = &self.plan.fail_dispatch {
            return Err(RemoteError::Dispatch {
                status: 503,
                body: body.clone(),
            });
        }

        let job_id = state.next_job_id;
        state.next_job_id += 1;
        debug!(job_id, service = %service, "Simulated job accepted");
        Ok(job_id)
    }

    async fn poll(&self, job_id: u64) -> Result<JobStatus, RemoteError> {
        let mut state = self.state.lock().await;

        if !state.poll_counts.contains_key(&job_id) && job_id >= state.next_job_id {
            return Err(RemoteError::NotFound(job_id));
        }
        if self.plan.vanish_after_dispatch {
            return Err(RemoteError::NotFound(job_id));
        }

        if state.transient_failures_left > 0 {
            state.transient_failures_left -= 1;
            return Err(RemoteError::Http {
                status: 502,
                body: "simulated transient failure".to_string(),
            });
        }

        let polls = state.poll_counts.entry(job_id).or_insert(0);
        *polls += 1;

        if *polls <= self.plan.polls_until_finished {
            return Ok(JobStatus {
                id: job_id,
                started: Some("started".to_string()),
                finished: None,
                steps: vec![Step {
                    name: "execute".to_string(),
                    state: StepState::Running,
                    message: String::new(),
                }],
            });
        }

        Ok(JobStatus {
            id: job_id,
            started: Some("started".to_string()),
            finished: Some("finished".to_string()),
            steps: self.plan.final_steps.clone(),
        })
    }
}
