//! Retry-with-deadline polling against the remote runner.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::remote::{JobStatus, RemoteError, RemoteRunner};

#[derive(Debug)]
pub enum PollOutcome {
    /// The remote job reached a terminal state.
    Finished(JobStatus),
    /// The deadline passed with no terminal state. The remote job keeps
    /// running; no cancellation primitive exists on the remote side.
    TimedOut { waited: Duration },
}

/// Poll `job_id` at `interval` until it finishes or `deadline` passes.
///
/// The deadline is absolute and should be anchored at dispatch time, so the
/// configured timeout bounds the whole run rather than the polling phase.
/// Transient transport and server errors are retried within the deadline;
/// a vanished job is returned immediately.
pub async fn poll_until_finished(
    runner: &dyn RemoteRunner,
    job_id: u64,
    interval: Duration,
    deadline: Instant,
) -> Result<PollOutcome, RemoteError> {
    let started = Instant::now();

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut {
                waited: now - started,
            });
        }

        tokio::time::sleep(interval.min(deadline - now)).await;

        match runner.poll(job_id).await {
            Ok(status) if status.is_finished() => {
                return Ok(PollOutcome::Finished(status));
            }
            Ok(_) => {
                debug!(job_id, "Remote job still running");
            }
            Err(e) if e.is_transient() => {
                warn!(job_id, error = %e, "Poll failed, retrying until deadline");
            }
            Err(e) => return Err(e),
        }
    }
}
