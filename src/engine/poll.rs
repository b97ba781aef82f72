//! Polling state machine for one submitted job.
//!
//! [`transition`] is a pure function over [`JobState`] and [`Event`]; [`drive`]
//! feeds it events from the remote server, one status query per cadence, and
//! enforces the per-phase budgets.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::outcome::Terminal;
use crate::config::Timing;
use crate::galaxy::{JobHandle, OrchestrationClient, RemoteStatus, UploadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Upload,
    Execution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Uploading { last: Option<RemoteStatus> },
    Uploaded,
    Executing { last: Option<RemoteStatus> },
    Succeeded,
    Failed,
    TimedOut { phase: Phase, last: Option<RemoteStatus> },
    ConnectionLost { phase: Phase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Upload(UploadStatus),
    /// Execution was routed to the endpoint and invoked.
    Started,
    Job(RemoteStatus),
    /// A status query or invocation failed at the transport level.
    Transport,
    /// The current phase ran out of time.
    BudgetExhausted,
}

impl JobState {
    pub fn phase(self) -> Option<Phase> {
        match self {
            JobState::Submitted | JobState::Uploading { .. } => Some(Phase::Upload),
            JobState::Uploaded | JobState::Executing { .. } => Some(Phase::Execution),
            _ => None,
        }
    }

    /// Terminal kind plus last observed remote status, once finished.
    pub fn terminal(self) -> Option<(Terminal, Option<RemoteStatus>)> {
        match self {
            JobState::Succeeded => Some((Terminal::Succeeded, Some(RemoteStatus::Ok))),
            JobState::Failed => Some((Terminal::Failed, Some(RemoteStatus::Error))),
            JobState::TimedOut { last, .. } => Some((Terminal::TimedOut, last)),
            JobState::ConnectionLost { .. } => Some((Terminal::ConnectionLost, None)),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.terminal().is_some()
    }
}

/// Advance the machine by one event. Terminal states absorb every event and
/// events that do not belong to the current phase are ignored.
pub fn transition(state: JobState, event: Event) -> JobState {
    use JobState::*;

    match (state, event) {
        (Succeeded | Failed | TimedOut { .. } | ConnectionLost { .. }, _) => state,

        (Submitted | Uploading { .. }, Event::Upload(UploadStatus::Complete)) => Uploaded,
        (Submitted | Uploading { .. }, Event::Upload(UploadStatus::Error)) => Failed,
        (Submitted | Uploading { .. }, Event::Upload(UploadStatus::Pending(status))) => {
            Uploading { last: Some(status) }
        }
        (Submitted, Event::BudgetExhausted) => TimedOut {
            phase: Phase::Upload,
            last: None,
        },
        (Uploading { last }, Event::BudgetExhausted) => TimedOut {
            phase: Phase::Upload,
            last,
        },
        (Submitted | Uploading { .. }, Event::Transport) => ConnectionLost {
            phase: Phase::Upload,
        },

        (Uploaded, Event::Started) => Executing { last: None },
        (Uploaded, Event::BudgetExhausted) => TimedOut {
            phase: Phase::Execution,
            last: None,
        },
        (Executing { .. }, Event::Job(RemoteStatus::Ok)) => Succeeded,
        (Executing { .. }, Event::Job(RemoteStatus::Error)) => Failed,
        (Executing { .. }, Event::Job(status)) => Executing { last: Some(status) },
        (Executing { last }, Event::BudgetExhausted) => TimedOut {
            phase: Phase::Execution,
            last,
        },
        (Uploaded | Executing { .. }, Event::Transport) => ConnectionLost {
            phase: Phase::Execution,
        },

        _ => state,
    }
}

/// Budget and cadence of one polling phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePolicy {
    pub budget: Duration,
    pub cadence: Duration,
}

impl PhasePolicy {
    pub fn upload(timing: &Timing) -> Self {
        Self {
            budget: timing.maxwait,
            cadence: timing.interval,
        }
    }

    pub fn execution(timing: &Timing) -> Self {
        Self {
            budget: timing.timeout,
            cadence: timing.sleep_time,
        }
    }

    /// Whether another poll after waiting one cadence would overrun the budget.
    fn exhausted(&self, started: Instant) -> bool {
        let elapsed = started.elapsed();
        elapsed >= self.budget || elapsed + self.cadence > self.budget
    }
}

/// Final state of a driven job and every remote status seen on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub state: JobState,
    pub observed: Vec<RemoteStatus>,
}

/// Drive a submitted job to a terminal state.
///
/// The upload budget counts from `submitted_at`, the execution budget from the
/// moment the workflow is invoked.
pub async fn drive(
    client: &dyn OrchestrationClient,
    handle: &mut JobHandle,
    timing: &Timing,
    submitted_at: Instant,
) -> PollReport {
    let mut state = JobState::Submitted;
    let mut observed = Vec::new();

    let upload = PhasePolicy::upload(timing);
    loop {
        let event = match client.upload_status(handle).await {
            Ok(status) => {
                if let UploadStatus::Pending(remote) = status {
                    observed.push(remote);
                }
                Event::Upload(status)
            }
            Err(e) => {
                warn!(error = %e, "upload status query failed");
                Event::Transport
            }
        };
        state = transition(state, event);
        if state.phase() != Some(Phase::Upload) {
            break;
        }
        if upload.exhausted(submitted_at) {
            state = transition(state, Event::BudgetExhausted);
            break;
        }
        sleep(upload.cadence).await;
    }
    debug!(state = ?state, "upload phase finished");
    if state.is_terminal() {
        return PollReport { state, observed };
    }

    let event = match client.start_execution(handle).await {
        Ok(()) => Event::Started,
        Err(e) => {
            warn!(error = %e, "workflow invocation failed");
            Event::Transport
        }
    };
    state = transition(state, event);

    let execution = PhasePolicy::execution(timing);
    let started_at = Instant::now();
    while !state.is_terminal() {
        let event = match client.job_status(handle).await {
            Ok(status) => {
                observed.push(status);
                Event::Job(status)
            }
            Err(e) => {
                warn!(error = %e, "job status query failed");
                Event::Transport
            }
        };
        state = transition(state, event);
        if state.is_terminal() {
            break;
        }
        if execution.exhausted(started_at) {
            state = transition(state, Event::BudgetExhausted);
            break;
        }
        sleep(execution.cadence).await;
    }
    debug!(state = ?state, "execution phase finished");
    PollReport { state, observed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = JobState::Submitted;
        state = transition(state, Event::Upload(UploadStatus::Pending(RemoteStatus::Queued)));
        assert_eq!(state, JobState::Uploading { last: Some(RemoteStatus::Queued) });
        state = transition(state, Event::Upload(UploadStatus::Complete));
        assert_eq!(state, JobState::Uploaded);
        state = transition(state, Event::Started);
        assert_eq!(state, JobState::Executing { last: None });
        state = transition(state, Event::Job(RemoteStatus::Running));
        assert_eq!(state, JobState::Executing { last: Some(RemoteStatus::Running) });
        state = transition(state, Event::Job(RemoteStatus::Ok));
        assert_eq!(state, JobState::Succeeded);
    }

    #[test]
    fn test_upload_timeout_keeps_last_state() {
        let state = JobState::Uploading { last: Some(RemoteStatus::Waiting) };
        assert_eq!(
            transition(state, Event::BudgetExhausted),
            JobState::TimedOut { phase: Phase::Upload, last: Some(RemoteStatus::Waiting) }
        );
        assert_eq!(
            transition(JobState::Submitted, Event::BudgetExhausted),
            JobState::TimedOut { phase: Phase::Upload, last: None }
        );
    }

    #[test]
    fn test_transport_errors_per_phase() {
        assert_eq!(
            transition(JobState::Submitted, Event::Transport),
            JobState::ConnectionLost { phase: Phase::Upload }
        );
        assert_eq!(
            transition(JobState::Uploaded, Event::Transport),
            JobState::ConnectionLost { phase: Phase::Execution }
        );
        assert_eq!(
            transition(JobState::Executing { last: None }, Event::Transport),
            JobState::ConnectionLost { phase: Phase::Execution }
        );
    }

    #[test]
    fn test_upload_error_fails_job() {
        assert_eq!(
            transition(JobState::Submitted, Event::Upload(UploadStatus::Error)),
            JobState::Failed
        );
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        for terminal in [
            JobState::Succeeded,
            JobState::Failed,
            JobState::TimedOut { phase: Phase::Execution, last: None },
            JobState::ConnectionLost { phase: Phase::Upload },
        ] {
            assert_eq!(transition(terminal, Event::Job(RemoteStatus::Ok)), terminal);
            assert_eq!(transition(terminal, Event::Transport), terminal);
            assert_eq!(transition(terminal, Event::BudgetExhausted), terminal);
        }
    }

    #[test]
    fn test_out_of_phase_events_ignored() {
        assert_eq!(
            transition(JobState::Submitted, Event::Job(RemoteStatus::Ok)),
            JobState::Submitted
        );
        assert_eq!(
            transition(JobState::Executing { last: None }, Event::Upload(UploadStatus::Complete)),
            JobState::Executing { last: None }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_check() {
        let policy = PhasePolicy {
            budget: Duration::from_secs(10),
            cadence: Duration::from_secs(5),
        };
        let start = Instant::now();
        assert!(!policy.exhausted(start));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!policy.exhausted(start));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(policy.exhausted(start));

        let zero = PhasePolicy {
            budget: Duration::ZERO,
            cadence: Duration::ZERO,
        };
        assert!(zero.exhausted(Instant::now()));
    }
}
