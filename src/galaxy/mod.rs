//! Orchestration service collaborator.
//!
//! [`OrchestrationClient`] is the only seam between the benchmark engine and
//! a workflow server. [`GalaxyClient`] speaks the Galaxy REST API; tests swap
//! in scripted fakes.

pub mod client;

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::config::{CleanPolicy, Endpoint, Server};

pub use client::GalaxyClient;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("workflow file not found: {path}")]
    WorkflowNotFound { path: String },

    #[error("invalid workflow file {path}: {reason}")]
    InvalidWorkflow { path: String, reason: String },

    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Any failure while talking to the server after submission.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError(err.to_string())
    }
}

/// Canonical remote state of a dataset or job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    New,
    Waiting,
    Queued,
    Running,
    Ok,
    Error,
}

impl RemoteStatus {
    /// Map a raw Galaxy state string. Unknown states yield `None`.
    pub fn from_galaxy(state: &str) -> Option<Self> {
        let status = match state {
            "new" | "resubmitted" => RemoteStatus::New,
            "queued" => RemoteStatus::Queued,
            "running" | "upload" | "setting_metadata" => RemoteStatus::Running,
            "waiting" | "paused" | "deferred" => RemoteStatus::Waiting,
            "ok" | "empty" | "skipped" => RemoteStatus::Ok,
            "error" | "failed" | "failed_metadata" | "discarded" | "deleted" | "deleting"
            | "stopped" | "stop" => RemoteStatus::Error,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteStatus::Ok | RemoteStatus::Error)
    }

    /// Pipeline position of a non-terminal state; lower is less advanced.
    fn progress(self) -> u8 {
        match self {
            RemoteStatus::New => 0,
            RemoteStatus::Waiting => 1,
            RemoteStatus::Queued => 2,
            RemoteStatus::Running => 3,
            RemoteStatus::Ok | RemoteStatus::Error => 4,
        }
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStatus::New => write!(f, "new"),
            RemoteStatus::Waiting => write!(f, "waiting"),
            RemoteStatus::Queued => write!(f, "queued"),
            RemoteStatus::Running => write!(f, "running"),
            RemoteStatus::Ok => write!(f, "ok"),
            RemoteStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Still staging; carries the least advanced dataset state.
    Pending(RemoteStatus),
    Complete,
    Error,
}

/// Remote identifiers of one submitted test job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub server: String,
    pub endpoint: String,
    pub compute_id: String,
    pub history_id: String,
    pub workflow_id: String,
    /// Workflow input label to staged dataset id.
    pub datasets: BTreeMap<String, String>,
    /// Set once execution has been started.
    pub invocation_id: Option<String>,
}

/// Operations the engine needs from a workflow server.
#[async_trait::async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Authenticate, import the workflow and stage its inputs on the server's
    /// default compute. No polling happens here.
    async fn submit_workflow(
        &self,
        server: &Server,
        endpoint: &Endpoint,
    ) -> Result<JobHandle, SubmissionError>;

    async fn upload_status(&self, handle: &JobHandle) -> Result<UploadStatus, TransportError>;

    /// Route execution to the handle's endpoint and invoke the workflow.
    async fn start_execution(&self, handle: &mut JobHandle) -> Result<(), TransportError>;

    async fn job_status(&self, handle: &JobHandle) -> Result<RemoteStatus, TransportError>;

    /// Label the outputs of a finished job with its endpoint and final state.
    /// Under `successful_only` the outputs of successful jobs are purged
    /// instead.
    async fn finalize_job(&self, server: &Server, handle: &JobHandle) -> Result<(), TransportError>;

    /// Best-effort release of everything created for `server`.
    async fn clean_up(&self, server: &Server, had_failures: bool) -> anyhow::Result<()>;
}

fn least_advanced(statuses: impl Iterator<Item = RemoteStatus>) -> RemoteStatus {
    statuses
        .filter(|s| !s.is_terminal())
        .min_by_key(|s| s.progress())
        .unwrap_or(RemoteStatus::New)
}

/// What happens to the outputs of one finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputAction {
    Tag(Vec<String>),
    Purge,
}

/// Outputs are tagged with the endpoint, plus `err` for failed jobs and
/// `saber_<state>` for jobs that never finished.
pub fn output_action(policy: CleanPolicy, endpoint: &str, state: &str) -> OutputAction {
    let mut tags = vec![endpoint.to_string()];
    match RemoteStatus::from_galaxy(state) {
        Some(RemoteStatus::Ok) if policy.purges_successful_outputs() => return OutputAction::Purge,
        Some(RemoteStatus::Ok) => {}
        Some(RemoteStatus::Error) => tags.push("err".to_string()),
        _ => tags.push(format!("saber_{state}")),
    }
    OutputAction::Tag(tags)
}

/// Fold dataset states into one upload status. Unknown states count as `new`.
pub fn summarize_uploads<'a>(states: impl IntoIterator<Item = &'a str>) -> UploadStatus {
    let statuses: Vec<RemoteStatus> = states
        .into_iter()
        .map(|s| RemoteStatus::from_galaxy(s).unwrap_or(RemoteStatus::New))
        .collect();

    if statuses.contains(&RemoteStatus::Error) {
        UploadStatus::Error
    } else if statuses.iter().all(|s| *s == RemoteStatus::Ok) {
        UploadStatus::Complete
    } else {
        UploadStatus::Pending(least_advanced(statuses.into_iter()))
    }
}

/// Fold the job states of one invocation into one remote status.
pub fn summarize_jobs<'a>(states: impl IntoIterator<Item = &'a str>) -> RemoteStatus {
    let statuses: Vec<RemoteStatus> = states
        .into_iter()
        .map(|s| RemoteStatus::from_galaxy(s).unwrap_or(RemoteStatus::New))
        .collect();

    if statuses.is_empty() {
        return RemoteStatus::New;
    }
    if statuses.iter().all(|s| s.is_terminal()) {
        if statuses.contains(&RemoteStatus::Error) {
            RemoteStatus::Error
        } else {
            RemoteStatus::Ok
        }
    } else {
        least_advanced(statuses.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_galaxy_state_mapping() {
        assert_eq!(RemoteStatus::from_galaxy("resubmitted"), Some(RemoteStatus::New));
        assert_eq!(RemoteStatus::from_galaxy("setting_metadata"), Some(RemoteStatus::Running));
        assert_eq!(RemoteStatus::from_galaxy("paused"), Some(RemoteStatus::Waiting));
        assert_eq!(RemoteStatus::from_galaxy("empty"), Some(RemoteStatus::Ok));
        assert_eq!(RemoteStatus::from_galaxy("failed_metadata"), Some(RemoteStatus::Error));
        assert_eq!(RemoteStatus::from_galaxy("stopped"), Some(RemoteStatus::Error));
        assert_eq!(RemoteStatus::from_galaxy("something_new"), None);
    }

    #[test]
    fn test_upload_summary() {
        assert_eq!(summarize_uploads(["ok", "empty"]), UploadStatus::Complete);
        assert_eq!(summarize_uploads([]), UploadStatus::Complete);
        assert_eq!(summarize_uploads(["ok", "discarded"]), UploadStatus::Error);
        assert_eq!(
            summarize_uploads(["ok", "running", "queued"]),
            UploadStatus::Pending(RemoteStatus::Queued)
        );
    }

    #[test]
    fn test_job_summary() {
        assert_eq!(summarize_jobs([]), RemoteStatus::New);
        assert_eq!(summarize_jobs(["ok", "skipped"]), RemoteStatus::Ok);
        assert_eq!(summarize_jobs(["ok", "error"]), RemoteStatus::Error);
        // an error with work still pending is not final yet
        assert_eq!(summarize_jobs(["error", "running"]), RemoteStatus::Running);
        assert_eq!(summarize_jobs(["running", "waiting", "queued"]), RemoteStatus::Waiting);
    }

    #[test]
    fn test_output_actions() {
        let tags = |v: &[&str]| OutputAction::Tag(v.iter().map(|s| s.to_string()).collect());

        assert_eq!(output_action(CleanPolicy::OnSuccess, "pulsar", "ok"), tags(&["pulsar"]));
        assert_eq!(output_action(CleanPolicy::SuccessfulOnly, "pulsar", "ok"), OutputAction::Purge);
        assert_eq!(
            output_action(CleanPolicy::SuccessfulOnly, "pulsar", "error"),
            tags(&["pulsar", "err"])
        );
        assert_eq!(
            output_action(CleanPolicy::Never, "Default", "queued"),
            tags(&["Default", "saber_queued"])
        );
    }
}
