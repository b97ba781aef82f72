//! Job submission boundary and the per-run record.

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use super::outcome::Outcome;
use crate::config::{Endpoint, Server};
use crate::galaxy::{JobHandle, OrchestrationClient, RemoteStatus, SubmissionError};

/// One test execution against one endpoint. Lives until its outcome has been
/// recorded.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub server: String,
    pub endpoint: String,
    /// Monotonic reference for the upload budget. Reset once submission
    /// returns, so session set-up is not charged to the upload phase.
    pub submitted_at: Instant,
    pub submitted_wall: DateTime<Utc>,
    /// Remote history holding the job, once submission succeeded.
    pub remote_id: Option<String>,
    pub observed: Vec<RemoteStatus>,
    pub outcome: Option<Outcome>,
}

impl JobRun {
    pub fn new(server: &Server, endpoint: &Endpoint) -> Self {
        Self {
            server: server.name.clone(),
            endpoint: endpoint.name.clone(),
            submitted_at: Instant::now(),
            submitted_wall: Utc::now(),
            remote_id: None,
            observed: Vec::new(),
            outcome: None,
        }
    }

    pub fn last_observed(&self) -> Option<RemoteStatus> {
        self.observed.last().copied()
    }
}

/// Thin wrapper over the orchestration client's submission call.
pub struct JobDriver<'a> {
    client: &'a dyn OrchestrationClient,
}

impl<'a> JobDriver<'a> {
    pub fn new(client: &'a dyn OrchestrationClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &'a dyn OrchestrationClient {
        self.client
    }

    /// Submit the server's test workflow for `endpoint`. Errors are not
    /// retried.
    pub async fn submit(
        &self,
        server: &Server,
        endpoint: &Endpoint,
        run: &mut JobRun,
    ) -> Result<JobHandle, SubmissionError> {
        match self.client.submit_workflow(server, endpoint).await {
            Ok(handle) => {
                run.submitted_at = Instant::now();
                run.submitted_wall = Utc::now();
                info!(history_id = %handle.history_id, "job submitted");
                run.remote_id = Some(handle.history_id.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!(error = %e, "submission failed");
                Err(e)
            }
        }
    }

    /// Label or purge the outputs of a finished job. Failures are only logged
    /// and never change the job's outcome.
    pub async fn finalize(&self, server: &Server, handle: &JobHandle) {
        if let Err(e) = self.client.finalize_job(server, handle).await {
            warn!(error = %e, "could not label job outputs");
        }
    }
}
