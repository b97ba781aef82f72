//! Galaxy REST implementation of [`OrchestrationClient`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    output_action, summarize_jobs, summarize_uploads, JobHandle, OrchestrationClient,
    OutputAction, RemoteStatus, SubmissionError, TransportError, UploadStatus,
};
use crate::config::{Credentials, Endpoint, Server};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const COMPUTE_PREFERENCE: &str = "distributed_compute|remote_resources";
const GALAXY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Non-success HTTP response or undecodable body.
#[derive(Debug)]
enum ApiError {
    Http(reqwest::Error),
    Status { status: StatusCode, body: String },
    Decode(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Http(e) => write!(f, "{e}"),
            ApiError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            ApiError::Decode(msg) => write!(f, "unexpected response: {msg}"),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Http(err)
    }
}

impl From<ApiError> for TransportError {
    fn from(err: ApiError) -> Self {
        TransportError(err.to_string())
    }
}

impl From<ApiError> for SubmissionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Http(e) => SubmissionError::Unreachable(e.to_string()),
            ApiError::Status { status, body }
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                SubmissionError::Authentication(body)
            }
            ApiError::Status { status, body } => SubmissionError::Rejected {
                status: status.as_u16(),
                body,
            },
            ApiError::Decode(msg) => SubmissionError::Rejected { status: 200, body: msg },
        }
    }
}

#[derive(Debug, Clone)]
struct ImportedWorkflow {
    id: String,
    /// Input label to step index.
    steps: BTreeMap<String, String>,
}

/// Authenticated state for one server, created on first submission.
#[derive(Debug, Clone)]
struct Session {
    base: String,
    api_key: String,
    user_id: String,
    workflow: ImportedWorkflow,
    history_name: String,
    histories: Vec<String>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
struct StateOnly {
    state: String,
}

#[derive(Deserialize)]
struct JobSummary {
    id: String,
    state: String,
}

#[derive(Deserialize)]
struct JobOutput {
    dataset: IdOnly,
}

#[derive(Deserialize)]
struct HistorySummary {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    create_time: Option<String>,
}

pub struct GalaxyClient {
    http: reqwest::Client,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl GalaxyClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("saber/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn request(&self, method: Method, base: &str, key: &str, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{base}{path}"))
            .header("x-api-key", key)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::Status { status, body });
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::Status { status, body });
        }
        Ok(())
    }

    async fn api_key(&self, server: &Server) -> Result<String, SubmissionError> {
        match &server.credentials {
            Credentials::ApiKey(key) => Ok(key.clone()),
            Credentials::Basic { email, password } => {
                #[derive(Deserialize)]
                struct BaseAuth {
                    api_key: String,
                }
                let builder = self
                    .http
                    .get(format!("{}/api/authenticate/baseauth", server.url))
                    .basic_auth(email, Some(password));
                let auth: BaseAuth = self.send(builder).await.map_err(|e| match e {
                    ApiError::Http(e) => SubmissionError::Unreachable(e.to_string()),
                    other => SubmissionError::Authentication(other.to_string()),
                })?;
                Ok(auth.api_key)
            }
        }
    }

    async fn open_session(&self, server: &Server) -> Result<Session, SubmissionError> {
        let base = server.url.clone();
        let api_key = self.api_key(server).await?;

        #[derive(Deserialize)]
        struct CurrentUser {
            id: Option<String>,
        }
        let user: CurrentUser = self
            .send(self.request(Method::GET, &base, &api_key, "/api/users/current"))
            .await?;
        let user_id = user
            .id
            .ok_or_else(|| SubmissionError::Authentication("anonymous user".to_string()))?;
        info!(server = %server.name, "connection initialized");

        let workflow = self.import_workflow(&base, &api_key, &server.workflow).await?;
        let history_name = format!(
            "{} {}",
            server.history_name,
            Local::now().format("%-d/%-m/%y %H:%M")
        );

        let session = Session {
            base,
            api_key,
            user_id,
            workflow,
            history_name,
            histories: Vec::new(),
        };
        if let Err(e) = self.purge_stale_histories(&session, server).await {
            warn!(server = %server.name, error = %e, "could not prune old histories");
        }
        Ok(session)
    }

    async fn session(&self, server: &Server) -> Result<Arc<Mutex<Session>>, SubmissionError> {
        if let Some(existing) = self.sessions.lock().await.get(&server.name) {
            return Ok(existing.clone());
        }
        let session = Arc::new(Mutex::new(self.open_session(server).await?));
        self.sessions
            .lock()
            .await
            .insert(server.name.clone(), session.clone());
        Ok(session)
    }

    async fn existing_session(&self, server: &str) -> Result<Arc<Mutex<Session>>, TransportError> {
        self.sessions
            .lock()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| TransportError(format!("no session for server `{server}`")))
    }

    async fn import_workflow(
        &self,
        base: &str,
        key: &str,
        path: &Path,
    ) -> Result<ImportedWorkflow, SubmissionError> {
        let display = path.display().to_string();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| SubmissionError::WorkflowNotFound {
                path: display.clone(),
            })?;
        let definition: Value =
            serde_json::from_str(&raw).map_err(|e| SubmissionError::InvalidWorkflow {
                path: display.clone(),
                reason: e.to_string(),
            })?;

        let imported: IdOnly = self
            .send(
                self.request(Method::POST, base, key, "/api/workflows")
                    .json(&json!({ "workflow": definition })),
            )
            .await?;

        #[derive(Deserialize)]
        struct WorkflowInput {
            #[serde(default)]
            label: Option<String>,
        }
        #[derive(Deserialize)]
        struct WorkflowDetails {
            #[serde(default)]
            inputs: BTreeMap<String, WorkflowInput>,
        }
        let details: WorkflowDetails = self
            .send(self.request(
                Method::GET,
                base,
                key,
                &format!("/api/workflows/{}", imported.id),
            ))
            .await?;

        let steps = details
            .inputs
            .into_iter()
            .filter_map(|(step, input)| input.label.map(|label| (label, step)))
            .collect();
        debug!(workflow_id = %imported.id, "workflow imported");
        Ok(ImportedWorkflow {
            id: imported.id,
            steps,
        })
    }

    async fn select_compute(&self, session: &Session, compute_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/users/{}/information/inputs", session.user_id);
        let mut preference = serde_json::Map::new();
        preference.insert(COMPUTE_PREFERENCE.to_string(), Value::from(compute_id));
        self.send_empty(
            self.request(Method::PUT, &session.base, &session.api_key, &path)
                .json(&preference),
        )
        .await?;
        debug!(compute_id = %compute_id, "compute preference updated");
        Ok(())
    }

    async fn stage_inputs(
        &self,
        session: &Session,
        server: &Server,
        history_id: &str,
    ) -> Result<BTreeMap<String, String>, ApiError> {
        #[derive(Deserialize)]
        struct FetchResponse {
            #[serde(default)]
            outputs: Vec<IdOnly>,
        }

        let mut staged = BTreeMap::new();
        for (label, input) in &server.data_inputs {
            let payload = json!({
                "history_id": history_id,
                "targets": [{
                    "destination": { "type": "hdas" },
                    "elements": [{
                        "src": "url",
                        "url": input.url,
                        "ext": input.file_type,
                        "name": label,
                    }],
                }],
            });
            let fetched: FetchResponse = self
                .send(
                    self.request(Method::POST, &session.base, &session.api_key, "/api/tools/fetch")
                        .json(&payload),
                )
                .await?;
            let dataset = fetched
                .outputs
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::Decode(format!("no dataset created for `{label}`")))?;
            debug!(label = %label, dataset_id = %dataset.id, "input staged");
            staged.insert(label.clone(), dataset.id);
        }
        Ok(staged)
    }

    async fn purge_history(&self, session: &Session, history_id: &str) -> Result<(), ApiError> {
        self.send_empty(
            self.request(
                Method::DELETE,
                &session.base,
                &session.api_key,
                &format!("/api/histories/{history_id}"),
            )
            .query(&[("purge", "true")]),
        )
        .await
    }

    async fn purge_stale_histories(&self, session: &Session, server: &Server) -> Result<(), ApiError> {
        let histories: Vec<HistorySummary> = self
            .send(
                self.request(Method::GET, &session.base, &session.api_key, "/api/histories")
                    .query(&[("keys", "id,name,create_time")]),
            )
            .await?;
        let max_age = chrono::Duration::days(server.delete_after_days.min(36_500) as i64);
        let now = Utc::now().naive_utc();

        for history in histories {
            if !is_test_history(&history.name, &server.history_name) {
                continue;
            }
            let stale = history
                .create_time
                .as_deref()
                .and_then(|t| NaiveDateTime::parse_from_str(t, GALAXY_TIME_FORMAT).ok())
                .is_some_and(|created| now - created > max_age);
            if stale || history.name == session.history_name {
                info!(history_id = %history.id, name = %history.name, "purging old history");
                if let Err(e) = self.purge_history(session, &history.id).await {
                    warn!(history_id = %history.id, error = %e, "skipping history");
                }
            }
        }
        Ok(())
    }
}

/// Histories created by earlier runs start with the configured base name
/// followed by a date.
fn is_test_history(name: &str, base: &str) -> bool {
    name == base
        || name
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with(' '))
}

#[async_trait::async_trait]
impl OrchestrationClient for GalaxyClient {
    async fn submit_workflow(
        &self,
        server: &Server,
        endpoint: &Endpoint,
    ) -> Result<JobHandle, SubmissionError> {
        let shared = self.session(server).await?;
        let mut session = shared.lock().await;

        // inputs are always staged on the local compute
        self.select_compute(&session, &server.default_compute_id).await?;

        let history: IdOnly = self
            .send(
                self.request(Method::POST, &session.base, &session.api_key, "/api/histories")
                    .json(&json!({ "name": session.history_name })),
            )
            .await?;
        session.histories.push(history.id.clone());
        info!(server = %server.name, endpoint = %endpoint.name, history_id = %history.id, "history created");

        let staged = self.stage_inputs(&session, server, &history.id).await?;
        Ok(JobHandle {
            server: server.name.clone(),
            endpoint: endpoint.name.clone(),
            compute_id: endpoint.compute_id.clone(),
            history_id: history.id,
            workflow_id: session.workflow.id.clone(),
            datasets: staged,
            invocation_id: None,
        })
    }

    async fn upload_status(&self, handle: &JobHandle) -> Result<UploadStatus, TransportError> {
        let shared = self.existing_session(&handle.server).await?;
        let session = shared.lock().await.clone();

        let mut states = Vec::with_capacity(handle.datasets.len());
        for id in handle.datasets.values() {
            let dataset: StateOnly = self
                .send(self.request(
                    Method::GET,
                    &session.base,
                    &session.api_key,
                    &format!("/api/datasets/{id}"),
                ))
                .await?;
            states.push(dataset.state);
        }
        Ok(summarize_uploads(states.iter().map(String::as_str)))
    }

    async fn start_execution(&self, handle: &mut JobHandle) -> Result<(), TransportError> {
        let shared = self.existing_session(&handle.server).await?;
        let session = shared.lock().await.clone();

        self.select_compute(&session, &handle.compute_id).await?;

        let inputs: serde_json::Map<String, Value> = session
            .workflow
            .steps
            .iter()
            .filter_map(|(label, step)| {
                handle
                    .datasets
                    .get(label)
                    .map(|id| (step.clone(), json!({ "src": "hda", "id": id })))
            })
            .collect();

        let invocation: IdOnly = self
            .send(
                self.request(
                    Method::POST,
                    &session.base,
                    &session.api_key,
                    &format!("/api/workflows/{}/invocations", handle.workflow_id),
                )
                .json(&json!({
                    "history_id": handle.history_id,
                    "inputs": inputs,
                    "inputs_by": "step_index",
                })),
            )
            .await?;
        info!(
            server = %handle.server,
            endpoint = %handle.endpoint,
            invocation_id = %invocation.id,
            "workflow invoked"
        );
        handle.invocation_id = Some(invocation.id);
        Ok(())
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<RemoteStatus, TransportError> {
        let invocation_id = handle
            .invocation_id
            .as_deref()
            .ok_or_else(|| TransportError("workflow was never invoked".to_string()))?;
        let shared = self.existing_session(&handle.server).await?;
        let session = shared.lock().await.clone();

        let jobs: Vec<StateOnly> = self
            .send(
                self.request(Method::GET, &session.base, &session.api_key, "/api/jobs")
                    .query(&[("invocation_id", invocation_id)]),
            )
            .await?;
        Ok(summarize_jobs(jobs.iter().map(|j| j.state.as_str())))
    }

    async fn finalize_job(&self, server: &Server, handle: &JobHandle) -> Result<(), TransportError> {
        let Some(invocation_id) = handle.invocation_id.as_deref() else {
            return Ok(());
        };
        let shared = self.existing_session(&handle.server).await?;
        let session = shared.lock().await.clone();

        let jobs: Vec<JobSummary> = self
            .send(
                self.request(Method::GET, &session.base, &session.api_key, "/api/jobs")
                    .query(&[("invocation_id", invocation_id)]),
            )
            .await?;

        for job in jobs {
            let outputs: Vec<JobOutput> = self
                .send(self.request(
                    Method::GET,
                    &session.base,
                    &session.api_key,
                    &format!("/api/jobs/{}/outputs", job.id),
                ))
                .await?;

            let action = output_action(server.clean_history, &handle.endpoint, &job.state);
            for output in outputs {
                let path = format!(
                    "/api/histories/{}/contents/{}",
                    handle.history_id, output.dataset.id
                );
                match &action {
                    OutputAction::Purge => {
                        self.send_empty(
                            self.request(Method::DELETE, &session.base, &session.api_key, &path)
                                .query(&[("purge", "true")]),
                        )
                        .await?;
                        info!(dataset_id = %output.dataset.id, "purged output of successful job");
                    }
                    OutputAction::Tag(tags) => {
                        self.send_empty(
                            self.request(Method::PUT, &session.base, &session.api_key, &path)
                                .json(&json!({ "tags": tags })),
                        )
                        .await?;
                    }
                }
            }
            if let OutputAction::Tag(tags) = &action {
                debug!(job_id = %job.id, tags = ?tags, "job outputs tagged");
            }
        }
        Ok(())
    }

    async fn clean_up(&self, server: &Server, had_failures: bool) -> anyhow::Result<()> {
        let Some(shared) = self.sessions.lock().await.remove(&server.name) else {
            debug!(server = %server.name, "nothing to clean up");
            return Ok(());
        };
        let session = shared.lock().await.clone();

        if server.clean_history.should_purge(had_failures) {
            for id in &session.histories {
                if let Err(e) = self.purge_history(&session, id).await {
                    warn!(history_id = %id, error = %e, "could not purge history");
                }
            }
        } else {
            info!(server = %server.name, "keeping test histories");
        }

        self.send_empty(self.request(
            Method::DELETE,
            &session.base,
            &session.api_key,
            &format!("/api/workflows/{}", session.workflow.id),
        ))
        .await
        .map_err(|e| anyhow::anyhow!("could not delete workflow: {e}"))?;

        self.select_compute(&session, &server.default_compute_id)
            .await
            .map_err(|e| anyhow::anyhow!("could not reset compute preference: {e}"))?;

        info!(server = %server.name, "clean-up terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_history_name_match() {
        assert!(is_test_history("SABER", "SABER"));
        assert!(is_test_history("SABER 1/2/24 10:00", "SABER"));
        assert!(!is_test_history("SABERTOOTH", "SABER"));
        assert!(!is_test_history("My analysis", "SABER"));
    }

    #[test]
    fn test_galaxy_timestamp_format() {
        assert!(NaiveDateTime::parse_from_str("2024-01-15T14:30:00.123456", GALAXY_TIME_FORMAT).is_ok());
        assert!(NaiveDateTime::parse_from_str("2024-01-15T14:30:00", GALAXY_TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_status_error_maps_to_authentication() {
        let err: SubmissionError = ApiError::Status {
            status: StatusCode::UNAUTHORIZED,
            body: "bad key".to_string(),
        }
        .into();
        assert!(matches!(err, SubmissionError::Authentication(_)));

        let err: SubmissionError = ApiError::Status {
            status: StatusCode::BAD_REQUEST,
            body: "nope".to_string(),
        }
        .into();
        assert!(matches!(err, SubmissionError::Rejected { status: 400, .. }));
    }
}
