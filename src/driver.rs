use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::error::BackendError;
use crate::backend::http::{BackendClient, MissingJobId};
use crate::backend::ws::{self, WatchOutcome};
use crate::rewriter::{self, Workflow};

/// Lifecycle state of a single dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Submitted,
    Watching,
    Completed,
    TimedOut,
    Failed,
}

/// Kind of artifact a job is expected to produce, used to pick the right
/// output key when extracting results from a history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Video,
}

impl ArtifactKind {
    fn output_keys(self) -> &'static [&'static str] {
        match self {
            ArtifactKind::Image => &["images"],
            ArtifactKind::Video => &["videos", "gifs"],
        }
    }
}

/// Reference to one output artifact (filename/subfolder/type) as reported
/// by a backend's history endpoint.
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    pub filename: String,
    pub subfolder: String,
    pub file_type: String,
}

/// Result of a completed job run.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub history: Value,
    pub artifact: Option<Vec<u8>>,
}

/// Drives one job-execution lifecycle against a single backend: submit,
/// watch for completion over the backend's WebSocket, fetch history, and
/// extract the result artifact.
///
/// One driver is bound to one backend address for the lifetime of its
/// ToolBinding; `client_id` is generated once and reused across jobs so the
/// backend sees a stable WebSocket session for this gateway.
pub struct JobDriver {
    address: String,
    client_id: String,
    http: BackendClient,
    state: Mutex<JobState>,
}

impl JobDriver {
    pub fn new(address: String, http: BackendClient) -> Self {
        Self {
            address,
            client_id: Uuid::new_v4().to_string(),
            http,
            state: Mutex::new(JobState::Idle),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap() = state;
    }

    /// `POST /prompt`. Extracts the job id from `prompt_id`, `id`, or
    /// `request_id`, in that order. A response with none of those keys is
    /// a protocol error, distinct from a transport failure.
    pub async fn submit(&self, workflow: &Workflow) -> Result<String, BackendError> {
        let prompt = Value::Object(workflow.clone());
        let job_id = match self.http.queue_prompt(&self.address, &prompt, &self.client_id).await {
            Ok(id) => id,
            Err(e) if e.downcast_ref::<MissingJobId>().is_some() => {
                return Err(BackendError::BackendProtocolError {
                    backend: self.address.clone(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                return Err(BackendError::TransportError {
                    backend: self.address.clone(),
                    source: e,
                });
            }
        };
        self.set_state(JobState::Submitted);
        Ok(job_id)
    }

    /// Open the backend's WebSocket and wait for the job to complete.
    pub async fn watch(
        &self,
        job_id: &str,
        deadline: Duration,
        shutdown: &Notify,
    ) -> Result<bool, BackendError> {
        self.set_state(JobState::Watching);
        let outcome = ws::watch_prompt(&self.address, &self.client_id, job_id, deadline, shutdown)
            .await
            .map_err(|e| BackendError::TransportError {
                backend: self.address.clone(),
                source: e,
            })?;

        match outcome {
            WatchOutcome::Completed => {
                self.set_state(JobState::Completed);
                Ok(true)
            }
            WatchOutcome::TimedOut => {
                self.set_state(JobState::TimedOut);
                Ok(false)
            }
        }
    }

    pub async fn fetch_history(&self, job_id: &str) -> Result<Value, BackendError> {
        self.http
            .history(&self.address, job_id)
            .await
            .map_err(|e| BackendError::TransportError {
                backend: self.address.clone(),
                source: e,
            })
    }

    pub async fn fetch_artifact(&self, reference: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        self.http
            .view(
                &self.address,
                &reference.filename,
                &reference.subfolder,
                &reference.file_type,
            )
            .await
            .map_err(|e| BackendError::TransportError {
                backend: self.address.clone(),
                source: e,
            })
    }

    /// Rewrite the template for an image-mode job, submit, watch, and fetch
    /// the result. `timeout` bounds the watch phase only.
    pub async fn run_image(
        &self,
        template: &Workflow,
        image_filename: &str,
        timeout: Duration,
        shutdown: &Notify,
    ) -> Result<JobResult, BackendError> {
        let (workflow, target) = rewriter::rewrite_image(template, image_filename);
        if target.is_none() {
            warn!(backend = %self.address, "rewrite found no LoadImage node; submitting unchanged");
        }
        self.run_submitted(workflow, timeout, shutdown, ArtifactKind::Image).await
    }

    /// Rewrite the template for a video-mode job, submit, watch, and fetch
    /// the result.
    pub async fn run_video(
        &self,
        template: &Workflow,
        video_filename: &str,
        target_node_id: Option<&str>,
        timeout: Duration,
        shutdown: &Notify,
    ) -> Result<JobResult, BackendError> {
        let (workflow, target) = rewriter::rewrite_video(template, video_filename, target_node_id);
        if target.is_none() {
            warn!(backend = %self.address, "rewrite found no matching video node; submitting unchanged");
        }
        self.run_submitted(workflow, timeout, shutdown, ArtifactKind::Video).await
    }

    async fn run_submitted(
        &self,
        workflow: Workflow,
        timeout: Duration,
        shutdown: &Notify,
        kind: ArtifactKind,
    ) -> Result<JobResult, BackendError> {
        let job_id = self.submit(&workflow).await?;

        let completed = self.watch(&job_id, timeout, shutdown).await?;
        if !completed {
            return Err(BackendError::ExecutionTimeout {
                backend: self.address.clone(),
                timeout_secs: timeout.as_secs(),
            });
        }

        let history = self.fetch_history(&job_id).await?;

        let artifact = match extract_artifact_ref(&history, &job_id, kind) {
            Some(reference) => Some(self.fetch_artifact(&reference).await?),
            None => {
                info!(backend = %self.address, job_id = %job_id, "job produced no retrievable artifact");
                None
            }
        };

        Ok(JobResult {
            job_id,
            history,
            artifact,
        })
    }

    /// `POST /free`, falling back to an empty no-op prompt.
    pub async fn free_memory(&self) -> Result<(), BackendError> {
        self.http
            .free_memory(&self.address)
            .await
            .map_err(|e| BackendError::TransportError {
                backend: self.address.clone(),
                source: e,
            })
    }
}

/// Walk `history[job_id].outputs` in insertion order and return the first
/// node output whose artifact list (per `kind`) is non-empty.
pub fn extract_artifact_ref(history: &Value, job_id: &str, kind: ArtifactKind) -> Option<ArtifactRef> {
    let outputs = history.get(job_id)?.get("outputs")?.as_object()?;

    for (_, node_output) in outputs {
        let node_output = node_output.as_object()?;
        for key in kind.output_keys() {
            if let Some(items) = node_output.get(*key).and_then(Value::as_array)
                && let Some(first) = items.first()
            {
                let filename = first.get("filename")?.as_str()?.to_string();
                let subfolder = first
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let file_type = first
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("output")
                    .to_string();
                return Some(ArtifactRef {
                    filename,
                    subfolder,
                    file_type,
                });
            }
        }
    }
    None
}
