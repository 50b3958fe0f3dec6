use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

/// A backend's `/prompt` response carried no job identifier under any of
/// the accepted keys. Distinguished from a plain transport failure so
/// callers can surface it as a protocol error rather than a connectivity
/// one.
#[derive(Debug, Error)]
#[error("POST /prompt response missing a job id (tried prompt_id, id, request_id)")]
pub struct MissingJobId;

/// Thin reqwest wrapper over a single backend engine's HTTP surface.
///
/// Every call is a plain request/response; no retry logic lives here —
/// callers (the prober, the job driver) decide how to react to failure.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
}

impl BackendClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// `GET /queue`. Returns the running/pending queue depths used both by
    /// the health prober and by the selector's load metric.
    pub async fn queue_status(&self, address: &str) -> Result<QueueStatus> {
        let url = format!("http://{address}/queue");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned error status"))?;

        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("GET {url} returned invalid JSON"))?;

        let running = body
            .get("queue_running")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let pending = body
            .get("queue_pending")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        Ok(QueueStatus {
            queue_running: running,
            queue_pending: pending,
        })
    }

    /// `POST /prompt`. Submits a workflow graph with a client id and returns
    /// the job id, tried in order under `prompt_id`, `id`, then
    /// `request_id` — different backend implementations use different
    /// key names for the same thing.
    pub async fn queue_prompt(
        &self,
        address: &str,
        prompt: &Value,
        client_id: &str,
    ) -> Result<String> {
        let url = format!("http://{address}/prompt");
        let body = serde_json::json!({ "prompt": prompt, "client_id": client_id });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {url} returned error status"))?;

        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("POST {url} returned invalid JSON"))?;

        for key in ["prompt_id", "id", "request_id"] {
            if let Some(id) = body.get(key).and_then(Value::as_str) {
                return Ok(id.to_string());
            }
        }
        Err(MissingJobId.into())
    }

    /// `GET /history/<prompt_id>`.
    pub async fn history(&self, address: &str, prompt_id: &str) -> Result<Value> {
        let url = format!("http://{address}/history/{prompt_id}");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned error status"))?;

        resp.json()
            .await
            .with_context(|| format!("GET {url} returned invalid JSON"))
    }

    /// `GET /view?filename=&subfolder=&type=`. Returns the raw artifact bytes.
    pub async fn view(
        &self,
        address: &str,
        filename: &str,
        subfolder: &str,
        file_type: &str,
    ) -> Result<Vec<u8>> {
        let url = format!("http://{address}/view");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", file_type),
            ])
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned error status"))?;

        Ok(resp.bytes().await.map(|b| b.to_vec())?)
    }

    /// `POST /free`. Best-effort memory release; falls back to an empty
    /// queued prompt if the backend has no dedicated endpoint.
    pub async fn free_memory(&self, address: &str) -> Result<()> {
        let url = format!("http://{address}/free");
        let body = serde_json::json!({ "unload_models": true, "free_memory": true });

        let result = self.client.post(&url).json(&body).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => Ok(()),
            _ => {
                // Fall back to an empty no-op prompt, matching the original
                // service's behavior when the dedicated endpoint is absent.
                self.queue_prompt(address, &Value::Object(Default::default()), "free-memory-noop")
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Upload an input image/video into the backend's input directory via
    /// the standard `/upload/image` endpoint.
    pub async fn upload_input(
        &self,
        address: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let url = format!("http://{address}/upload/image");
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("image", part);

        self.client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {url} returned error status"))?;
        Ok(())
    }
}

/// Queue depths reported by a single `/queue` probe.
#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub queue_running: usize,
    pub queue_pending: usize,
}
