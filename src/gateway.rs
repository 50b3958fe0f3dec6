use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout for ordinary job HTTP calls (submit/history/view/upload). These
/// are quick metadata round-trips; the actual workflow execution is bounded
/// separately by the per-mode workflow timeout via the WebSocket watch.
const JOB_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::backend::error::BackendError;
use crate::backend::health;
use crate::backend::http::BackendClient;
use crate::config::GatewayConfig;
use crate::driver::JobResult;
use crate::pool::ToolPool;
use crate::preload::{self, PreloadOutcome};
use crate::registry::{BackendRegistry, InFlightGuard};
use crate::rewriter::Workflow;

/// Job mode, determining which Rewriter entry point and timeout apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Image,
    Video,
}

/// Result of loading a template: per-backend preload outcomes (image mode
/// only; video mode skips preload entirely).
#[derive(Debug, Clone)]
pub struct LoadTemplateResult {
    pub ok: bool,
    pub per_backend: Vec<PreloadOutcome>,
}

/// Result of processing one upload through the scheduler.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub job_id: String,
    pub backend_address: String,
    pub history: serde_json::Value,
    pub artifact_bytes: Option<Vec<u8>>,
}

/// Top-level wiring: Registry + Tool Pool + Health Prober + shutdown.
/// This is the handler-facing contract described in the specification's
/// upstream interface — HTTP routing, uploads, and template storage are a
/// collaborator's concern and live outside this type.
pub struct Gateway {
    registry: Arc<BackendRegistry>,
    pool: Arc<ToolPool>,
    config: GatewayConfig,
    shutdown: Arc<Notify>,
    prober_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Construct the gateway, register configured backends, and spawn the
    /// health prober. The prober runs until `shutdown()` is called.
    pub fn start(config: GatewayConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(BackendRegistry::new(config.health.failure_threshold));
        let job_http = BackendClient::new(JOB_HTTP_TIMEOUT)?;
        let probe_http = BackendClient::new(config.health.probe_timeout)?;
        let pool = Arc::new(ToolPool::new(job_http));

        for address in &config.backends {
            registry.add(address);
            pool.add_backend(address);
        }

        let shutdown = Arc::new(Notify::new());

        let prober_handle = {
            let registry = Arc::clone(&registry);
            let health_config = config.health.clone();
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                health::run_health_checker(registry, probe_http, health_config, shutdown).await;
            })
        };

        info!(backends = config.backends.len(), "gateway started");

        Ok(Self {
            registry,
            pool,
            config,
            shutdown,
            prober_handle: std::sync::Mutex::new(Some(prober_handle)),
        })
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ToolPool> {
        &self.pool
    }

    /// `load_template(graph, name, mode)`. For image mode, also runs the
    /// Preload Orchestrator across every bound backend. Video mode skips
    /// preload entirely (long-running workflows aren't worth warming).
    pub async fn load_template(
        &self,
        graph: Workflow,
        name: String,
        mode: JobMode,
    ) -> Result<LoadTemplateResult, BackendError> {
        self.pool.load_workflow(graph.clone(), name);

        if mode != JobMode::Image {
            return Ok(LoadTemplateResult {
                ok: true,
                per_backend: Vec::new(),
            });
        }

        let outcomes = preload::preload_all(
            &self.pool,
            &graph,
            &self.input_dir(),
            &self.config.preload.placeholder_name,
            self.config.timeouts.preload_timeout,
            Arc::clone(&self.shutdown),
        )
        .await?;

        for outcome in &outcomes {
            if outcome.ok {
                self.pool.mark_preloaded(&outcome.address);
            }
        }

        Ok(LoadTemplateResult {
            ok: true,
            per_backend: outcomes,
        })
    }

    /// `process(upload_filename, mode)`. Selects a backend, brackets the
    /// dispatch with in-flight accounting, rewrites and runs the loaded
    /// template, and returns the extracted artifact if any.
    pub async fn process(&self, upload_filename: &str, mode: JobMode) -> Result<ProcessResult, BackendError> {
        let loaded = self
            .pool
            .current_workflow()
            .ok_or_else(|| BackendError::Other(anyhow::anyhow!("no workflow loaded")))?;

        let driver = self.pool.get_tool_for_request(&self.registry)?;
        let address = driver.address().to_string();

        let _in_flight = InFlightGuard::new(&self.registry, &address);
        let started_at = Instant::now();

        let result: JobResult = match mode {
            JobMode::Image => {
                driver
                    .run_image(
                        &loaded.graph,
                        upload_filename,
                        self.config.timeouts.workflow_timeout,
                        &self.shutdown,
                    )
                    .await?
            }
            JobMode::Video => {
                driver
                    .run_video(
                        &loaded.graph,
                        upload_filename,
                        None,
                        self.config.timeouts.video_workflow_timeout,
                        &self.shutdown,
                    )
                    .await?
            }
        };

        info!(
            backend = %address,
            job_id = %result.job_id,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "job complete"
        );

        Ok(ProcessResult {
            job_id: result.job_id,
            backend_address: address,
            history: result.history,
            artifact_bytes: result.artifact,
        })
    }

    pub fn add_backend(&self, address: &str) {
        self.registry.add(address);
        self.pool.add_backend(address);
    }

    pub fn remove_backend(&self, address: &str) {
        self.registry.remove(address);
        self.pool.remove_backend(address);
    }

    pub fn status_snapshot(&self) -> Vec<crate::registry::BackendStatus> {
        self.registry.snapshot()
    }

    /// Best-effort GPU memory release on one backend, outside the normal
    /// job lifecycle.
    pub async fn release_backend_memory(&self, address: &str) -> Result<(), BackendError> {
        let driver = self
            .pool
            .driver_for(address)
            .ok_or(BackendError::NoBackendAvailable)?;
        driver.free_memory().await
    }

    pub fn input_dir(&self) -> PathBuf {
        self.config.comfyui_input_dir.clone()
    }

    /// Signal the prober to stop, drain in-flight jobs (bounded at 10s,
    /// then force), and join the prober task. In-flight jobs are never
    /// cancelled — this only waits for their `InFlightGuard`s to drop, or
    /// gives up and shuts down anyway. Safe to call more than once; later
    /// calls are no-ops.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();

        let drain_start = Instant::now();
        let in_flight: u64 = self.status_snapshot().iter().map(|b| b.in_flight as u64).sum();
        if in_flight > 0 {
            info!(in_flight, "draining in-flight jobs before shutdown");
            loop {
                let remaining: u64 = self.status_snapshot().iter().map(|b| b.in_flight as u64).sum();
                if remaining == 0 {
                    info!(elapsed_ms = drain_start.elapsed().as_millis() as u64, "all in-flight jobs drained");
                    break;
                }
                if drain_start.elapsed() > Duration::from_secs(10) {
                    warn!(in_flight = remaining, "drain timeout after 10s, forcing shutdown");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let handle = self.prober_handle.lock().unwrap().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "health prober task panicked during shutdown");
        }
        info!("gateway shut down");
    }
}

/// JSON-serializable snapshot returned by the admin API.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub backends: Vec<crate::registry::BackendStatus>,
}

impl Gateway {
    pub fn status_report(&self) -> StatusReport {
        let backends = self.status_snapshot();
        let status = if backends.iter().all(|b| b.available) {
            "healthy"
        } else {
            "degraded"
        };
        StatusReport { status, backends }
    }
}
