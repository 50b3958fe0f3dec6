use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;

use crate::backend::error::BackendError;
use crate::backend::http::BackendClient;
use crate::backend::selector;
use crate::driver::JobDriver;
use crate::registry::BackendRegistry;
use crate::rewriter::Workflow;

/// An immutable, atomically-swappable reference to the currently loaded
/// template graph. Held centrally by the pool; every binding reads through
/// to the same `ArcSwapOption`, so `load_workflow` updates every binding's
/// view in one store without taking the pool lock.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub graph: Workflow,
    pub template_name: String,
}

/// One per backend: owns the Job Driver bound to that address and tracks
/// whether it has been preloaded.
pub struct ToolBinding {
    pub driver: Arc<JobDriver>,
    pub preloaded: bool,
}

/// Owns one `ToolBinding` per backend and the pool-wide current workflow.
/// `get_tool_for_request` is the only path a request handler uses to reach
/// a driver — it always selects via the Registry snapshot first.
pub struct ToolPool {
    bindings: DashMap<String, ToolBinding>,
    current_workflow: ArcSwapOption<LoadedWorkflow>,
    http: BackendClient,
}

impl ToolPool {
    pub fn new(http: BackendClient) -> Self {
        Self {
            bindings: DashMap::new(),
            current_workflow: ArcSwapOption::empty(),
            http,
        }
    }

    pub fn current_workflow(&self) -> Option<Arc<LoadedWorkflow>> {
        self.current_workflow.load_full()
    }

    /// Replace the pool's workflow reference. Every existing and future
    /// binding observes the new graph on its next read — no per-binding
    /// mutation needed.
    pub fn load_workflow(&self, graph: Workflow, template_name: String) {
        self.current_workflow.store(Some(Arc::new(LoadedWorkflow {
            graph,
            template_name,
        })));
    }

    /// Materialize a fresh binding for `address` if one doesn't already
    /// exist. Idempotent.
    pub fn add_backend(&self, address: &str) {
        self.bindings.entry(address.to_string()).or_insert_with(|| ToolBinding {
            driver: Arc::new(JobDriver::new(address.to_string(), self.http.clone())),
            preloaded: false,
        });
    }

    pub fn remove_backend(&self, address: &str) {
        self.bindings.remove(address);
    }

    /// Select the least-loaded backend and return its driver, creating a
    /// binding on the fly if the registry and pool briefly disagree (e.g. a
    /// backend was just added).
    pub fn get_tool_for_request(&self, registry: &BackendRegistry) -> Result<Arc<JobDriver>, BackendError> {
        let snapshot = registry.snapshot();
        let address = selector::select_backend(&snapshot).ok_or(BackendError::NoBackendAvailable)?;

        self.add_backend(&address);
        let binding = self
            .bindings
            .get(&address)
            .ok_or(BackendError::NoBackendAvailable)?;
        Ok(Arc::clone(&binding.driver))
    }

    pub fn mark_preloaded(&self, address: &str) {
        if let Some(mut binding) = self.bindings.get_mut(address) {
            binding.preloaded = true;
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.bindings.iter().map(|r| r.key().clone()).collect()
    }

    pub fn driver_for(&self, address: &str) -> Option<Arc<JobDriver>> {
        self.bindings.get(address).map(|r| Arc::clone(&r.driver))
    }
}
