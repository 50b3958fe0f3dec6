use thiserror::Error;

/// Errors surfaced by the backend pool to callers driving a job.
#[derive(Error, Debug)]
pub enum BackendError {
    /// No registered backend was available to accept dispatch.
    #[error("no backend available")]
    NoBackendAvailable,

    /// A backend responded, but with a payload the driver could not parse
    /// or that signalled an execution error on the ComfyUI side.
    #[error("backend '{backend}' protocol error: {message}")]
    BackendProtocolError { backend: String, message: String },

    /// The job's deadline elapsed before the backend reported completion.
    #[error("execution on backend '{backend}' timed out after {timeout_secs}s")]
    ExecutionTimeout {
        backend: String,
        timeout_secs: u64,
    },

    /// The HTTP or WebSocket transport to a backend failed outright.
    #[error("transport error talking to backend '{backend}': {source}")]
    TransportError {
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    /// Every registered backend failed during a preload fan-out.
    #[error("preload failed on all {count} backend(s)")]
    PreloadAllFailed { count: usize },

    /// Other errors (wraps the underlying error).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
