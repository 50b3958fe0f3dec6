//! Test utilities — a mock ComfyUI-shaped backend server used by the
//! driver/pool/gateway integration tests. Built on `axum` (already pulled
//! in for the admin API) rather than a real ComfyUI instance or a
//! hand-rolled TCP listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Which key (if any) the mock's `/prompt` response carries the job id
/// under, to exercise the driver's fallback lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobIdKey {
    PromptId,
    Id,
    RequestId,
    Omit,
}

struct MockState {
    next_id: AtomicU64,
    queue_running: AtomicUsize,
    queue_pending: AtomicUsize,
    fail_prompt: AtomicBool,
    no_completion: AtomicBool,
    completion_delay: std::sync::Mutex<Duration>,
    last_prompt_id: std::sync::Mutex<Option<String>>,
    job_id_key: std::sync::Mutex<JobIdKey>,
    histories: DashMap<String, Value>,
    prompts: DashMap<String, Value>,
}

/// A running mock backend bound to an ephemeral localhost port, shaped like
/// a single ComfyUI-compatible engine: `/queue`, `/prompt`, `/history/:id`,
/// `/view`, `/free`, `/upload/image`, `/ws`.
pub struct MockComfyServer {
    pub addr: String,
    state: Arc<MockState>,
    shutdown: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockComfyServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            next_id: AtomicU64::new(1),
            queue_running: AtomicUsize::new(0),
            queue_pending: AtomicUsize::new(0),
            fail_prompt: AtomicBool::new(false),
            no_completion: AtomicBool::new(false),
            completion_delay: std::sync::Mutex::new(Duration::from_millis(20)),
            last_prompt_id: std::sync::Mutex::new(None),
            job_id_key: std::sync::Mutex::new(JobIdKey::PromptId),
            histories: DashMap::new(),
            prompts: DashMap::new(),
        });

        let app = Router::new()
            .route("/queue", get(handle_queue))
            .route("/prompt", post(handle_prompt))
            .route("/history/{id}", get(handle_history))
            .route("/view", get(handle_view))
            .route("/free", post(handle_free))
            .route("/upload/image", post(handle_upload))
            .route("/ws", get(handle_ws))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_for_task.notified().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown,
            handle,
        }
    }

    pub fn set_queue_depth(&self, running: usize, pending: usize) {
        self.state.queue_running.store(running, Ordering::SeqCst);
        self.state.queue_pending.store(pending, Ordering::SeqCst);
    }

    pub fn set_fail_prompt(&self, fail: bool) {
        self.state.fail_prompt.store(fail, Ordering::SeqCst);
    }

    pub fn set_no_completion(&self, enabled: bool) {
        self.state.no_completion.store(enabled, Ordering::SeqCst);
    }

    pub fn set_completion_delay(&self, delay: Duration) {
        *self.state.completion_delay.lock().unwrap() = delay;
    }

    pub fn set_job_id_key(&self, key: JobIdKey) {
        *self.state.job_id_key.lock().unwrap() = key;
    }

    pub async fn shutdown(self) {
        self.shutdown.notify_waiters();
        let _ = self.handle.await;
    }
}

async fn handle_queue(State(state): State<Arc<MockState>>) -> Json<Value> {
    let running = vec![Value::Null; state.queue_running.load(Ordering::SeqCst)];
    let pending = vec![Value::Null; state.queue_pending.load(Ordering::SeqCst)];
    Json(serde_json::json!({ "queue_running": running, "queue_pending": pending }))
}

async fn handle_prompt(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if state.fail_prompt.load(Ordering::SeqCst) {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let id = state.next_id.fetch_add(1, Ordering::SeqCst).to_string();
    state.prompts.insert(id.clone(), body);
    state.histories.insert(
        id.clone(),
        serde_json::json!({
            "outputs": {
                "9": {"images": [{"filename": "result.png", "subfolder": "", "type": "output"}]}
            }
        }),
    );
    *state.last_prompt_id.lock().unwrap() = Some(id.clone());

    let key = *state.job_id_key.lock().unwrap();
    let body = match key {
        JobIdKey::PromptId => serde_json::json!({ "prompt_id": id }),
        JobIdKey::Id => serde_json::json!({ "id": id }),
        JobIdKey::RequestId => serde_json::json!({ "request_id": id }),
        JobIdKey::Omit => serde_json::json!({ "status": "queued" }),
    };
    Json(body).into_response()
}

async fn handle_history(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Json<Value> {
    let outputs = state
        .histories
        .get(&id)
        .map(|r| r.value().clone())
        .unwrap_or_else(|| serde_json::json!({"outputs": {}}));
    Json(serde_json::json!({ id: outputs }))
}

async fn handle_view(Query(_params): Query<std::collections::HashMap<String, String>>) -> Vec<u8> {
    vec![0x89, 0x50, 0x4e, 0x47]
}

async fn handle_free() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

async fn handle_upload(mut multipart: Multipart) -> impl IntoResponse {
    while let Ok(Some(_field)) = multipart.next_field().await {}
    axum::http::StatusCode::OK
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

async fn run_ws(mut socket: WebSocket, state: Arc<MockState>) {
    if state.no_completion.load(Ordering::SeqCst) {
        // Hold the connection open without ever completing, to exercise the
        // caller's deadline path.
        loop {
            match socket.recv().await {
                Some(Ok(_)) => continue,
                _ => return,
            }
        }
    }

    let delay = *state.completion_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    let Some(prompt_id) = state.last_prompt_id.lock().unwrap().clone() else {
        return;
    };

    let frame = serde_json::json!({
        "type": "executing",
        "data": { "node": null, "prompt_id": prompt_id }
    });
    let _ = socket.send(Message::Text(frame.to_string().into())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_reports_configured_queue_depth() {
        let server = MockComfyServer::start().await;
        server.set_queue_depth(2, 3);

        let client = reqwest::Client::new();
        let resp: Value = client
            .get(format!("http://{}/queue", server.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["queue_running"].as_array().unwrap().len(), 2);
        assert_eq!(resp["queue_pending"].as_array().unwrap().len(), 3);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_mock_server_prompt_then_history_round_trip() {
        let server = MockComfyServer::start().await;
        let client = reqwest::Client::new();

        let resp: Value = client
            .post(format!("http://{}/prompt", server.addr))
            .json(&serde_json::json!({"prompt": {}, "client_id": "c1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = resp["prompt_id"].as_str().unwrap().to_string();

        let history: Value = client
            .get(format!("http://{}/history/{id}", server.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(history[&id]["outputs"]["9"]["images"][0]["filename"].is_string());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_mock_server_prompt_accepts_id_and_request_id_fallback_keys() {
        let server = MockComfyServer::start().await;
        let client = reqwest::Client::new();

        for key in [JobIdKey::Id, JobIdKey::RequestId] {
            server.set_job_id_key(key);
            let resp: Value = client
                .post(format!("http://{}/prompt", server.addr))
                .json(&serde_json::json!({"prompt": {}, "client_id": "c1"}))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let expected_key = match key {
                JobIdKey::Id => "id",
                JobIdKey::RequestId => "request_id",
                _ => unreachable!(),
            };
            assert!(resp.get(expected_key).and_then(Value::as_str).is_some());
        }

        server.shutdown().await;
    }
}
