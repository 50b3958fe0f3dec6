use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Outcome of watching a backend's WebSocket stream for a prompt's
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// `executing` with `node: null` for our prompt id — the graph is done.
    Completed,
    /// The deadline elapsed before completion was observed.
    TimedOut,
}

/// Open `ws://{address}/ws?clientId={client_id}` and watch for the given
/// prompt's completion, cancellable by `shutdown` and bounded by `deadline`.
///
/// This replaces a busy receive-until-deadline loop with a single
/// `tokio::select!` racing the socket read, a deadline timer, and the
/// shutdown signal — the loop never spins and reacts to shutdown
/// immediately instead of after the next frame arrives.
pub async fn watch_prompt(
    address: &str,
    client_id: &str,
    prompt_id: &str,
    deadline: Duration,
    shutdown: &Notify,
) -> Result<WatchOutcome> {
    let url = format!("ws://{address}/ws?clientId={client_id}");
    let (stream, _) = connect_async(&url)
        .await
        .with_context(|| format!("failed to open websocket to {url}"))?;
    let (_, mut read) = stream.split();

    let deadline_at = Instant::now() + deadline;

    loop {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WatchOutcome::TimedOut);
        }

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if is_completion_frame(&text, prompt_id) {
                            return Ok(WatchOutcome::Completed);
                        }
                        if let Some((value, max)) = progress_frame(&text) {
                            debug!(backend = %address, value, max, "workflow progress");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(backend = %address, "websocket closed before completion");
                        return Ok(WatchOutcome::TimedOut);
                    }
                    Some(Ok(_)) => {} // binary/ping/pong — ignore
                    Some(Err(e)) => {
                        warn!(backend = %address, error = %e, "websocket error");
                        return Ok(WatchOutcome::TimedOut);
                    }
                }
            }
            _ = tokio::time::sleep(remaining) => {
                return Ok(WatchOutcome::TimedOut);
            }
            _ = shutdown.notified() => {
                return Ok(WatchOutcome::TimedOut);
            }
        }
    }
}

/// `{"type": "executing", "data": {"node": null, "prompt_id": "..."}}`
/// signals the prompt has finished executing.
fn is_completion_frame(text: &str, prompt_id: &str) -> bool {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return false;
    };
    if frame.get("type").and_then(Value::as_str) != Some("executing") {
        return false;
    }
    let data = frame.get("data");
    let node_is_null = data
        .map(|d| d.get("node").is_none_or(Value::is_null))
        .unwrap_or(false);
    let matches_prompt = data
        .and_then(|d| d.get("prompt_id"))
        .and_then(Value::as_str)
        == Some(prompt_id);
    node_is_null && matches_prompt
}

/// `{"type": "progress", "data": {"value": N, "max": M}}`.
fn progress_frame(text: &str) -> Option<(u64, u64)> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("type").and_then(Value::as_str) != Some("progress") {
        return None;
    }
    let data = frame.get("data")?;
    let value = data.get("value")?.as_u64()?;
    let max = data.get("max")?.as_u64()?;
    Some((value, max))
}
