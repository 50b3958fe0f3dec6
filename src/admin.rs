//! Optional admin API (axum HTTP server).
//! Feature-gated behind the `admin` cargo feature.

#[cfg(feature = "admin")]
pub mod api {
    use axum::{Json, Router, extract::State, routing::get};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;
    use tracing::info;

    use crate::gateway::{Gateway, StatusReport};

    #[derive(Clone)]
    pub struct AdminState {
        pub gateway: Arc<Gateway>,
    }

    pub async fn start(state: AdminState, listen: &str, shutdown: Arc<Notify>) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/api/health", get(health))
            .route("/api/backends", get(backends))
            .with_state(state);

        let listener = TcpListener::bind(listen).await?;
        info!(listen = %listen, "admin API started");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await?;
        info!("admin API stopped");
        Ok(())
    }

    async fn health(State(state): State<AdminState>) -> Json<StatusReport> {
        Json(state.gateway.status_report())
    }

    async fn backends(
        State(state): State<AdminState>,
    ) -> Json<Vec<crate::registry::BackendStatus>> {
        Json(state.gateway.status_snapshot())
    }
}
