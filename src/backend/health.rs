use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::backend::http::BackendClient;
use crate::config::HealthConfig;
use crate::registry::{BackendRegistry, ProbeOutcome};

/// Runs periodic `/queue` probes against every registered backend.
///
/// Probes for a given tick run concurrently (one task per backend) but the
/// ticks themselves are sequential — a slow backend in one round cannot
/// delay the probe of another backend in the same round. Outcomes are
/// applied to the registry as they land, not batched.
pub async fn run_health_checker(
    registry: Arc<BackendRegistry>,
    client: BackendClient,
    config: HealthConfig,
    shutdown: Arc<Notify>,
) {
    info!(
        interval_secs = config.probe_interval.as_secs(),
        failure_threshold = config.failure_threshold,
        "health prober started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.probe_interval) => {},
            _ = shutdown.notified() => {
                info!("health prober shutting down");
                return;
            }
        }

        let addresses: Vec<String> = registry.snapshot().into_iter().map(|s| s.address).collect();
        if addresses.is_empty() {
            continue;
        }

        let mut join_set: JoinSet<(String, ProbeOutcome)> = JoinSet::new();
        for address in addresses {
            let client = client.clone();
            let timeout = config.probe_timeout;
            join_set.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, client.queue_status(&address)).await
                {
                    Ok(Ok(status)) => ProbeOutcome::Success {
                        queue_running: status.queue_running,
                        queue_pending: status.queue_pending,
                    },
                    Ok(Err(e)) => {
                        warn!(backend = %address, error = %e, "health probe failed");
                        ProbeOutcome::Failure
                    }
                    Err(_) => {
                        warn!(backend = %address, timeout_secs = timeout.as_secs(), "health probe timed out");
                        ProbeOutcome::Failure
                    }
                };
                (address, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((address, outcome)) => registry.apply_probe(&address, outcome),
                Err(e) => warn!(error = %e, "health probe task panicked"),
            }
        }
    }
}
