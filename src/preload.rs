use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::backend::error::BackendError;
use crate::pool::ToolPool;
use crate::rewriter::{self, Workflow};

const PLACEHOLDER_SIZE: u32 = 16;

/// Ensure the 16x16 all-white placeholder image exists at
/// `input_dir/placeholder_name`, creating it if absent. Idempotent — many
/// preload rounds may call this concurrently.
pub fn ensure_placeholder(input_dir: &Path, placeholder_name: &str) -> Result<PathBuf> {
    let path = input_dir.join(placeholder_name);
    if path.is_file() {
        return Ok(path);
    }

    std::fs::create_dir_all(input_dir)
        .with_context(|| format!("failed to create input dir {}", input_dir.display()))?;

    let image = image::RgbImage::from_pixel(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, image::Rgb([255, 255, 255]));
    image
        .save(&path)
        .with_context(|| format!("failed to write placeholder image {}", path.display()))?;

    info!(path = %path.display(), "created preload placeholder image");
    Ok(path)
}

/// Outcome of preloading a single backend.
#[derive(Debug, Clone)]
pub struct PreloadOutcome {
    pub address: String,
    pub ok: bool,
    pub message: String,
}

/// Fan out the preload-variant rewrite + a full submit/watch cycle across
/// every backend currently bound in the pool, in parallel. Video-mode
/// templates are never preloaded (see caller).
///
/// Writes the placeholder image to `input_dir` before dispatching a single
/// job, since every fanned-out submission references it by filename and
/// backends read it from that (shared) input directory.
pub async fn preload_all(
    pool: &ToolPool,
    template: &Workflow,
    input_dir: &Path,
    placeholder_name: &str,
    timeout: Duration,
    shutdown: Arc<Notify>,
) -> Result<Vec<PreloadOutcome>, BackendError> {
    ensure_placeholder(input_dir, placeholder_name)
        .map_err(|e| BackendError::Other(e.context("failed to prepare preload placeholder")))?;

    let rewritten = rewriter::rewrite_image_preload(template, placeholder_name);
    let addresses = pool.addresses();

    if addresses.is_empty() {
        return Ok(Vec::new());
    }

    let mut join_set: JoinSet<PreloadOutcome> = JoinSet::new();
    for address in addresses {
        let Some(driver) = pool.driver_for(&address) else {
            continue;
        };
        let rewritten = rewritten.clone();
        let shutdown = Arc::clone(&shutdown);

        join_set.spawn(async move {
            match driver
                .run_image(&rewritten, placeholder_name, timeout, &shutdown)
                .await
            {
                Ok(result) => PreloadOutcome {
                    address: driver.address().to_string(),
                    ok: true,
                    message: format!("preloaded prompt_id={}", result.job_id),
                },
                Err(e) => {
                    warn!(backend = %driver.address(), error = %e, "preload failed");
                    PreloadOutcome {
                        address: driver.address().to_string(),
                        ok: false,
                        message: e.to_string(),
                    }
                }
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok(outcome) = joined {
            results.push(outcome);
        }
    }

    if !results.is_empty() && results.iter().all(|r| !r.ok) {
        return Err(BackendError::PreloadAllFailed {
            count: results.len(),
        });
    }

    Ok(results)
}
