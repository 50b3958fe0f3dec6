use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once.
///
/// Must be called early in `main()` before spawning concurrent tasks.
/// `Once` guarantees a single execution even if called again from a
/// hot-reload path.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: called once, before any task spawns concurrent env reads.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Backend addresses (host:port), registered at startup in this order.
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub preload: PreloadConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    /// ComfyUI input directory that rewritten workflows reference.
    #[serde(default = "default_input_dir")]
    pub comfyui_input_dir: PathBuf,
}

/// Health-probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval", with = "humantime_duration")]
    pub probe_interval: Duration,

    #[serde(default = "default_probe_timeout", with = "humantime_duration")]
    pub probe_timeout: Duration,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Per-job-kind execution deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_workflow_timeout", with = "humantime_duration")]
    pub workflow_timeout: Duration,

    #[serde(default = "default_video_workflow_timeout", with = "humantime_duration")]
    pub video_workflow_timeout: Duration,

    #[serde(default = "default_preload_timeout", with = "humantime_duration")]
    pub preload_timeout: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            workflow_timeout: default_workflow_timeout(),
            video_workflow_timeout: default_video_workflow_timeout(),
            preload_timeout: default_preload_timeout(),
        }
    }
}

/// Preload warm-up configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadConfig {
    #[serde(default = "default_placeholder_name")]
    pub placeholder_name: String,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            placeholder_name: default_placeholder_name(),
        }
    }
}

/// Admin/status API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_admin_listen(),
        }
    }
}

// --- Defaults. Mirrors the original service's Settings defaults. ---

fn default_log_level() -> String {
    "info".to_string()
}
fn default_backends() -> Vec<String> {
    vec!["127.0.0.1:8155".to_string(), "127.0.0.1:8166".to_string()]
}
fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_workflow_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_video_workflow_timeout() -> Duration {
    Duration::from_secs(1200)
}
fn default_preload_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_placeholder_name() -> String {
    "preload_white.png".to_string()
}
fn default_admin_listen() -> String {
    "127.0.0.1:19999".to_string()
}
fn default_input_dir() -> PathBuf {
    PathBuf::from("./comfyui_input")
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backends: default_backends(),
            health: HealthConfig::default(),
            timeouts: TimeoutsConfig::default(),
            preload: PreloadConfig::default(),
            admin: AdminConfig::default(),
            comfyui_input_dir: default_input_dir(),
        }
    }
}

// --- humantime_duration serde helper ---

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime_format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime_parse(&s).map_err(serde::de::Error::custom)
    }

    fn humantime_format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn humantime_parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected format like '30s', '5m', '1h'")
            })
        }
    }
}

// --- Loading ---

impl GatewayConfig {
    /// Load config from a YAML file.
    ///
    /// Pipeline: read file -> shellexpand `${VAR}` -> deserialize YAML -> validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

        let config: GatewayConfig = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.health.failure_threshold == 0 {
            anyhow::bail!("health.failure_threshold must be >= 1");
        }
        if self.backends.is_empty() {
            tracing::warn!("no backends configured at startup; none will be registered");
        }
        for addr in &self.backends {
            if addr.trim().is_empty() {
                anyhow::bail!("backend address must not be empty");
            }
        }
        Ok(())
    }
}
