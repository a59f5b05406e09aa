use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Scheduler tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Shared permits bounding concurrently running node attempts across all workflows
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Maximum idle time before the liveness guard reconciles with the substrate
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    /// How often the liveness guard wakes up
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,

    /// Prefer hard links over copies when materializing outputs
    #[serde(default = "default_link_outputs")]
    pub link_outputs: bool,

    /// Number of finished workflows kept around for `poll`
    #[serde(default = "default_retained_workflows")]
    pub retained_workflows: usize,
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_liveness_timeout_secs() -> u64 {
    300
}

fn default_liveness_interval_secs() -> u64 {
    5
}

fn default_link_outputs() -> bool {
    true
}

fn default_retained_workflows() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            liveness_interval_secs: default_liveness_interval_secs(),
            link_outputs: default_link_outputs(),
            retained_workflows: default_retained_workflows(),
        }
    }
}

impl SchedulerConfig {
    /// Load from a TOML file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Scheduler configuration not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).context("Failed to read scheduler configuration")?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse scheduler configuration")?;
        Ok(config.sanitized())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    /// Clamp values that would stall the scheduler; a zero-sized pool never runs anything
    pub fn sanitized(mut self) -> Self {
        self.worker_pool_size = self.worker_pool_size.max(1);
        self
    }
}
