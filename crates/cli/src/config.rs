use anyhow::{Context, Result};
use jobgraph_core::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl CliConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                scheduler: SchedulerConfig::default(),
            }
        };

        config.data_dir = data_dir;
        config.scheduler = config.scheduler.sanitized();

        Ok(config)
    }

    /// Root of the local substrate's attempt work directories
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    /// Root under which workflows stage their outputs
    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }
}
