use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::{DEFAULT_BUFFER_SIZE, DEFAULT_SCP_PATH, MIN_BUFFER_SIZE};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpConfig {
    /// scp binary invoked on the remote side
    pub scp_path: String,
    /// Buffer size around the remote streams, in bytes
    pub buffer_size: usize,
    /// Send and restore mode and times
    pub preserve: bool,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            scp_path: DEFAULT_SCP_PATH.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            preserve: true,
        }
    }
}

impl ScpConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let config: ScpConfig = toml::from_str(data).context("invalid scp config")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("in {}", path.display()))
    }

    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.max(MIN_BUFFER_SIZE)
    }
}
