use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between background credential/endpoint refresh cycles.
    #[serde(default = "RefreshConfig::default_interval_secs")]
    pub interval_secs: u64,
}

impl RefreshConfig {
    fn default_interval_secs() -> u64 {
        // 6h keeps a 12h token comfortably inside its validity window
        6 * 60 * 60
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("refresh.interval_secs must be greater than zero");
        }
        Ok(())
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
        }
    }
}
