use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long `Success`/`Error` stay visible before reverting to `Idle`.
    pub cooldown_secs: u64,
    /// A full sync older than this is considered stale.
    pub staleness_threshold_secs: u64,
    /// Upper bound on concurrent record uploads within one fact kind.
    pub upload_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 3,
            staleness_threshold_secs: 3600,
            upload_concurrency: 4,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    #[must_use]
    pub fn upload_workers(&self) -> usize {
        self.upload_concurrency.max(1)
    }
}
