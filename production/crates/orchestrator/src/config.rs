//! Configuration for the orchestration service

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the orchestration service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Bound on each counterparty signing round trip
    pub countersignature_timeout: Duration,

    /// Bound on the finality submission
    pub finality_timeout: Duration,

    /// Bound on delivering a committed transition to one observer
    pub broadcast_timeout: Duration,

    /// Interval between timeout monitor scans
    pub timeout_check_interval: Duration,

    /// Capacity of the progress event channel
    pub progress_channel_capacity: usize,

    /// Resume incomplete attempts when the service starts
    pub resume_on_start: bool,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            countersignature_timeout: Duration::from_secs(60),
            finality_timeout: Duration::from_secs(30),
            broadcast_timeout: Duration::from_secs(10),
            timeout_check_interval: Duration::from_secs(10),
            progress_channel_capacity: 256,
            resume_on_start: true,
        }
    }
}

/// Builder for OrchestrationConfig
pub struct OrchestrationConfigBuilder {
    config: OrchestrationConfig,
}

impl OrchestrationConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestrationConfig::default(),
        }
    }

    pub fn countersignature_timeout(mut self, timeout: Duration) -> Self {
        self.config.countersignature_timeout = timeout;
        self
    }

    pub fn finality_timeout(mut self, timeout: Duration) -> Self {
        self.config.finality_timeout = timeout;
        self
    }

    pub fn broadcast_timeout(mut self, timeout: Duration) -> Self {
        self.config.broadcast_timeout = timeout;
        self
    }

    pub fn timeout_check_interval(mut self, interval: Duration) -> Self {
        self.config.timeout_check_interval = interval;
        self
    }

    pub fn progress_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.progress_channel_capacity = capacity;
        self
    }

    pub fn resume_on_start(mut self, resume: bool) -> Self {
        self.config.resume_on_start = resume;
        self
    }

    pub fn build(self) -> OrchestrationConfig {
        self.config
    }
}

impl Default for OrchestrationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
