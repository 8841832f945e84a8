use command_ring::RingSetConfig;
use completion_waiter::{RetryConfig, RetryConfigError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub rings: RingSetConfig,
    /// Budget for waiting on ring consumption: many short waits.
    pub command_stream_wait: RetryConfig,
    pub render_wait: RetryConfig,
    /// Back-off polling used when a resource must become idle before it is reused or freed.
    pub resource_wait: RetryConfig,
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        self.command_stream_wait.validate()?;
        self.render_wait.validate()?;
        self.resource_wait.validate()
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            rings: RingSetConfig::default(),
            command_stream_wait: RetryConfig::new(200, 2),
            render_wait: RetryConfig::new(100, 20),
            resource_wait: RetryConfig::new(50, 2),
        }
    }
}
