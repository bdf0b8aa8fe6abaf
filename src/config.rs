//! Endpoint configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AttachError;
use crate::features::Features;
use crate::registry::DEFAULT_MAX_INSTANCES;
use crate::wire::MAX_NAME_LEN;

/// Data slots per ring, matching the emulated device.
pub const DEFAULT_RING_SIZE: usize = 64;

/// How long the communicator waits for the peer to take a batch.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 1000;

/// Configuration for one endpoint (guest driver or host device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Guest instance this endpoint serves; the probe registry partition.
    pub instance: String,
    /// Data slots per ring. One more slot is reserved for EOF.
    pub ring_size: usize,
    /// Offer/request probe lifecycle events
    pub probe: bool,
    /// Offer/request provider lifecycle events
    pub provider: bool,
    /// Offer/request NACK replies
    pub nack: bool,
    /// Outbound queue bound (0 = unbounded)
    pub queue_capacity: usize,
    /// Flush wait per batch, in milliseconds
    pub flush_timeout_ms: u64,
    /// Registry instance pool size
    pub max_instances: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            instance: "vm0".to_string(),
            ring_size: DEFAULT_RING_SIZE,
            probe: true,
            provider: true,
            nack: true,
            queue_capacity: 0,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            max_instances: DEFAULT_MAX_INSTANCES,
        }
    }
}

impl EndpointConfig {
    pub fn with_instance(instance: &str) -> Self {
        EndpointConfig {
            instance: instance.to_string(),
            ..Default::default()
        }
    }

    pub fn features(&self) -> Features {
        Features::from_toggles(self.probe, self.provider, self.nack)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), AttachError> {
        if self.instance.is_empty() || self.instance.len() > MAX_NAME_LEN {
            return Err(AttachError::Config(format!(
                "instance name must be 1..={} bytes, got '{}'",
                MAX_NAME_LEN, self.instance
            )));
        }
        if self.ring_size == 0 {
            return Err(AttachError::Config("ring_size must be at least 1".into()));
        }
        if self.max_instances == 0 {
            return Err(AttachError::Config(
                "max_instances must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
