//! Guest-side driver.
//!
//! The guest requests a feature set, keeps whatever the host device
//! offers of it, and from then on reports probe lifecycle changes to the
//! host and fires its own installed probes.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::EndpointConfig;
use crate::endpoint::{Endpoint, Role, StatsSnapshot};
use crate::error::QueueError;
use crate::features::Features;
use crate::framework::TracingFramework;
use crate::registry::ProbeRegistry;
use crate::virtqueue::QueuePair;
use crate::wire::{BoundedName, ControlMessage, ProbeId, PROBE_NARGS};

pub struct GuestDriver {
    endpoint: Endpoint,
}

impl GuestDriver {
    /// Attach to a device that offers `offered`.
    pub fn attach(
        config: &EndpointConfig,
        offered: Features,
        queues: QueuePair,
        framework: Arc<dyn TracingFramework>,
        registry: Arc<ProbeRegistry>,
    ) -> Result<Self> {
        let features = Features::negotiate(offered, config.features());
        let endpoint = Endpoint::attach(
            Role::Guest,
            config,
            features,
            queues,
            framework,
            registry,
        )
        .with_context(|| format!("failed to attach guest driver for {}", config.instance))?;
        Ok(GuestDriver { endpoint })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The guest enabled probe `id`; tell the host.
    pub fn install_probe(&self, id: ProbeId) -> Result<(), QueueError> {
        self.endpoint
            .post(ControlMessage::ProbeInstall { probe_id: id })
    }

    pub fn uninstall_probe(&self, id: ProbeId) -> Result<(), QueueError> {
        self.endpoint
            .post(ControlMessage::ProbeUninstall { probe_id: id })
    }

    /// Ask the host to tear down everything registered for this guest.
    pub fn destroy(&self) -> Result<()> {
        let instance = BoundedName::new(self.endpoint.instance())?;
        self.endpoint.post(ControlMessage::Destroy { instance })?;
        Ok(())
    }

    pub fn fire(&self, id: ProbeId, args: [u64; PROBE_NARGS]) -> bool {
        self.endpoint.fire(id, args)
    }

    pub fn detach(self) -> StatsSnapshot {
        self.endpoint.detach()
    }
}
