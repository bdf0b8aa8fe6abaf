//! Host-side emulated device.
//!
//! The device offers its feature set to the guest, registers providers and
//! creates probes on the host's behalf (mirroring each one to the guest),
//! and turns probe install/uninstall notifications from the host tracer
//! into control messages.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::EndpointConfig;
use crate::endpoint::{Endpoint, Role, Shared, StatsSnapshot};
use crate::error::QueueError;
use crate::features::Features;
use crate::framework::TracingFramework;
use crate::registry::ProbeRegistry;
use crate::virtqueue::QueuePair;
use crate::wire::{
    BoundedName, ControlMessage, ProbeCreate, ProbeDesc, ProbeId, ProviderEvent, ProviderId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeChange {
    Installed,
    Uninstalled,
}

/// A probe state change reported by the host tracer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeNotification {
    pub instance: String,
    pub change: ProbeChange,
    pub probe_id: ProbeId,
}

/// Cloneable handle that forwards probe notifications to one device.
///
/// Notifications for other instances are ignored, as is anything that
/// arrives after the device went away.
#[derive(Clone)]
pub struct ProbeNotifier {
    instance: String,
    shared: Weak<Shared>,
}

impl ProbeNotifier {
    /// Returns true if the notification was queued for the guest.
    pub fn notify(&self, note: &ProbeNotification) -> Result<bool, QueueError> {
        if note.instance != self.instance {
            trace!(
                "Ignoring {:?} of probe {} for {}",
                note.change,
                note.probe_id,
                note.instance
            );
            return Ok(false);
        }
        let Some(shared) = self.shared.upgrade() else {
            return Err(QueueError::Shutdown);
        };
        let msg = match note.change {
            ProbeChange::Installed => ControlMessage::ProbeInstall {
                probe_id: note.probe_id,
            },
            ProbeChange::Uninstalled => ControlMessage::ProbeUninstall {
                probe_id: note.probe_id,
            },
        };
        shared.post(msg)?;
        Ok(true)
    }
}

pub struct HostDevice {
    endpoint: Endpoint,
}

impl HostDevice {
    /// Features this device would offer with `config`.
    pub fn offered(config: &EndpointConfig) -> Features {
        config.features()
    }

    /// Attach with the feature set the guest acknowledged.
    pub fn attach(
        config: &EndpointConfig,
        acked: Features,
        queues: QueuePair,
        framework: Arc<dyn TracingFramework>,
        registry: Arc<ProbeRegistry>,
    ) -> Result<Self> {
        let features = acked & Self::offered(config);
        let endpoint = Endpoint::attach(
            Role::Host,
            config,
            features,
            queues,
            framework,
            registry,
        )
        .with_context(|| format!("failed to attach host device for {}", config.instance))?;
        Ok(HostDevice { endpoint })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn notifier(&self) -> ProbeNotifier {
        ProbeNotifier {
            instance: self.endpoint.instance().to_string(),
            shared: Arc::downgrade(self.endpoint.shared()),
        }
    }

    /// Register a provider for this device's guest under a fresh handle and
    /// announce it. Nothing is registered if the announcement cannot be
    /// queued.
    pub fn register_provider(&self, name: &str) -> Result<ProviderId> {
        let pv = ProviderEvent {
            uuid: ProviderId::generate(),
            name: BoundedName::new(name)?,
            instance: BoundedName::new(self.endpoint.instance())?,
        };
        let uuid = pv.uuid;
        let slot = self
            .endpoint
            .reserve()
            .with_context(|| format!("no room to announce provider {}", name))?;
        self.endpoint
            .processor()
            .register(&pv)
            .with_context(|| format!("failed to register provider {}", name))?;
        if let Err(e) = slot.post(ControlMessage::Register(pv)) {
            if let Err(undo) = self.endpoint.processor().unregister(uuid) {
                warn!("Failed to roll back provider {}: {}", uuid, undo);
            }
            return Err(e).with_context(|| format!("failed to announce provider {}", name));
        }
        debug!("Host registered provider {} as {}", name, uuid);
        Ok(uuid)
    }

    /// Unregister a provider and announce it. Unknown handles fail with
    /// an ESRCH-class error. Nothing changes if the announcement cannot be
    /// queued.
    pub fn unregister_provider(&self, uuid: ProviderId) -> Result<()> {
        let slot = self
            .endpoint
            .reserve()
            .with_context(|| format!("no room to announce removal of provider {}", uuid))?;
        let pv = self
            .endpoint
            .processor()
            .unregister(uuid)
            .with_context(|| format!("failed to unregister provider {}", uuid))?;
        slot.post(ControlMessage::Unregister(pv))?;
        Ok(())
    }

    /// Create a probe under `provider` and announce it under the id the
    /// host framework assigned.
    pub fn create_probe(
        &self,
        provider: ProviderId,
        module: &str,
        function: &str,
        name: &str,
    ) -> Result<ProbeId> {
        let desc = ProbeDesc {
            provider,
            module: BoundedName::new(module)?,
            function: BoundedName::new(function)?,
            name: BoundedName::new(name)?,
        };
        let slot = self
            .endpoint
            .reserve()
            .with_context(|| format!("no room to announce probe {}", desc))?;
        let probe_id = self
            .endpoint
            .processor()
            .create(&desc)
            .with_context(|| format!("failed to create probe {}", desc))?;
        slot.post(ControlMessage::ProbeCreate(ProbeCreate { probe_id, desc }))?;
        Ok(probe_id)
    }

    /// Shorthand for a notification about this device's own instance.
    pub fn install_probe(&self, id: ProbeId) -> Result<bool, QueueError> {
        self.notifier().notify(&ProbeNotification {
            instance: self.endpoint.instance().to_string(),
            change: ProbeChange::Installed,
            probe_id: id,
        })
    }

    pub fn uninstall_probe(&self, id: ProbeId) -> Result<bool, QueueError> {
        self.notifier().notify(&ProbeNotification {
            instance: self.endpoint.instance().to_string(),
            change: ProbeChange::Uninstalled,
            probe_id: id,
        })
    }

    pub fn providers(&self) -> Vec<ProviderEvent> {
        self.endpoint.processor().providers()
    }

    pub fn detach(self) -> StatsSnapshot {
        self.endpoint.detach()
    }
}
