//! A guest and a host wired back to back over an in-memory link.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::config::EndpointConfig;
use crate::endpoint::StatsSnapshot;
use crate::features::Features;
use crate::framework::{FrameworkSnapshot, MemoryFramework};
use crate::guest::GuestDriver;
use crate::host::HostDevice;
use crate::registry::{InstanceSnapshot, ProbeRegistry};
use crate::virtqueue::link;

/// Final state of one side, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SideReport {
    pub features: String,
    pub framework: FrameworkSnapshot,
    pub registry: Vec<InstanceSnapshot>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub guest: SideReport,
    pub host: SideReport,
}

pub struct Loopback {
    pub guest: GuestDriver,
    pub host: HostDevice,
    pub guest_framework: Arc<MemoryFramework>,
    pub host_framework: Arc<MemoryFramework>,
    pub guest_registry: Arc<ProbeRegistry>,
    pub host_registry: Arc<ProbeRegistry>,
}

impl Loopback {
    /// Bring up a host device and a guest driver connected to each other.
    /// The ring size is the device's; the guest's setting is ignored.
    pub fn connect(guest_cfg: &EndpointConfig, host_cfg: &EndpointConfig) -> Result<Self> {
        if guest_cfg.ring_size != host_cfg.ring_size {
            warn!(
                "Guest ring size {} ignored, device uses {}",
                guest_cfg.ring_size, host_cfg.ring_size
            );
        }
        host_cfg.validate()?;

        let offered = HostDevice::offered(host_cfg);
        let acked = Features::negotiate(offered, guest_cfg.features());
        let (gq, hq) = link(host_cfg.ring_size + 1);

        let host_framework = Arc::new(MemoryFramework::new());
        let host_registry = Arc::new(ProbeRegistry::with_capacity(host_cfg.max_instances));
        let host = HostDevice::attach(
            host_cfg,
            acked,
            hq,
            host_framework.clone(),
            host_registry.clone(),
        )?;

        let guest_framework = Arc::new(MemoryFramework::new());
        let guest_registry = Arc::new(ProbeRegistry::with_capacity(guest_cfg.max_instances));
        let guest = GuestDriver::attach(
            guest_cfg,
            offered,
            gq,
            guest_framework.clone(),
            guest_registry.clone(),
        )?;

        Ok(Loopback {
            guest,
            host,
            guest_framework,
            host_framework,
            guest_registry,
            host_registry,
        })
    }

    /// Detach both sides and collect what they had at the end of the session.
    pub fn finish(self) -> SessionReport {
        let guest_features = self.guest.endpoint().features().to_string();
        let host_features = self.host.endpoint().features().to_string();
        let guest_registry = self.guest_registry.snapshot();
        let host_registry = self.host_registry.snapshot();
        let guest_framework = self.guest_framework.snapshot();
        let host_framework = self.host_framework.snapshot();

        let guest_stats = self.guest.detach();
        let host_stats = self.host.detach();

        SessionReport {
            guest: SideReport {
                features: guest_features,
                framework: guest_framework,
                registry: guest_registry,
                stats: guest_stats,
            },
            host: SideReport {
                features: host_features,
                framework: host_framework,
                registry: host_registry,
                stats: host_stats,
            },
        }
    }
}
