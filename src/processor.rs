//! Inbound event processing.
//!
//! [`EventProcessor`] applies one decoded control message to the local
//! state: the provider table, the probe registry and the tracing framework.
//! Dispatch is a single match on the message. Locks on the provider table
//! and registry are only ever taken around bookkeeping, never across a call
//! into the framework.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::features::Features;
use crate::framework::TracingFramework;
use crate::registry::ProbeRegistry;
use crate::wire::{
    BoundedName, ControlEvent, ControlMessage, Nack, ProbeCreate, ProbeDesc, ProbeId,
    ProviderEvent, ProviderId, BAD_PROBE_ID, PROBE_NARGS,
};

/// What the receive path should do after a message was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The peer is ready to receive.
    PeerReady,
    /// End of the current receive batch.
    EndOfBatch,
    /// State was updated.
    Applied,
    /// DESTROY removed these providers; the peer must forget them too.
    Destroyed(Vec<ProviderEvent>),
    /// The peer rejected one of our messages.
    Nacked(Nack),
}

pub struct EventProcessor {
    /// Registry partition this endpoint serves.
    instance: String,
    features: Features,
    framework: Arc<dyn TracingFramework>,
    registry: Arc<ProbeRegistry>,
    providers: Mutex<BTreeMap<ProviderId, ProviderEvent>>,
}

impl EventProcessor {
    pub fn new(
        instance: &str,
        features: Features,
        framework: Arc<dyn TracingFramework>,
        registry: Arc<ProbeRegistry>,
    ) -> Self {
        Self {
            instance: instance.to_string(),
            features,
            framework,
            registry,
            providers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn registry(&self) -> &Arc<ProbeRegistry> {
        &self.registry
    }

    /// Apply one inbound message. `in_session` is false until the peer's
    /// first READY; application messages before that are rejected.
    pub fn process(
        &self,
        msg: &ControlMessage,
        in_session: bool,
    ) -> Result<Disposition, ProcessError> {
        let event = msg.event();
        if !in_session && msg.needs_ack() {
            return Err(ProcessError::NotReady(event));
        }

        match msg {
            ControlMessage::DeviceReady => Ok(Disposition::PeerReady),
            ControlMessage::Eof => Ok(Disposition::EndOfBatch),
            ControlMessage::Nack(nack) => {
                self.require(event, Features::NACK, "NACK")?;
                warn!(
                    "Peer rejected {} (probe {}, provider {}): errno {}",
                    nack.failed, nack.probe_id, nack.uuid, nack.status
                );
                Ok(Disposition::Nacked(nack.clone()))
            }
            ControlMessage::Register(pv) => {
                self.require(event, Features::PROV, "PROV")?;
                self.register(pv)?;
                Ok(Disposition::Applied)
            }
            ControlMessage::Unregister(pv) => {
                self.require(event, Features::PROV, "PROV")?;
                self.unregister(pv.uuid)?;
                Ok(Disposition::Applied)
            }
            ControlMessage::Destroy { instance } => {
                self.require(event, Features::PROV, "PROV")?;
                Ok(Disposition::Destroyed(self.destroy(instance)))
            }
            ControlMessage::ProbeCreate(create) => {
                self.require(event, Features::PROBE, "PROBE")?;
                self.create_from_peer(create)?;
                Ok(Disposition::Applied)
            }
            ControlMessage::ProbeInstall { probe_id } => {
                self.require(event, Features::PROBE, "PROBE")?;
                self.registry.install(&self.instance, *probe_id)?;
                debug!("Installed probe {}:{}", self.instance, probe_id);
                Ok(Disposition::Applied)
            }
            ControlMessage::ProbeUninstall { probe_id } => {
                self.require(event, Features::PROBE, "PROBE")?;
                if !self.registry.uninstall(&self.instance, *probe_id) {
                    debug!(
                        "Uninstall of unknown probe {}:{} ignored",
                        self.instance, probe_id
                    );
                }
                Ok(Disposition::Applied)
            }
        }
    }

    fn require(
        &self,
        event: ControlEvent,
        feature: Features,
        name: &'static str,
    ) -> Result<(), ProcessError> {
        if self.features.contains(feature) {
            Ok(())
        } else {
            Err(ProcessError::FeatureDisabled {
                event,
                feature: name,
            })
        }
    }

    /// Register a provider with the framework and remember it.
    pub fn register(&self, pv: &ProviderEvent) -> Result<(), ProcessError> {
        if self.providers.lock().unwrap().contains_key(&pv.uuid) {
            return Err(ProcessError::DuplicateProvider(pv.uuid));
        }

        let got = self.framework.register_provider(pv)?;
        if got != pv.uuid {
            if let Err(e) = self.framework.unregister_provider(got) {
                warn!("Failed to roll back provider {}: {}", got, e);
            }
            return Err(ProcessError::ProviderMismatch { want: pv.uuid, got });
        }

        self.providers.lock().unwrap().insert(pv.uuid, pv.clone());
        info!(
            "Registered provider {} ({}) for {}",
            pv.name, pv.uuid, pv.instance
        );
        Ok(())
    }

    /// Unregister a provider and forget the probes created under it.
    pub fn unregister(&self, uuid: ProviderId) -> Result<ProviderEvent, ProcessError> {
        let Some(pv) = self.providers.lock().unwrap().get(&uuid).cloned() else {
            return Err(ProcessError::UnknownProvider(uuid));
        };

        self.framework.unregister_provider(uuid)?;
        self.providers.lock().unwrap().remove(&uuid);
        let purged = self.registry.purge_provider(&self.instance, uuid);
        info!(
            "Unregistered provider {} ({}), {} probes dropped",
            pv.name, uuid, purged
        );
        Ok(pv)
    }

    /// Tear down every provider owned by `instance` and its probe records,
    /// returning the providers that went. The instance itself stays attached.
    pub fn destroy(&self, instance: &BoundedName) -> Vec<ProviderEvent> {
        let owned: Vec<ProviderId> = self
            .providers
            .lock()
            .unwrap()
            .values()
            .filter(|pv| pv.instance == *instance)
            .map(|pv| pv.uuid)
            .collect();

        let mut removed = Vec::new();
        for uuid in owned {
            match self.unregister(uuid) {
                Ok(pv) => removed.push(pv),
                Err(e) => warn!("Destroy of {}: provider {}: {}", instance, uuid, e),
            }
        }
        let purged = self.registry.purge(instance.as_str());
        info!(
            "Destroyed {}: {} providers, {} probes",
            instance,
            removed.len(),
            purged
        );
        removed
    }

    fn create_from_peer(&self, create: &ProbeCreate) -> Result<(), ProcessError> {
        let provider = create.desc.provider;
        let local_id = self.create(&create.desc)?;
        self.registry
            .alias(&self.instance, create.probe_id, local_id, provider)?;
        debug!(
            "Created probe {} as {} (peer id {})",
            create.desc, local_id, create.probe_id
        );
        Ok(())
    }

    /// Create a probe under a known provider; returns the framework's id.
    pub fn create(&self, desc: &ProbeDesc) -> Result<ProbeId, ProcessError> {
        if !self.providers.lock().unwrap().contains_key(&desc.provider) {
            return Err(ProcessError::UnknownProvider(desc.provider));
        }
        Ok(self.framework.create_probe(desc)?)
    }

    /// Data-plane firing. Commits only when `id` is installed and enabled.
    pub fn fire(&self, id: ProbeId, args: [u64; PROBE_NARGS]) -> bool {
        let Some(local) = self.registry.arm(&self.instance, id, args) else {
            return false;
        };
        self.framework.commit(&self.instance, local, args);
        true
    }

    pub fn arg_value(&self, id: ProbeId, index: usize) -> u64 {
        self.registry.arg_value(&self.instance, id, index)
    }

    /// The NACK to send for a failed message, if NACKs are negotiated.
    pub fn nack_for(&self, msg: &ControlMessage, err: &ProcessError) -> Option<ControlMessage> {
        if !self.features.contains(Features::NACK) || !msg.needs_ack() {
            return None;
        }
        if matches!(msg, ControlMessage::Nack(_)) {
            return None;
        }
        Some(ControlMessage::Nack(Nack {
            failed: msg.event(),
            probe_id: msg.probe_id().unwrap_or(BAD_PROBE_ID),
            uuid: msg.provider_id().unwrap_or(ProviderId::NIL),
            status: err.errno(),
        }))
    }

    pub fn has_provider(&self, uuid: ProviderId) -> bool {
        self.providers.lock().unwrap().contains_key(&uuid)
    }

    pub fn providers(&self) -> Vec<ProviderEvent> {
        self.providers.lock().unwrap().values().cloned().collect()
    }

    /// Unregister every provider still held. Returns how many went.
    pub fn cleanup(&self) -> usize {
        let all: Vec<ProviderId> = self.providers.lock().unwrap().keys().copied().collect();
        let mut n = 0;
        for uuid in all {
            match self.unregister(uuid) {
                Ok(_) => n += 1,
                Err(e) => warn!("Cleanup of provider {}: {}", uuid, e),
            }
        }
        n
    }
}
