//! Per-instance probe registry.
//!
//! The registry answers the one question the firing path asks: is probe
//! `id` of guest `instance` installed and enabled, and if so, under which
//! local id should the event be committed? Instances live in a [`DashMap`]
//! sized at construction; each instance holds an ordered map from probe id
//! to [`ProbeRecord`], so a firing costs one hashed lookup plus one tree
//! lookup.
//!
//! Alongside the installed records each instance keeps the aliases learned
//! from PROBE_CREATE: the creator's probe id on the wire mapped to the id
//! the local tracing framework handed out, and the provider the probe
//! belongs to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::RegistryError;
use crate::wire::{ProbeId, ProviderId, PROBE_NARGS};

/// Default instance pool size.
pub const DEFAULT_MAX_INSTANCES: usize = 4096;

/// An installed probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeRecord {
    pub id: ProbeId,
    pub enabled: bool,
    /// Last argument values seen for this probe.
    pub args: [u64; PROBE_NARGS],
}

impl ProbeRecord {
    fn new(id: ProbeId) -> Self {
        ProbeRecord {
            id,
            enabled: true,
            args: [0; PROBE_NARGS],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeAlias {
    pub local_id: ProbeId,
    pub provider: ProviderId,
}

#[derive(Debug, Default)]
struct InstanceProbes {
    probes: BTreeMap<ProbeId, ProbeRecord>,
    aliases: BTreeMap<ProbeId, ProbeAlias>,
}

/// Point-in-time copy of one instance, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance: String,
    pub probes: Vec<ProbeRecord>,
    pub aliases: BTreeMap<ProbeId, ProbeAlias>,
}

#[derive(Debug)]
pub struct ProbeRegistry {
    instances: DashMap<String, InstanceProbes>,
    // Pool slots claimed by attached instances.
    attached: AtomicUsize,
    max_instances: usize,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_INSTANCES)
    }
}

impl ProbeRegistry {
    pub fn with_capacity(max_instances: usize) -> Self {
        Self {
            instances: DashMap::with_capacity(max_instances),
            attached: AtomicUsize::new(0),
            max_instances,
        }
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    /// Create the sub-registry for `instance`.
    pub fn attach_instance(&self, instance: &str) -> Result<(), RegistryError> {
        let Entry::Vacant(slot) = self.instances.entry(instance.to_string()) else {
            return Err(RegistryError::AlreadyAttached(instance.to_string()));
        };
        // The shard stays locked until insert, so a pool slot is claimed at
        // most once per name.
        let max = self.max_instances;
        if self
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(RegistryError::PoolExhausted(max));
        }
        slot.insert(InstanceProbes::default());
        debug!("Attached instance {} to probe registry", instance);
        Ok(())
    }

    /// Destroy the sub-registry for `instance`, returning how many probe
    /// records it still held.
    pub fn detach_instance(&self, instance: &str) -> Option<usize> {
        let (_, probes) = self.instances.remove(instance)?;
        self.attached.fetch_sub(1, Ordering::AcqRel);
        debug!(
            "Detached instance {} ({} probes purged)",
            instance,
            probes.probes.len()
        );
        Some(probes.probes.len())
    }

    pub fn is_attached(&self, instance: &str) -> bool {
        self.instances.contains_key(instance)
    }

    /// Install (or re-enable) probe `id`. Returns true if a new record was
    /// created; a repeated install leaves exactly one record.
    pub fn install(&self, instance: &str, id: ProbeId) -> Result<bool, RegistryError> {
        let mut inst = self
            .instances
            .get_mut(instance)
            .ok_or_else(|| RegistryError::UnknownInstance(instance.to_string()))?;
        let mut created = false;
        inst.probes
            .entry(id)
            .and_modify(|rec| rec.enabled = true)
            .or_insert_with(|| {
                created = true;
                ProbeRecord::new(id)
            });
        trace!("Install {}:{} (new: {})", instance, id, created);
        Ok(created)
    }

    /// Remove probe `id`. Unknown instances and ids are a no-op.
    pub fn uninstall(&self, instance: &str, id: ProbeId) -> bool {
        let Some(mut inst) = self.instances.get_mut(instance) else {
            return false;
        };
        inst.probes.remove(&id).is_some()
    }

    pub fn is_enabled(&self, instance: &str, id: ProbeId) -> bool {
        self.instances
            .get(instance)
            .and_then(|inst| inst.probes.get(&id).map(|rec| rec.enabled))
            .unwrap_or(false)
    }

    /// Toggle an installed probe without removing it. False if not installed.
    pub fn set_enabled(&self, instance: &str, id: ProbeId, enabled: bool) -> bool {
        let Some(mut inst) = self.instances.get_mut(instance) else {
            return false;
        };
        match inst.probes.get_mut(&id) {
            Some(rec) => {
                rec.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_args(&self, instance: &str, id: ProbeId, args: [u64; PROBE_NARGS]) -> bool {
        let Some(mut inst) = self.instances.get_mut(instance) else {
            return false;
        };
        match inst.probes.get_mut(&id) {
            Some(rec) => {
                rec.args = args;
                true
            }
            None => false,
        }
    }

    /// Cached argument `index` of probe `id`; 0 for anything unknown.
    pub fn arg_value(&self, instance: &str, id: ProbeId, index: usize) -> u64 {
        self.instances
            .get(instance)
            .and_then(|inst| {
                inst.probes
                    .get(&id)
                    .and_then(|rec| rec.args.get(index).copied())
            })
            .unwrap_or(0)
    }

    /// Firing-path lookup. If `id` is installed and enabled, caches `args`
    /// and returns the id to commit under (the local alias when one exists).
    pub fn arm(&self, instance: &str, id: ProbeId, args: [u64; PROBE_NARGS]) -> Option<ProbeId> {
        let mut inst = self.instances.get_mut(instance)?;
        let inst = &mut *inst;
        let rec = inst.probes.get_mut(&id).filter(|rec| rec.enabled)?;
        rec.args = args;
        Some(inst.aliases.get(&id).map_or(id, |alias| alias.local_id))
    }

    /// Record that wire probe `wire_id` maps to the framework's `local_id`.
    pub fn alias(
        &self,
        instance: &str,
        wire_id: ProbeId,
        local_id: ProbeId,
        provider: ProviderId,
    ) -> Result<(), RegistryError> {
        let mut inst = self
            .instances
            .get_mut(instance)
            .ok_or_else(|| RegistryError::UnknownInstance(instance.to_string()))?;
        inst.aliases
            .insert(wire_id, ProbeAlias { local_id, provider });
        Ok(())
    }

    pub fn local_id(&self, instance: &str, wire_id: ProbeId) -> Option<ProbeId> {
        self.instances
            .get(instance)
            .and_then(|inst| inst.aliases.get(&wire_id).map(|alias| alias.local_id))
    }

    /// Drop every alias and record belonging to `provider`. Returns how many
    /// probes were affected.
    pub fn purge_provider(&self, instance: &str, provider: ProviderId) -> usize {
        let Some(mut inst) = self.instances.get_mut(instance) else {
            return 0;
        };
        let inst = &mut *inst;
        let doomed: Vec<ProbeId> = inst
            .aliases
            .iter()
            .filter(|(_, alias)| alias.provider == provider)
            .map(|(&id, _)| id)
            .collect();
        for id in &doomed {
            inst.aliases.remove(id);
            inst.probes.remove(id);
        }
        doomed.len()
    }

    /// Drop all records and aliases of `instance` but keep it attached.
    pub fn purge(&self, instance: &str) -> usize {
        let Some(mut inst) = self.instances.get_mut(instance) else {
            return 0;
        };
        let n = inst.probes.len();
        inst.probes.clear();
        inst.aliases.clear();
        n
    }

    pub fn probe(&self, instance: &str, id: ProbeId) -> Option<ProbeRecord> {
        self.instances
            .get(instance)
            .and_then(|inst| inst.probes.get(&id).cloned())
    }

    pub fn probe_count(&self, instance: &str) -> usize {
        self.instances
            .get(instance)
            .map_or(0, |inst| inst.probes.len())
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let mut out: Vec<InstanceSnapshot> = self
            .instances
            .iter()
            .map(|entry| InstanceSnapshot {
                instance: entry.key().clone(),
                probes: entry.probes.values().cloned().collect(),
                aliases: entry.aliases.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.instance.cmp(&b.instance));
        out
    }
}
