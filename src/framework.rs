//! The tracing framework the bridge feeds.
//!
//! The bridge never owns provider or probe internals; it calls out through
//! [`TracingFramework`], handed to each endpoint at construction.
//! [`MemoryFramework`] keeps everything in memory and is what the CLI and
//! the tests run against.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::FrameworkError;
use crate::wire::{ProbeDesc, ProbeId, ProviderEvent, ProviderId, PROBE_NARGS};

/// Operations the bridge needs from a tracing framework.
///
/// Implementations may block or call back into the bridge; endpoints never
/// hold an internal lock across these calls.
pub trait TracingFramework: Send + Sync {
    /// Register `provider` under the handle it carries. Returns the handle
    /// the framework bound it to, which must match.
    fn register_provider(&self, provider: &ProviderEvent) -> Result<ProviderId, FrameworkError>;

    fn unregister_provider(&self, id: ProviderId) -> Result<(), FrameworkError>;

    /// Create a probe and return the framework's id for it.
    fn create_probe(&self, desc: &ProbeDesc) -> Result<ProbeId, FrameworkError>;

    /// Fire probe `id` on behalf of `instance`.
    fn commit(&self, instance: &str, id: ProbeId, args: [u64; PROBE_NARGS]);

    /// Argument `index` of the most recent firing of `id`; 0 if unknown.
    fn probe_argument_value(&self, instance: &str, id: ProbeId, index: usize) -> u64;
}

/// One committed probe firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub instance: String,
    pub probe_id: ProbeId,
    pub args: [u64; PROBE_NARGS],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedProbe {
    pub id: ProbeId,
    #[serde(flatten)]
    pub desc: ProbeDesc,
}

/// Everything a [`MemoryFramework`] has seen, for reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameworkSnapshot {
    pub providers: Vec<ProviderEvent>,
    pub probes: Vec<CreatedProbe>,
    pub commits: Vec<Commit>,
}

#[derive(Debug, Default)]
struct MemoryState {
    providers: BTreeMap<ProviderId, ProviderEvent>,
    probes: BTreeMap<ProbeId, ProbeDesc>,
    next_probe: ProbeId,
    commits: Vec<Commit>,
    refuse: Option<u32>,
}

/// In-memory tracing framework.
#[derive(Debug, Default)]
pub struct MemoryFramework {
    state: Mutex<MemoryState>,
}

impl MemoryFramework {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent register/create fail with `errno`, or stop
    /// doing so with `None`.
    pub fn set_refusal(&self, errno: Option<u32>) {
        self.state.lock().unwrap().refuse = errno;
    }

    pub fn has_provider(&self, id: ProviderId) -> bool {
        self.state.lock().unwrap().providers.contains_key(&id)
    }

    pub fn provider_count(&self) -> usize {
        self.state.lock().unwrap().providers.len()
    }

    pub fn probe(&self, id: ProbeId) -> Option<ProbeDesc> {
        self.state.lock().unwrap().probes.get(&id).cloned()
    }

    /// Find a probe by its `module:function:name` triple.
    pub fn find_probe(&self, module: &str, function: &str, name: &str) -> Option<ProbeId> {
        let state = self.state.lock().unwrap();
        state
            .probes
            .iter()
            .find(|(_, d)| {
                d.module.as_str() == module
                    && d.function.as_str() == function
                    && d.name.as_str() == name
            })
            .map(|(&id, _)| id)
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn snapshot(&self) -> FrameworkSnapshot {
        let state = self.state.lock().unwrap();
        FrameworkSnapshot {
            providers: state.providers.values().cloned().collect(),
            probes: state
                .probes
                .iter()
                .map(|(&id, desc)| CreatedProbe {
                    id,
                    desc: desc.clone(),
                })
                .collect(),
            commits: state.commits.clone(),
        }
    }
}

impl TracingFramework for MemoryFramework {
    fn register_provider(&self, provider: &ProviderEvent) -> Result<ProviderId, FrameworkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.refuse {
            return Err(FrameworkError::Refused(errno));
        }
        if state.providers.contains_key(&provider.uuid) {
            return Err(FrameworkError::DuplicateProvider(provider.uuid));
        }
        state.providers.insert(provider.uuid, provider.clone());
        Ok(provider.uuid)
    }

    fn unregister_provider(&self, id: ProviderId) -> Result<(), FrameworkError> {
        let mut state = self.state.lock().unwrap();
        if state.providers.remove(&id).is_none() {
            return Err(FrameworkError::UnknownProvider(id));
        }
        state.probes.retain(|_, desc| desc.provider != id);
        Ok(())
    }

    fn create_probe(&self, desc: &ProbeDesc) -> Result<ProbeId, FrameworkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.refuse {
            return Err(FrameworkError::Refused(errno));
        }
        if !state.providers.contains_key(&desc.provider) {
            return Err(FrameworkError::UnknownProvider(desc.provider));
        }
        if state.probes.values().any(|d| d == desc) {
            return Err(FrameworkError::DuplicateProbe {
                module: desc.module.to_string(),
                function: desc.function.to_string(),
                name: desc.name.to_string(),
            });
        }
        state.next_probe += 1;
        let id = state.next_probe;
        state.probes.insert(id, desc.clone());
        Ok(id)
    }

    fn commit(&self, instance: &str, id: ProbeId, args: [u64; PROBE_NARGS]) {
        self.state.lock().unwrap().commits.push(Commit {
            instance: instance.to_string(),
            probe_id: id,
            args,
        });
    }

    fn probe_argument_value(&self, instance: &str, id: ProbeId, index: usize) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .commits
            .iter()
            .rev()
            .find(|c| c.instance == instance && c.probe_id == id)
            .and_then(|c| c.args.get(index).copied())
            .unwrap_or(0)
    }
}
