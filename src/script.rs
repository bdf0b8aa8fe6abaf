//! Scripted loopback sessions.
//!
//! A script is a JSON file holding a guest config, a host config and a list
//! of steps to run against a [`Loopback`]:
//!
//! ```json
//! { "guest": { "instance": "vm0" }, "host": { "instance": "vm0" },
//!   "steps": [
//!     { "host_register": { "provider": "syscall" } },
//!     { "host_create": { "probe": "syscall:vmm:run:entry" } },
//!     { "settle": { "ms": 50 } }
//!   ] }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::session::Loopback;
use crate::wire::{ProbeId, ProviderId, PROBE_NARGS};

/// `provider:module:function:name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub provider: String,
    pub module: String,
    pub function: String,
    pub name: String,
}

impl ProbeSpec {
    fn from_parts(parts: Vec<&str>) -> Result<Self> {
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(anyhow!(
                "Invalid probe format: {} (want provider:module:function:name)",
                parts.join(":")
            ));
        }
        Ok(ProbeSpec {
            provider: parts[0].to_string(),
            module: parts[1].to_string(),
            function: parts[2].to_string(),
            name: parts[3].to_string(),
        })
    }
}

impl FromStr for ProbeSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ProbeSpec::from_parts(s.split(':').collect())
    }
}

impl fmt::Display for ProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.provider, self.module, self.function, self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    HostRegister {
        provider: String,
    },
    HostUnregister {
        provider: String,
    },
    HostCreate {
        probe: String,
    },
    HostInstall {
        probe_id: ProbeId,
    },
    HostUninstall {
        probe_id: ProbeId,
    },
    GuestInstall {
        probe_id: ProbeId,
    },
    GuestUninstall {
        probe_id: ProbeId,
    },
    GuestFire {
        probe_id: ProbeId,
        #[serde(default)]
        args: Vec<u64>,
    },
    GuestDestroy,
    /// Wait for both sides to go idle, then sleep `ms`.
    Settle {
        ms: u64,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionScript {
    pub guest: EndpointConfig,
    pub host: EndpointConfig,
    pub steps: Vec<Step>,
}

impl SessionScript {
    pub fn from_json(buf: &str) -> Result<Self> {
        Ok(serde_json::from_str(buf)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        Self::from_json(&buf).with_context(|| format!("failed to parse script {}", path.display()))
    }

    /// A small script exercising the whole protocol.
    pub fn example() -> Self {
        SessionScript {
            guest: EndpointConfig::with_instance("vm0"),
            host: EndpointConfig::with_instance("vm0"),
            steps: vec![
                Step::HostRegister {
                    provider: "syscall".into(),
                },
                Step::HostCreate {
                    probe: "syscall:vmm:run:entry".into(),
                },
                Step::Settle { ms: 20 },
                Step::HostInstall { probe_id: 1 },
                Step::GuestInstall { probe_id: 42 },
                Step::Settle { ms: 20 },
                Step::GuestFire {
                    probe_id: 1,
                    args: vec![1, 2, 3, 4, 5],
                },
                Step::Settle { ms: 20 },
            ],
        }
    }
}

/// One `guest_fire` step and whether it committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FireResult {
    pub probe_id: ProbeId,
    pub committed: bool,
}

/// Runs script steps, remembering the providers it registered by name.
pub struct ScriptRunner<'a> {
    session: &'a Loopback,
    providers: HashMap<String, ProviderId>,
    fired: Vec<FireResult>,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(session: &'a Loopback) -> Self {
        ScriptRunner {
            session,
            providers: HashMap::new(),
            fired: Vec::new(),
        }
    }

    pub fn run(&mut self, steps: &[Step]) -> Result<()> {
        for (i, step) in steps.iter().enumerate() {
            self.step(step)
                .with_context(|| format!("step {} ({:?}) failed", i + 1, step))?;
        }
        Ok(())
    }

    pub fn fired(&self) -> &[FireResult] {
        &self.fired
    }

    pub fn into_fired(self) -> Vec<FireResult> {
        self.fired
    }

    fn provider(&self, name: &str) -> Result<ProviderId> {
        self.providers
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("provider {} was not registered by this script", name))
    }

    fn step(&mut self, step: &Step) -> Result<()> {
        debug!("Running {:?}", step);
        let host = &self.session.host;
        let guest = &self.session.guest;
        match step {
            Step::HostRegister { provider } => {
                if self.providers.contains_key(provider) {
                    bail!("provider {} already registered", provider);
                }
                let uuid = host.register_provider(provider)?;
                info!("Registered provider {} as {}", provider, uuid);
                self.providers.insert(provider.clone(), uuid);
            }
            Step::HostUnregister { provider } => {
                let uuid = self.provider(provider)?;
                host.unregister_provider(uuid)?;
                self.providers.remove(provider);
            }
            Step::HostCreate { probe } => {
                let spec: ProbeSpec = probe.parse()?;
                let uuid = self.provider(&spec.provider)?;
                let id = host.create_probe(uuid, &spec.module, &spec.function, &spec.name)?;
                info!("Created probe {} as id {}", spec, id);
            }
            Step::HostInstall { probe_id } => {
                host.install_probe(*probe_id)?;
            }
            Step::HostUninstall { probe_id } => {
                host.uninstall_probe(*probe_id)?;
            }
            Step::GuestInstall { probe_id } => guest.install_probe(*probe_id)?,
            Step::GuestUninstall { probe_id } => guest.uninstall_probe(*probe_id)?,
            Step::GuestFire { probe_id, args } => {
                if args.len() > PROBE_NARGS {
                    bail!("at most {} probe arguments, got {}", PROBE_NARGS, args.len());
                }
                let mut padded = [0u64; PROBE_NARGS];
                padded[..args.len()].copy_from_slice(args);
                let committed = guest.fire(*probe_id, padded);
                info!("Fired probe {}: committed {}", probe_id, committed);
                self.fired.push(FireResult {
                    probe_id: *probe_id,
                    committed,
                });
            }
            Step::GuestDestroy => guest.destroy()?,
            Step::Settle { ms } => {
                let wait = Duration::from_millis(*ms);
                guest.endpoint().wait_idle(wait);
                host.endpoint().wait_idle(wait);
                thread::sleep(wait);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_spec_parse() {
        let spec: ProbeSpec = "syscall:vmm:run:entry".parse().unwrap();
        assert_eq!(spec.provider, "syscall");
        assert_eq!(spec.module, "vmm");
        assert_eq!(spec.function, "run");
        assert_eq!(spec.name, "entry");
        assert_eq!(spec.to_string(), "syscall:vmm:run:entry");

        assert!("syscall:vmm:run".parse::<ProbeSpec>().is_err());
        assert!("syscall::run:entry".parse::<ProbeSpec>().is_err());
    }

    #[test]
    fn test_script_json() {
        let script = SessionScript::from_json(
            r#"{
                "guest": { "instance": "vm3" },
                "steps": [
                    { "host_register": { "provider": "io" } },
                    { "guest_fire": { "probe_id": 2 } },
                    "guest_destroy",
                    { "settle": { "ms": 5 } }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(script.guest.instance, "vm3");
        assert_eq!(script.host.instance, "vm0");
        assert_eq!(script.steps.len(), 4);
        assert_eq!(
            script.steps[1],
            Step::GuestFire {
                probe_id: 2,
                args: vec![]
            }
        );
        assert_eq!(script.steps[2], Step::GuestDestroy);
    }

    #[test]
    fn test_example_round_trips_through_json() {
        let text = serde_json::to_string_pretty(&SessionScript::example()).unwrap();
        let back = SessionScript::from_json(&text).unwrap();
        assert_eq!(back.steps, SessionScript::example().steps);
    }
}
