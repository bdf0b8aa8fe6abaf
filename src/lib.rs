//! vtdtr - virtio control-queue bridge for cross-VM dynamic tracing.
//!
//! A guest driver and a host device exchange fixed-size control messages
//! over a pair of descriptor rings so that a tracer on the host can create,
//! install and uninstall probes inside a guest, and the guest can report
//! probe state back.
//!
//! # Modules
//!
//! - [`wire`] - Control message types and their little-endian wire layout
//! - [`ctrlq`] - Outbound control queue with a priority lane
//! - [`virtqueue`] / [`transport`] - Descriptor rings and their lifecycle
//! - [`registry`] - Per-instance probe registry consulted when probes fire
//! - [`processor`] - Inbound event handling
//! - [`worker`] - The communicator thread owning the transmit ring
//! - [`endpoint`], [`guest`], [`host`] - The two sides of a session
//! - [`session`], [`script`] - Loopback sessions driven from JSON scripts
//!
//! # Example
//!
//! ```no_run
//! use vtdtr::{EndpointConfig, Loopback};
//!
//! let cfg = EndpointConfig::with_instance("vm0");
//! let session = Loopback::connect(&cfg, &cfg).unwrap();
//! session.guest.install_probe(42).unwrap();
//! let report = session.finish();
//! println!("{}", serde_json::to_string_pretty(&report).unwrap());
//! ```

pub mod config;
pub mod ctrlq;
pub mod endpoint;
pub mod error;
pub mod features;
pub mod framework;
pub mod guest;
pub mod host;
pub mod processor;
pub mod registry;
pub mod script;
pub mod session;
pub mod transport;
pub mod virtqueue;
pub mod wire;
pub mod worker;

// Re-export for convenience
pub use config::EndpointConfig;
pub use endpoint::{Endpoint, Role, StatsSnapshot};
pub use features::Features;
pub use framework::{MemoryFramework, TracingFramework};
pub use guest::GuestDriver;
pub use host::{HostDevice, ProbeChange, ProbeNotification, ProbeNotifier};
pub use registry::ProbeRegistry;
pub use script::{ScriptRunner, SessionScript, Step};
pub use session::{Loopback, SessionReport};
pub use wire::{ControlEvent, ControlMessage, ProbeId, ProviderId};
