//! Error types shared across the control-queue bridge.
//!
//! Each layer has its own enum so callers can tell a malformed message apart
//! from a full ring or a collaborator refusing a request. Entry points that
//! stitch several layers together (attach, the CLI) wrap these in
//! `anyhow::Error` with context.

use thiserror::Error;

use crate::wire::{ControlEvent, ProviderId};

/// errno-style codes carried in NACK replies.
pub mod errno {
    pub const ENOENT: u32 = 2;
    pub const ESRCH: u32 = 3;
    pub const ENOMEM: u32 = 12;
    pub const EEXIST: u32 = 17;
    pub const EINVAL: u32 = 22;
    pub const ENOSPC: u32 = 28;
    pub const EPROTO: u32 = 71;
    pub const EOPNOTSUPP: u32 = 95;
}

/// Failures decoding or building a control message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("control message too short: got {got} bytes, need {need}")]
    ShortBuffer { got: usize, need: usize },

    #[error("unknown control event {0:#x}")]
    UnknownEvent(u32),

    #[error("string field '{field}' is not NUL terminated")]
    Unterminated { field: &'static str },

    #[error("string field '{field}' is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("name '{name}' is {len} bytes, limit is {max}")]
    NameTooLong { name: String, len: usize, max: usize },

    #[error("name contains an interior NUL byte")]
    InteriorNul,

    #[error("{event} message carries data in unused bytes")]
    StrayBytes { event: ControlEvent },
}

/// Failures of the outbound control queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("control queue full ({capacity} entries)")]
    Full { capacity: usize },

    #[error("endpoint is shutting down")]
    Shutdown,
}

/// Failures of the descriptor-ring wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("descriptor ring full ({slots} slots)")]
    RingFull { slots: usize },

    #[error("could not allocate a single receive descriptor")]
    NoDescriptors,

    #[error("{0} descriptor submitted to the wrong ring")]
    WrongDirection(&'static str),

    #[error("descriptor buffer is {got} bytes, expected {need}")]
    BadLength { got: usize, need: usize },
}

/// Failures of the probe registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("instance '{0}' is not attached to the probe registry")]
    UnknownInstance(String),

    #[error("probe registry is full ({0} instances)")]
    PoolExhausted(usize),

    #[error("instance '{0}' is already attached")]
    AlreadyAttached(String),
}

/// Failures reported by the tracing framework collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameworkError {
    #[error("provider {0} is not registered")]
    UnknownProvider(ProviderId),

    #[error("provider {0} is already registered")]
    DuplicateProvider(ProviderId),

    #[error("probe {module}:{function}:{name} already exists")]
    DuplicateProbe {
        module: String,
        function: String,
        name: String,
    },

    #[error("tracing framework refused the request (errno {0})")]
    Refused(u32),
}

impl FrameworkError {
    pub fn errno(&self) -> u32 {
        match self {
            FrameworkError::UnknownProvider(_) => errno::ESRCH,
            FrameworkError::DuplicateProvider(_) => errno::EEXIST,
            FrameworkError::DuplicateProbe { .. } => errno::EEXIST,
            FrameworkError::Refused(code) => *code,
        }
    }
}

/// Failures while processing one inbound control message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("{0} received before the session handshake")]
    NotReady(ControlEvent),

    #[error("{event} requires feature {feature}, which was not negotiated")]
    FeatureDisabled {
        event: ControlEvent,
        feature: &'static str,
    },

    #[error("provider {0} is not known to this endpoint")]
    UnknownProvider(ProviderId),

    #[error("provider {0} is already registered on this endpoint")]
    DuplicateProvider(ProviderId),

    #[error("tracing framework returned provider {got} for {want}")]
    ProviderMismatch { want: ProviderId, got: ProviderId },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Framework(#[from] FrameworkError),
}

impl ProcessError {
    /// Code sent back to the peer in a NACK.
    pub fn errno(&self) -> u32 {
        match self {
            ProcessError::NotReady(_) => errno::EPROTO,
            ProcessError::FeatureDisabled { .. } => errno::EOPNOTSUPP,
            ProcessError::UnknownProvider(_) => errno::ESRCH,
            ProcessError::DuplicateProvider(_) => errno::EEXIST,
            ProcessError::ProviderMismatch { .. } => errno::EINVAL,
            ProcessError::Registry(RegistryError::UnknownInstance(_)) => errno::ENOENT,
            ProcessError::Registry(RegistryError::PoolExhausted(_)) => errno::ENOSPC,
            ProcessError::Registry(RegistryError::AlreadyAttached(_)) => errno::EEXIST,
            ProcessError::Framework(e) => e.errno(),
        }
    }
}

/// Fatal failures while bringing an endpoint up.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("cannot allocate receive descriptors")]
    Populate(#[source] TransportError),

    #[error("cannot attach instance to the probe registry")]
    Registry(#[source] RegistryError),

    #[error("cannot spawn communicator thread")]
    Spawn(#[source] std::io::Error),

    #[error("invalid endpoint configuration: {0}")]
    Config(String),
}
