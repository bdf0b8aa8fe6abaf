//! Control message wire format.
//!
//! Every message crossing the guest/host boundary is one fixed-size record,
//! [`CONTROL_MSG_SIZE`] bytes, with all integers little-endian so the two
//! sides never have to agree on byte order out of band:
//!
//! ```text
//! off  size  field
//! 0    4     event
//! 4    4     id       probe id (probe events, NACK)
//! 8    4     aux      NACK: event kind that failed
//! 12   4     status   NACK: errno-style code
//! 16   16    uuid     provider handle
//! 32   64    str0     provider name | probe module
//! 96   64    str1     instance name | probe function
//! 160  64    str2     probe name
//! ```
//!
//! Strings are NUL padded and hold at most [`MAX_NAME_LEN`] bytes.

use std::fmt;

use plain::Plain;
use rand::RngCore;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::WireError;

/// Size of one serialized control message.
pub const CONTROL_MSG_SIZE: usize = 224;

/// Width of a string slot on the wire, including the terminator.
pub const NAME_SLOT_LEN: usize = 64;

/// Longest string that fits in a slot.
pub const MAX_NAME_LEN: usize = NAME_SLOT_LEN - 1;

/// Number of word-sized arguments a probe firing carries.
pub const PROBE_NARGS: usize = 5;

/// Probe identifier. Scoped to the endpoint that created the probe.
pub type ProbeId = u32;

/// Probe id used when a message has no probe attached.
pub const BAD_PROBE_ID: ProbeId = !0;

/// Event kind tag of a control message.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlEvent {
    DeviceReady = 0x00,
    Register = 0x01,
    Unregister = 0x02,
    Destroy = 0x03,
    ProbeCreate = 0x04,
    ProbeInstall = 0x05,
    ProbeUninstall = 0x06,
    Eof = 0x07,
    Nack = 0x08,
}

impl ControlEvent {
    pub fn from_u32(code: u32) -> Result<Self, WireError> {
        let event = match code {
            0x00 => ControlEvent::DeviceReady,
            0x01 => ControlEvent::Register,
            0x02 => ControlEvent::Unregister,
            0x03 => ControlEvent::Destroy,
            0x04 => ControlEvent::ProbeCreate,
            0x05 => ControlEvent::ProbeInstall,
            0x06 => ControlEvent::ProbeUninstall,
            0x07 => ControlEvent::Eof,
            0x08 => ControlEvent::Nack,
            other => return Err(WireError::UnknownEvent(other)),
        };
        Ok(event)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            ControlEvent::DeviceReady => "DEVICE_READY",
            ControlEvent::Register => "REGISTER",
            ControlEvent::Unregister => "UNREGISTER",
            ControlEvent::Destroy => "DESTROY",
            ControlEvent::ProbeCreate => "PROBE_CREATE",
            ControlEvent::ProbeInstall => "PROBE_INSTALL",
            ControlEvent::ProbeUninstall => "PROBE_UNINSTALL",
            ControlEvent::Eof => "EOF",
            ControlEvent::Nack => "NACK",
        }
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 128-bit opaque provider handle shared by both endpoints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ProviderId([u8; 16]);

impl ProviderId {
    pub const NIL: ProviderId = ProviderId([0; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ProviderId(bytes)
    }

    /// Fresh random handle, version 4 / variant 1 like uuidgen produces.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        ProviderId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderId({self})")
    }
}

impl Serialize for ProviderId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A string that is guaranteed to fit in one wire slot.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoundedName(String);

impl BoundedName {
    pub fn new(name: impl Into<String>) -> Result<Self, WireError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(WireError::NameTooLong {
                len: name.len(),
                name,
                max: MAX_NAME_LEN,
            });
        }
        if name.as_bytes().contains(&0) {
            return Err(WireError::InteriorNul);
        }
        Ok(BoundedName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write_slot(&self, slot: &mut [u8]) {
        slot.fill(0);
        slot[..self.0.len()].copy_from_slice(self.0.as_bytes());
    }

    fn read_slot(slot: &[u8; NAME_SLOT_LEN], field: &'static str) -> Result<Self, WireError> {
        let end = slot
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::Unterminated { field })?;
        let s = std::str::from_utf8(&slot[..end]).map_err(|_| WireError::InvalidUtf8 { field })?;
        Ok(BoundedName(s.to_string()))
    }
}

impl TryFrom<String> for BoundedName {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BoundedName::new(value)
    }
}

impl TryFrom<&str> for BoundedName {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        BoundedName::new(value)
    }
}

impl From<BoundedName> for String {
    fn from(name: BoundedName) -> Self {
        name.0
    }
}

impl fmt::Display for BoundedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BoundedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Payload of REGISTER and UNREGISTER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderEvent {
    pub uuid: ProviderId,
    pub name: BoundedName,
    pub instance: BoundedName,
}

/// A probe description under an already registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProbeDesc {
    pub provider: ProviderId,
    pub module: BoundedName,
    pub function: BoundedName,
    pub name: BoundedName,
}

impl fmt::Display for ProbeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.module, self.function, self.name)
    }
}

/// Payload of PROBE_CREATE: the sender's id for the new probe and its description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCreate {
    pub probe_id: ProbeId,
    pub desc: ProbeDesc,
}

/// Negative acknowledgement of a message the peer could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Nack {
    #[serde(serialize_with = "serialize_event")]
    pub failed: ControlEvent,
    pub probe_id: ProbeId,
    pub uuid: ProviderId,
    pub status: u32,
}

fn serialize_event<S: Serializer>(event: &ControlEvent, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(event.name())
}

/// One protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    DeviceReady,
    Register(ProviderEvent),
    Unregister(ProviderEvent),
    Destroy { instance: BoundedName },
    ProbeCreate(ProbeCreate),
    ProbeInstall { probe_id: ProbeId },
    ProbeUninstall { probe_id: ProbeId },
    Eof,
    Nack(Nack),
}

impl ControlMessage {
    pub fn event(&self) -> ControlEvent {
        match self {
            ControlMessage::DeviceReady => ControlEvent::DeviceReady,
            ControlMessage::Register(_) => ControlEvent::Register,
            ControlMessage::Unregister(_) => ControlEvent::Unregister,
            ControlMessage::Destroy { .. } => ControlEvent::Destroy,
            ControlMessage::ProbeCreate(_) => ControlEvent::ProbeCreate,
            ControlMessage::ProbeInstall { .. } => ControlEvent::ProbeInstall,
            ControlMessage::ProbeUninstall { .. } => ControlEvent::ProbeUninstall,
            ControlMessage::Eof => ControlEvent::Eof,
            ControlMessage::Nack(_) => ControlEvent::Nack,
        }
    }

    /// True for the readiness handshake, the only message allowed onto the
    /// ring while the peer has not signalled readiness.
    pub fn is_ready(&self) -> bool {
        matches!(self, ControlMessage::DeviceReady)
    }

    /// True for messages the peer has to acknowledge with a fresh READY.
    pub fn needs_ack(&self) -> bool {
        !matches!(self, ControlMessage::DeviceReady | ControlMessage::Eof)
    }

    /// Probe id named by the message, if any.
    pub fn probe_id(&self) -> Option<ProbeId> {
        match self {
            ControlMessage::ProbeCreate(c) => Some(c.probe_id),
            ControlMessage::ProbeInstall { probe_id }
            | ControlMessage::ProbeUninstall { probe_id } => Some(*probe_id),
            ControlMessage::Nack(n) => Some(n.probe_id),
            _ => None,
        }
    }

    /// Provider handle named by the message, if any.
    pub fn provider_id(&self) -> Option<ProviderId> {
        match self {
            ControlMessage::Register(pv) | ControlMessage::Unregister(pv) => Some(pv.uuid),
            ControlMessage::ProbeCreate(c) => Some(c.desc.provider),
            ControlMessage::Nack(n) => Some(n.uuid),
            _ => None,
        }
    }

    /// Serialize into a freshly allocated [`CONTROL_MSG_SIZE`] buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CONTROL_MSG_SIZE];
        self.raw().write(&mut buf);
        buf
    }

    /// Serialize into `buf`, which must hold at least [`CONTROL_MSG_SIZE`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < CONTROL_MSG_SIZE {
            return Err(WireError::ShortBuffer {
                got: buf.len(),
                need: CONTROL_MSG_SIZE,
            });
        }
        self.raw().write(&mut buf[..CONTROL_MSG_SIZE]);
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < CONTROL_MSG_SIZE {
            return Err(WireError::ShortBuffer {
                got: buf.len(),
                need: CONTROL_MSG_SIZE,
            });
        }
        let mut raw = RawControl::default();
        raw.copy_from_bytes(&buf[..CONTROL_MSG_SIZE])
            .map_err(|_| WireError::ShortBuffer {
                got: buf.len(),
                need: CONTROL_MSG_SIZE,
            })?;
        raw.from_wire_order();

        let msg = match ControlEvent::from_u32(raw.event)? {
            ControlEvent::DeviceReady => ControlMessage::DeviceReady,
            ControlEvent::Register => ControlMessage::Register(raw.provider_event()?),
            ControlEvent::Unregister => ControlMessage::Unregister(raw.provider_event()?),
            ControlEvent::Destroy => ControlMessage::Destroy {
                instance: BoundedName::read_slot(&raw.str1, "instance")?,
            },
            ControlEvent::ProbeCreate => ControlMessage::ProbeCreate(ProbeCreate {
                probe_id: raw.id,
                desc: ProbeDesc {
                    provider: ProviderId(raw.uuid),
                    module: BoundedName::read_slot(&raw.str0, "module")?,
                    function: BoundedName::read_slot(&raw.str1, "function")?,
                    name: BoundedName::read_slot(&raw.str2, "name")?,
                },
            }),
            ControlEvent::ProbeInstall => ControlMessage::ProbeInstall { probe_id: raw.id },
            ControlEvent::ProbeUninstall => ControlMessage::ProbeUninstall { probe_id: raw.id },
            ControlEvent::Eof => ControlMessage::Eof,
            ControlEvent::Nack => ControlMessage::Nack(Nack {
                failed: ControlEvent::from_u32(raw.aux)?,
                probe_id: raw.id,
                uuid: ProviderId(raw.uuid),
                status: raw.status,
            }),
        };
        // Fields the event does not use, and bytes after a string's NUL, must be zero.
        if msg.to_bytes().as_slice() != &buf[..CONTROL_MSG_SIZE] {
            return Err(WireError::StrayBytes { event: msg.event() });
        }
        Ok(msg)
    }

    fn raw(&self) -> RawControl {
        let mut raw = RawControl {
            event: self.event().code(),
            ..Default::default()
        };
        match self {
            ControlMessage::DeviceReady | ControlMessage::Eof => {}
            ControlMessage::Register(pv) | ControlMessage::Unregister(pv) => {
                raw.uuid = pv.uuid.0;
                pv.name.write_slot(&mut raw.str0);
                pv.instance.write_slot(&mut raw.str1);
            }
            ControlMessage::Destroy { instance } => instance.write_slot(&mut raw.str1),
            ControlMessage::ProbeCreate(create) => {
                raw.id = create.probe_id;
                raw.uuid = create.desc.provider.0;
                create.desc.module.write_slot(&mut raw.str0);
                create.desc.function.write_slot(&mut raw.str1);
                create.desc.name.write_slot(&mut raw.str2);
            }
            ControlMessage::ProbeInstall { probe_id }
            | ControlMessage::ProbeUninstall { probe_id } => {
                raw.id = *probe_id;
            }
            ControlMessage::Nack(nack) => {
                raw.id = nack.probe_id;
                raw.aux = nack.failed.code();
                raw.status = nack.status;
                raw.uuid = nack.uuid.0;
            }
        }
        raw
    }
}

/// In-memory image of the wire record. Integer fields hold native values;
/// conversion to little-endian happens in [`RawControl::write`] and
/// [`RawControl::from_wire_order`].
#[repr(C)]
#[derive(Clone, Copy)]
struct RawControl {
    event: u32,
    id: u32,
    aux: u32,
    status: u32,
    uuid: [u8; 16],
    str0: [u8; NAME_SLOT_LEN],
    str1: [u8; NAME_SLOT_LEN],
    str2: [u8; NAME_SLOT_LEN],
}
unsafe impl Plain for RawControl {}

const _: () = assert!(std::mem::size_of::<RawControl>() == CONTROL_MSG_SIZE);

impl Default for RawControl {
    fn default() -> Self {
        RawControl {
            event: 0,
            id: 0,
            aux: 0,
            status: 0,
            uuid: [0; 16],
            str0: [0; NAME_SLOT_LEN],
            str1: [0; NAME_SLOT_LEN],
            str2: [0; NAME_SLOT_LEN],
        }
    }
}

impl RawControl {
    fn from_wire_order(&mut self) {
        self.event = u32::from_le(self.event);
        self.id = u32::from_le(self.id);
        self.aux = u32::from_le(self.aux);
        self.status = u32::from_le(self.status);
    }

    fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.event.to_le_bytes());
        out[4..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..12].copy_from_slice(&self.aux.to_le_bytes());
        out[12..16].copy_from_slice(&self.status.to_le_bytes());
        out[16..32].copy_from_slice(&self.uuid);
        out[32..96].copy_from_slice(&self.str0);
        out[96..160].copy_from_slice(&self.str1);
        out[160..224].copy_from_slice(&self.str2);
    }

    fn provider_event(&self) -> Result<ProviderEvent, WireError> {
        Ok(ProviderEvent {
            uuid: ProviderId(self.uuid),
            name: BoundedName::read_slot(&self.str0, "provider")?,
            instance: BoundedName::read_slot(&self.str1, "instance")?,
        })
    }
}
