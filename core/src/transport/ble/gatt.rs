/// GATT definitions shared by both roles
///
/// The responder registers one primary service carrying a single readable
/// characteristic. Reading it yields the PSM the initiator must present to
/// open the L2CAP channel, encoded as a small JSON object.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Local name both sides advertise and filter on
pub const SERVICE_NAME: &str = "com.example.corebluetooth";

/// Bluetooth SIG base UUID used to expand 16-bit short UUIDs
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// Expand a 16-bit short UUID onto the Bluetooth base UUID
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Characteristic holding the published PSM (short UUID 0x0001)
pub const PSM_CHARACTERISTIC_UUID: Uuid = short_uuid(0x0001);

/// Well-known identifier of one link instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentifier(pub Uuid);

impl PeerIdentifier {
    /// Service identifier the responder advertises
    pub const RESPONDER: PeerIdentifier =
        PeerIdentifier(Uuid::from_u128(0x6873C1CD_61F2_4848_B8E0_3531B6903F0B));

    /// Identifier the initiator runs under
    pub const INITIATOR: PeerIdentifier =
        PeerIdentifier(Uuid::from_u128(0xBE8F7BED_87DE_4DEF_887A_FE8C50D2C098));

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated().to_string().to_uppercase())
    }
}

/// Protocol/Service Multiplexer negotiated for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Psm(u16);

impl Psm {
    /// First dynamically allocated LE PSM
    pub const DYNAMIC_START: Psm = Psm(0x0080);

    /// Validate a PSM value; zero is never a valid channel
    pub fn new(value: u16) -> Result<Self, CapabilityError> {
        if value == 0 {
            return Err(CapabilityError::OutOfRange(0));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors for the capability exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Capability payload could not be decoded: {0}")]
    Decode(String),
    #[error("PSM out of range: {0}")]
    OutOfRange(i64),
}

/// Wire record carried by the PSM characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CapabilityPayload {
    psm: i64,
}

/// Serialize a PSM for a characteristic read response
pub fn encode_capability(psm: Psm) -> Vec<u8> {
    let payload = CapabilityPayload {
        psm: i64::from(psm.value()),
    };
    // A struct with one integer field always serializes
    serde_json::to_vec(&payload).unwrap_or_default()
}

/// Parse the characteristic value read from the responder
pub fn decode_capability(bytes: &[u8]) -> Result<Psm, CapabilityError> {
    let payload: CapabilityPayload =
        serde_json::from_slice(bytes).map_err(|e| CapabilityError::Decode(e.to_string()))?;
    let value = u16::try_from(payload.psm).map_err(|_| CapabilityError::OutOfRange(payload.psm))?;
    Psm::new(value)
}

/// Opaque handle the radio uses for a remote peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(pub u64);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peripheral#{}", self.0)
    }
}

/// Advertisement data observed while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Advertised local name, if any
    pub local_name: Option<String>,
    /// Advertised service identifiers
    pub service_uuids: Vec<Uuid>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(local_name: impl Into<String>, service_uuids: Vec<Uuid>) -> Self {
        Self {
            local_name: Some(local_name.into()),
            service_uuids,
            rssi: None,
        }
    }

    /// True when this advertisement belongs to a link responder
    pub fn matches(&self, service_name: &str) -> bool {
        self.local_name.as_deref() == Some(service_name) && !self.service_uuids.is_empty()
    }
}

/// One characteristic of a registered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub readable: bool,
}

/// Primary service registered by the responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    /// The link service for `identifier`: one readable PSM characteristic
    pub fn link_service(identifier: PeerIdentifier) -> Self {
        Self {
            uuid: identifier.uuid(),
            primary: true,
            characteristics: vec![CharacteristicDefinition {
                uuid: PSM_CHARACTERISTIC_UUID,
                readable: true,
            }],
        }
    }

    pub fn characteristic_uuids(&self) -> Vec<Uuid> {
        self.characteristics.iter().map(|c| c.uuid).collect()
    }
}

/// Power/availability state reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        *self == RadioState::PoweredOn
    }
}

/// A radio command was refused outright
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Radio rejected {operation}: {reason}")]
pub struct RadioError {
    pub operation: &'static str,
    pub reason: String,
}

impl RadioError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}
