/// BLE (Bluetooth Low Energy) link transport
///
/// Protocol-level logic for a single point-to-point L2CAP text channel:
///
/// - **framing**: fixed 1024-byte chunks with a textual `EOF` sentinel
/// - **session**: one open duplex channel driving the framing both ways
/// - **gatt**: identifiers, PSM characteristic payload, advertisement filter
/// - **central**: initiator role (scan, connect, read PSM, open channel)
/// - **peripheral**: responder role (advertise, publish PSM, accept channel)
/// - **loopback**: in-memory radio pair for tests and demos
///
/// Platform code (Swift/Kotlin/BlueZ) implements the radio traits and feeds
/// radio callbacks back as events; nothing here touches hardware.

pub mod central;
pub mod framing;
pub mod gatt;
pub mod loopback;
pub mod peripheral;
pub mod session;

// Re-export commonly used types
pub use central::{CentralEvent, CentralRadio, InitiatorError, InitiatorPhase, InitiatorRole};

pub use framing::{Chunk, FrameCodec, FramingError, Reassembler, MAX_CHUNK, PADDING_BYTE, SENTINEL};

pub use gatt::{
    decode_capability, encode_capability, Advertisement, CapabilityError, PeerIdentifier,
    PeripheralId, Psm, RadioError, RadioState, ServiceDefinition, PSM_CHARACTERISTIC_UUID,
    SERVICE_NAME,
};

pub use loopback::{LoopbackAir, LoopbackCentral, LoopbackChannel, LoopbackPeripheral, LOOPBACK_PERIPHERAL};

pub use peripheral::{
    AttError, PeripheralEvent, PeripheralRadio, ReadRequestId, ReadResponse, ResponderError,
    ResponderPhase, ResponderRole,
};

pub use session::{ChannelEvent, ChannelSession, DuplexChannel, SessionError, SessionState};
