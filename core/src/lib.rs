// PeerLink Core: point-to-point BLE text channel
//
// One device advertises (responder), the other scans (initiator). The
// initiator reads the responder's L2CAP PSM from a GATT characteristic,
// opens the channel, and from then on both sides exchange arbitrarily long
// text messages framed into fixed 1024-byte chunks.
//
// Radio access is provided by the platform through the traits in
// `transport::ble`; everything here is a plain state machine driven by the
// events the platform delivers.
#![allow(clippy::empty_line_after_doc_comments)]

pub mod config;
pub mod link;
pub mod observer;
pub mod runtime;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use config::{ConfigError, LinkConfig};
pub use link::PeerLink;
pub use observer::{LinkEvent, LinkObserver, ObserverSlot, RecordingObserver};
pub use runtime::{spawn_link, LinkHandle};
pub use transport::ble::{
    CapabilityError, ChannelSession, FrameCodec, FramingError, InitiatorError, InitiatorPhase,
    InitiatorRole, Psm, RadioError, Reassembler, ResponderError, ResponderPhase, ResponderRole,
    SessionError, MAX_CHUNK, SENTINEL,
};

// ============================================================================
// ROLES
// ============================================================================

/// Which side of the link an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Scans for the responder and opens the channel (BLE central)
    Initiator,
    /// Advertises and accepts the channel (BLE peripheral)
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum LinkError {
    #[error("No active channel session")]
    NoActiveSession,
    #[error("Link runtime is not running")]
    RuntimeStopped,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Initiator(#[from] InitiatorError),
    #[error(transparent)]
    Responder(#[from] ResponderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
