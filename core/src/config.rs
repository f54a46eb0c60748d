// Link configuration

use crate::transport::ble::framing::{DEFAULT_MAX_PENDING, MAX_CHUNK};
use crate::transport::ble::gatt::{PeerIdentifier, SERVICE_NAME};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default depth of the link runtime's input queue
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Service name must not be empty")]
    EmptyServiceName,
    #[error("max_message_bytes must be at least {min}, got {got}")]
    MessageLimitTooSmall { min: usize, got: usize },
    #[error("event_queue_depth must be greater than zero")]
    ZeroQueueDepth,
}

/// Settings shared by both roles.
///
/// Peers only find each other when `service_name` matches on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Local name advertised by the responder and filtered on by the initiator
    pub service_name: String,
    /// Service identifier the responder advertises
    pub responder_identifier: PeerIdentifier,
    /// Identifier the initiator runs under
    pub initiator_identifier: PeerIdentifier,
    /// Request link-layer encryption when publishing the channel
    pub encrypted_channel: bool,
    /// Largest inbound message held before it is dropped
    pub max_message_bytes: usize,
    /// Bounded queue depth for the runtime task
    pub event_queue_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            responder_identifier: PeerIdentifier::RESPONDER,
            initiator_identifier: PeerIdentifier::INITIATOR,
            encrypted_channel: true,
            max_message_bytes: DEFAULT_MAX_PENDING,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
        }
    }
}

impl LinkConfig {
    /// Set the advertised service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the inbound message limit
    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        if self.max_message_bytes < MAX_CHUNK {
            return Err(ConfigError::MessageLimitTooSmall {
                min: MAX_CHUNK,
                got: self.max_message_bytes,
            });
        }
        if self.event_queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        Ok(())
    }
}
