/// Initiator role (BLE central)
///
/// Scans for a responder advertising the link service name, connects,
/// discovers the advertised services, reads the PSM characteristic and opens
/// the L2CAP channel with it. At most one peer is pursued at a time and at
/// most one session is active.
///
/// Radio operations are requests; their outcomes come back later as
/// [`CentralEvent`]s delivered by the platform on the link's event loop.

use super::gatt::{
    decode_capability, Advertisement, CapabilityError, PeerIdentifier, PeripheralId, Psm,
    RadioError, RadioState, PSM_CHARACTERISTIC_UUID,
};
use super::session::{ChannelEvent, ChannelSession, DuplexChannel};
use crate::config::LinkConfig;
use crate::observer::ObserverSlot;
use crate::Role;
use serde::{Deserialize, Serialize};
use std::mem;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Radio primitives the initiator drives
#[cfg_attr(test, mockall::automock)]
pub trait CentralRadio: Send {
    /// Start scanning for advertisements
    fn scan(&mut self) -> Result<(), RadioError>;
    fn stop_scan(&mut self);
    fn connect(&mut self, peripheral: PeripheralId) -> Result<(), RadioError>;
    /// Cancel a pending or established connection
    fn cancel_connection(&mut self, peripheral: PeripheralId);
    /// Discover only the listed services
    fn discover_services(
        &mut self,
        peripheral: PeripheralId,
        services: &[Uuid],
    ) -> Result<(), RadioError>;
    fn discover_characteristics(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
    ) -> Result<(), RadioError>;
    fn read_characteristic(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), RadioError>;
    /// Open the L2CAP channel published under `psm`
    fn open_channel(&mut self, peripheral: PeripheralId, psm: Psm) -> Result<(), RadioError>;
}

/// Radio callbacks for the initiator
#[derive(Debug)]
pub enum CentralEvent {
    StateChanged(RadioState),
    ScanFailed {
        reason: String,
    },
    Discovered {
        peripheral: PeripheralId,
        advertisement: Advertisement,
    },
    Connected {
        peripheral: PeripheralId,
    },
    ConnectFailed {
        peripheral: PeripheralId,
        reason: String,
    },
    Disconnected {
        peripheral: PeripheralId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        result: Result<Vec<Uuid>, String>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        result: Result<Vec<Uuid>, String>,
    },
    CharacteristicRead {
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: Result<Vec<u8>, String>,
    },
    ChannelOpened {
        peripheral: PeripheralId,
        result: Result<Box<dyn DuplexChannel>, String>,
    },
    Channel(ChannelEvent),
}

/// Errors for initiator operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitiatorError {
    #[error("Initiator already started")]
    AlreadyStarted,
    #[error("Discovery error: {0}")]
    Discovery(String),
    #[error("Connection to {peripheral} failed: {reason}")]
    Connect {
        peripheral: PeripheralId,
        reason: String,
    },
    #[error("Service discovery failed: {0}")]
    ServiceDiscovery(String),
    #[error("Capability characteristic not found")]
    CapabilityNotFound,
    #[error("Capability read failed: {0}")]
    CapabilityRead(String),
    #[error("Capability decode failed: {0}")]
    CapabilityDecode(#[from] CapabilityError),
    #[error("Channel open failed: {0}")]
    ChannelOpen(String),
    #[error(transparent)]
    Radio(#[from] RadioError),
}

impl InitiatorError {
    /// False for errors after which the role keeps going on its own
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InitiatorError::Discovery(_))
    }
}

/// Externally visible initiator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatorPhase {
    Idle,
    WaitingForRadio,
    Scanning,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    RequestingCapability,
    OpeningChannel,
    SessionActive,
}

/// The peer currently being pursued
#[derive(Debug, Clone)]
struct Attempt {
    peripheral: PeripheralId,
    services: Vec<Uuid>,
}

#[derive(Debug)]
enum State {
    Idle,
    WaitingForRadio,
    Scanning,
    Connecting(Attempt),
    ServiceDiscovery(Attempt),
    CharacteristicDiscovery { attempt: Attempt, remaining: usize },
    RequestingCapability { attempt: Attempt, service: Uuid },
    OpeningChannel { attempt: Attempt, psm: Psm },
    SessionActive { attempt: Attempt, psm: Psm, session: ChannelSession },
}

impl State {
    fn phase(&self) -> InitiatorPhase {
        match self {
            State::Idle => InitiatorPhase::Idle,
            State::WaitingForRadio => InitiatorPhase::WaitingForRadio,
            State::Scanning => InitiatorPhase::Scanning,
            State::Connecting(_) => InitiatorPhase::Connecting,
            State::ServiceDiscovery(_) => InitiatorPhase::ServiceDiscovery,
            State::CharacteristicDiscovery { .. } => InitiatorPhase::CharacteristicDiscovery,
            State::RequestingCapability { .. } => InitiatorPhase::RequestingCapability,
            State::OpeningChannel { .. } => InitiatorPhase::OpeningChannel,
            State::SessionActive { .. } => InitiatorPhase::SessionActive,
        }
    }

    fn attempt(&self) -> Option<&Attempt> {
        match self {
            State::Connecting(attempt) | State::ServiceDiscovery(attempt) => Some(attempt),
            State::CharacteristicDiscovery { attempt, .. }
            | State::RequestingCapability { attempt, .. }
            | State::OpeningChannel { attempt, .. }
            | State::SessionActive { attempt, .. } => Some(attempt),
            _ => None,
        }
    }
}

type Step = (State, Result<(), InitiatorError>);

pub struct InitiatorRole {
    radio: Box<dyn CentralRadio>,
    observer: ObserverSlot,
    service_name: String,
    max_pending: usize,
    radio_state: RadioState,
    state: State,
}

impl InitiatorRole {
    pub fn new(radio: Box<dyn CentralRadio>, observer: ObserverSlot, config: &LinkConfig) -> Self {
        Self {
            radio,
            observer,
            service_name: config.service_name.clone(),
            max_pending: config.max_message_bytes,
            radio_state: RadioState::Unknown,
            state: State::Idle,
        }
    }

    pub fn phase(&self) -> InitiatorPhase {
        self.state.phase()
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio_state
    }

    /// PSM negotiated for the current attempt, once read
    pub fn psm(&self) -> Option<Psm> {
        match &self.state {
            State::OpeningChannel { psm, .. } | State::SessionActive { psm, .. } => Some(*psm),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&ChannelSession> {
        match &self.state {
            State::SessionActive { session, .. } => Some(session),
            _ => None,
        }
    }

    /// The active session, if the channel is open
    pub fn session_mut(&mut self) -> Option<&mut ChannelSession> {
        match &mut self.state {
            State::SessionActive { session, .. } => Some(session),
            _ => None,
        }
    }

    /// Begin looking for a responder
    pub fn start(&mut self, identifier: PeerIdentifier) -> Result<(), InitiatorError> {
        if !matches!(self.state, State::Idle) {
            return Err(InitiatorError::AlreadyStarted);
        }
        info!("Initiator {} starting", identifier);

        if self.radio_state.is_powered_on() {
            let (next, result) = self.begin_scan();
            self.state = next;
            result
        } else {
            debug!("Radio is {:?}, waiting for power", self.radio_state);
            self.state = State::WaitingForRadio;
            Ok(())
        }
    }

    /// Close any session, cancel any attempt, and return to idle
    pub fn stop(&mut self) {
        let state = mem::replace(&mut self.state, State::Idle);
        match state {
            State::Idle => return,
            State::WaitingForRadio => {}
            State::Scanning => self.radio.stop_scan(),
            State::SessionActive {
                attempt,
                mut session,
                ..
            } => {
                session.close();
                self.radio.cancel_connection(attempt.peripheral);
            }
            other => {
                if let Some(attempt) = other.attempt() {
                    self.radio.cancel_connection(attempt.peripheral);
                }
            }
        }
        info!("Initiator stopped");
    }

    /// Apply one radio event
    pub fn handle_event(&mut self, event: CentralEvent) -> Result<(), InitiatorError> {
        let state = mem::replace(&mut self.state, State::Idle);
        let before = state.phase();
        let (next, result) = self.step(state, event);
        if next.phase() != before {
            debug!("Initiator phase: {:?} -> {:?}", before, next.phase());
        }
        self.state = next;
        result
    }

    fn step(&mut self, state: State, event: CentralEvent) -> Step {
        match event {
            CentralEvent::StateChanged(radio_state) => self.on_radio_state(state, radio_state),

            CentralEvent::ScanFailed { reason } => {
                warn!("Scan error: {}", reason);
                (state, Err(InitiatorError::Discovery(reason)))
            }

            CentralEvent::Discovered {
                peripheral,
                advertisement,
            } => match state {
                State::Scanning => self.on_discovered(peripheral, advertisement),
                other => {
                    debug!("Ignoring discovery of {} while {:?}", peripheral, other.phase());
                    (other, Ok(()))
                }
            },

            CentralEvent::Connected { peripheral } => match state {
                State::Connecting(attempt) if attempt.peripheral == peripheral => {
                    info!("Connected to {}", peripheral);
                    match self.radio.discover_services(peripheral, &attempt.services) {
                        Ok(()) => (State::ServiceDiscovery(attempt), Ok(())),
                        Err(e) => self.abort(attempt, e.into()),
                    }
                }
                other => (other, Ok(())),
            },

            CentralEvent::ConnectFailed { peripheral, reason } => match state.attempt() {
                Some(attempt) if attempt.peripheral == peripheral => {
                    let attempt = attempt.clone();
                    self.abort(attempt, InitiatorError::Connect { peripheral, reason })
                }
                _ => (state, Ok(())),
            },

            CentralEvent::Disconnected { peripheral, reason } => {
                self.on_disconnected(state, peripheral, reason)
            }

            CentralEvent::ServicesDiscovered { peripheral, result } => match state {
                State::ServiceDiscovery(attempt) if attempt.peripheral == peripheral => {
                    self.on_services(attempt, result)
                }
                other => (other, Ok(())),
            },

            CentralEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => match state {
                State::CharacteristicDiscovery { attempt, remaining }
                    if attempt.peripheral == peripheral =>
                {
                    self.on_characteristics(attempt, remaining, service, result)
                }
                other => (other, Ok(())),
            },

            CentralEvent::CharacteristicRead {
                peripheral,
                characteristic,
                result,
            } => match state {
                State::RequestingCapability { attempt, .. }
                    if attempt.peripheral == peripheral
                        && characteristic == PSM_CHARACTERISTIC_UUID =>
                {
                    self.on_capability(attempt, result)
                }
                other => (other, Ok(())),
            },

            CentralEvent::ChannelOpened { peripheral, result } => match state {
                State::OpeningChannel { attempt, psm } if attempt.peripheral == peripheral => {
                    match result {
                        Ok(channel) => {
                            let session = ChannelSession::open(
                                Role::Initiator,
                                channel,
                                self.observer.clone(),
                                self.max_pending,
                            );
                            (
                                State::SessionActive {
                                    attempt,
                                    psm,
                                    session,
                                },
                                Ok(()),
                            )
                        }
                        Err(reason) => self.abort(attempt, InitiatorError::ChannelOpen(reason)),
                    }
                }
                other => {
                    if let Ok(mut channel) = result {
                        warn!("Closing unexpected channel from {}", peripheral);
                        channel.close();
                    }
                    (other, Ok(()))
                }
            },

            CentralEvent::Channel(channel_event) => match state {
                State::SessionActive {
                    attempt,
                    psm,
                    mut session,
                } => {
                    session.handle_event(channel_event);
                    if session.is_open() {
                        (
                            State::SessionActive {
                                attempt,
                                psm,
                                session,
                            },
                            Ok(()),
                        )
                    } else {
                        self.radio.cancel_connection(attempt.peripheral);
                        (State::Idle, Ok(()))
                    }
                }
                other => (other, Ok(())),
            },
        }
    }

    fn begin_scan(&mut self) -> Step {
        match self.radio.scan() {
            Ok(()) => {
                info!("Scanning for {}", self.service_name);
                (State::Scanning, Ok(()))
            }
            Err(e) => (State::Idle, Err(e.into())),
        }
    }

    fn on_radio_state(&mut self, state: State, radio_state: RadioState) -> Step {
        self.radio_state = radio_state;
        if radio_state.is_powered_on() {
            return match state {
                State::WaitingForRadio => self.begin_scan(),
                other => (other, Ok(())),
            };
        }

        match state {
            State::Idle => (State::Idle, Ok(())),
            State::WaitingForRadio => (State::WaitingForRadio, Ok(())),
            State::SessionActive { mut session, .. } => {
                warn!("Radio {:?}, closing session", radio_state);
                session.close();
                (State::WaitingForRadio, Ok(()))
            }
            other => {
                warn!("Radio {:?} during {:?}, waiting for power", radio_state, other.phase());
                (State::WaitingForRadio, Ok(()))
            }
        }
    }

    fn on_discovered(&mut self, peripheral: PeripheralId, advertisement: Advertisement) -> Step {
        if !advertisement.matches(&self.service_name) {
            debug!(
                "Ignoring {} advertising {:?}",
                peripheral, advertisement.local_name
            );
            return (State::Scanning, Ok(()));
        }

        info!(
            "Peer found: {} with services {:?}",
            peripheral, advertisement.service_uuids
        );
        self.radio.stop_scan();

        let attempt = Attempt {
            peripheral,
            services: advertisement.service_uuids,
        };
        match self.radio.connect(peripheral) {
            Ok(()) => (State::Connecting(attempt), Ok(())),
            Err(e) => self.abort(attempt, e.into()),
        }
    }

    fn on_disconnected(
        &mut self,
        state: State,
        peripheral: PeripheralId,
        reason: Option<String>,
    ) -> Step {
        match state {
            State::SessionActive {
                attempt,
                mut session,
                ..
            } if attempt.peripheral == peripheral => {
                info!("{} disconnected: {}", peripheral, reason.as_deref().unwrap_or("normal"));
                session.close();
                (State::Idle, Ok(()))
            }
            other => match other.attempt() {
                Some(attempt) if attempt.peripheral == peripheral => (
                    State::Idle,
                    Err(InitiatorError::Connect {
                        peripheral,
                        reason: reason.unwrap_or_else(|| "disconnected".to_string()),
                    }),
                ),
                _ => (other, Ok(())),
            },
        }
    }

    fn on_services(&mut self, attempt: Attempt, result: Result<Vec<Uuid>, String>) -> Step {
        let found = match result {
            Ok(found) => found,
            Err(reason) => return self.abort(attempt, InitiatorError::ServiceDiscovery(reason)),
        };

        // Only services the peer advertised are relevant
        let matched: Vec<Uuid> = found
            .into_iter()
            .filter(|s| attempt.services.contains(s))
            .collect();
        if matched.is_empty() {
            return self.abort(attempt, InitiatorError::CapabilityNotFound);
        }

        for service in &matched {
            if let Err(e) = self.radio.discover_characteristics(attempt.peripheral, *service) {
                return self.abort(attempt, e.into());
            }
        }
        (
            State::CharacteristicDiscovery {
                attempt,
                remaining: matched.len(),
            },
            Ok(()),
        )
    }

    fn on_characteristics(
        &mut self,
        attempt: Attempt,
        remaining: usize,
        service: Uuid,
        result: Result<Vec<Uuid>, String>,
    ) -> Step {
        let remaining = remaining.saturating_sub(1);
        match result {
            Ok(characteristics) if characteristics.contains(&PSM_CHARACTERISTIC_UUID) => {
                return match self.radio.read_characteristic(
                    attempt.peripheral,
                    service,
                    PSM_CHARACTERISTIC_UUID,
                ) {
                    Ok(()) => (State::RequestingCapability { attempt, service }, Ok(())),
                    Err(e) => self.abort(attempt, e.into()),
                };
            }
            Ok(_) => debug!("Service {} has no PSM characteristic", service),
            Err(reason) => warn!("Characteristic discovery on {} failed: {}", service, reason),
        }

        if remaining == 0 {
            self.abort(attempt, InitiatorError::CapabilityNotFound)
        } else {
            (State::CharacteristicDiscovery { attempt, remaining }, Ok(()))
        }
    }

    fn on_capability(&mut self, attempt: Attempt, result: Result<Vec<u8>, String>) -> Step {
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(reason) => return self.abort(attempt, InitiatorError::CapabilityRead(reason)),
        };
        let psm = match decode_capability(&bytes) {
            Ok(psm) => psm,
            Err(e) => return self.abort(attempt, e.into()),
        };

        info!("Opening channel on PSM {}", psm);
        match self.radio.open_channel(attempt.peripheral, psm) {
            Ok(()) => (State::OpeningChannel { attempt, psm }, Ok(())),
            Err(e) => self.abort(attempt, e.into()),
        }
    }

    /// Fail the current attempt and go back to idle
    fn abort(&mut self, attempt: Attempt, error: InitiatorError) -> Step {
        warn!("Initiator attempt on {} failed: {}", attempt.peripheral, error);
        self.radio.cancel_connection(attempt.peripheral);
        (State::Idle, Err(error))
    }
}
