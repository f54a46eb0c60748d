/// Responder role (BLE peripheral)
///
/// Registers the link service, advertises it under the well-known name,
/// publishes an L2CAP channel and answers PSM reads with the most recently
/// published value. Accepts one inbound channel at a time.

use super::gatt::{
    encode_capability, PeerIdentifier, Psm, RadioError, RadioState, ServiceDefinition,
    PSM_CHARACTERISTIC_UUID,
};
use super::session::{ChannelEvent, ChannelSession, DuplexChannel};
use crate::config::LinkConfig;
use crate::observer::ObserverSlot;
use crate::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies a pending ATT read so it can be answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadRequestId(pub u64);

/// ATT error codes the responder may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttError {
    /// 0x02
    ReadNotPermitted,
    /// 0x0A
    AttributeNotFound,
}

impl fmt::Display for AttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttError::ReadNotPermitted => write!(f, "read not permitted"),
            AttError::AttributeNotFound => write!(f, "attribute not found"),
        }
    }
}

/// Answer to a characteristic read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResponse {
    Value(Vec<u8>),
    Rejected(AttError),
}

/// Radio primitives the responder drives
#[cfg_attr(test, mockall::automock)]
pub trait PeripheralRadio: Send {
    fn add_service(&mut self, service: &ServiceDefinition) -> Result<(), RadioError>;
    fn remove_service(&mut self, service: Uuid);
    fn start_advertising(&mut self, local_name: &str, services: &[Uuid]) -> Result<(), RadioError>;
    fn stop_advertising(&mut self);
    /// Ask the radio to allocate a PSM and listen on it
    fn publish_channel(&mut self, encrypted: bool) -> Result<(), RadioError>;
    fn unpublish_channel(&mut self, psm: Psm);
    fn respond_to_read(&mut self, request: ReadRequestId, response: ReadResponse);
}

/// Radio callbacks for the responder
#[derive(Debug)]
pub enum PeripheralEvent {
    StateChanged(RadioState),
    ServiceAdded {
        service: Uuid,
        result: Result<(), String>,
    },
    AdvertisingStarted {
        result: Result<(), String>,
    },
    /// A PSM was (re)published; the value may differ from the previous one
    ChannelPublished {
        result: Result<Psm, String>,
    },
    ReadRequest {
        request: ReadRequestId,
        characteristic: Uuid,
    },
    ChannelOpened {
        result: Result<Box<dyn DuplexChannel>, String>,
    },
    Channel(ChannelEvent),
}

/// Errors for responder operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponderError {
    #[error("Responder already started")]
    AlreadyStarted,
    #[error("Service registration failed: {0}")]
    ServiceRegistration(String),
    #[error("Advertising failed: {0}")]
    Advertising(String),
    #[error("Channel publish failed: {0}")]
    Publish(String),
    #[error("Channel open failed: {0}")]
    ChannelOpen(String),
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Externally visible responder state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderPhase {
    Idle,
    WaitingForRadio,
    Registering,
    Advertising,
    CapabilityPublished,
    AwaitingChannel,
    SessionActive,
}

#[derive(Debug)]
enum State {
    Idle,
    WaitingForRadio {
        identifier: PeerIdentifier,
    },
    Registering {
        identifier: PeerIdentifier,
    },
    Advertising {
        identifier: PeerIdentifier,
    },
    CapabilityPublished {
        identifier: PeerIdentifier,
        psm: Psm,
    },
    AwaitingChannel {
        identifier: PeerIdentifier,
        psm: Psm,
    },
    SessionActive {
        identifier: PeerIdentifier,
        psm: Psm,
        session: ChannelSession,
    },
}

impl State {
    fn phase(&self) -> ResponderPhase {
        match self {
            State::Idle => ResponderPhase::Idle,
            State::WaitingForRadio { .. } => ResponderPhase::WaitingForRadio,
            State::Registering { .. } => ResponderPhase::Registering,
            State::Advertising { .. } => ResponderPhase::Advertising,
            State::CapabilityPublished { .. } => ResponderPhase::CapabilityPublished,
            State::AwaitingChannel { .. } => ResponderPhase::AwaitingChannel,
            State::SessionActive { .. } => ResponderPhase::SessionActive,
        }
    }

    fn psm(&self) -> Option<Psm> {
        match self {
            State::CapabilityPublished { psm, .. }
            | State::AwaitingChannel { psm, .. }
            | State::SessionActive { psm, .. } => Some(*psm),
            _ => None,
        }
    }
}

type Step = (State, Result<(), ResponderError>);

pub struct ResponderRole {
    radio: Box<dyn PeripheralRadio>,
    observer: ObserverSlot,
    service_name: String,
    encrypted: bool,
    max_pending: usize,
    radio_state: RadioState,
    state: State,
}

impl ResponderRole {
    pub fn new(
        radio: Box<dyn PeripheralRadio>,
        observer: ObserverSlot,
        config: &LinkConfig,
    ) -> Self {
        Self {
            radio,
            observer,
            service_name: config.service_name.clone(),
            encrypted: config.encrypted_channel,
            max_pending: config.max_message_bytes,
            radio_state: RadioState::Unknown,
            state: State::Idle,
        }
    }

    pub fn phase(&self) -> ResponderPhase {
        self.state.phase()
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio_state
    }

    /// PSM currently answered to capability reads
    pub fn psm(&self) -> Option<Psm> {
        self.state.psm()
    }

    pub fn session(&self) -> Option<&ChannelSession> {
        match &self.state {
            State::SessionActive { session, .. } => Some(session),
            _ => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut ChannelSession> {
        match &mut self.state {
            State::SessionActive { session, .. } => Some(session),
            _ => None,
        }
    }

    /// Register the service and start advertising under `identifier`
    pub fn start(&mut self, identifier: PeerIdentifier) -> Result<(), ResponderError> {
        if !matches!(self.state, State::Idle) {
            return Err(ResponderError::AlreadyStarted);
        }
        info!("Responder {} starting", identifier);

        if self.radio_state.is_powered_on() {
            let (next, result) = self.register(identifier);
            self.state = next;
            result
        } else {
            debug!("Radio is {:?}, waiting for power", self.radio_state);
            self.state = State::WaitingForRadio { identifier };
            Ok(())
        }
    }

    /// Close any session and stop advertising
    pub fn stop(&mut self) {
        let state = mem::replace(&mut self.state, State::Idle);
        let psm = state.psm();
        match state {
            State::Idle => return,
            State::WaitingForRadio { .. } => {}
            State::Registering { identifier } => self.radio.remove_service(identifier.uuid()),
            State::SessionActive {
                identifier,
                mut session,
                ..
            } => {
                session.close();
                self.teardown(identifier, psm);
            }
            State::Advertising { identifier }
            | State::CapabilityPublished { identifier, .. }
            | State::AwaitingChannel { identifier, .. } => self.teardown(identifier, psm),
        }
        info!("Responder stopped");
    }

    /// Apply one radio event
    pub fn handle_event(&mut self, event: PeripheralEvent) -> Result<(), ResponderError> {
        let state = mem::replace(&mut self.state, State::Idle);
        let before = state.phase();
        let (next, result) = self.step(state, event);
        if next.phase() != before {
            debug!("Responder phase: {:?} -> {:?}", before, next.phase());
        }
        self.state = next;
        result
    }

    fn step(&mut self, state: State, event: PeripheralEvent) -> Step {
        match event {
            PeripheralEvent::StateChanged(radio_state) => self.on_radio_state(state, radio_state),

            PeripheralEvent::ServiceAdded { service, result } => match state {
                State::Registering { identifier } if identifier.uuid() == service => {
                    self.on_service_added(identifier, result)
                }
                other => (other, Ok(())),
            },

            PeripheralEvent::AdvertisingStarted { result } => match result {
                Ok(()) => {
                    info!("Advertising {}", self.service_name);
                    (state, Ok(()))
                }
                Err(reason) => self.fail(state, ResponderError::Advertising(reason)),
            },

            PeripheralEvent::ChannelPublished { result } => self.on_published(state, result),

            PeripheralEvent::ReadRequest {
                request,
                characteristic,
            } => self.on_read(state, request, characteristic),

            PeripheralEvent::ChannelOpened { result } => self.on_channel_opened(state, result),

            PeripheralEvent::Channel(channel_event) => match state {
                State::SessionActive {
                    identifier,
                    psm,
                    mut session,
                } => {
                    session.handle_event(channel_event);
                    if session.is_open() {
                        (
                            State::SessionActive {
                                identifier,
                                psm,
                                session,
                            },
                            Ok(()),
                        )
                    } else {
                        // Still advertising; the next initiator gets a new session
                        (State::AwaitingChannel { identifier, psm }, Ok(()))
                    }
                }
                other => (other, Ok(())),
            },
        }
    }

    fn register(&mut self, identifier: PeerIdentifier) -> Step {
        let service = ServiceDefinition::link_service(identifier);
        match self.radio.add_service(&service) {
            Ok(()) => (State::Registering { identifier }, Ok(())),
            Err(e) => (State::Idle, Err(e.into())),
        }
    }

    fn on_radio_state(&mut self, state: State, radio_state: RadioState) -> Step {
        self.radio_state = radio_state;
        if radio_state.is_powered_on() {
            return match state {
                State::WaitingForRadio { identifier } => self.register(identifier),
                other => (other, Ok(())),
            };
        }

        match state {
            State::Idle => (State::Idle, Ok(())),
            State::WaitingForRadio { identifier } => (State::WaitingForRadio { identifier }, Ok(())),
            State::SessionActive {
                identifier,
                mut session,
                ..
            } => {
                warn!("Radio {:?}, closing session", radio_state);
                session.close();
                (State::WaitingForRadio { identifier }, Ok(()))
            }
            State::Registering { identifier }
            | State::Advertising { identifier }
            | State::CapabilityPublished { identifier, .. }
            | State::AwaitingChannel { identifier, .. } => {
                warn!("Radio {:?}, waiting for power to re-register", radio_state);
                (State::WaitingForRadio { identifier }, Ok(()))
            }
        }
    }

    fn on_service_added(&mut self, identifier: PeerIdentifier, result: Result<(), String>) -> Step {
        if let Err(reason) = result {
            warn!("Service registration failed: {}", reason);
            return (State::Idle, Err(ResponderError::ServiceRegistration(reason)));
        }

        let services = [identifier.uuid()];
        if let Err(e) = self.radio.start_advertising(&self.service_name, &services) {
            self.radio.remove_service(identifier.uuid());
            return (State::Idle, Err(e.into()));
        }
        if let Err(e) = self.radio.publish_channel(self.encrypted) {
            self.teardown(identifier, None);
            return (State::Idle, Err(e.into()));
        }
        (State::Advertising { identifier }, Ok(()))
    }

    fn on_published(&mut self, state: State, result: Result<Psm, String>) -> Step {
        let psm = match result {
            Ok(psm) => psm,
            Err(reason) => {
                return match state {
                    State::Advertising { .. } => self.fail(state, ResponderError::Publish(reason)),
                    other => {
                        warn!("Channel republish failed: {}", reason);
                        (other, Ok(()))
                    }
                };
            }
        };

        match state {
            State::Advertising { identifier } => {
                info!("Published channel PSM {}", psm);
                (State::CapabilityPublished { identifier, psm }, Ok(()))
            }
            State::CapabilityPublished { identifier, psm: old }
            | State::AwaitingChannel { identifier, psm: old } => {
                info!("Channel PSM rotated {} -> {}", old, psm);
                (State::CapabilityPublished { identifier, psm }, Ok(()))
            }
            State::SessionActive {
                identifier,
                session,
                ..
            } => {
                info!("Channel PSM rotated to {} during session", psm);
                (
                    State::SessionActive {
                        identifier,
                        psm,
                        session,
                    },
                    Ok(()),
                )
            }
            other => {
                debug!("Ignoring PSM {} published while {:?}", psm, other.phase());
                (other, Ok(()))
            }
        }
    }

    fn on_read(&mut self, state: State, request: ReadRequestId, characteristic: Uuid) -> Step {
        if characteristic != PSM_CHARACTERISTIC_UUID {
            debug!("Read for unknown characteristic {}", characteristic);
            self.radio
                .respond_to_read(request, ReadResponse::Rejected(AttError::AttributeNotFound));
            return (state, Ok(()));
        }

        let Some(psm) = state.psm() else {
            debug!("PSM read before publish, rejecting");
            self.radio
                .respond_to_read(request, ReadResponse::Rejected(AttError::ReadNotPermitted));
            return (state, Ok(()));
        };

        debug!("Answering PSM read with {}", psm);
        self.radio
            .respond_to_read(request, ReadResponse::Value(encode_capability(psm)));
        match state {
            State::CapabilityPublished { identifier, psm } => {
                (State::AwaitingChannel { identifier, psm }, Ok(()))
            }
            other => (other, Ok(())),
        }
    }

    fn on_channel_opened(
        &mut self,
        state: State,
        result: Result<Box<dyn DuplexChannel>, String>,
    ) -> Step {
        let mut channel = match result {
            Ok(channel) => channel,
            Err(reason) => {
                warn!("Inbound channel failed to open: {}", reason);
                return (state, Err(ResponderError::ChannelOpen(reason)));
            }
        };

        match state {
            State::CapabilityPublished { identifier, psm }
            | State::AwaitingChannel { identifier, psm } => {
                let session = ChannelSession::open(
                    Role::Responder,
                    channel,
                    self.observer.clone(),
                    self.max_pending,
                );
                (
                    State::SessionActive {
                        identifier,
                        psm,
                        session,
                    },
                    Ok(()),
                )
            }
            other => {
                warn!("Refusing inbound channel while {:?}", other.phase());
                channel.close();
                (other, Ok(()))
            }
        }
    }

    /// Abandon the start sequence after a terminal failure
    fn fail(&mut self, state: State, error: ResponderError) -> Step {
        warn!("Responder failed: {}", error);
        let psm = state.psm();
        match state {
            State::Idle | State::WaitingForRadio { .. } => {}
            State::Registering { identifier } => self.radio.remove_service(identifier.uuid()),
            State::SessionActive {
                identifier,
                mut session,
                ..
            } => {
                session.close();
                self.teardown(identifier, psm);
            }
            State::Advertising { identifier }
            | State::CapabilityPublished { identifier, .. }
            | State::AwaitingChannel { identifier, .. } => self.teardown(identifier, psm),
        }
        (State::Idle, Err(error))
    }

    fn teardown(&mut self, identifier: PeerIdentifier, psm: Option<Psm>) {
        self.radio.stop_advertising();
        if let Some(psm) = psm {
            self.radio.unpublish_channel(psm);
        }
        self.radio.remove_service(identifier.uuid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{LinkEvent, RecordingObserver};
    use crate::transport::ble::gatt::SERVICE_NAME;
    use mockall::predicate::eq;
    use std::io;
    use std::sync::Arc;

    struct NullChannel;

    impl DuplexChannel for NullChannel {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn write_chunk(&mut self, _chunk: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    fn service_id() -> Uuid {
        PeerIdentifier::RESPONDER.uuid()
    }

    fn psm(value: u16) -> Psm {
        Psm::new(value).expect("psm")
    }

    /// Radio that accepts registration, advertising and publishing
    fn registering_radio() -> MockPeripheralRadio {
        let mut radio = MockPeripheralRadio::new();
        radio
            .expect_add_service()
            .withf(|s| s.uuid == service_id() && s.characteristic_uuids() == [PSM_CHARACTERISTIC_UUID])
            .times(1)
            .returning(|_| Ok(()));
        radio
            .expect_start_advertising()
            .withf(|name, services| name == SERVICE_NAME && services.iter().copied().eq([service_id()]))
            .times(1)
            .returning(|_, _| Ok(()));
        radio
            .expect_publish_channel()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));
        radio
    }

    fn started(radio: MockPeripheralRadio) -> (ResponderRole, Arc<RecordingObserver>) {
        let observer = RecordingObserver::new();
        let mut role = ResponderRole::new(
            Box::new(radio),
            ObserverSlot::new(observer.clone()),
            &LinkConfig::default(),
        );
        role.handle_event(PeripheralEvent::StateChanged(RadioState::PoweredOn))
            .expect("power");
        role.start(PeerIdentifier::RESPONDER).expect("start");
        role.handle_event(PeripheralEvent::ServiceAdded {
            service: service_id(),
            result: Ok(()),
        })
        .expect("service added");
        assert_eq!(role.phase(), ResponderPhase::Advertising);
        (role, observer)
    }

    #[test]
    fn test_read_before_publish_is_rejected() {
        let mut radio = registering_radio();
        radio
            .expect_respond_to_read()
            .with(
                eq(ReadRequestId(1)),
                eq(ReadResponse::Rejected(AttError::ReadNotPermitted)),
            )
            .times(1)
            .return_const(());
        let (mut role, _) = started(radio);

        role.handle_event(PeripheralEvent::ReadRequest {
            request: ReadRequestId(1),
            characteristic: PSM_CHARACTERISTIC_UUID,
        })
        .expect("read");
        assert_eq!(role.phase(), ResponderPhase::Advertising);
    }

    #[test]
    fn test_read_answers_latest_published_psm() {
        let mut radio = registering_radio();
        radio
            .expect_respond_to_read()
            .with(eq(ReadRequestId(2)), eq(ReadResponse::Value(br#"{"psm":5}"#.to_vec())))
            .times(1)
            .return_const(());
        radio
            .expect_respond_to_read()
            .with(eq(ReadRequestId(3)), eq(ReadResponse::Value(br#"{"psm":11}"#.to_vec())))
            .times(1)
            .return_const(());
        let (mut role, _) = started(radio);

        role.handle_event(PeripheralEvent::ChannelPublished { result: Ok(psm(5)) })
            .expect("publish");
        assert_eq!(role.phase(), ResponderPhase::CapabilityPublished);

        role.handle_event(PeripheralEvent::ReadRequest {
            request: ReadRequestId(2),
            characteristic: PSM_CHARACTERISTIC_UUID,
        })
        .expect("read");
        assert_eq!(role.phase(), ResponderPhase::AwaitingChannel);

        role.handle_event(PeripheralEvent::ChannelPublished { result: Ok(psm(11)) })
            .expect("republish");
        assert_eq!(role.psm(), Some(psm(11)));

        role.handle_event(PeripheralEvent::ReadRequest {
            request: ReadRequestId(3),
            characteristic: PSM_CHARACTERISTIC_UUID,
        })
        .expect("read");
    }

    #[test]
    fn test_unknown_characteristic_read_rejected() {
        let mut radio = registering_radio();
        radio
            .expect_respond_to_read()
            .with(
                eq(ReadRequestId(4)),
                eq(ReadResponse::Rejected(AttError::AttributeNotFound)),
            )
            .times(1)
            .return_const(());
        let (mut role, _) = started(radio);

        role.handle_event(PeripheralEvent::ReadRequest {
            request: ReadRequestId(4),
            characteristic: Uuid::from_u128(0x2A19),
        })
        .expect("read");
    }

    #[test]
    fn test_channel_opened_creates_single_session() {
        let mut radio = registering_radio();
        radio.expect_stop_advertising().times(1).return_const(());
        radio.expect_unpublish_channel().with(eq(psm(5))).times(1).return_const(());
        radio
            .expect_remove_service()
            .with(eq(service_id()))
            .times(1)
            .return_const(());
        let (mut role, observer) = started(radio);
        role.handle_event(PeripheralEvent::ChannelPublished { result: Ok(psm(5)) })
            .expect("publish");

        role.handle_event(PeripheralEvent::ChannelOpened {
            result: Ok(Box::new(NullChannel)),
        })
        .expect("open");
        assert_eq!(role.phase(), ResponderPhase::SessionActive);

        // A second channel while one is active is refused
        role.handle_event(PeripheralEvent::ChannelOpened {
            result: Ok(Box::new(NullChannel)),
        })
        .expect("second open");
        assert_eq!(observer.events().len(), 1);

        role.stop();
        role.stop();
        assert_eq!(role.phase(), ResponderPhase::Idle);
        assert_eq!(
            observer.events(),
            vec![
                LinkEvent::Opened { role: Role::Responder },
                LinkEvent::Closed { role: Role::Responder },
            ]
        );
    }

    #[test]
    fn test_session_end_returns_to_awaiting_channel() {
        let radio = registering_radio();
        let (mut role, observer) = started(radio);
        role.handle_event(PeripheralEvent::ChannelPublished { result: Ok(psm(5)) })
            .expect("publish");
        role.handle_event(PeripheralEvent::ChannelOpened {
            result: Ok(Box::new(NullChannel)),
        })
        .expect("open");

        role.handle_event(PeripheralEvent::Channel(ChannelEvent::Ended))
            .expect("ended");
        assert_eq!(role.phase(), ResponderPhase::AwaitingChannel);
        assert_eq!(role.psm(), Some(psm(5)));
        assert_eq!(
            observer.events().last(),
            Some(&LinkEvent::Closed { role: Role::Responder })
        );
    }

    #[test]
    fn test_service_registration_failure_is_terminal() {
        let mut radio = MockPeripheralRadio::new();
        radio.expect_add_service().times(1).returning(|_| Ok(()));
        radio.expect_start_advertising().never();
        let observer = RecordingObserver::new();
        let mut role = ResponderRole::new(
            Box::new(radio),
            ObserverSlot::new(observer),
            &LinkConfig::default(),
        );
        role.handle_event(PeripheralEvent::StateChanged(RadioState::PoweredOn))
            .expect("power");
        role.start(PeerIdentifier::RESPONDER).expect("start");

        let result = role.handle_event(PeripheralEvent::ServiceAdded {
            service: service_id(),
            result: Err("duplicate service".to_string()),
        });
        assert_eq!(
            result,
            Err(ResponderError::ServiceRegistration("duplicate service".to_string()))
        );
        assert_eq!(role.phase(), ResponderPhase::Idle);
    }

    #[test]
    fn test_start_waits_for_power() {
        let mut radio = MockPeripheralRadio::new();
        radio.expect_add_service().times(1).returning(|_| Ok(()));
        let mut role = ResponderRole::new(
            Box::new(radio),
            ObserverSlot::empty(),
            &LinkConfig::default(),
        );

        role.start(PeerIdentifier::RESPONDER).expect("start");
        assert_eq!(role.phase(), ResponderPhase::WaitingForRadio);
        assert_eq!(
            role.start(PeerIdentifier::RESPONDER),
            Err(ResponderError::AlreadyStarted)
        );

        role.handle_event(PeripheralEvent::StateChanged(RadioState::PoweredOn))
            .expect("power");
        assert_eq!(role.phase(), ResponderPhase::Registering);
    }
}
