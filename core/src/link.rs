// PeerLink facade: both roles behind one command and observer surface
//
// The host bridge issues commands (start/stop either role, send) and
// receives opened/message/closed notifications. Radio callbacks for each
// role are routed in through `handle_central_event` and
// `handle_peripheral_event`.

use crate::config::LinkConfig;
use crate::observer::{LinkObserver, ObserverSlot};
use crate::transport::ble::{
    CentralEvent, CentralRadio, InitiatorPhase, InitiatorRole, PeripheralEvent, PeripheralRadio,
    ResponderPhase, ResponderRole,
};
use crate::{LinkError, Role};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PeerLink {
    config: LinkConfig,
    observer: ObserverSlot,
    initiator: InitiatorRole,
    responder: ResponderRole,
    /// Role whose session opened most recently; `send` prefers it
    preferred: Role,
}

impl PeerLink {
    /// Build a link over the platform radios. No observer is attached yet.
    pub fn new(
        central: Box<dyn CentralRadio>,
        peripheral: Box<dyn PeripheralRadio>,
        config: LinkConfig,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let observer = ObserverSlot::empty();
        Ok(Self {
            initiator: InitiatorRole::new(central, observer.clone(), &config),
            responder: ResponderRole::new(peripheral, observer.clone(), &config),
            observer,
            config,
            preferred: Role::Initiator,
        })
    }

    /// Attach an observer at construction
    pub fn with_observer(self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer.set(Some(observer));
        self
    }

    /// Replace or clear the observer
    pub fn set_observer(&self, observer: Option<Arc<dyn LinkObserver>>) {
        self.observer.set(observer);
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn initiator(&self) -> &InitiatorRole {
        &self.initiator
    }

    pub fn responder(&self) -> &ResponderRole {
        &self.responder
    }

    pub fn initiator_phase(&self) -> InitiatorPhase {
        self.initiator.phase()
    }

    pub fn responder_phase(&self) -> ResponderPhase {
        self.responder.phase()
    }

    pub fn start_initiator(&mut self) -> Result<(), LinkError> {
        let identifier = self.config.initiator_identifier;
        self.initiator.start(identifier).map_err(LinkError::from)
    }

    pub fn stop_initiator(&mut self) {
        self.initiator.stop();
    }

    pub fn start_responder(&mut self) -> Result<(), LinkError> {
        let identifier = self.config.responder_identifier;
        self.responder.start(identifier).map_err(LinkError::from)
    }

    pub fn stop_responder(&mut self) {
        self.responder.stop();
    }

    /// Stop both roles
    pub fn shutdown(&mut self) {
        self.initiator.stop();
        self.responder.stop();
    }

    /// Role that would carry the next `send`, if any session is open
    pub fn active_role(&self) -> Option<Role> {
        let initiator = self.initiator.session().is_some();
        let responder = self.responder.session().is_some();
        match (initiator, responder) {
            (true, true) => Some(self.preferred),
            (true, false) => Some(Role::Initiator),
            (false, true) => Some(Role::Responder),
            (false, false) => None,
        }
    }

    /// Send `message` over the active session, returning chunks written
    pub fn send(&mut self, message: &str) -> Result<usize, LinkError> {
        let session = match self.active_role() {
            Some(Role::Initiator) => self.initiator.session_mut(),
            Some(Role::Responder) => self.responder.session_mut(),
            None => None,
        };
        let session = session.ok_or(LinkError::NoActiveSession)?;
        session.send(message).map_err(LinkError::from)
    }

    /// Route an initiator radio callback
    pub fn handle_central_event(&mut self, event: CentralEvent) {
        let was_active = self.initiator.phase() == InitiatorPhase::SessionActive;
        match self.initiator.handle_event(event) {
            Ok(()) => {}
            Err(e) if e.is_terminal() => {
                warn!("Initiator error: {}", e);
                self.observer.error(Role::Initiator, &LinkError::from(e));
            }
            Err(e) => debug!("Initiator recoverable error: {}", e),
        }
        if !was_active && self.initiator.phase() == InitiatorPhase::SessionActive {
            self.preferred = Role::Initiator;
        }
    }

    /// Route a responder radio callback
    pub fn handle_peripheral_event(&mut self, event: PeripheralEvent) {
        let was_active = self.responder.phase() == ResponderPhase::SessionActive;
        if let Err(e) = self.responder.handle_event(event) {
            warn!("Responder error: {}", e);
            self.observer.error(Role::Responder, &LinkError::from(e));
        }
        if !was_active && self.responder.phase() == ResponderPhase::SessionActive {
            self.preferred = Role::Responder;
        }
    }
}
