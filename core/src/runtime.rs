// Single-task link runtime.
//
// `spawn_link` moves a `PeerLink` into a tokio task. Host commands and
// radio callbacks are funneled through one bounded queue, so every state
// transition and every observer notification happens on that task in
// arrival order.

use crate::link::PeerLink;
use crate::transport::ble::{CentralEvent, InitiatorPhase, PeripheralEvent, ResponderPhase};
use crate::{LinkError, Role};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Inputs accepted by the link task
#[derive(Debug)]
pub enum LinkCommand {
    StartInitiator {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    StopInitiator {
        reply: oneshot::Sender<()>,
    },
    StartResponder {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    StopResponder {
        reply: oneshot::Sender<()>,
    },
    /// Send text over the active session
    Send {
        message: String,
        reply: oneshot::Sender<Result<usize, LinkError>>,
    },
    /// Current phase of both roles
    Phases {
        reply: oneshot::Sender<(InitiatorPhase, ResponderPhase)>,
    },
    ActiveRole {
        reply: oneshot::Sender<Option<Role>>,
    },
    /// Initiator radio callback
    Central(CentralEvent),
    /// Responder radio callback
    Peripheral(PeripheralEvent),
    /// Answered once everything queued before it has been handled
    Flush {
        reply: oneshot::Sender<()>,
    },
    /// Stop both roles and end the task
    Shutdown,
}

/// Handle to communicate with the running link task
#[derive(Clone)]
pub struct LinkHandle {
    command_tx: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LinkCommand,
    ) -> Result<T, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| LinkError::RuntimeStopped)?;
        reply_rx.await.map_err(|_| LinkError::RuntimeStopped)
    }

    async fn post(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| LinkError::RuntimeStopped)
    }

    pub async fn start_initiator(&self) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::StartInitiator { reply })
            .await?
    }

    pub async fn stop_initiator(&self) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::StopInitiator { reply })
            .await
    }

    pub async fn start_responder(&self) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::StartResponder { reply })
            .await?
    }

    pub async fn stop_responder(&self) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::StopResponder { reply })
            .await
    }

    /// Send `message`, returning the number of chunks written
    pub async fn send(&self, message: impl Into<String>) -> Result<usize, LinkError> {
        let message = message.into();
        self.request(|reply| LinkCommand::Send { message, reply })
            .await?
    }

    pub async fn phases(&self) -> Result<(InitiatorPhase, ResponderPhase), LinkError> {
        self.request(|reply| LinkCommand::Phases { reply }).await
    }

    pub async fn active_role(&self) -> Result<Option<Role>, LinkError> {
        self.request(|reply| LinkCommand::ActiveRole { reply })
            .await
    }

    /// Queue an initiator radio callback
    pub async fn deliver_central(&self, event: CentralEvent) -> Result<(), LinkError> {
        self.post(LinkCommand::Central(event)).await
    }

    /// Queue a responder radio callback
    pub async fn deliver_peripheral(&self, event: PeripheralEvent) -> Result<(), LinkError> {
        self.post(LinkCommand::Peripheral(event)).await
    }

    /// Wait until everything queued so far has been handled
    pub async fn flush(&self) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::Flush { reply }).await
    }

    /// Stop both roles and end the task
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        self.post(LinkCommand::Shutdown).await
    }

    /// True once the task has ended
    pub fn is_stopped(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Move `link` onto its own task and return a handle to drive it.
///
/// The task ends on [`LinkHandle::shutdown`] or once every handle is
/// dropped; either way both roles are stopped first.
pub fn spawn_link(link: PeerLink) -> (LinkHandle, JoinHandle<()>) {
    let depth = link.config().event_queue_depth.max(1);
    let (command_tx, command_rx) = mpsc::channel::<LinkCommand>(depth);
    let task = tokio::spawn(run(link, command_rx));
    (LinkHandle { command_tx }, task)
}

async fn run(mut link: PeerLink, mut command_rx: mpsc::Receiver<LinkCommand>) {
    info!("Link runtime started");
    while let Some(command) = command_rx.recv().await {
        match command {
            LinkCommand::StartInitiator { reply } => {
                let _ = reply.send(link.start_initiator());
            }
            LinkCommand::StopInitiator { reply } => {
                link.stop_initiator();
                let _ = reply.send(());
            }
            LinkCommand::StartResponder { reply } => {
                let _ = reply.send(link.start_responder());
            }
            LinkCommand::StopResponder { reply } => {
                link.stop_responder();
                let _ = reply.send(());
            }
            LinkCommand::Send { message, reply } => {
                let _ = reply.send(link.send(&message));
            }
            LinkCommand::Phases { reply } => {
                let _ = reply.send((link.initiator_phase(), link.responder_phase()));
            }
            LinkCommand::ActiveRole { reply } => {
                let _ = reply.send(link.active_role());
            }
            LinkCommand::Central(event) => link.handle_central_event(event),
            LinkCommand::Peripheral(event) => link.handle_peripheral_event(event),
            LinkCommand::Flush { reply } => {
                let _ = reply.send(());
            }
            LinkCommand::Shutdown => {
                debug!("Link runtime shutdown requested");
                break;
            }
        }
    }
    link.shutdown();
    info!("Link runtime stopped");
}
