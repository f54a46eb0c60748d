/// Channel session over one open L2CAP duplex channel
///
/// A session owns the channel handle exclusively. Outbound text goes through
/// [`FrameCodec::encode`]; inbound bytes go through a per-session
/// [`Reassembler`]. The session lives from the channel-opened event until the
/// channel ends, fails, or is closed locally; it is never reopened.

use super::framing::{FrameCodec, Reassembler, MAX_CHUNK};
use crate::observer::ObserverSlot;
use crate::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Byte-oriented duplex channel handed over by the radio once opened
pub trait DuplexChannel: Send {
    /// Non-blocking read of whatever is available, up to `buf.len()` bytes.
    /// `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one chunk in full or fail
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Close both directions
    fn close(&mut self);
}

impl fmt::Debug for dyn DuplexChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DuplexChannel")
    }
}

/// Stream readiness and lifecycle events for an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Inbound bytes are available
    Readable,
    /// The peer closed the stream
    Ended,
    /// The stream failed
    Failed(String),
}

/// Session state machine; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Closed,
}

/// Errors for session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Channel session is not open")]
    NotOpen,
    #[error("Write failed at chunk {index} of {total}: {reason}")]
    WriteFailed {
        index: usize,
        total: usize,
        reason: String,
    },
}

pub struct ChannelSession {
    role: Role,
    state: SessionState,
    channel: Box<dyn DuplexChannel>,
    reassembler: Reassembler,
    observer: ObserverSlot,
    read_buf: Vec<u8>,
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending", &self.reassembler.pending_len())
            .finish()
    }
}

impl ChannelSession {
    /// Take ownership of an opened channel and tell the observer it is
    /// writable
    pub fn open(
        role: Role,
        channel: Box<dyn DuplexChannel>,
        observer: ObserverSlot,
        max_pending: usize,
    ) -> Self {
        info!("{} channel session opened", role);
        let session = Self {
            role,
            state: SessionState::Open,
            channel,
            reassembler: Reassembler::with_limit(max_pending),
            observer,
            read_buf: vec![0u8; MAX_CHUNK],
        };
        session.observer.opened(role);
        session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Bytes of a partial inbound message currently held
    pub fn pending_len(&self) -> usize {
        self.reassembler.pending_len()
    }

    /// Frame and write `message`, returning the number of chunks written.
    ///
    /// A failed write aborts the rest of the message; the session stays open
    /// and the caller may resend.
    pub fn send(&mut self, message: &str) -> Result<usize, SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }

        let chunks = FrameCodec::encode(message);
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            self.channel
                .write_chunk(chunk.as_bytes())
                .map_err(|e| {
                    warn!("{} write failed at chunk {}/{}: {}", self.role, index + 1, total, e);
                    SessionError::WriteFailed {
                        index,
                        total,
                        reason: e.to_string(),
                    }
                })?;
        }

        debug!("{} sent {} bytes in {} chunks", self.role, message.len(), total);
        Ok(total)
    }

    /// Dispatch a channel event
    pub fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Readable => self.on_readable(),
            ChannelEvent::Ended => self.finish("end of stream"),
            ChannelEvent::Failed(reason) => self.finish(&reason),
        }
    }

    /// Read one delivery of at most [`MAX_CHUNK`] bytes and surface every
    /// message it completes
    pub fn on_readable(&mut self) {
        if !self.is_open() {
            return;
        }

        let count = match self.channel.read(&mut self.read_buf) {
            Ok(0) => {
                self.finish("end of stream");
                return;
            }
            Ok(count) => count,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return;
            }
            Err(e) => {
                self.finish(&e.to_string());
                return;
            }
        };

        debug!("{} read {} bytes", self.role, count);
        for result in self.reassembler.push(&self.read_buf[..count]) {
            match result {
                Ok(message) => self.observer.message(self.role, message),
                Err(e) => warn!("{} dropped inbound data: {}", self.role, e),
            }
        }
    }

    /// Close the channel locally
    pub fn close(&mut self) {
        self.finish("closed locally");
    }

    fn finish(&mut self, reason: &str) {
        if !self.is_open() {
            return;
        }
        self.state = SessionState::Closed;

        let dropped = self.reassembler.discard();
        if dropped > 0 {
            debug!("{} discarded {} bytes of unterminated message", self.role, dropped);
        }
        self.channel.close();
        info!("{} channel session closed: {}", self.role, reason);
        self.observer.closed(self.role);
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        if self.is_open() {
            self.channel.close();
        }
    }
}
