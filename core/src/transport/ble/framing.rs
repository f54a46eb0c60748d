/// Chunked stream framing for the L2CAP text channel
///
/// The channel only guarantees ordered delivery of bytes, so each logical
/// message is terminated with the ASCII sentinel `EOF`, cut into
/// `MAX_CHUNK`-sized pieces, and the last piece is right-padded with spaces.
/// The receiver accumulates bytes until it sees a sentinel and then emits the
/// text that preceded it, with padding trimmed away.
///
/// Both peers must agree bit-for-bit on `MAX_CHUNK`, `PADDING_BYTE` and
/// `SENTINEL`.

use std::fmt;
use std::ops::Deref;
use thiserror::Error;

/// Size of every chunk written to the channel
pub const MAX_CHUNK: usize = 1024;

/// Byte used to pad the final chunk of a message
pub const PADDING_BYTE: u8 = b' ';

/// End-of-message marker appended to every outbound message
pub const SENTINEL: &str = "EOF";

/// Default bound on a not-yet-terminated inbound message (1 MiB)
pub const DEFAULT_MAX_PENDING: usize = 1024 * 1024;

/// Errors raised while reassembling inbound messages.
///
/// Both are recoverable: the offending bytes are dropped and the stream
/// continues with the next message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Inbound message is not valid UTF-8 ({len} bytes dropped)")]
    Decode { len: usize },
    #[error("Pending message exceeded {limit} bytes and was dropped")]
    Overflow { limit: usize },
}

/// One fixed-size unit on the wire
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk(Box<[u8; MAX_CHUNK]>);

impl Chunk {
    /// Copy `piece` into a fresh chunk, padding the tail with [`PADDING_BYTE`].
    ///
    /// `piece` must not be longer than [`MAX_CHUNK`]; extra bytes are cut.
    fn padded(piece: &[u8]) -> Self {
        let mut bytes = Box::new([PADDING_BYTE; MAX_CHUNK]);
        let len = piece.len().min(MAX_CHUNK);
        bytes[..len].copy_from_slice(&piece[..len]);
        Self(bytes)
    }

    /// Raw bytes of the chunk
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// Number of trailing padding bytes
    pub fn padding_len(&self) -> usize {
        self.0.iter().rev().take_while(|b| **b == PADDING_BYTE).count()
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let content = MAX_CHUNK - self.padding_len();
        write!(f, "Chunk {{ content: {}, padding: {} }}", content, MAX_CHUNK - content)
    }
}

/// Stateless outbound side of the framing protocol
pub struct FrameCodec;

impl FrameCodec {
    /// Frame `message` into chunks ready to be written in order.
    ///
    /// Always returns at least one chunk, and every chunk is exactly
    /// [`MAX_CHUNK`] bytes.
    pub fn encode(message: &str) -> Vec<Chunk> {
        let mut framed = Vec::with_capacity(message.len() + SENTINEL.len());
        framed.extend_from_slice(message.as_bytes());
        framed.extend_from_slice(SENTINEL.as_bytes());

        framed.chunks(MAX_CHUNK).map(Chunk::padded).collect()
    }

    /// Number of chunks [`FrameCodec::encode`] produces for a message of
    /// `message_len` bytes
    pub fn chunk_count(message_len: usize) -> usize {
        (message_len + SENTINEL.len()).div_ceil(MAX_CHUNK)
    }
}

/// Inbound side of the framing protocol.
///
/// Holds the pending buffer for one channel session. Bytes are kept raw
/// until a sentinel completes a message, so a read that splits a sentinel
/// or a multi-byte character across two deliveries is handled the same as
/// an unsplit one.
///
/// A message longer than the limit is reported once as
/// [`FramingError::Overflow`]; everything up to its sentinel is then skipped
/// so no part of it is ever delivered.
#[derive(Debug)]
pub struct Reassembler {
    pending: Vec<u8>,
    max_pending: usize,
    // Skipping the remainder of an overflowed message. `pending` then holds
    // only the lookback for a straddling sentinel.
    discarding: bool,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    /// Create a reassembler with the default pending limit
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }

    /// Create a reassembler that drops a pending message once it grows past
    /// `max_pending` bytes
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
            discarding: false,
        }
    }

    /// Bytes held for the current unterminated message
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True when no partial message is being held or skipped
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && !self.discarding
    }

    /// Drop any partial message, returning how many bytes were discarded
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.discarding = false;
        dropped
    }

    /// Feed one inbound delivery and collect every message it completes.
    ///
    /// Results are in sentinel order. An `Err` entry stands for a message
    /// that was dropped; later entries are unaffected.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, FramingError>> {
        let mut completed = Vec::new();
        let bytes = if self.discarding {
            match self.skip_overflowed(bytes) {
                Some(rest) => rest,
                None => return completed,
            }
        } else {
            bytes
        };
        let bytes = if self.pending.is_empty() {
            strip_leading_padding(bytes)
        } else {
            bytes
        };
        if bytes.is_empty() {
            return completed;
        }

        // A sentinel may straddle the previous delivery and this one
        let mut cursor = self.pending.len().saturating_sub(SENTINEL.len() - 1);
        self.pending.extend_from_slice(bytes);

        let mut start = 0;
        while let Some(offset) = find_sentinel(&self.pending[cursor..]) {
            let end = cursor + offset;
            if end - start > self.max_pending {
                completed.push(Err(FramingError::Overflow {
                    limit: self.max_pending,
                }));
            } else if let Some(result) = finish_message(&self.pending[start..end]) {
                completed.push(result);
            }
            start = end + SENTINEL.len();
            cursor = start;
        }

        self.pending.drain(..start);
        let padding = self.pending.len() - strip_leading_padding(&self.pending).len();
        self.pending.drain(..padding);

        if self.pending.len() > self.max_pending {
            let lookback = self.pending.len().saturating_sub(SENTINEL.len() - 1);
            self.pending.drain(..lookback);
            self.discarding = true;
            completed.push(Err(FramingError::Overflow {
                limit: self.max_pending,
            }));
        }

        completed
    }

    /// Drop bytes of an overflowed message through its sentinel. Returns
    /// what follows the sentinel, or `None` while it has not arrived.
    fn skip_overflowed<'a>(&mut self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        let held = self.pending.len();
        self.pending.extend_from_slice(bytes);

        match find_sentinel(&self.pending) {
            Some(offset) => {
                // The held lookback never contains a whole sentinel
                let resume = offset + SENTINEL.len() - held;
                self.pending.clear();
                self.discarding = false;
                Some(&bytes[resume..])
            }
            None => {
                let lookback = self.pending.len().saturating_sub(SENTINEL.len() - 1);
                self.pending.drain(..lookback);
                None
            }
        }
    }
}

fn find_sentinel(haystack: &[u8]) -> Option<usize> {
    let needle = SENTINEL.as_bytes();
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_padding(byte: &u8) -> bool {
    matches!(*byte, b' ' | b'\t')
}

fn strip_leading_padding(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|b| is_padding(b)).count();
    &bytes[skip..]
}

fn strip_padding(bytes: &[u8]) -> &[u8] {
    let bytes = strip_leading_padding(bytes);
    let end = bytes.iter().rposition(|b| !is_padding(b)).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Trim and decode one completed message. Empty messages are absorbed.
fn finish_message(raw: &[u8]) -> Option<Result<String, FramingError>> {
    let trimmed = strip_padding(raw);
    if trimmed.is_empty() {
        return None;
    }
    match std::str::from_utf8(trimmed) {
        Ok(text) => Some(Ok(text.to_string())),
        Err(_) => Some(Err(FramingError::Decode { len: raw.len() })),
    }
}
