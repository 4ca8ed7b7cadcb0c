use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Errors that could be returned to the caller when emitting a message.
///
/// Network and queueing failures are never reported this way: they are absorbed by the client and only show up in
/// its telemetry and logs. These errors indicate a message that could never be sent as-is.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The message is larger than the maximum payload size, and the client is configured to reject such messages.
    #[error("message of {len} bytes is too big for the payload limit of {max_payload_size} bytes")]
    MessageTooLarge {
        /// Length of the rejected message, in bytes.
        len: usize,
        /// Configured maximum payload size, in bytes.
        max_payload_size: usize,
    },

    /// The event is larger than the maximum event size, and truncation was not requested.
    #[error("event '{title}' of {len} bytes is too big (more than {max_event_size} bytes); event discarded")]
    EventTooLarge {
        /// Title of the rejected event.
        title: String,
        /// Serialized length of the rejected event, in bytes.
        len: usize,
        /// Maximum event size, in bytes.
        max_event_size: usize,
    },
}

/// What a message represents, for the purpose of internal telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// A metric: counter, gauge, histogram, distribution, timing, or set.
    Metric,

    /// An event.
    Event,

    /// A service check.
    ServiceCheck,

    /// Anything else, such as a pre-serialized message of unknown type or internal telemetry.
    Other,
}

enum Payload {
    Serialized(Bytes),
    Deferred(Box<dyn FnOnce() -> Bytes + Send>),
}

/// A single DogStatsD message.
///
/// Messages are either already serialized, or hold a closure that serializes them on the sender's side when they are
/// finally written into a payload. Either way, a message is consumed exactly once: it's either merged into a payload
/// or dropped.
pub struct Message {
    kind: MessageKind,
    payload: Payload,
}

impl Message {
    /// Creates a message from already-serialized bytes.
    ///
    /// The bytes must form a single DogStatsD line, without a trailing newline.
    pub fn new<B>(kind: MessageKind, serialized: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self { kind, payload: Payload::Serialized(serialized.into()) }
    }

    /// Creates a message whose serialization is deferred until it is added to a payload.
    pub fn deferred<F>(kind: MessageKind, serialize: F) -> Self
    where
        F: FnOnce() -> Bytes + Send + 'static,
    {
        Self { kind, payload: Payload::Deferred(Box::new(serialize)) }
    }

    /// Returns the kind of this message.
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns the serialized length of this message, if it has already been serialized.
    pub fn serialized_len(&self) -> Option<usize> {
        match &self.payload {
            Payload::Serialized(buf) => Some(buf.len()),
            Payload::Deferred(_) => None,
        }
    }

    /// Consumes the message, serializing it if necessary.
    pub fn into_bytes(self) -> Bytes {
        match self.payload {
            Payload::Serialized(buf) => buf,
            Payload::Deferred(serialize) => serialize(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        s.field("kind", &self.kind);
        match &self.payload {
            Payload::Serialized(buf) => s.field("payload", buf),
            Payload::Deferred(_) => s.field("payload", &"<deferred>"),
        };
        s.finish()
    }
}

impl From<Bytes> for Message {
    fn from(buf: Bytes) -> Self {
        Message::new(MessageKind::Other, buf)
    }
}

impl From<Vec<u8>> for Message {
    fn from(buf: Vec<u8>) -> Self {
        Message::new(MessageKind::Other, buf)
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::new(MessageKind::Other, s)
    }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Message::new(MessageKind::Other, s)
    }
}
