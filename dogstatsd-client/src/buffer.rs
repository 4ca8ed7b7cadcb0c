use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    connection::Transport,
    message::{Message, SendError},
    telemetry::{Telemetry, TelemetrySent},
};

/// Fraction of the maximum payload size kept as headroom before flushing preemptively.
///
/// Once a payload is within this margin of the maximum size, it's unlikely that another message will fit, so flushing
/// right away avoids holding on to an almost-full payload until the next message forces it out.
pub const PAYLOAD_SIZE_TOLERANCE: f64 = 0.05;

// Upper bound on the capacity reserved up front. Larger payloads grow the buffer as needed.
const MAX_INITIAL_CAPACITY: usize = 64 * 1024;

/// What to do with a message that is larger than the maximum payload size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Silently drop the message.
    #[default]
    Drop,

    /// Reject the message with [`SendError::MessageTooLarge`].
    Raise,
}

/// Message buffer configuration.
#[derive(Clone, Copy, Debug)]
pub struct BufferConfiguration {
    /// Maximum size of a single payload, in bytes.
    pub max_payload_size: usize,

    /// Maximum number of messages in a single payload.
    pub max_pool_size: usize,

    /// What to do with messages larger than `max_payload_size`.
    pub overflow_strategy: OverflowStrategy,
}

impl BufferConfiguration {
    /// Returns the payload size above which the buffer is flushed preemptively.
    pub fn preemptive_flush_threshold(&self) -> usize {
        (self.max_payload_size as f64 * (1.0 - PAYLOAD_SIZE_TOLERANCE)) as usize
    }
}

/// Accumulates messages into newline-delimited payloads.
///
/// DogStatsD messages are newline delimited, which means that multiple messages can be sent in a single payload, and
/// then trivially split apart by the server. This saves on the number of system calls required to send them.
///
/// A payload never exceeds the maximum payload size, nor the maximum number of messages. Whenever adding a message
/// would go over either limit, the current payload is written to the transport first.
///
/// The buffer is not thread-safe, and is meant to be exclusively owned by whatever drives it.
pub struct MessageBuffer {
    config: BufferConfiguration,
    flush_threshold: usize,
    buf: Vec<u8>,
    message_count: usize,
    transport: Box<dyn Transport>,
    telemetry: Option<Arc<Telemetry>>,
}

impl MessageBuffer {
    /// Creates a new `MessageBuffer` writing to the given transport.
    pub fn new(
        config: BufferConfiguration,
        transport: Box<dyn Transport>,
        telemetry: Option<Arc<Telemetry>>,
    ) -> Self {
        Self {
            flush_threshold: config.preemptive_flush_threshold(),
            buf: Vec::with_capacity(config.max_payload_size.min(MAX_INITIAL_CAPACITY)),
            message_count: 0,
            config,
            transport,
            telemetry,
        }
    }

    /// Returns the current payload length, in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if no messages are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the number of messages currently buffered.
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Adds a message to the buffer.
    ///
    /// Returns `Ok(true)` if the message was buffered (and potentially already written, if it filled the payload), or
    /// `Ok(false)` if it was dropped because it was empty, or too big under [`OverflowStrategy::Drop`].
    ///
    /// # Errors
    ///
    /// If the message is larger than the maximum payload size and the overflow strategy is
    /// [`OverflowStrategy::Raise`], an error is returned. The buffer is left untouched.
    pub fn add(&mut self, message: Message) -> Result<bool, SendError> {
        let message = message.into_bytes();
        if message.is_empty() {
            return Ok(false);
        }

        let max_payload_size = self.config.max_payload_size;
        if message.len() > max_payload_size {
            return match self.config.overflow_strategy {
                OverflowStrategy::Drop => {
                    debug!(message_len = message.len(), max_payload_size, "Dropping message too big for payload.");
                    Ok(false)
                }
                OverflowStrategy::Raise => {
                    Err(SendError::MessageTooLarge { len: message.len(), max_payload_size })
                }
            };
        }

        // Write out what we have if the message, plus its separator, would not fit in the current payload.
        if !self.buf.is_empty() && self.buf.len() + 1 + message.len() > max_payload_size {
            self.flush();
        }

        if !self.buf.is_empty() {
            self.buf.push(b'\n');
        }
        self.buf.extend_from_slice(&message);
        self.message_count += 1;

        // Flush preemptively when we're pretty sure another message won't fit.
        if self.message_count >= self.config.max_pool_size || self.buf.len() > self.flush_threshold {
            self.flush();
        }

        Ok(true)
    }

    /// Writes the current payload to the transport, if there is one, and clears the buffer.
    ///
    /// The buffer is cleared whether or not the write succeeded.
    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        let payload_len = self.buf.len() as u64;
        let result = self.transport.write(&self.buf);
        trace!(payload_len, message_count = self.message_count, ?result, "Flushed payload.");

        if let Some(telemetry) = &self.telemetry {
            if result.is_sent() {
                telemetry.sent(TelemetrySent { bytes: payload_len, packets: 1, ..Default::default() });
            } else {
                telemetry.dropped_writer(payload_len, 1);
            }
        }

        self.clear();
    }

    /// Discards the current payload, and resets the telemetry counters.
    ///
    /// This is used when the buffered state can no longer be trusted, such as after a fork.
    pub fn reset(&mut self) {
        self.clear();
        if let Some(telemetry) = &self.telemetry {
            telemetry.reset();
        }
    }

    /// Closes the underlying transport.
    pub fn close(&mut self) {
        self.transport.close();
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.message_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use proptest::{collection::vec as arb_vec, prelude::*, proptest};

    use super::{BufferConfiguration, MessageBuffer, OverflowStrategy};
    use crate::{
        message::{Message, SendError},
        telemetry::Telemetry,
        test_util::RecordingTransport,
    };

    fn buffer(
        max_payload_size: usize,
        max_pool_size: usize,
        overflow_strategy: OverflowStrategy,
    ) -> (MessageBuffer, RecordingTransport) {
        let transport = RecordingTransport::default();
        let config = BufferConfiguration { max_payload_size, max_pool_size, overflow_strategy };
        let buffer = MessageBuffer::new(config, Box::new(transport.clone()), None);
        (buffer, transport)
    }

    #[test]
    fn pool_size_triggers_flush() {
        let (mut buffer, transport) = buffer(100, 3, OverflowStrategy::Drop);

        assert_eq!(buffer.add(Message::from("aaaaaaaaaa")), Ok(true));
        assert_eq!(buffer.add(Message::from("bbbbbbbbbb")), Ok(true));
        assert!(transport.payloads().is_empty());

        assert_eq!(buffer.add(Message::from("cccccccccc")), Ok(true));
        assert_eq!(transport.payloads_as_strings(), ["aaaaaaaaaa\nbbbbbbbbbb\ncccccccccc"]);
        assert_eq!(transport.payloads()[0].len(), 32);
        assert!(buffer.is_empty());

        assert_eq!(buffer.add(Message::from("dddddddddd")), Ok(true));
        assert_eq!(transport.payloads().len(), 1);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.message_count(), 1);
    }

    #[test]
    fn flushes_before_exceeding_payload_size() {
        let (mut buffer, transport) = buffer(25, usize::MAX, OverflowStrategy::Drop);

        buffer.add(Message::from("aaaaaaaaaa")).unwrap();
        buffer.add(Message::from("bbbbbbbbbb")).unwrap();
        assert!(transport.payloads().is_empty());

        // 21 + 1 + 10 > 25, so the first two messages go out on their own.
        buffer.add(Message::from("cccccccccc")).unwrap();
        assert_eq!(transport.payloads_as_strings(), ["aaaaaaaaaa\nbbbbbbbbbb"]);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn byte_threshold_triggers_flush() {
        // The preemptive threshold is 95 bytes for a 100 byte payload.
        let (mut buffer, transport) = buffer(100, usize::MAX, OverflowStrategy::Drop);

        let message = "x".repeat(95);
        buffer.add(Message::from(message.clone())).unwrap();
        assert!(transport.payloads().is_empty());

        buffer.add(Message::from("y")).unwrap();
        assert_eq!(transport.payloads_as_strings(), [format!("{message}\ny")]);
    }

    #[test]
    fn huge_payload_limit_does_not_reserve_it() {
        let (mut buffer, transport) = buffer(usize::MAX, 2, OverflowStrategy::Drop);
        assert!(buffer.buf.capacity() <= super::MAX_INITIAL_CAPACITY);

        let large = "l".repeat(100 * 1024);
        assert!(buffer.add(Message::from(large.clone())).unwrap());
        assert!(buffer.add(Message::from("small")).unwrap());

        assert_eq!(transport.payloads_as_strings(), [format!("{large}\nsmall")]);
    }

    #[test]
    fn empty_messages_are_ignored() {
        let (mut buffer, transport) = buffer(100, 1, OverflowStrategy::Raise);

        assert_eq!(buffer.add(Message::from("")), Ok(false));
        assert!(buffer.is_empty());
        assert_eq!(buffer.message_count(), 0);

        buffer.flush();
        assert!(transport.payloads().is_empty());
    }

    #[test]
    fn oversized_messages_are_dropped() {
        let (mut buffer, transport) = buffer(10, usize::MAX, OverflowStrategy::Drop);
        buffer.add(Message::from("abc")).unwrap();

        assert_eq!(buffer.add(Message::from("x".repeat(11))), Ok(false));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.message_count(), 1);

        buffer.flush();
        assert_eq!(transport.payloads_as_strings(), ["abc"]);
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let (mut buffer, transport) = buffer(10, usize::MAX, OverflowStrategy::Raise);
        buffer.add(Message::from("abc")).unwrap();

        assert_eq!(
            buffer.add(Message::from("x".repeat(11))),
            Err(SendError::MessageTooLarge { len: 11, max_payload_size: 10 })
        );
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.message_count(), 1);
        assert!(transport.payloads().is_empty());
    }

    #[test]
    fn failed_writes_still_clear_the_buffer() {
        let transport = RecordingTransport::default();
        transport.fail_writes(true);

        let telemetry = Arc::new(Telemetry::new(Duration::from_secs(10), "udp", &[]));
        let config =
            BufferConfiguration { max_payload_size: 100, max_pool_size: 2, overflow_strategy: OverflowStrategy::Drop };
        let mut buffer = MessageBuffer::new(config, Box::new(transport.clone()), Some(Arc::clone(&telemetry)));

        buffer.add(Message::from("aaaa")).unwrap();
        buffer.add(Message::from("bbbb")).unwrap();
        assert!(buffer.is_empty());

        transport.fail_writes(false);
        buffer.add(Message::from("cccc")).unwrap();
        buffer.flush();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.packets_dropped_writer, 1);
        assert_eq!(snapshot.bytes_dropped_writer, 9);
        assert_eq!(snapshot.packets_sent, 1);
        assert_eq!(snapshot.bytes_sent, 4);
        assert_eq!(transport.payloads_as_strings(), ["cccc"]);
    }

    #[test]
    fn reset_discards_payload_and_telemetry() {
        let transport = RecordingTransport::default();
        let telemetry = Arc::new(Telemetry::new(Duration::from_secs(10), "udp", &[]));
        let config =
            BufferConfiguration { max_payload_size: 100, max_pool_size: 1, overflow_strategy: OverflowStrategy::Drop };
        let mut buffer = MessageBuffer::new(config, Box::new(transport.clone()), Some(Arc::clone(&telemetry)));

        buffer.add(Message::from("sent")).unwrap();
        assert_eq!(telemetry.snapshot().packets_sent, 1);

        let config = BufferConfiguration { max_pool_size: 10, ..config };
        let mut buffer = MessageBuffer::new(config, Box::new(transport.clone()), Some(Arc::clone(&telemetry)));
        buffer.add(Message::from("pending")).unwrap();
        buffer.reset();
        buffer.flush();

        assert_eq!(transport.payloads_as_strings(), ["sent"]);
        assert_eq!(telemetry.snapshot(), Default::default());
    }

    proptest! {
        #[test]
        fn payloads_preserve_order_and_respect_limits(
            max_payload_size in 16usize..512,
            max_pool_size in 1usize..32,
            messages in arb_vec("[a-z0-9.:|#]{1,48}", 1..256),
        ) {
            let (mut buffer, transport) = buffer(max_payload_size, max_pool_size, OverflowStrategy::Drop);

            for message in &messages {
                buffer.add(Message::from(message.clone())).unwrap();
            }
            buffer.flush();

            let payloads = transport.payloads_as_strings();
            for payload in &payloads {
                prop_assert!(payload.len() <= max_payload_size);
                prop_assert!(payload.split('\n').count() <= max_pool_size);
            }

            // Everything that fits is delivered, in order.
            let expected = messages.iter().filter(|m| m.len() <= max_payload_size).cloned().collect::<Vec<_>>();
            let actual = payloads.iter().flat_map(|p| p.split('\n')).map(str::to_string).collect::<Vec<_>>();
            prop_assert_eq!(actual, expected);
        }
    }
}
