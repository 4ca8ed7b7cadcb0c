use std::{path::Path, sync::Arc, time::Duration};

use metrics::Label;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    buffer::{BufferConfiguration, MessageBuffer, OverflowStrategy},
    builder::BuildError,
    config::TransportConfig,
    connection::{Connection, Transport, DEFAULT_WRITE_TIMEOUT},
    message::{Message, MessageKind, SendError},
    sender::{BufferFactory, Sender, SenderConfiguration},
    telemetry::{Telemetry, TelemetrySent, DEFAULT_TELEMETRY_FLUSH_INTERVAL},
};

/// Default maximum payload size over UDP.
///
/// Chosen to fit in a single Ethernet frame, after IP and UDP headers.
pub const UDP_DEFAULT_MAX_PAYLOAD_SIZE: usize = 1432;

/// Default maximum payload size over Unix domain sockets.
pub const UDS_DEFAULT_MAX_PAYLOAD_SIZE: usize = 8192;

/// Default sender queue size over UDP.
pub const UDP_DEFAULT_SENDER_QUEUE_SIZE: usize = 2048;

/// Default sender queue size over Unix domain sockets.
pub const UDS_DEFAULT_SENDER_QUEUE_SIZE: usize = 512;

/// Default batch size for the single-thread sender.
pub const SINGLE_THREAD_DEFAULT_SENDER_QUEUE_SIZE: usize = 1;

/// Default interval between periodic buffer flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

pub(crate) type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Forwarder configuration.
#[derive(Clone, Debug)]
pub struct ForwarderConfiguration {
    /// Where to send payloads.
    pub transport: TransportConfig,

    /// Maximum payload size, in bytes.
    ///
    /// When `None`, defaults to a value suited to the transport.
    pub max_payload_size: Option<usize>,

    /// Maximum number of messages in a single payload.
    pub max_pool_size: usize,

    /// What to do with messages larger than the maximum payload size.
    pub overflow_strategy: OverflowStrategy,

    /// Interval between periodic buffer flushes. `None` disables periodic flushing.
    pub flush_interval: Option<Duration>,

    /// Sender queue size, or batch size in single-thread mode.
    ///
    /// When `None`, defaults to a value suited to the transport and sender.
    pub sender_queue_size: Option<usize>,

    /// Whether to write payloads on the caller's thread rather than on a dedicated worker thread.
    pub single_thread: bool,

    /// Interval between telemetry flushes. `None` disables telemetry.
    pub telemetry_flush_interval: Option<Duration>,

    /// Tags added to every telemetry message.
    pub global_tags: Vec<Label>,

    /// Write timeout for UDP sockets.
    pub write_timeout: Duration,
}

impl ForwarderConfiguration {
    /// Returns the effective maximum payload size.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size.unwrap_or(match self.transport {
            TransportConfig::Udp { .. } => UDP_DEFAULT_MAX_PAYLOAD_SIZE,
            TransportConfig::Uds { .. } => UDS_DEFAULT_MAX_PAYLOAD_SIZE,
        })
    }

    /// Returns the effective sender queue size.
    pub fn sender_queue_size(&self) -> usize {
        self.sender_queue_size.unwrap_or(match (&self.transport, self.single_thread) {
            (_, true) => SINGLE_THREAD_DEFAULT_SENDER_QUEUE_SIZE,
            (TransportConfig::Udp { .. }, false) => UDP_DEFAULT_SENDER_QUEUE_SIZE,
            (TransportConfig::Uds { .. }, false) => UDS_DEFAULT_SENDER_QUEUE_SIZE,
        })
    }
}

impl Default for ForwarderConfiguration {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_payload_size: None,
            max_pool_size: usize::MAX,
            overflow_strategy: OverflowStrategy::Drop,
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            sender_queue_size: None,
            single_thread: false,
            telemetry_flush_interval: Some(DEFAULT_TELEMETRY_FLUSH_INTERVAL),
            global_tags: Vec::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Routes messages to the configured transport.
///
/// The forwarder ties everything together: a sender, buffering messages into payloads written to a connection, and
/// telemetry about all of it, periodically fed back into the same pipeline.
pub struct Forwarder {
    transport: TransportConfig,
    max_payload_size: usize,
    overflow_strategy: OverflowStrategy,
    sender: Sender,
    telemetry: Option<Arc<Telemetry>>,
    telemetry_flush: Mutex<()>,
}

impl Forwarder {
    /// Creates a new `Forwarder` and starts its sender.
    ///
    /// # Errors
    ///
    /// If the maximum payload size is zero, or too small to fit telemetry when telemetry is enabled, or if the sender's
    /// background threads cannot be spawned, an error is returned.
    pub fn new(config: ForwarderConfiguration) -> Result<Self, BuildError> {
        let transport = config.transport.clone();
        let write_timeout = config.write_timeout;
        Self::with_transport(
            config,
            Arc::new(move || -> Box<dyn Transport> { Box::new(Connection::new(transport.clone(), write_timeout)) }),
        )
    }

    pub(crate) fn with_transport(
        config: ForwarderConfiguration,
        transport_factory: TransportFactory,
    ) -> Result<Self, BuildError> {
        let max_payload_size = config.max_payload_size();
        if max_payload_size == 0 {
            return Err(BuildError::InvalidPayloadSize);
        }

        let telemetry = config.telemetry_flush_interval.map(|interval| {
            Arc::new(Telemetry::new(interval, config.transport.transport_id(), &config.global_tags))
        });
        if let Some(telemetry) = &telemetry {
            if !telemetry.would_fit_in(max_payload_size) {
                return Err(BuildError::TelemetryDoesNotFit {
                    max_payload_size,
                    required: telemetry.max_line_len(),
                });
            }
        }

        let buffer_config = BufferConfiguration {
            max_payload_size,
            max_pool_size: config.max_pool_size,
            overflow_strategy: config.overflow_strategy,
        };
        let buffer_telemetry = telemetry.clone();
        let factory: BufferFactory =
            Arc::new(move || MessageBuffer::new(buffer_config, transport_factory(), buffer_telemetry.clone()));

        let sender_config =
            SenderConfiguration { queue_size: config.sender_queue_size(), flush_interval: config.flush_interval };
        let sender = if config.single_thread {
            Sender::single_thread(sender_config, &factory)
        } else {
            Sender::threaded(sender_config, factory, telemetry.clone())
        };
        sender.start().map_err(BuildError::Backend)?;

        debug!(
            transport = config.transport.transport_id(),
            max_payload_size,
            sender_queue_size = sender_config.queue_size,
            single_thread = config.single_thread,
            telemetry = telemetry.is_some(),
            "Forwarder started."
        );

        Ok(Self {
            transport: config.transport,
            max_payload_size,
            overflow_strategy: config.overflow_strategy,
            sender,
            telemetry,
            telemetry_flush: Mutex::new(()),
        })
    }

    /// Sends a message.
    ///
    /// The message is handed off to the sender, and will be written out as part of a later payload. Transport and
    /// queueing failures are not reported here.
    ///
    /// # Errors
    ///
    /// If the message is larger than the maximum payload size, and the overflow strategy is
    /// [`OverflowStrategy::Raise`], an error is returned and the message is not sent.
    pub fn send_message(&self, message: Message) -> Result<(), SendError> {
        if self.overflow_strategy == OverflowStrategy::Raise {
            if let Some(len) = message.serialized_len() {
                if len > self.max_payload_size {
                    return Err(SendError::MessageTooLarge { len, max_payload_size: self.max_payload_size });
                }
            }
        }

        self.track_emitted(message.kind());
        self.sender.add(message);
        self.tick_telemetry();
        Ok(())
    }

    /// Flushes buffered messages.
    ///
    /// If `flush_telemetry` is `true`, telemetry is flushed into the pipeline first, whether or not it is due. If
    /// `sync` is `true`, waits until everything sent before this call has been written.
    pub fn flush(&self, flush_telemetry: bool, sync: bool) {
        if flush_telemetry {
            if let Some(telemetry) = &self.telemetry {
                let _guard = self.telemetry_flush.lock();
                self.flush_telemetry(telemetry);
            }
        }

        self.sender.flush(sync);
    }

    /// Waits until every message sent before this call has been processed by the sender.
    ///
    /// This does not flush: messages may still be sitting in the buffer afterwards.
    pub fn sync_with_outbound_io(&self) {
        self.sender.rendezvous();
    }

    /// Stops the sender, writing out whatever is still buffered, and closes the connection.
    ///
    /// Messages sent after closing are dropped.
    pub fn close(&self) {
        self.sender.stop(true);
    }

    /// Returns the configured transport.
    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Returns the host, when sending over UDP.
    pub fn host(&self) -> Option<&str> {
        self.transport.host()
    }

    /// Returns the port, when sending over UDP.
    pub fn port(&self) -> Option<u16> {
        self.transport.port()
    }

    /// Returns the socket path, when sending over a Unix domain socket.
    pub fn socket_path(&self) -> Option<&Path> {
        self.transport.socket_path()
    }

    /// Returns the transport type: `udp` or `uds`.
    pub fn transport_type(&self) -> &'static str {
        self.transport.transport_id()
    }

    /// Returns the effective maximum payload size.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Returns the telemetry, if enabled.
    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_deref()
    }

    /// Counts a message that was emitted, but dropped before reaching the forwarder, such as by sampling.
    pub(crate) fn track_emitted(&self, kind: MessageKind) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };

        let sent = match kind {
            MessageKind::Metric => TelemetrySent { metrics: 1, ..Default::default() },
            MessageKind::Event => TelemetrySent { events: 1, ..Default::default() },
            MessageKind::ServiceCheck => TelemetrySent { service_checks: 1, ..Default::default() },
            MessageKind::Other => return,
        };
        telemetry.sent(sent);
    }

    fn tick_telemetry(&self) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };

        if !telemetry.should_flush() {
            return;
        }

        // Only one caller gets to flush telemetry. Everyone else carries on.
        let Some(_guard) = self.telemetry_flush.try_lock() else {
            return;
        };
        if telemetry.should_flush() {
            self.flush_telemetry(telemetry);
        }
    }

    fn flush_telemetry(&self, telemetry: &Telemetry) {
        let lines = telemetry.flush();

        for line in lines {
            if line.len() > self.max_payload_size {
                // Checked at construction, so this can only mean the bound itself is wrong.
                error!(line_len = line.len(), max_payload_size = self.max_payload_size, "Telemetry line too large.");
                continue;
            }
            self.sender.add(Message::new(MessageKind::Other, line));
        }
    }
}
