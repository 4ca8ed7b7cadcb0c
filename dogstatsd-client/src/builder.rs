use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use metrics::Label;
use thiserror::Error;

use crate::{
    buffer::OverflowStrategy,
    client::DogStatsDClient,
    config::{self, ConfigError},
    connection::DEFAULT_WRITE_TIMEOUT,
    forwarder::{Forwarder, ForwarderConfiguration, DEFAULT_FLUSH_INTERVAL},
    serializer::Serializer,
    telemetry::DEFAULT_TELEMETRY_FLUSH_INTERVAL,
};

/// Errors that could occur while building a DogStatsD client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The transport configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The maximum payload size is zero.
    #[error("maximum payload size must be greater than zero")]
    InvalidPayloadSize,

    /// The maximum payload size is too small to fit telemetry.
    #[error(
        "maximum payload size of {max_payload_size} bytes is too small to fit telemetry, which needs {required} bytes"
    )]
    TelemetryDoesNotFit {
        /// Configured maximum payload size, in bytes.
        max_payload_size: usize,
        /// Payload size needed to fit the largest telemetry message, in bytes.
        required: usize,
    },

    /// The default sample rate is outside of `[0, 1]`.
    #[error("invalid sample rate {0} (expected a value between 0 and 1)")]
    InvalidSampleRate(f64),

    /// Failed to spawn the background threads.
    #[error("failed to spawn background thread for the sender")]
    Backend(#[source] io::Error),
}

/// Builder for a DogStatsD client.
///
/// Every setting has a default, so `DogStatsDBuilder::default().build()` is enough to get a client sending to the
/// local Datadog Agent over UDP.
pub struct DogStatsDBuilder {
    host: Option<String>,
    port: Option<u16>,
    socket_path: Option<PathBuf>,
    max_payload_size: Option<usize>,
    max_pool_size: usize,
    overflow_strategy: OverflowStrategy,
    sender_queue_size: Option<usize>,
    single_thread: bool,
    flush_interval: Option<Duration>,
    telemetry_flush_interval: Option<Duration>,
    global_tags: Vec<Label>,
    namespace: Option<String>,
    sample_rate: Option<f64>,
    delayed_serialization: bool,
    write_timeout: Duration,
}

impl DogStatsDBuilder {
    /// Set the host to send to over UDP.
    ///
    /// When only one of the host and port is set, the other takes its default value.
    ///
    /// Explicitly configured transport settings take precedence over the environment: `DD_DOGSTATSD_URL` first, then
    /// `DD_AGENT_HOST`, `DD_DOGSTATSD_PORT`, and `DD_DOGSTATSD_SOCKET`. Without either, defaults to `127.0.0.1:8125`.
    #[must_use]
    pub fn with_host<H>(mut self, host: H) -> Self
    where
        H: Into<String>,
    {
        self.host = Some(host.into());
        self
    }

    /// Set the port to send to over UDP.
    ///
    /// Defaults to 8125.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the path of the Unix domain socket to send to.
    ///
    /// This cannot be combined with a host or port: building will fail if both are set.
    #[must_use]
    pub fn with_socket_path<P>(mut self, socket_path: P) -> Self
    where
        P: AsRef<Path>,
    {
        self.socket_path = Some(socket_path.as_ref().to_path_buf());
        self
    }

    /// Set the maximum payload size.
    ///
    /// This controls the maximum size of a single payload that will be sent to the remote server. Messages are
    /// batched into payloads up to this size, and a message that is larger on its own is handled according to the
    /// overflow strategy.
    ///
    /// This should generally be set to the same value (or lower) as `dogstatsd_buffer_size` in the Datadog Agent.
    ///
    /// Defaults to 1432 bytes over UDP, and 8192 bytes over Unix domain sockets.
    #[must_use]
    pub fn with_maximum_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = Some(max_payload_size);
        self
    }

    /// Set the maximum number of messages in a single payload.
    ///
    /// Defaults to no limit beyond the maximum payload size.
    #[must_use]
    pub fn with_maximum_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size.max(1);
        self
    }

    /// Set what happens to messages larger than the maximum payload size.
    ///
    /// Defaults to [`OverflowStrategy::Drop`].
    #[must_use]
    pub fn with_overflow_strategy(mut self, overflow_strategy: OverflowStrategy) -> Self {
        self.overflow_strategy = overflow_strategy;
        self
    }

    /// Set the sender queue size.
    ///
    /// With the default threaded sender, this is the number of messages that can be waiting for the worker thread
    /// before new messages start getting dropped. With the single-thread sender, this is the number of messages
    /// collected before they're moved into the payload buffer.
    ///
    /// Defaults to 2048 over UDP and 512 over Unix domain sockets, or 1 with the single-thread sender.
    #[must_use]
    pub fn with_sender_queue_size(mut self, sender_queue_size: usize) -> Self {
        self.sender_queue_size = Some(sender_queue_size);
        self
    }

    /// Sets whether payloads are written on the caller's thread rather than on a dedicated worker thread.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_single_thread(mut self, single_thread: bool) -> Self {
        self.single_thread = single_thread;
        self
    }

    /// Set the interval between periodic flushes of the payload buffer.
    ///
    /// Messages are otherwise only written out once a payload is full, or when explicitly flushed. `None` disables
    /// periodic flushing.
    ///
    /// Defaults to 3 seconds.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Option<Duration>) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the interval between telemetry flushes.
    ///
    /// When enabled, additional metrics are sent to the remote server, under the `datadog.dogstatsd.client`
    /// namespace, describing the operation of the client itself: how many metrics, events, and service checks were
    /// emitted, how many payloads and bytes were sent, and how many were dropped. `None` disables telemetry.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_telemetry_flush_interval(mut self, telemetry_flush_interval: Option<Duration>) -> Self {
        self.telemetry_flush_interval = telemetry_flush_interval;
        self
    }

    /// Set tags added to every message, telemetry included.
    ///
    /// Labels with an empty value are sent as bare tags.
    #[must_use]
    pub fn with_global_tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = Label>,
    {
        self.global_tags = tags.into_iter().collect();
        self
    }

    /// Set a namespace prepended to every metric name, separated by a dot.
    #[must_use]
    pub fn with_namespace<N>(mut self, namespace: N) -> Self
    where
        N: Into<String>,
    {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the default sample rate for metrics.
    ///
    /// Can be overridden for each metric. Defaults to sending every metric.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Sets whether metrics are serialized by the sender rather than by the caller.
    ///
    /// This moves serialization work off of the caller's thread when using the threaded sender. Oversized metrics can
    /// then no longer be rejected on the caller's thread, and are dropped instead.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_delayed_serialization(mut self, delayed_serialization: bool) -> Self {
        self.delayed_serialization = delayed_serialization;
        self
    }

    /// Set the write timeout for UDP sockets.
    ///
    /// When the write timeout is reached, the payload being sent at the time is dropped.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    fn forwarder_configuration<F>(&self, env: F) -> Result<ForwarderConfiguration, BuildError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transport =
            config::resolve_with_env(self.host.as_deref(), self.port, self.socket_path.as_deref(), env)?;

        Ok(ForwarderConfiguration {
            transport,
            max_payload_size: self.max_payload_size,
            max_pool_size: self.max_pool_size,
            overflow_strategy: self.overflow_strategy,
            flush_interval: self.flush_interval,
            sender_queue_size: self.sender_queue_size,
            single_thread: self.single_thread,
            telemetry_flush_interval: self.telemetry_flush_interval,
            global_tags: self.global_tags.clone(),
            write_timeout: self.write_timeout,
        })
    }

    /// Builds the forwarder, without a client on top.
    ///
    /// This is useful for sending messages that were serialized elsewhere.
    ///
    /// # Errors
    ///
    /// If the transport configuration is invalid or conflicting, if the maximum payload size is too small, or if the
    /// background threads cannot be spawned, an error is returned.
    pub fn build_forwarder(self) -> Result<Forwarder, BuildError> {
        let config = self.forwarder_configuration(|name| std::env::var(name).ok())?;
        Forwarder::new(config)
    }

    /// Builds the client.
    ///
    /// The sender starts right away, but nothing is sent until the first metric is emitted.
    ///
    /// # Errors
    ///
    /// If the transport configuration is invalid or conflicting, if the maximum payload size is too small, if the
    /// default sample rate is invalid, or if the background threads cannot be spawned, an error is returned.
    pub fn build(self) -> Result<DogStatsDClient, BuildError> {
        if let Some(rate) = self.sample_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(BuildError::InvalidSampleRate(rate));
            }
        }

        let serializer = Serializer::new(self.namespace.as_deref(), self.global_tags.clone());
        let sample_rate = self.sample_rate;
        let delayed_serialization = self.delayed_serialization;
        let forwarder = self.build_forwarder()?;

        Ok(DogStatsDClient::new(forwarder, serializer, sample_rate, delayed_serialization))
    }
}

impl Default for DogStatsDBuilder {
    fn default() -> Self {
        DogStatsDBuilder {
            host: None,
            port: None,
            socket_path: None,
            max_payload_size: None,
            max_pool_size: usize::MAX,
            overflow_strategy: OverflowStrategy::Drop,
            sender_queue_size: None,
            single_thread: false,
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            telemetry_flush_interval: Some(DEFAULT_TELEMETRY_FLUSH_INTERVAL),
            global_tags: Vec::new(),
            namespace: None,
            sample_rate: None,
            delayed_serialization: false,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}
