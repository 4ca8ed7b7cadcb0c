use std::path::Path;

use metrics::Label;
use quanta::Clock;
use tracing::debug;

use crate::{
    forwarder::Forwarder,
    message::{Message, MessageKind, SendError},
    serializer::{
        EventOptions, MetricType, MetricValue, Serializer, ServiceCheckOptions, ServiceCheckStatus,
    },
    telemetry::Telemetry,
};

/// Per-metric options.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricOptions<'a> {
    /// Tags for this metric, sent before the global tags.
    pub tags: &'a [Label],

    /// Sample rate for this metric, overriding the client's default.
    pub sample_rate: Option<f64>,

    /// Whether the caller already sampled this metric.
    ///
    /// The sample rate is still sent along, so that the server can scale the value back up, but the client won't
    /// sample it again.
    pub pre_sampled: bool,
}

impl<'a> MetricOptions<'a> {
    /// Creates options with the given tags.
    pub fn with_tags(tags: &'a [Label]) -> Self {
        Self { tags, ..Default::default() }
    }

    /// Sets the sample rate.
    #[must_use]
    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Marks the metric as already sampled.
    #[must_use]
    pub fn pre_sampled(mut self) -> Self {
        self.pre_sampled = true;
        self
    }
}

// Owned copy of a metric value, for serializing later on another thread.
enum OwnedMetricValue {
    Integer(i64),
    FloatingPoint(f64),
    Raw(String),
}

impl OwnedMetricValue {
    fn as_value(&self) -> MetricValue<'_> {
        match self {
            OwnedMetricValue::Integer(v) => MetricValue::Integer(*v),
            OwnedMetricValue::FloatingPoint(v) => MetricValue::FloatingPoint(*v),
            OwnedMetricValue::Raw(v) => MetricValue::Raw(v),
        }
    }
}

impl From<MetricValue<'_>> for OwnedMetricValue {
    fn from(value: MetricValue<'_>) -> Self {
        match value {
            MetricValue::Integer(v) => OwnedMetricValue::Integer(v),
            MetricValue::FloatingPoint(v) => OwnedMetricValue::FloatingPoint(v),
            MetricValue::Raw(v) => OwnedMetricValue::Raw(v.to_string()),
        }
    }
}

/// A DogStatsD client.
///
/// The client serializes metrics, events, and service checks, and hands them off to its [`Forwarder`], which batches
/// them into payloads in the background. Emitting never blocks on the network, and never fails because of it: the
/// only errors returned are for messages that could never be sent as-is.
///
/// The client can be shared between threads.
///
/// Build one with [`DogStatsDBuilder`](crate::DogStatsDBuilder).
pub struct DogStatsDClient {
    forwarder: Forwarder,
    serializer: Serializer,
    sample_rate: Option<f64>,
    delayed_serialization: bool,
    clock: Clock,
}

impl DogStatsDClient {
    pub(crate) fn new(
        forwarder: Forwarder,
        serializer: Serializer,
        sample_rate: Option<f64>,
        delayed_serialization: bool,
    ) -> Self {
        Self { forwarder, serializer, sample_rate, delayed_serialization, clock: Clock::new() }
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Increments a counter by one.
    ///
    /// # Errors
    ///
    /// See [`count`](DogStatsDClient::count).
    pub fn increment(&self, name: &str, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.count(name, 1, options)
    }

    /// Decrements a counter by one.
    ///
    /// # Errors
    ///
    /// See [`count`](DogStatsDClient::count).
    pub fn decrement(&self, name: &str, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.count(name, -1, options)
    }

    /// Adds `value` to a counter.
    ///
    /// # Errors
    ///
    /// If the metric is larger than the maximum payload size, and the client is configured to reject such messages,
    /// an error is returned.
    pub fn count(&self, name: &str, value: i64, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.send_stat(name, MetricValue::Integer(value), MetricType::Counter, options)
    }

    /// Sets a gauge.
    ///
    /// # Errors
    ///
    /// See [`count`](DogStatsDClient::count).
    pub fn gauge(&self, name: &str, value: f64, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.send_stat(name, MetricValue::FloatingPoint(value), MetricType::Gauge, options)
    }

    /// Records a value in a histogram.
    ///
    /// # Errors
    ///
    /// See [`count`](DogStatsDClient::count).
    pub fn histogram(&self, name: &str, value: f64, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.send_stat(name, MetricValue::FloatingPoint(value), MetricType::Histogram, options)
    }

    /// Records a value in a distribution.
    ///
    /// # Errors
    ///
    /// See [`count`](DogStatsDClient::count).
    pub fn distribution(&self, name: &str, value: f64, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.send_stat(name, MetricValue::FloatingPoint(value), MetricType::Distribution, options)
    }

    /// Records a timing, in milliseconds.
    ///
    /// # Errors
    ///
    /// See [`count`](DogStatsDClient::count).
    pub fn timing(&self, name: &str, millis: f64, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.send_stat(name, MetricValue::FloatingPoint(millis), MetricType::Timing, options)
    }

    /// Runs `f`, and records how long it took as a timing.
    ///
    /// The timing is recorded even if `f` panics. Failing to record it is not reported.
    pub fn time<F, T>(&self, name: &str, options: &MetricOptions<'_>, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = TimingGuard::new(self, name, options, MetricType::Timing);
        f()
    }

    /// Runs `f`, and records how long it took, in milliseconds, in a distribution.
    ///
    /// The value is recorded even if `f` panics. Failing to record it is not reported.
    pub fn distribution_time<F, T>(&self, name: &str, options: &MetricOptions<'_>, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = TimingGuard::new(self, name, options, MetricType::Distribution);
        f()
    }

    /// Adds a value to a set, counting unique occurrences.
    ///
    /// # Errors
    ///
    /// See [`count`](DogStatsDClient::count).
    pub fn set(&self, name: &str, value: &str, options: &MetricOptions<'_>) -> Result<(), SendError> {
        self.send_stat(name, MetricValue::Raw(value), MetricType::Set, options)
    }

    /// Sends an event.
    ///
    /// # Errors
    ///
    /// If the event is larger than 8 KiB and truncation was not requested, or if it is larger than the maximum payload
    /// size and the client is configured to reject such messages, an error is returned.
    pub fn event(&self, title: &str, text: &str, options: &EventOptions, tags: &[Label]) -> Result<(), SendError> {
        let serialized = self.serializer.to_event(title, text, options, tags)?;
        self.forwarder.send_message(Message::new(MessageKind::Event, serialized))
    }

    /// Sends a service check.
    ///
    /// # Errors
    ///
    /// If the service check is larger than the maximum payload size, and the client is configured to reject such
    /// messages, an error is returned.
    pub fn service_check(
        &self,
        name: &str,
        status: ServiceCheckStatus,
        options: &ServiceCheckOptions,
        tags: &[Label],
    ) -> Result<(), SendError> {
        let serialized = self.serializer.to_service_check(name, status, options, tags);
        self.forwarder.send_message(Message::new(MessageKind::ServiceCheck, serialized))
    }

    /// Runs `f`, then flushes and waits for everything it emitted to be written.
    pub fn batch<F>(&self, f: F)
    where
        F: FnOnce(&Self),
    {
        f(self);
        self.flush(false, true);
    }

    /// Flushes buffered messages.
    ///
    /// If `flush_telemetry` is `true`, telemetry is sent along, whether or not it is due. If `sync` is `true`, waits
    /// until everything emitted before this call has been written.
    pub fn flush(&self, flush_telemetry: bool, sync: bool) {
        self.forwarder.flush(flush_telemetry, sync);
    }

    /// Waits until everything emitted before this call has been processed by the sender.
    pub fn sync_with_outbound_io(&self) {
        self.forwarder.sync_with_outbound_io();
    }

    /// Closes the client.
    ///
    /// If `flush` is `true`, buffered messages are flushed first. Anything emitted afterwards is dropped.
    pub fn close(&self, flush: bool) {
        if flush {
            self.flush(false, true);
        }
        self.forwarder.close();
    }

    /// Returns the namespace prepended to metric names, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.serializer.namespace()
    }

    /// Returns the global tags.
    pub fn global_tags(&self) -> &[Label] {
        self.serializer.global_tags()
    }

    /// Returns the default sample rate, if any.
    pub fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }

    /// Returns the host, when sending over UDP.
    pub fn host(&self) -> Option<&str> {
        self.forwarder.host()
    }

    /// Returns the port, when sending over UDP.
    pub fn port(&self) -> Option<u16> {
        self.forwarder.port()
    }

    /// Returns the socket path, when sending over a Unix domain socket.
    pub fn socket_path(&self) -> Option<&Path> {
        self.forwarder.socket_path()
    }

    /// Returns the transport type: `udp` or `uds`.
    pub fn transport_type(&self) -> &'static str {
        self.forwarder.transport_type()
    }

    /// Returns the client telemetry, if enabled.
    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.forwarder.telemetry()
    }

    /// Returns the underlying forwarder.
    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    fn send_stat(
        &self,
        name: &str,
        value: MetricValue<'_>,
        metric_type: MetricType,
        options: &MetricOptions<'_>,
    ) -> Result<(), SendError> {
        let sample_rate = options.sample_rate.or(self.sample_rate);
        if let Some(rate) = sample_rate {
            if !options.pre_sampled && !should_sample(rate) {
                // Sampled out metrics were still emitted, as far as telemetry is concerned.
                self.forwarder.track_emitted(MessageKind::Metric);
                return Ok(());
            }
        }

        let message = if self.delayed_serialization {
            let serializer = self.serializer.clone();
            let name = name.to_string();
            let value = OwnedMetricValue::from(value);
            let tags = options.tags.to_vec();
            Message::deferred(MessageKind::Metric, move || {
                serializer.to_stat(&name, value.as_value(), metric_type, &tags, sample_rate)
            })
        } else {
            let serialized = self.serializer.to_stat(name, value, metric_type, options.tags, sample_rate);
            Message::new(MessageKind::Metric, serialized)
        };

        self.forwarder.send_message(message)
    }
}

fn should_sample(rate: f64) -> bool {
    rate >= 1.0 || rand::random::<f64>() < rate
}

struct TimingGuard<'a> {
    client: &'a DogStatsDClient,
    name: &'a str,
    options: MetricOptions<'a>,
    metric_type: MetricType,
    start: quanta::Instant,
}

impl<'a> TimingGuard<'a> {
    fn new(client: &'a DogStatsDClient, name: &'a str, options: &MetricOptions<'a>, metric_type: MetricType) -> Self {
        Self { client, name, options: *options, metric_type, start: client.clock.now() }
    }
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.client.clock.now().duration_since(self.start);
        let millis = elapsed.as_secs_f64() * 1000.0;
        let value = MetricValue::FloatingPoint(millis);

        if let Err(e) = self.client.send_stat(self.name, value, self.metric_type, &self.options) {
            debug!(error = %e, name = self.name, "Failed to record timing.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use metrics::Label;
    use quanta::Clock;

    use super::{DogStatsDClient, MetricOptions};
    use crate::{
        buffer::OverflowStrategy,
        connection::Transport,
        forwarder::{Forwarder, ForwarderConfiguration},
        message::SendError,
        serializer::{
            EventOptions, Serializer, ServiceCheckOptions, ServiceCheckStatus, MAX_EVENT_SIZE,
        },
        test_util::RecordingTransport,
    };

    struct Harness {
        client: DogStatsDClient,
        transport: RecordingTransport,
    }

    impl Harness {
        fn new(namespace: Option<&str>, sample_rate: Option<f64>, delayed_serialization: bool) -> Self {
            Self::with_config(namespace, sample_rate, delayed_serialization, ForwarderConfiguration::default())
        }

        fn with_config(
            namespace: Option<&str>,
            sample_rate: Option<f64>,
            delayed_serialization: bool,
            config: ForwarderConfiguration,
        ) -> Self {
            let transport = RecordingTransport::default();
            let forwarder_transport = transport.clone();
            let config = ForwarderConfiguration { flush_interval: None, ..config };
            let forwarder = Forwarder::with_transport(
                config,
                Arc::new(move || -> Box<dyn Transport> { Box::new(forwarder_transport.clone()) }),
            )
            .unwrap();

            let serializer = Serializer::new(namespace, vec![Label::new("env", "test")]);
            let client = DogStatsDClient::new(forwarder, serializer, sample_rate, delayed_serialization);
            Self { client, transport }
        }

        fn messages(&self) -> Vec<String> {
            self.client.flush(false, true);
            self.transport.messages()
        }
    }

    #[test]
    fn emits_every_metric_type() {
        let harness = Harness::new(Some("app"), None, false);
        let client = &harness.client;
        let tags = [Label::new("route", "/home")];
        let options = MetricOptions::with_tags(&tags);

        client.increment("requests", &options).unwrap();
        client.decrement("workers", &MetricOptions::default()).unwrap();
        client.count("bytes", 512, &options).unwrap();
        client.gauge("queue.depth", 12.5, &options).unwrap();
        client.histogram("latency", 3.0, &options).unwrap();
        client.distribution("payload", 0.25, &options).unwrap();
        client.timing("render", 42.0, &options).unwrap();
        client.set("users", "alice", &options).unwrap();

        assert_eq!(
            harness.messages(),
            [
                "app.requests:1|c|#route:/home,env:test",
                "app.workers:-1|c|#env:test",
                "app.bytes:512|c|#route:/home,env:test",
                "app.queue.depth:12.5|g|#route:/home,env:test",
                "app.latency:3.0|h|#route:/home,env:test",
                "app.payload:0.25|d|#route:/home,env:test",
                "app.render:42.0|ms|#route:/home,env:test",
                "app.users:alice|s|#route:/home,env:test",
            ]
        );
        assert_eq!(client.telemetry().unwrap().snapshot().metrics, 8);
    }

    #[test]
    fn delayed_serialization_produces_same_lines() {
        let eager = Harness::new(None, None, false);
        let delayed = Harness::new(None, None, true);
        let tags = [Label::new("shard", "3")];

        for harness in [&eager, &delayed] {
            let options = MetricOptions::with_tags(&tags).sample_rate(1.0);
            harness.client.count("hits", 3, &options).unwrap();
            harness.client.set("visitors", "bob", &options).unwrap();
        }

        assert_eq!(eager.messages(), delayed.messages());
        assert_eq!(delayed.messages(), ["hits:3|c|#shard:3,env:test", "visitors:bob|s|#shard:3,env:test"]);
    }

    #[test]
    fn sampling() {
        let harness = Harness::new(None, Some(0.0), false);
        let client = &harness.client;

        // Sampled out, but still counted.
        client.increment("dropped", &MetricOptions::default()).unwrap();
        assert_eq!(client.telemetry().unwrap().snapshot().metrics, 1);

        // Already sampled by the caller: sent with its rate.
        client.increment("kept", &MetricOptions::default().sample_rate(0.5).pre_sampled()).unwrap();

        // Per-metric rate overrides the default.
        client.increment("always", &MetricOptions::default().sample_rate(1.0)).unwrap();

        assert_eq!(harness.messages(), ["kept:1|c|@0.5|#env:test", "always:1|c|#env:test"]);
        assert_eq!(client.telemetry().unwrap().snapshot().metrics, 3);
    }

    #[test]
    fn time_records_elapsed_milliseconds() {
        let (clock, mock) = Clock::mock();
        let harness = Harness::new(None, None, false);
        let client = harness.client.with_clock(clock);

        let result = client.time("work", &MetricOptions::default(), || {
            mock.increment(Duration::from_millis(250));
            "done"
        });
        assert_eq!(result, "done");

        client.distribution_time("work.dist", &MetricOptions::default(), || {
            mock.increment(Duration::from_millis(5));
        });

        client.flush(false, true);
        assert_eq!(harness.transport.messages(), ["work:250.0|ms|#env:test", "work.dist:5.0|d|#env:test"]);
    }

    #[test]
    fn events_and_service_checks() {
        let harness = Harness::new(None, None, false);
        let client = &harness.client;

        client.event("Deploy", "v1.2.3 is out", &EventOptions::default(), &[]).unwrap();
        client
            .service_check(
                "app.can_connect",
                ServiceCheckStatus::Critical,
                &ServiceCheckOptions { message: Some("timed out".to_string()), ..Default::default() },
                &[],
            )
            .unwrap();

        let text = "x".repeat(MAX_EVENT_SIZE);
        let result = client.event("Too big", &text, &EventOptions::default(), &[]);
        assert!(matches!(result, Err(SendError::EventTooLarge { .. })));

        assert_eq!(
            harness.messages(),
            ["_e{6,13}:Deploy|v1.2.3 is out|#env:test", "_sc|app.can_connect|2|#env:test|m:timed out"]
        );

        let snapshot = client.telemetry().unwrap().snapshot();
        assert_eq!(snapshot.events, 1);
        assert_eq!(snapshot.service_checks, 1);
    }

    #[test]
    fn oversized_metric_is_rejected_when_configured() {
        let config = ForwarderConfiguration {
            max_payload_size: Some(64),
            overflow_strategy: OverflowStrategy::Raise,
            telemetry_flush_interval: None,
            ..Default::default()
        };
        let harness = Harness::with_config(None, None, false, config);

        let name = "n".repeat(64);
        let result = harness.client.increment(&name, &MetricOptions::default());
        assert!(matches!(result, Err(SendError::MessageTooLarge { max_payload_size: 64, .. })));
        assert!(harness.messages().is_empty());
    }

    #[test]
    fn batch_and_close() {
        let harness = Harness::new(None, None, false);

        harness.client.batch(|client| {
            client.increment("a", &MetricOptions::default()).unwrap();
            client.increment("b", &MetricOptions::default()).unwrap();
        });
        assert_eq!(harness.transport.messages(), ["a:1|c|#env:test", "b:1|c|#env:test"]);

        harness.client.increment("c", &MetricOptions::default()).unwrap();
        harness.client.close(true);
        harness.client.increment("d", &MetricOptions::default()).unwrap();

        assert_eq!(harness.transport.messages(), ["a:1|c|#env:test", "b:1|c|#env:test", "c:1|c|#env:test"]);
        assert_eq!(harness.transport.close_count(), 1);
    }

    #[test]
    fn accessors() {
        let harness = Harness::new(Some("app"), Some(0.5), false);
        let client = &harness.client;

        assert_eq!(client.namespace(), Some("app"));
        assert_eq!(client.global_tags(), [Label::new("env", "test")]);
        assert_eq!(client.sample_rate(), Some(0.5));
        assert_eq!(client.host(), Some("127.0.0.1"));
        assert_eq!(client.port(), Some(8125));
        assert_eq!(client.socket_path(), None);
        assert_eq!(client.transport_type(), "udp");
    }
}
