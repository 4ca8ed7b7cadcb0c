use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use metrics::Label;
use parking_lot::Mutex;
use quanta::{Clock, Instant};

use crate::serializer::write_tags;

const TELEMETRY_PREFIX: &str = "datadog.dogstatsd.client.";

// Longest counter name, used to compute the largest line telemetry can ever render.
const LONGEST_COUNTER_NAME: &str = "packets_dropped_writer";

// Number of digits in `u64::MAX`.
const MAX_COUNTER_DIGITS: usize = 20;

/// Default interval between two telemetry flushes.
pub const DEFAULT_TELEMETRY_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Counts of successfully handed-off items, passed to [`Telemetry::sent`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetrySent {
    /// Metrics emitted.
    pub metrics: u64,
    /// Events emitted.
    pub events: u64,
    /// Service checks emitted.
    pub service_checks: u64,
    /// Bytes written to the transport.
    pub bytes: u64,
    /// Payloads written to the transport.
    pub packets: u64,
}

/// A point-in-time copy of the telemetry counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Metrics emitted.
    pub metrics: u64,
    /// Events emitted.
    pub events: u64,
    /// Service checks emitted.
    pub service_checks: u64,
    /// Bytes written to the transport.
    pub bytes_sent: u64,
    /// Payloads written to the transport.
    pub packets_sent: u64,
    /// Bytes dropped because the sender queue was full.
    pub bytes_dropped_queue: u64,
    /// Messages dropped because the sender queue was full.
    pub packets_dropped_queue: u64,
    /// Bytes dropped because the transport failed to write them.
    pub bytes_dropped_writer: u64,
    /// Payloads dropped because the transport failed to write them.
    pub packets_dropped_writer: u64,
}

impl TelemetrySnapshot {
    /// Returns the total number of bytes dropped, at the queue and at the writer.
    pub const fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped_queue.saturating_add(self.bytes_dropped_writer)
    }

    /// Returns the total number of packets dropped, at the queue and at the writer.
    pub const fn packets_dropped(&self) -> u64 {
        self.packets_dropped_queue.saturating_add(self.packets_dropped_writer)
    }
}

#[derive(Default)]
struct Counters {
    metrics: AtomicU64,
    events: AtomicU64,
    service_checks: AtomicU64,
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    bytes_dropped_queue: AtomicU64,
    packets_dropped_queue: AtomicU64,
    bytes_dropped_writer: AtomicU64,
    packets_dropped_writer: AtomicU64,
}

impl Counters {
    fn all(&self) -> [&AtomicU64; 9] {
        [
            &self.metrics,
            &self.events,
            &self.service_checks,
            &self.bytes_sent,
            &self.packets_sent,
            &self.bytes_dropped_queue,
            &self.packets_dropped_queue,
            &self.bytes_dropped_writer,
            &self.packets_dropped_writer,
        ]
    }
}

/// Client telemetry.
///
/// `Telemetry` counts what the client itself is doing, such as how many messages were emitted and how many payloads
/// were sent or dropped. These counts are periodically rendered as regular DogStatsD counters, and fed back into the
/// same pipeline as every other message.
///
/// All telemetry is emitted under the `datadog.dogstatsd.client` namespace, to align with the internal telemetry
/// emitted by official DogStatsD clients.
///
/// Counters are atomic, and may be updated from any thread.
pub struct Telemetry {
    counters: Counters,
    flush_interval: Duration,
    clock: Clock,
    next_flush: Mutex<Instant>,
    serialized_tags: Vec<u8>,
}

impl Telemetry {
    /// Creates a new `Telemetry` instance.
    ///
    /// Telemetry is flushed every `flush_interval`, and every rendered counter is tagged with the client identity, the
    /// given transport ID, and the given global tags.
    pub fn new(flush_interval: Duration, transport: &'static str, global_tags: &[Label]) -> Self {
        Self::with_clock(flush_interval, transport, global_tags, Clock::new())
    }

    pub(crate) fn with_clock(
        flush_interval: Duration,
        transport: &'static str,
        global_tags: &[Label],
        clock: Clock,
    ) -> Self {
        let client_tags = [
            Label::from_static_parts("client", "rust"),
            Label::from_static_parts("client_version", env!("CARGO_PKG_VERSION")),
            Label::from_static_parts("client_transport", transport),
        ];

        let mut serialized_tags = Vec::new();
        write_tags(&mut serialized_tags, client_tags.iter().chain(global_tags));

        let next_flush = Mutex::new(clock.now() + flush_interval);
        Self { counters: Counters::default(), flush_interval, clock, next_flush, serialized_tags }
    }

    /// Tracks items that were emitted or written.
    pub fn sent(&self, sent: TelemetrySent) {
        let c = &self.counters;
        c.metrics.fetch_add(sent.metrics, Ordering::Relaxed);
        c.events.fetch_add(sent.events, Ordering::Relaxed);
        c.service_checks.fetch_add(sent.service_checks, Ordering::Relaxed);
        c.bytes_sent.fetch_add(sent.bytes, Ordering::Relaxed);
        c.packets_sent.fetch_add(sent.packets, Ordering::Relaxed);
    }

    /// Tracks messages dropped because the sender queue was full.
    pub fn dropped_queue(&self, bytes: u64, packets: u64) {
        self.counters.bytes_dropped_queue.fetch_add(bytes, Ordering::Relaxed);
        self.counters.packets_dropped_queue.fetch_add(packets, Ordering::Relaxed);
    }

    /// Tracks payloads dropped because the transport failed to write them.
    pub fn dropped_writer(&self, bytes: u64, packets: u64) {
        self.counters.bytes_dropped_writer.fetch_add(bytes, Ordering::Relaxed);
        self.counters.packets_dropped_writer.fetch_add(packets, Ordering::Relaxed);
    }

    /// Returns `true` if the flush interval has elapsed since the last reset.
    pub fn should_flush(&self) -> bool {
        self.clock.now() >= *self.next_flush.lock()
    }

    /// Returns a copy of the current counter values.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        TelemetrySnapshot {
            metrics: c.metrics.load(Ordering::Relaxed),
            events: c.events.load(Ordering::Relaxed),
            service_checks: c.service_checks.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_dropped_queue: c.bytes_dropped_queue.load(Ordering::Relaxed),
            packets_dropped_queue: c.packets_dropped_queue.load(Ordering::Relaxed),
            bytes_dropped_writer: c.bytes_dropped_writer.load(Ordering::Relaxed),
            packets_dropped_writer: c.packets_dropped_writer.load(Ordering::Relaxed),
        }
    }

    /// Takes the current counter values, leaving every counter at zero.
    ///
    /// Each counter is swapped out individually, so increments racing with this call end up either in the returned
    /// snapshot or in the next one, never in neither.
    pub fn take_snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        TelemetrySnapshot {
            metrics: c.metrics.swap(0, Ordering::Relaxed),
            events: c.events.swap(0, Ordering::Relaxed),
            service_checks: c.service_checks.swap(0, Ordering::Relaxed),
            bytes_sent: c.bytes_sent.swap(0, Ordering::Relaxed),
            packets_sent: c.packets_sent.swap(0, Ordering::Relaxed),
            bytes_dropped_queue: c.bytes_dropped_queue.swap(0, Ordering::Relaxed),
            packets_dropped_queue: c.packets_dropped_queue.swap(0, Ordering::Relaxed),
            bytes_dropped_writer: c.bytes_dropped_writer.swap(0, Ordering::Relaxed),
            packets_dropped_writer: c.packets_dropped_writer.swap(0, Ordering::Relaxed),
        }
    }

    /// Renders the counters as DogStatsD counter lines, and starts counting again from zero.
    ///
    /// The next flush is scheduled one interval from now.
    pub fn flush(&self) -> Vec<Bytes> {
        let s = self.take_snapshot();
        *self.next_flush.lock() = self.clock.now() + self.flush_interval;

        let counters = [
            ("metrics", s.metrics),
            ("events", s.events),
            ("service_checks", s.service_checks),
            ("bytes_sent", s.bytes_sent),
            ("bytes_dropped", s.bytes_dropped()),
            ("bytes_dropped_queue", s.bytes_dropped_queue),
            ("bytes_dropped_writer", s.bytes_dropped_writer),
            ("packets_sent", s.packets_sent),
            ("packets_dropped", s.packets_dropped()),
            ("packets_dropped_queue", s.packets_dropped_queue),
            ("packets_dropped_writer", s.packets_dropped_writer),
        ];

        let mut int_writer = itoa::Buffer::new();
        counters
            .iter()
            .map(|(name, value)| {
                let value = int_writer.format(*value);
                let mut line = Vec::with_capacity(
                    TELEMETRY_PREFIX.len() + name.len() + value.len() + 4 + self.serialized_tags.len(),
                );
                line.extend_from_slice(TELEMETRY_PREFIX.as_bytes());
                line.extend_from_slice(name.as_bytes());
                line.push(b':');
                line.extend_from_slice(value.as_bytes());
                line.extend_from_slice(b"|c|#");
                line.extend_from_slice(&self.serialized_tags);
                Bytes::from(line)
            })
            .collect()
    }

    /// Resets all counters to zero and schedules the next flush one interval from now.
    ///
    /// Anything counted since the last flush is discarded. This is meant for state that can no longer be trusted, such
    /// as after a fork.
    pub fn reset(&self) {
        for counter in self.counters.all() {
            counter.store(0, Ordering::Relaxed);
        }

        *self.next_flush.lock() = self.clock.now() + self.flush_interval;
    }

    /// Returns `true` if every line rendered by [`flush`](Telemetry::flush) is guaranteed to fit in a payload of
    /// `max_payload_size` bytes.
    pub fn would_fit_in(&self, max_payload_size: usize) -> bool {
        self.max_line_len() <= max_payload_size
    }

    pub(crate) fn max_line_len(&self) -> usize {
        TELEMETRY_PREFIX.len()
            + LONGEST_COUNTER_NAME.len()
            + 1
            + MAX_COUNTER_DIGITS
            + 4
            + self.serialized_tags.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use metrics::Label;
    use quanta::Clock;

    use super::{Telemetry, TelemetrySent};

    fn lines(telemetry: &Telemetry) -> Vec<String> {
        telemetry
            .flush()
            .into_iter()
            .map(|line| String::from_utf8(line.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn renders_all_counters() {
        let telemetry = Telemetry::new(Duration::from_secs(10), "udp", &[]);
        telemetry.sent(TelemetrySent { metrics: 3, events: 1, service_checks: 2, ..Default::default() });
        telemetry.sent(TelemetrySent { bytes: 120, packets: 2, ..Default::default() });
        telemetry.dropped_queue(10, 1);
        telemetry.dropped_writer(30, 1);

        let tags = format!("client:rust,client_version:{},client_transport:udp", env!("CARGO_PKG_VERSION"));
        let expected = [
            ("metrics", 3),
            ("events", 1),
            ("service_checks", 2),
            ("bytes_sent", 120),
            ("bytes_dropped", 40),
            ("bytes_dropped_queue", 10),
            ("bytes_dropped_writer", 30),
            ("packets_sent", 2),
            ("packets_dropped", 2),
            ("packets_dropped_queue", 1),
            ("packets_dropped_writer", 1),
        ]
        .iter()
        .map(|(name, value)| format!("datadog.dogstatsd.client.{name}:{value}|c|#{tags}"))
        .collect::<Vec<_>>();

        assert_eq!(lines(&telemetry), expected);
    }

    #[test]
    fn global_tags_follow_client_tags() {
        let global_tags = [Label::new("env", "prod"), Label::new("canary", "")];
        let telemetry = Telemetry::new(Duration::from_secs(10), "uds", &global_tags);

        for line in lines(&telemetry) {
            assert!(line.ends_with("client_transport:uds,env:prod,canary"), "line: {line}");
        }
    }

    #[test]
    fn reset_zeroes_counters() {
        let telemetry = Telemetry::new(Duration::from_secs(10), "udp", &[]);
        telemetry.sent(TelemetrySent { metrics: 5, bytes: 50, packets: 1, ..Default::default() });
        telemetry.dropped_writer(7, 1);
        telemetry.reset();

        assert_eq!(telemetry.snapshot(), Default::default());
    }

    #[test]
    fn flush_deadline() {
        let (clock, mock) = Clock::mock();
        let telemetry = Telemetry::with_clock(Duration::from_secs(10), "udp", &[], clock);
        assert!(!telemetry.should_flush());

        mock.increment(Duration::from_secs(9));
        assert!(!telemetry.should_flush());

        mock.increment(Duration::from_secs(1));
        assert!(telemetry.should_flush());

        telemetry.reset();
        assert!(!telemetry.should_flush());

        mock.increment(Duration::from_secs(11));
        assert!(telemetry.should_flush());
    }

    #[test]
    fn flush_takes_counters_and_reschedules() {
        let (clock, mock) = Clock::mock();
        let telemetry = Telemetry::with_clock(Duration::from_secs(10), "udp", &[], clock);
        telemetry.sent(TelemetrySent { metrics: 4, bytes: 40, packets: 1, ..Default::default() });

        mock.increment(Duration::from_secs(10));
        assert!(telemetry.should_flush());

        let rendered = lines(&telemetry);
        assert!(rendered[0].starts_with("datadog.dogstatsd.client.metrics:4|c"));
        assert_eq!(telemetry.snapshot(), Default::default());
        assert!(!telemetry.should_flush());
    }

    #[test]
    fn flush_never_loses_concurrent_increments() {
        let telemetry = Arc::new(Telemetry::new(Duration::from_secs(10), "udp", &[]));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let telemetry = Arc::clone(&telemetry);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut incremented = 0u64;
                while !done.load(Ordering::SeqCst) {
                    telemetry.dropped_writer(1, 1);
                    incremented += 1;
                }
                incremented
            })
        };

        let mut reported = 0;
        for _ in 0..20_000 {
            reported += telemetry.take_snapshot().packets_dropped_writer;
        }
        done.store(true, Ordering::SeqCst);
        let incremented = writer.join().unwrap();
        reported += telemetry.take_snapshot().packets_dropped_writer;

        assert_eq!(reported, incremented);
    }

    #[test]
    fn fit_check_accounts_for_tags() {
        let telemetry = Telemetry::new(Duration::from_secs(10), "udp", &[]);
        let max_line_len = telemetry.max_line_len();
        assert!(telemetry.would_fit_in(max_line_len));
        assert!(!telemetry.would_fit_in(max_line_len - 1));

        // Every rendered line, even with maxed-out counters, stays within the computed bound.
        telemetry.sent(TelemetrySent { metrics: u64::MAX, ..Default::default() });
        for line in telemetry.flush() {
            assert!(line.len() <= max_line_len);
        }

        let long_tags = [Label::new("a_very_long_tag_name", "with_an_even_longer_tag_value")];
        let tagged = Telemetry::new(Duration::from_secs(10), "udp", &long_tags);
        assert!(!tagged.would_fit_in(max_line_len));
    }
}
