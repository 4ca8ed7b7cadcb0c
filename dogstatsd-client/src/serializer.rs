//! DogStatsD line serialization.
//!
//! Every function here produces exactly one DogStatsD line, without the trailing newline: joining lines into payloads
//! is the job of the message buffer.
use std::sync::Arc;

use bytes::Bytes;
use metrics::Label;

use crate::message::SendError;

/// Maximum size of a serialized event, in bytes.
pub const MAX_EVENT_SIZE: usize = 8 * 1024;

/// DogStatsD metric type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricType {
    /// Counter (`c`).
    Counter,
    /// Gauge (`g`).
    Gauge,
    /// Histogram (`h`).
    Histogram,
    /// Distribution (`d`).
    Distribution,
    /// Timing, in milliseconds (`ms`).
    Timing,
    /// Set (`s`).
    Set,
}

impl MetricType {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MetricType::Counter => b"|c",
            MetricType::Gauge => b"|g",
            MetricType::Histogram => b"|h",
            MetricType::Distribution => b"|d",
            MetricType::Timing => b"|ms",
            MetricType::Set => b"|s",
        }
    }
}

/// A metric value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue<'a> {
    /// An integer value.
    Integer(i64),
    /// A floating-point value.
    FloatingPoint(f64),
    /// A raw value, used for sets.
    Raw(&'a str),
}

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    fn format<'a>(&'a mut self, value: MetricValue<'a>) -> &'a str {
        match value {
            MetricValue::Integer(v) => self.int_writer.format(v),
            MetricValue::FloatingPoint(v) => self.float_writer.format(v),
            MetricValue::Raw(v) => v,
        }
    }
}

/// Event priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventPriority {
    /// Normal priority.
    Normal,
    /// Low priority.
    Low,
}

impl EventPriority {
    const fn as_str(self) -> &'static str {
        match self {
            EventPriority::Normal => "normal",
            EventPriority::Low => "low",
        }
    }
}

/// Event alert type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAlertType {
    /// Error.
    Error,
    /// Warning.
    Warning,
    /// Informational.
    Info,
    /// Success.
    Success,
}

impl EventAlertType {
    const fn as_str(self) -> &'static str {
        match self {
            EventAlertType::Error => "error",
            EventAlertType::Warning => "warning",
            EventAlertType::Info => "info",
            EventAlertType::Success => "success",
        }
    }
}

/// Optional event attributes.
#[derive(Clone, Debug, Default)]
pub struct EventOptions {
    /// When the event happened, as a Unix timestamp. Defaults to when the server receives it.
    pub date_happened: Option<u64>,
    /// Hostname to attach to the event.
    pub hostname: Option<String>,
    /// Key used to group the event with others.
    pub aggregation_key: Option<String>,
    /// Event priority. Defaults to normal.
    pub priority: Option<EventPriority>,
    /// Source type of the event.
    pub source_type_name: Option<String>,
    /// Alert type. Defaults to info.
    pub alert_type: Option<EventAlertType>,
    /// Whether to truncate events larger than [`MAX_EVENT_SIZE`] instead of rejecting them.
    pub truncate_if_too_long: bool,
}

/// Service check status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceCheckStatus {
    /// OK.
    Ok,
    /// Warning.
    Warning,
    /// Critical.
    Critical,
    /// Unknown.
    Unknown,
}

impl ServiceCheckStatus {
    const fn as_bytes(self) -> &'static [u8] {
        match self {
            ServiceCheckStatus::Ok => b"0",
            ServiceCheckStatus::Warning => b"1",
            ServiceCheckStatus::Critical => b"2",
            ServiceCheckStatus::Unknown => b"3",
        }
    }
}

/// Optional service check attributes.
#[derive(Clone, Debug, Default)]
pub struct ServiceCheckOptions {
    /// When the check ran, as a Unix timestamp. Defaults to when the server receives it.
    pub timestamp: Option<u64>,
    /// Hostname to attach to the service check.
    pub hostname: Option<String>,
    /// Message describing the status.
    pub message: Option<String>,
}

struct Inner {
    prefix: Option<String>,
    global_tags: Vec<Label>,
}

/// Serializes metrics, events, and service checks into DogStatsD lines.
///
/// A namespace, when configured, is prepended to every metric name. Global tags are appended after the tags given for
/// each individual call. Cloning is cheap.
#[derive(Clone)]
pub struct Serializer {
    inner: Arc<Inner>,
}

impl Serializer {
    /// Creates a new `Serializer`.
    pub fn new(namespace: Option<&str>, global_tags: Vec<Label>) -> Self {
        let prefix = namespace.map(|ns| format!("{ns}."));
        Self { inner: Arc::new(Inner { prefix, global_tags }) }
    }

    /// Returns the namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.inner.prefix.as_deref().and_then(|prefix| prefix.strip_suffix('.'))
    }

    /// Returns the global tags.
    pub fn global_tags(&self) -> &[Label] {
        &self.inner.global_tags
    }

    fn write_tags_section(&self, buf: &mut Vec<u8>, tags: &[Label]) {
        if tags.is_empty() && self.inner.global_tags.is_empty() {
            return;
        }

        buf.extend_from_slice(b"|#");
        write_tags(buf, tags.iter().chain(self.inner.global_tags.iter()));
    }

    /// Serializes a metric.
    ///
    /// The sample rate is only written when it is present and not `1.0`, as that is the implied default.
    pub fn to_stat(
        &self,
        name: &str,
        value: MetricValue<'_>,
        metric_type: MetricType,
        tags: &[Label],
        sample_rate: Option<f64>,
    ) -> Bytes {
        let mut buf = Vec::with_capacity(64);

        if let Some(prefix) = &self.inner.prefix {
            buf.extend_from_slice(prefix.as_bytes());
        }
        write_sanitized(&mut buf, name, |b| matches!(b, ':' | '|' | '@'), Some('_'));

        let mut formatter = MetricValueFormatter::new();
        buf.push(b':');
        buf.extend_from_slice(formatter.format(value).as_bytes());
        buf.extend_from_slice(metric_type.as_bytes());

        if let Some(sample_rate) = sample_rate.filter(|rate| (rate - 1.0).abs() > f64::EPSILON) {
            let mut float_writer = ryu::Buffer::new();
            buf.extend_from_slice(b"|@");
            buf.extend_from_slice(float_writer.format(sample_rate).as_bytes());
        }

        self.write_tags_section(&mut buf, tags);

        Bytes::from(buf)
    }

    /// Serializes an event.
    ///
    /// Newlines in the title and text are escaped.
    ///
    /// # Errors
    ///
    /// If the serialized event is larger than [`MAX_EVENT_SIZE`], and truncation was not requested, an error is
    /// returned.
    pub fn to_event(
        &self,
        title: &str,
        text: &str,
        options: &EventOptions,
        tags: &[Label],
    ) -> Result<Bytes, SendError> {
        let title_escaped = escape_newlines(title);
        let text_escaped = escape_newlines(text);

        let mut int_writer = itoa::Buffer::new();
        let mut buf = Vec::with_capacity(title_escaped.len() + text_escaped.len() + 64);
        buf.extend_from_slice(b"_e{");
        buf.extend_from_slice(int_writer.format(title_escaped.len()).as_bytes());
        buf.push(b',');
        buf.extend_from_slice(int_writer.format(text_escaped.len()).as_bytes());
        buf.extend_from_slice(b"}:");
        buf.extend_from_slice(title_escaped.as_bytes());
        buf.push(b'|');
        buf.extend_from_slice(text_escaped.as_bytes());

        if let Some(date_happened) = options.date_happened {
            buf.extend_from_slice(b"|d:");
            buf.extend_from_slice(int_writer.format(date_happened).as_bytes());
        }
        write_field(&mut buf, b"|h:", options.hostname.as_deref());
        write_field(&mut buf, b"|k:", options.aggregation_key.as_deref());
        write_field(&mut buf, b"|p:", options.priority.map(EventPriority::as_str));
        write_field(&mut buf, b"|s:", options.source_type_name.as_deref());
        write_field(&mut buf, b"|t:", options.alert_type.map(EventAlertType::as_str));

        self.write_tags_section(&mut buf, tags);

        if buf.len() > MAX_EVENT_SIZE {
            if !options.truncate_if_too_long {
                return Err(SendError::EventTooLarge {
                    title: title.to_string(),
                    len: buf.len(),
                    max_event_size: MAX_EVENT_SIZE,
                });
            }

            // Cut on a character boundary, so that the line stays valid UTF-8.
            let mut len = MAX_EVENT_SIZE;
            while len > 0 && (buf[len] & 0xC0) == 0x80 {
                len -= 1;
            }
            buf.truncate(len);
        }

        Ok(Bytes::from(buf))
    }

    /// Serializes a service check.
    ///
    /// The message, if any, is always written last, with newlines and `m:` escaped.
    pub fn to_service_check(
        &self,
        name: &str,
        status: ServiceCheckStatus,
        options: &ServiceCheckOptions,
        tags: &[Label],
    ) -> Bytes {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"_sc|");
        write_sanitized(&mut buf, name, |b| b == '|', None);
        buf.push(b'|');
        buf.extend_from_slice(status.as_bytes());

        if let Some(timestamp) = options.timestamp {
            let mut int_writer = itoa::Buffer::new();
            buf.extend_from_slice(b"|d:");
            buf.extend_from_slice(int_writer.format(timestamp).as_bytes());
        }
        write_field(&mut buf, b"|h:", options.hostname.as_deref());

        self.write_tags_section(&mut buf, tags);

        if let Some(message) = &options.message {
            buf.extend_from_slice(b"|m:");
            buf.extend_from_slice(escape_newlines(message).replace("m:", "m\\:").as_bytes());
        }

        Bytes::from(buf)
    }
}

/// Writes the given tags, comma-separated.
///
/// Tags with an empty value are written as bare tags: `tag` rather than `tag:`. Characters that would break the line
/// format (`|` and `,`) are removed.
pub(crate) fn write_tags<'a, I>(buf: &mut Vec<u8>, tags: I)
where
    I: IntoIterator<Item = &'a Label>,
{
    for (i, tag) in tags.into_iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }

        write_tag(buf, tag);
    }
}

fn write_tag(buf: &mut Vec<u8>, label: &Label) {
    let is_reserved = |c: char| matches!(c, '|' | ',');

    write_sanitized(buf, label.key(), is_reserved, None);
    if label.value().is_empty() {
        return;
    }

    buf.push(b':');
    write_sanitized(buf, label.value(), is_reserved, None);
}

// Writes `s`, replacing characters matching `is_reserved` with `replacement`, or removing them.
fn write_sanitized<F>(buf: &mut Vec<u8>, s: &str, is_reserved: F, replacement: Option<char>)
where
    F: Fn(char) -> bool,
{
    if !s.contains(&is_reserved) {
        buf.extend_from_slice(s.as_bytes());
        return;
    }

    let mut char_buf = [0; 4];
    for c in s.chars() {
        let c = if is_reserved(c) { replacement } else { Some(c) };
        if let Some(c) = c {
            buf.extend_from_slice(c.encode_utf8(&mut char_buf).as_bytes());
        }
    }
}

fn write_field(buf: &mut Vec<u8>, field_prefix: &[u8], value: Option<&str>) {
    if let Some(value) = value {
        buf.extend_from_slice(field_prefix);
        write_sanitized(buf, value, |c| c == '|', None);
    }
}

fn escape_newlines(s: &str) -> String {
    s.replace('\n', "\\n")
}
