//! A client for sending metrics, events, and service checks to a [DogStatsD][dsd] server, such as the Datadog Agent.
//!
//! [dsd]: https://docs.datadoghq.com/developers/dogstatsd/
//!
//! # Usage
//!
//! ```no_run
//! # use dogstatsd_client::{DogStatsDBuilder, MetricOptions};
//! # use metrics::Label;
//! // First, create a builder.
//! //
//! // The builder configures where messages are sent, how they are batched, and what is attached to each of them, such
//! // as a namespace or global tags.
//! let client = DogStatsDBuilder::default()
//!     .with_namespace("checkout")
//!     .with_global_tags([Label::new("env", "prod")])
//!     .build()
//!     .expect("failed to build client");
//!
//! // Emitting never blocks on the network.
//! let tags = [Label::new("route", "/cart")];
//! client.increment("requests", &MetricOptions::with_tags(&tags)).expect("metric too large");
//! client.gauge("cart.size", 3.0, &MetricOptions::default()).expect("metric too large");
//!
//! // Write out everything still buffered before exiting.
//! client.close(true);
//! ```
//!
//! # Features
//!
//! ## Batching
//!
//! Messages are joined into payloads as large as the transport allows, and written out once a payload is full, once
//! enough messages have been buffered, or periodically, whichever comes first.
//!
//! ## Non-blocking emission
//!
//! By default, a dedicated thread owns the connection, and callers hand messages off to it through a bounded queue.
//! When the queue is full, messages are dropped rather than blocking the caller. A single-thread mode is also
//! available, where payloads are written on the caller's thread instead.
//!
//! ## Transports
//!
//! Messages can be sent over UDP, or over a Unix domain socket in `SOCK_DGRAM` mode. The target can be configured
//! explicitly, or picked up from the `DD_DOGSTATSD_URL`, `DD_AGENT_HOST`, `DD_DOGSTATSD_PORT` and
//! `DD_DOGSTATSD_SOCKET` environment variables.
//!
//! ## Fork safety
//!
//! Senders detect when the process has forked, and start over in the child with a fresh buffer, connection, and
//! background threads, discarding whatever was inherited from the parent.
//!
//! ## Telemetry
//!
//! The client tracks how many metrics, events, and service checks were emitted, and how many payloads and bytes were
//! sent or dropped. This telemetry is periodically sent to the same DogStatsD server, under the
//! `datadog.dogstatsd.client` namespace.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod buffer;
pub use self::buffer::{BufferConfiguration, MessageBuffer, OverflowStrategy, PAYLOAD_SIZE_TOLERANCE};

mod builder;
pub use self::builder::{BuildError, DogStatsDBuilder};

mod client;
pub use self::client::{DogStatsDClient, MetricOptions};

mod config;
pub use self::config::{resolve, resolve_with_env, ConfigError, Tier, TransportConfig, DEFAULT_HOST, DEFAULT_PORT};

mod connection;
pub use self::connection::{Connection, Transport, WriteResult, DEFAULT_WRITE_TIMEOUT};

mod forwarder;
pub use self::forwarder::{
    Forwarder, ForwarderConfiguration, DEFAULT_FLUSH_INTERVAL, SINGLE_THREAD_DEFAULT_SENDER_QUEUE_SIZE,
    UDP_DEFAULT_MAX_PAYLOAD_SIZE, UDP_DEFAULT_SENDER_QUEUE_SIZE, UDS_DEFAULT_MAX_PAYLOAD_SIZE,
    UDS_DEFAULT_SENDER_QUEUE_SIZE,
};

mod message;
pub use self::message::{Message, MessageKind, SendError};

mod sender;
pub use self::sender::{BufferFactory, Sender, SenderConfiguration, SingleThreadSender, ThreadedSender};

mod serializer;
pub use self::serializer::{
    EventAlertType, EventOptions, EventPriority, MetricType, MetricValue, Serializer, ServiceCheckOptions,
    ServiceCheckStatus, MAX_EVENT_SIZE,
};

mod telemetry;
pub use self::telemetry::{Telemetry, TelemetrySent, TelemetrySnapshot, DEFAULT_TELEMETRY_FLUSH_INTERVAL};

mod timer;
pub use self::timer::FlushTimer;

#[cfg(test)]
mod test_util;
