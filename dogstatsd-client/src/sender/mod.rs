//! Background senders.
//!
//! A sender sits between the callers emitting messages and the [`MessageBuffer`] that batches them into payloads. Two
//! flavors are available:
//!
//! - [`ThreadedSender`], where a dedicated worker thread owns the buffer and callers hand off messages through a
//!   bounded queue, never blocking on I/O
//! - [`SingleThreadSender`], where the buffer is driven directly on the caller's thread, under a lock
//!
//! Both flush periodically, through a [`FlushTimer`](crate::timer::FlushTimer), and both detect when the process has
//! forked underneath them, discarding whatever state was inherited from the parent.
use std::{io, sync::Arc, time::Duration};

use crate::{buffer::MessageBuffer, message::Message, telemetry::Telemetry};

mod single;
pub use self::single::SingleThreadSender;

mod threaded;
pub use self::threaded::ThreadedSender;

/// Builds a fresh message buffer, along with a fresh transport.
pub type BufferFactory = Arc<dyn Fn() -> MessageBuffer + Send + Sync>;

/// Returns the current process ID.
///
/// Overridable so that tests can simulate a fork.
pub(crate) type ProcessId = Arc<dyn Fn() -> u32 + Send + Sync>;

pub(crate) fn current_process_id() -> ProcessId {
    Arc::new(std::process::id)
}

/// Sender configuration.
#[derive(Clone, Copy, Debug)]
pub struct SenderConfiguration {
    /// Queue capacity for the threaded sender, or batch size for the single-thread sender.
    pub queue_size: usize,

    /// Interval between periodic flushes, if any.
    pub flush_interval: Option<Duration>,
}

/// A background sender.
pub enum Sender {
    /// Messages are handed off to a dedicated worker thread.
    Threaded(ThreadedSender),

    /// Messages are buffered and written on the caller's thread.
    SingleThread(SingleThreadSender),
}

impl Sender {
    /// Creates a new threaded sender.
    ///
    /// The sender is not running until [`start`](Sender::start) is called.
    pub fn threaded(config: SenderConfiguration, factory: BufferFactory, telemetry: Option<Arc<Telemetry>>) -> Self {
        Sender::Threaded(ThreadedSender::new(config, factory, telemetry))
    }

    /// Creates a new single-thread sender.
    ///
    /// The sender is not running until [`start`](Sender::start) is called.
    pub fn single_thread(config: SenderConfiguration, factory: &BufferFactory) -> Self {
        Sender::SingleThread(SingleThreadSender::new(config, factory))
    }

    /// Starts the sender, and its flush timer.
    ///
    /// # Errors
    ///
    /// If a background thread cannot be spawned, an error is returned.
    pub fn start(&self) -> io::Result<()> {
        match self {
            Sender::Threaded(sender) => sender.start(),
            Sender::SingleThread(sender) => sender.start(),
        }
    }

    /// Adds a message.
    ///
    /// Never fails: messages that cannot be accepted are dropped and accounted for in telemetry.
    pub fn add(&self, message: Message) {
        match self {
            Sender::Threaded(sender) => sender.add(message),
            Sender::SingleThread(sender) => sender.add(message),
        }
    }

    /// Flushes the buffered messages.
    ///
    /// If `sync` is `true`, waits until everything added before this call has been written.
    pub fn flush(&self, sync: bool) {
        match self {
            Sender::Threaded(sender) => sender.flush(sync),
            Sender::SingleThread(sender) => sender.flush(),
        }
    }

    /// Waits until every item added before this call has been processed.
    pub fn rendezvous(&self) {
        match self {
            Sender::Threaded(sender) => sender.rendezvous(),
            Sender::SingleThread(_) => {}
        }
    }

    /// Stops the sender, flushing whatever is still buffered.
    ///
    /// If `join` is `true`, waits for any background thread to exit.
    pub fn stop(&self, join: bool) {
        match self {
            Sender::Threaded(sender) => sender.stop(join),
            Sender::SingleThread(sender) => sender.stop(),
        }
    }
}
