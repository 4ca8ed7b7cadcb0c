use std::{io, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{buffer::MessageBuffer, message::Message, timer::FlushTimer};

use super::{current_process_id, BufferFactory, ProcessId, SenderConfiguration};

struct State {
    buffer: MessageBuffer,
    pending: Vec<Message>,
    batch_size: usize,
    pid: u32,
    stopped: bool,
}

impl State {
    fn drain(&mut self) {
        for message in self.pending.drain(..) {
            if let Err(e) = self.buffer.add(message) {
                debug!(error = %e, "Dropping message.");
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    process_id: ProcessId,
    timer: Option<FlushTimer>,
}

impl Shared {
    /// Locks the state, discarding it first if it was inherited from a parent process.
    ///
    /// Returns `None` if the sender is stopped.
    fn lock(&self) -> Option<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }

        let pid = (self.process_id)();
        if state.pid != pid {
            debug!(previous_pid = state.pid, pid, "Process forked. Discarding inherited messages.");
            state.buffer.reset();
            state.pending.clear();
            state.pid = pid;

            if let Some(timer) = &self.timer {
                timer.abandon();
                if let Err(e) = timer.start() {
                    error!(error = %e, "Failed to restart flush timer.");
                }
            }
        }

        Some(state)
    }

    fn flush(&self) {
        if let Some(mut state) = self.lock() {
            state.drain();
            state.buffer.flush();
        }
    }
}

/// A sender that writes messages on the caller's thread.
///
/// Messages are collected into a small pending batch, which is moved into the [`MessageBuffer`] once it reaches the
/// configured batch size. Everything happens under a single lock, and writes happen on whichever thread triggered them.
///
/// This avoids spawning a worker thread, at the cost of callers occasionally blocking on I/O.
pub struct SingleThreadSender {
    shared: Arc<Shared>,
}

impl SingleThreadSender {
    /// Creates a new `SingleThreadSender`.
    ///
    /// Telemetry, if any, is tracked by the buffers that `factory` creates.
    pub fn new(config: SenderConfiguration, factory: &BufferFactory) -> Self {
        Self::with_process_id(config, factory, current_process_id())
    }

    pub(crate) fn with_process_id(config: SenderConfiguration, factory: &BufferFactory, process_id: ProcessId) -> Self {
        let batch_size = config.queue_size.max(1);
        let state = State {
            buffer: factory(),
            pending: Vec::with_capacity(batch_size),
            batch_size,
            pid: process_id(),
            stopped: true,
        };

        let shared = Arc::new_cyclic(|weak: &std::sync::Weak<Shared>| {
            let weak = weak.clone();
            let timer = config.flush_interval.map(|interval| {
                FlushTimer::new(interval, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.flush();
                    }
                })
            });

            Shared { state: Mutex::new(state), process_id, timer }
        });

        Self { shared }
    }

    /// Starts the flush timer.
    ///
    /// # Errors
    ///
    /// If the timer thread cannot be spawned, an error is returned.
    pub fn start(&self) -> io::Result<()> {
        self.shared.state.lock().stopped = false;
        match &self.shared.timer {
            Some(timer) => timer.start(),
            None => Ok(()),
        }
    }

    /// Adds a message to the pending batch, moving the batch into the buffer once it is full.
    pub fn add(&self, message: Message) {
        let Some(mut state) = self.shared.lock() else {
            debug!("Sender is not running. Dropping message.");
            return;
        };

        state.pending.push(message);
        if state.pending.len() >= state.batch_size {
            state.drain();
        }
    }

    /// Moves the pending batch into the buffer, and writes out the buffer.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Stops the flush timer, then flushes and closes the buffer.
    pub fn stop(&self) {
        // The timer callback takes the state lock, so it has to be stopped before we take it ourselves.
        if let Some(timer) = &self.shared.timer {
            timer.stop();
        }

        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }

        // Anything inherited from a parent process is the parent's to send.
        if state.pid == (self.shared.process_id)() {
            state.drain();
            state.buffer.flush();
        }
        state.buffer.close();
        state.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::SingleThreadSender;
    use crate::{
        buffer::{BufferConfiguration, MessageBuffer, OverflowStrategy},
        message::Message,
        sender::{BufferFactory, SenderConfiguration},
        telemetry::Telemetry,
        test_util::{wait_until, RecordingTransport},
    };

    fn factory(transport: &RecordingTransport, telemetry: Option<Arc<Telemetry>>) -> BufferFactory {
        let transport = transport.clone();
        Arc::new(move || {
            let config = BufferConfiguration {
                max_payload_size: 1432,
                max_pool_size: usize::MAX,
                overflow_strategy: OverflowStrategy::Drop,
            };
            MessageBuffer::new(config, Box::new(transport.clone()), telemetry.clone())
        })
    }

    #[test]
    fn batches_until_flush() {
        let transport = RecordingTransport::default();
        let sender = SingleThreadSender::new(
            SenderConfiguration { queue_size: 3, flush_interval: None },
            &factory(&transport, None),
        );
        sender.start().unwrap();

        sender.add(Message::from("a:1|c"));
        sender.add(Message::from("b:1|c"));
        assert!(transport.payloads().is_empty());

        sender.flush();
        assert_eq!(transport.payloads_as_strings(), ["a:1|c\nb:1|c"]);

        sender.stop();
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn stop_flushes_pending_messages() {
        let transport = RecordingTransport::default();
        let sender = SingleThreadSender::new(
            SenderConfiguration { queue_size: 1, flush_interval: None },
            &factory(&transport, None),
        );
        sender.start().unwrap();

        sender.add(Message::from("a:1|c"));
        sender.add(Message::from("b:1|c"));
        sender.stop();

        sender.add(Message::from("c:1|c"));
        sender.flush();
        sender.stop();

        assert_eq!(transport.messages(), ["a:1|c", "b:1|c"]);
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn timer_flushes_periodically() {
        let transport = RecordingTransport::default();
        let sender = SingleThreadSender::new(
            SenderConfiguration { queue_size: 1, flush_interval: Some(Duration::from_millis(10)) },
            &factory(&transport, None),
        );
        sender.start().unwrap();

        sender.add(Message::from("page.views:1|c"));
        wait_until(|| transport.messages() == ["page.views:1|c"]);

        sender.stop();
    }

    #[test]
    fn discards_inherited_state_after_fork() {
        let transport = RecordingTransport::default();
        let telemetry = Arc::new(Telemetry::new(Duration::from_secs(10), "udp", &[]));
        let pid = Arc::new(AtomicU32::new(1000));
        let observed_pid = Arc::clone(&pid);

        let sender = SingleThreadSender::with_process_id(
            SenderConfiguration { queue_size: 2, flush_interval: None },
            &factory(&transport, Some(Arc::clone(&telemetry))),
            Arc::new(move || observed_pid.load(Ordering::SeqCst)),
        );
        sender.start().unwrap();

        // Two messages in the buffer, one still pending.
        sender.add(Message::from("parent.a:1|c"));
        sender.add(Message::from("parent.b:1|c"));
        sender.add(Message::from("parent.c:1|c"));
        telemetry.dropped_writer(10, 1);

        pid.store(1001, Ordering::SeqCst);
        sender.add(Message::from("child:1|c"));
        sender.flush();

        assert_eq!(transport.messages(), ["child:1|c"]);
        assert_eq!(telemetry.snapshot().packets_dropped_writer, 0);
        assert_eq!(telemetry.snapshot().packets_sent, 1);

        sender.stop();
    }
}
