use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, TrySendError};
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use crate::{buffer::MessageBuffer, message::Message, telemetry::Telemetry, timer::FlushTimer};

use super::{current_process_id, BufferFactory, ProcessId, SenderConfiguration};

enum WorkItem {
    Message(Message),
    Flush,
    Rendezvous(crossbeam_channel::Sender<()>),
}

struct Worker {
    tx: crossbeam_channel::Sender<WorkItem>,
    handle: JoinHandle<()>,
    abandoned: Arc<AtomicBool>,
    pid: u32,
}

impl Worker {
    fn is_alive(&self, pid: u32) -> bool {
        self.pid == pid && !self.handle.is_finished()
    }
}

enum State {
    NotStarted,
    Running(Worker),
    Stopped,
}

struct Shared {
    factory: BufferFactory,
    telemetry: Option<Arc<Telemetry>>,
    queue_size: usize,
    process_id: ProcessId,
    state: RwLock<State>,
    timer: Option<FlushTimer>,
}

impl Shared {
    fn spawn_worker(&self, pid: u32) -> io::Result<Worker> {
        let (tx, rx) = crossbeam_channel::bounded(self.queue_size);
        let abandoned = Arc::new(AtomicBool::new(false));
        let buffer = (self.factory)();

        let worker_abandoned = Arc::clone(&abandoned);
        let handle = thread::Builder::new()
            .name("dogstatsd-sender".to_string())
            .spawn(move || run_worker(&rx, buffer, &worker_abandoned))?;

        Ok(Worker { tx, handle, abandoned, pid })
    }

    /// Runs `f` against a live worker, replacing a dead one first if necessary.
    ///
    /// Returns `None` if the sender isn't running.
    fn with_worker<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Worker) -> R,
    {
        let pid = (self.process_id)();

        match &*self.state.read() {
            State::Running(worker) if worker.is_alive(pid) => return Some(f(worker)),
            State::Running(_) => {}
            State::NotStarted | State::Stopped => return None,
        }

        self.recover(pid);

        match &*self.state.read() {
            State::Running(worker) => Some(f(worker)),
            State::NotStarted | State::Stopped => None,
        }
    }

    /// Replaces a dead worker with a fresh one.
    ///
    /// The worker either died, or we're in a forked child process and the worker thread only exists in the parent.
    /// Either way, whatever it had buffered is lost: the old generation is abandoned, telemetry is reset, and a new
    /// worker starts from an empty buffer and an empty queue.
    fn recover(&self, pid: u32) {
        let mut state = self.state.write();
        let State::Running(worker) = &*state else {
            return;
        };

        // Someone else got here first.
        if worker.is_alive(pid) {
            return;
        }

        let forked = worker.pid != pid;
        debug!(previous_pid = worker.pid, pid, forked, "Sender worker is gone. Starting a new one.");

        worker.abandoned.store(true, Ordering::Release);
        if let Some(telemetry) = &self.telemetry {
            telemetry.reset();
        }

        match self.spawn_worker(pid) {
            // Dropping the old worker closes its queue, and detaches its thread if it still exists.
            Ok(new_worker) => *state = State::Running(new_worker),
            Err(e) => {
                error!(error = %e, "Failed to spawn sender worker.");
                return;
            }
        }
        drop(state);

        if let Some(timer) = &self.timer {
            if forked {
                timer.abandon();
            }
            if timer.is_stopped() {
                if let Err(e) = timer.start() {
                    error!(error = %e, "Failed to restart flush timer.");
                }
            }
        }
    }

    fn send_blocking(&self, item: WorkItem) -> bool {
        // Clone the queue handle so that the lock isn't held while blocked on a full queue.
        let Some(tx) = self.with_worker(|worker| worker.tx.clone()) else {
            return false;
        };

        tx.send(item).is_ok()
    }

    fn flush(&self, sync: bool) {
        if self.send_blocking(WorkItem::Flush) && sync {
            self.rendezvous();
        }
    }

    fn rendezvous(&self) {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self.send_blocking(WorkItem::Rendezvous(reply_tx)) {
            // An abandoned worker drops the request instead of answering it, which also wakes us up.
            let _ = reply_rx.recv();
        }
    }
}

fn run_worker(rx: &Receiver<WorkItem>, mut buffer: MessageBuffer, abandoned: &AtomicBool) {
    for item in rx {
        if abandoned.load(Ordering::Acquire) {
            debug!("Sender worker abandoned. Exiting without flushing.");
            return;
        }

        match item {
            WorkItem::Message(message) => {
                if let Err(e) = buffer.add(message) {
                    debug!(error = %e, "Dropping message.");
                }
            }
            WorkItem::Flush => buffer.flush(),
            WorkItem::Rendezvous(reply) => {
                let _ = reply.send(());
            }
        }
    }

    if abandoned.load(Ordering::Acquire) {
        return;
    }

    trace!("Sender queue closed. Flushing remaining messages.");
    buffer.flush();
    buffer.close();
}

/// A sender that hands messages off to a dedicated worker thread.
///
/// Callers enqueue messages onto a bounded queue, which the worker drains into its [`MessageBuffer`]. Enqueuing never
/// blocks: when the queue is full, the message is dropped and counted in telemetry. Flush and rendezvous requests
/// travel through the same queue, which is what gives them their ordering guarantees relative to messages.
///
/// The worker is checked on every call, and replaced if it is no longer running, which is how a forked child process
/// ends up with a worker of its own.
pub struct ThreadedSender {
    shared: Arc<Shared>,
}

impl ThreadedSender {
    /// Creates a new `ThreadedSender`.
    pub fn new(config: SenderConfiguration, factory: BufferFactory, telemetry: Option<Arc<Telemetry>>) -> Self {
        Self::with_process_id(config, factory, telemetry, current_process_id())
    }

    pub(crate) fn with_process_id(
        config: SenderConfiguration,
        factory: BufferFactory,
        telemetry: Option<Arc<Telemetry>>,
        process_id: ProcessId,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let timer = config.flush_interval.map(|interval| {
                FlushTimer::new(interval, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.flush(false);
                    }
                })
            });

            Shared {
                factory,
                telemetry,
                queue_size: config.queue_size.max(1),
                process_id,
                state: RwLock::new(State::NotStarted),
                timer,
            }
        });

        Self { shared }
    }

    /// Starts the worker thread and the flush timer.
    ///
    /// Does nothing if already running. A stopped sender can be started again.
    ///
    /// # Errors
    ///
    /// If either thread cannot be spawned, an error is returned.
    pub fn start(&self) -> io::Result<()> {
        {
            let mut state = self.shared.state.write();
            if let State::NotStarted | State::Stopped = &*state {
                let pid = (self.shared.process_id)();
                *state = State::Running(self.shared.spawn_worker(pid)?);
            }
        }

        match &self.shared.timer {
            Some(timer) => timer.start(),
            None => Ok(()),
        }
    }

    /// Enqueues a message for the worker.
    ///
    /// If the queue is full, the message is dropped.
    pub fn add(&self, message: Message) {
        let len = message.serialized_len().unwrap_or(0) as u64;
        let result = self.shared.with_worker(|worker| worker.tx.try_send(WorkItem::Message(message)));

        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                let reason = match e {
                    TrySendError::Full(_) => "full",
                    TrySendError::Disconnected(_) => "closed",
                };
                trace!(reason, "Sender queue unavailable. Dropping message.");
                if let Some(telemetry) = &self.shared.telemetry {
                    telemetry.dropped_queue(len, 1);
                }
            }
            None => debug!("Sender is not running. Dropping message."),
        }
    }

    /// Asks the worker to flush its buffer.
    ///
    /// If `sync` is `true`, waits until the flush has happened, and with it, every message enqueued before this call.
    pub fn flush(&self, sync: bool) {
        self.shared.flush(sync);
    }

    /// Waits until the worker has processed every item enqueued before this call.
    pub fn rendezvous(&self) {
        self.shared.rendezvous();
    }

    #[cfg(test)]
    fn worker_finished(&self) -> bool {
        match &*self.shared.state.read() {
            State::Running(worker) => worker.handle.is_finished(),
            State::NotStarted | State::Stopped => true,
        }
    }

    /// Stops the flush timer and closes the queue.
    ///
    /// The worker drains whatever is left in the queue, flushes, and exits. If `join` is `true`, waits for it.
    pub fn stop(&self, join: bool) {
        if let Some(timer) = &self.shared.timer {
            timer.stop();
        }

        let previous = std::mem::replace(&mut *self.shared.state.write(), State::Stopped);
        let State::Running(Worker { tx, handle, pid, .. }) = previous else {
            return;
        };
        drop(tx);

        // A worker spawned by another process can't be waited on from this one.
        if join && pid == (self.shared.process_id)() {
            if let Err(e) = handle.join() {
                error!(error = ?e, "Sender worker panicked.");
            }
        }
    }
}
