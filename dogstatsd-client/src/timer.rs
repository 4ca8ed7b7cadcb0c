use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

const ABANDON_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

type Callback = Arc<dyn Fn() + Send + Sync>;

// Shared between the timer and its thread. `true` while the thread should keep running.
type Signal = Arc<(Mutex<bool>, Condvar)>;

struct Running {
    signal: Signal,
    handle: JoinHandle<()>,
}

/// Periodically calls a callback on a background thread.
///
/// The interval is measured from the end of one callback to the start of the next, so a slow callback delays the next
/// tick rather than causing ticks to pile up.
pub struct FlushTimer {
    interval: Duration,
    callback: Callback,
    running: Mutex<Option<Running>>,
}

impl FlushTimer {
    /// Creates a new `FlushTimer`.
    ///
    /// The timer is created stopped.
    pub fn new<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self { interval, callback: Arc::new(callback), running: Mutex::new(None) }
    }

    /// Starts the timer.
    ///
    /// Does nothing if the timer is already running.
    ///
    /// # Errors
    ///
    /// If the background thread cannot be spawned, an error is returned.
    pub fn start(&self) -> io::Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        // Every run gets its own signal, so that a stale thread can never observe a later run's state.
        let signal: Signal = Arc::new((Mutex::new(true), Condvar::new()));
        let thread_signal = Arc::clone(&signal);
        let callback = Arc::clone(&self.callback);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("dogstatsd-flush-timer".to_string())
            .spawn(move || run(&thread_signal, interval, &*callback))?;

        *running = Some(Running { signal, handle });
        Ok(())
    }

    /// Stops the timer, waiting for the background thread to exit.
    ///
    /// Does nothing if the timer is already stopped.
    pub fn stop(&self) {
        let Some(Running { signal, handle }) = self.running.lock().take() else {
            return;
        };

        let (lock, cvar) = &*signal;
        *lock.lock() = false;
        cvar.notify_all();

        // The callback may end up dropping the last reference to whatever owns this timer, in which case we're
        // stopping from the timer thread itself and must not wait on it.
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }

    /// Returns `true` if the timer is not running.
    pub fn is_stopped(&self) -> bool {
        self.running.lock().is_none()
    }

    /// Forgets the current background thread without waiting for it.
    ///
    /// Used after a fork, where the thread recorded here belongs to the parent process. The thread is still told to
    /// stop, in case it does exist, but the signal lock is never waited on.
    pub(crate) fn abandon(&self) {
        let Some(Running { signal, .. }) = self.running.lock().take() else {
            return;
        };

        let (lock, cvar) = &*signal;
        let Some(mut running) = lock.try_lock_for(ABANDON_LOCK_TIMEOUT) else {
            return;
        };
        *running = false;
        cvar.notify_all();
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(signal: &Signal, interval: Duration, callback: &(dyn Fn() + Send + Sync)) {
    let (lock, cvar) = &**signal;
    let mut running = lock.lock();
    let mut deadline = Instant::now() + interval;

    while *running {
        if !cvar.wait_until(&mut running, deadline).timed_out() {
            // Either we were stopped, or this was a spurious wakeup: the loop condition sorts out which.
            continue;
        }

        if !*running {
            break;
        }

        trace!("Flush timer fired.");
        MutexGuard::unlocked(&mut running, callback);
        deadline = Instant::now() + interval;
    }
}
