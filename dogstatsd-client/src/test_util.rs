use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::connection::{Transport, WriteResult};

#[derive(Default)]
struct Inner {
    payloads: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    closes: AtomicUsize,
    held: Mutex<bool>,
    released: Condvar,
    blocked_writers: AtomicUsize,
}

/// An in-memory transport that records every payload written to it.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Inner>,
}

impl RecordingTransport {
    /// When set, every write fails with a fatal error and nothing is recorded.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// When set, writes block until released.
    pub fn hold_writes(&self, hold: bool) {
        *self.inner.held.lock() = hold;
        if !hold {
            self.inner.released.notify_all();
        }
    }

    /// Returns the number of writes currently blocked by [`hold_writes`](RecordingTransport::hold_writes).
    pub fn blocked_writers(&self) -> usize {
        self.inner.blocked_writers.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.inner.payloads.lock().clone()
    }

    pub fn payloads_as_strings(&self) -> Vec<String> {
        self.payloads().into_iter().map(|p| String::from_utf8(p).expect("payload is not UTF-8")).collect()
    }

    /// Returns every message written so far, across payloads, in order.
    pub fn messages(&self) -> Vec<String> {
        self.payloads_as_strings().iter().flat_map(|p| p.split('\n')).map(str::to_string).collect()
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn write(&mut self, payload: &[u8]) -> WriteResult {
        let mut held = self.inner.held.lock();
        if *held {
            self.inner.blocked_writers.fetch_add(1, Ordering::SeqCst);
            while *held {
                self.inner.released.wait(&mut held);
            }
            self.inner.blocked_writers.fetch_sub(1, Ordering::SeqCst);
        }
        drop(held);

        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return WriteResult::FatalError;
        }

        self.inner.payloads.lock().push(payload.to_vec());
        WriteResult::Sent
    }

    fn close(&mut self) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(2));
    }
}
