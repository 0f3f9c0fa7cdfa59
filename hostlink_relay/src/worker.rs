// Single-threaded executors and bounded thread joins.
//
// `Worker` is one named background thread draining an `mpsc` queue of boxed
// jobs in submission order. `SessionManager` uses one to serialize every
// create/close/dispose, and `LatencyProbe` uses one to serialize probes, so
// neither needs locking around its own operations.
//
// `std::thread::JoinHandle::join` cannot time out, so every thread spawned
// here carries a `Finished` guard that drops a channel sender when the thread
// exits (including by panic). `join_bounded` waits on that channel with a
// timeout and only calls `join()` once the thread is known to be done; a
// thread that overstays the timeout is detached and left to finish alone.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::RelayError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dropped at thread exit; closes the completion channel.
struct Finished(#[allow(dead_code)] Sender<()>);

/// A spawned thread that can be joined with a timeout.
pub struct TrackedThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl TrackedThread {
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = mpsc::channel();
        let handle = thread::Builder::new().name(name.to_owned()).spawn(move || {
            let _finished = Finished(done_tx);
            body();
        })?;
        Ok(Self {
            name: name.to_owned(),
            handle: Some(handle),
            done,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread to exit. Returns whether it did.
    pub fn join_bounded(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if handle.join().is_err() {
                    log::warn!("thread {} panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "thread {} did not exit within {timeout:?}; detaching it",
                    self.name
                );
                false
            }
        }
    }
}

/// One background thread running submitted jobs in order.
pub struct Worker {
    tx: Option<Sender<Job>>,
    thread: Option<TrackedThread>,
}

impl Worker {
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread = TrackedThread::spawn(name, move || {
            while let Ok(job) = rx.recv() {
                job();
            }
        })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn submit<F>(&self, job: F) -> Result<(), RelayError>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(RelayError::WorkerGone)?;
        tx.send(Box::new(job)).map_err(|_| RelayError::WorkerGone)
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Stop accepting jobs, let queued ones finish, and join with a bound.
    /// Safe to call repeatedly.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.tx = None;
        match self.thread.take() {
            Some(thread) => thread.join_bounded(timeout),
            None => true,
        }
    }
}
