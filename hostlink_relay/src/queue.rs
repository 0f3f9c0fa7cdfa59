// Task queues for handing callbacks to the host's main thread.
//
// The link's event loop runs on its own thread, but listener callbacks and
// session callbacks usually touch game state that is only safe to mutate
// from the host's main thread. Everything the runtime wants to run "on the
// host" is posted as a boxed closure through a `TaskQueue`:
//
// - `MainQueue`: an `mpsc` channel. The host calls `run_pending()` once per
//   frame from its main loop, which runs every queued task in FIFO order.
// - `ImmediateQueue`: runs the task on the posting thread. For headless hosts
//   whose listeners are already thread-safe, and for tests.
//
// Both preserve posting order, which is what keeps `connected` ahead of the
// first `received` for a connection and every `received` in arrival order.

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

/// A unit of work posted to the host.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run callbacks that touch host state.
pub trait TaskQueue: Send + Sync {
    fn post(&self, task: Task);
}

/// Channel-backed queue drained by the host's main loop.
pub struct MainQueue {
    tx: Sender<Task>,
    rx: Mutex<Receiver<Task>>,
}

impl MainQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Run every task queued so far. Returns how many ran.
    ///
    /// Tasks posted while draining run in the same call.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            // Release the receiver before running the task so a task that
            // posts more work (or drains recursively) cannot deadlock.
            let next = match self.rx.lock() {
                Ok(rx) => rx.try_recv().ok(),
                Err(poisoned) => poisoned.into_inner().try_recv().ok(),
            };
            match next {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => return count,
            }
        }
    }
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue for MainQueue {
    fn post(&self, task: Task) {
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.tx.send(task);
    }
}

/// Runs every task inline on the posting thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateQueue;

impl TaskQueue for ImmediateQueue {
    fn post(&self, task: Task) {
        task();
    }
}
