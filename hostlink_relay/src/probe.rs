// Relay latency probes for server-browser style UIs.
//
// A probe is a bare TCP connect to the relay, timed and dropped. It never
// touches a hosted session. All probes are serialized through one `Worker`,
// sharing a `ProbeClient` that is created on first use; results are posted
// to the host task queue.
//
// Every probe needs a fresh socket, so the shared client keeps what outlives
// one: resolved addresses per relay (a relay list is pinged over and over)
// and the last failure for display. A failed probe forgets that relay's
// addresses so the next one resolves again.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::link::{connect_any, resolve};
use crate::queue::TaskQueue;
use crate::worker::Worker;

/// Connects, measures, disconnects.
pub struct ProbeClient {
    timeout: Duration,
    completed: u64,
    addresses: HashMap<(String, u16), Vec<SocketAddr>>,
    last_error: Option<String>,
}

impl ProbeClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            completed: 0,
            addresses: HashMap::new(),
            last_error: None,
        }
    }

    /// Time to connect to `host:port`, in milliseconds. Name resolution is
    /// not counted.
    pub fn measure(&mut self, host: &str, port: u16) -> Result<u64, RelayError> {
        let result = self.connect_timed(host, port);
        match &result {
            Ok(_) => self.completed += 1,
            Err(e) => {
                self.addresses.remove(&(host.to_owned(), port));
                self.last_error = Some(e.to_string());
            }
        }
        result
    }

    fn connect_timed(&mut self, host: &str, port: u16) -> Result<u64, RelayError> {
        let key = (host.to_owned(), port);
        let addrs = match self.addresses.get(&key) {
            Some(addrs) => addrs.clone(),
            None => {
                let addrs = resolve(host, port)?;
                self.addresses.insert(key, addrs.clone());
                addrs
            }
        };
        let start = Instant::now();
        let stream = connect_any(&addrs, self.timeout, &format!("{host}:{port}"))?;
        let elapsed = start.elapsed();
        let _ = stream.shutdown(Shutdown::Both);
        Ok(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Relays whose addresses are cached, sorted.
    pub fn cached_targets(&self) -> Vec<(String, u16)> {
        let mut targets: Vec<_> = self.addresses.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Message of the most recent failed probe.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

pub struct LatencyProbe {
    timeout: Duration,
    join_timeout: Duration,
    queue: Arc<dyn TaskQueue>,
    client: Arc<Mutex<Option<ProbeClient>>>,
    worker: Mutex<Worker>,
}

impl LatencyProbe {
    pub fn new(config: &RelayConfig, queue: Arc<dyn TaskQueue>) -> Result<Self, RelayError> {
        Ok(Self {
            timeout: config.probe_timeout(),
            join_timeout: config.join_timeout(),
            queue,
            client: Arc::new(Mutex::new(None)),
            worker: Mutex::new(Worker::spawn("relay-probe")?),
        })
    }

    /// Queue a probe of `ip:port`. Exactly one of the callbacks fires, on
    /// the host queue.
    pub fn ping<O, F>(&self, ip: &str, port: u16, on_ok: O, on_fail: F)
    where
        O: FnOnce(u64) + Send + 'static,
        F: FnOnce(RelayError) + Send + 'static,
    {
        // Callbacks may ping again, so the worker lock is never held
        // across a post.
        let running = self.lock_worker().is_running();
        if !running {
            self.queue
                .post(Box::new(move || on_fail(RelayError::WorkerGone)));
            return;
        }

        let ip = ip.to_owned();
        let timeout = self.timeout;
        let client = self.client.clone();
        let queue = self.queue.clone();
        let job = move || {
            let result = {
                let mut slot = lock(&client);
                slot.get_or_insert_with(|| ProbeClient::new(timeout))
                    .measure(&ip, port)
            };
            match result {
                Ok(ms) => {
                    log::debug!("relay {ip}:{port} answered in {ms} ms");
                    queue.post(Box::new(move || on_ok(ms)));
                }
                Err(e) => {
                    log::debug!("relay {ip}:{port} unreachable: {e}");
                    queue.post(Box::new(move || on_fail(e)));
                }
            }
        };
        let submitted = self.lock_worker().submit(job);
        if let Err(e) = submitted {
            log::warn!("could not schedule probe: {e}");
        }
    }

    /// Stop the probe worker (bounded wait). Later pings fail with
    /// `WorkerGone`.
    pub fn dispose(&self) {
        if !self.lock_worker().shutdown(self.join_timeout) {
            log::warn!("probe worker still busy after {:?}", self.join_timeout);
        }
    }

    /// Probes that got an answer so far.
    pub fn completed(&self) -> u64 {
        lock(&self.client).as_ref().map_or(0, ProbeClient::completed)
    }

    pub fn cached_targets(&self) -> Vec<(String, u16)> {
        lock(&self.client)
            .as_ref()
            .map_or_else(Vec::new, ProbeClient::cached_targets)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.client)
            .as_ref()
            .and_then(|client| client.last_error().map(str::to_owned))
    }

    fn lock_worker(&self) -> MutexGuard<'_, Worker> {
        lock(&self.worker)
    }
}

impl Drop for LatencyProbe {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
