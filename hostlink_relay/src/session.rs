// Session lifecycle: at most one hosted room per `SessionManager`.
//
// Lifecycle: Idle → Connecting → Active → Closing → Idle.
//
// Every lifecycle operation (`create`, `close`, `dispose`) runs on the
// manager's private `Worker` thread, so they are totally ordered and the
// blocking connect never happens on the host's thread. The event loop of
// each link runs on its own `TrackedThread`, owned by the session state.
//
// Room callbacks from a link arrive on the host task queue. Each link is
// tagged with a generation number; a callback from a link that has since
// been disposed or replaced sees a different generation and is ignored.
//
// Locking: `Shared` is only held for short state transitions. The manager
// never stops or joins a link thread while holding it, because with an
// `ImmediateQueue` the link's callbacks take the same lock on the loop
// thread.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use hostlink_protocol::{CloseReason, RoomId};

use crate::config::RelayConfig;
use crate::connection::ConnectionListener;
use crate::error::RelayError;
use crate::link::{RelayLink, RoomCallbacks};
use crate::queue::TaskQueue;
use crate::stats::{HostState, snapshot};
use crate::worker::{TrackedThread, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

type OkFn = Box<dyn FnOnce(Arc<RelayLink>) + Send + 'static>;
type FailFn = Box<dyn FnOnce(RelayError) + Send + 'static>;
type DisconnectedFn = Box<dyn FnOnce(CloseReason) + Send + 'static>;

/// Outcome callbacks for one `create()`. They run on the host task queue and
/// at most one of `on_ok` / `on_fail` fires; `on_disconnected` may follow
/// `on_ok`. A room closed or disposed by the host before the relay answered
/// fires neither.
pub struct SessionCallbacks {
    on_ok: OkFn,
    on_fail: FailFn,
    on_disconnected: DisconnectedFn,
}

impl SessionCallbacks {
    pub fn new<O, F, D>(on_ok: O, on_fail: F, on_disconnected: D) -> Self
    where
        O: FnOnce(Arc<RelayLink>) + Send + 'static,
        F: FnOnce(RelayError) + Send + 'static,
        D: FnOnce(CloseReason) + Send + 'static,
    {
        Self {
            on_ok: Box::new(on_ok),
            on_fail: Box::new(on_fail),
            on_disconnected: Box::new(on_disconnected),
        }
    }
}

struct Shared {
    phase: SessionState,
    generation: u64,
    acknowledged: bool,
    link: Option<Arc<RelayLink>>,
    loop_thread: Option<TrackedThread>,
}

/// Everything a worker job needs, shared between the manager and its jobs.
struct Context {
    config: RelayConfig,
    dispatcher: Arc<dyn ConnectionListener>,
    queue: Arc<dyn TaskQueue>,
    host: Arc<dyn HostState>,
    shared: Mutex<Shared>,
}

pub struct SessionManager {
    ctx: Arc<Context>,
    worker: Mutex<Worker>,
}

impl SessionManager {
    pub fn new(
        config: RelayConfig,
        dispatcher: Arc<dyn ConnectionListener>,
        queue: Arc<dyn TaskQueue>,
        host: Arc<dyn HostState>,
    ) -> Result<Self, RelayError> {
        let worker = Worker::spawn("relay-session")?;
        Ok(Self {
            ctx: Arc::new(Context {
                config,
                dispatcher,
                queue,
                host,
                shared: Mutex::new(Shared {
                    phase: SessionState::Idle,
                    generation: 0,
                    acknowledged: false,
                    link: None,
                    loop_thread: None,
                }),
            }),
            worker: Mutex::new(worker),
        })
    }

    /// Open a room on the relay at `ip:port`. Returns immediately; the
    /// outcome arrives through `callbacks`.
    pub fn create(
        &self,
        ip: &str,
        port: u16,
        password: Option<String>,
        callbacks: SessionCallbacks,
    ) {
        let ctx = self.ctx.clone();
        let ip = ip.to_owned();
        // Released before posting: `on_fail` may call back into the session.
        let running = self.lock_worker().is_running();
        if !running {
            let on_fail = callbacks.on_fail;
            self.ctx
                .queue
                .post(Box::new(move || on_fail(RelayError::WorkerGone)));
            return;
        }
        let submitted = self
            .lock_worker()
            .submit(move || ctx.open(&ip, port, password, callbacks));
        if let Err(e) = submitted {
            log::warn!("could not schedule session create: {e}");
        }
    }

    /// Ask the relay to close the room and drop the socket. Returns
    /// immediately; does nothing when no session is open.
    pub fn close(&self) {
        let ctx = self.ctx.clone();
        if let Err(e) = self.lock_worker().submit(move || ctx.close_room()) {
            log::debug!("could not schedule session close: {e}");
        }
    }

    /// Stop the link, join its thread (bounded), and forget it, so the next
    /// `create()` starts clean. Waits at most `join_timeout` for the worker
    /// to get through it.
    pub fn dispose(&self) {
        let timeout = self.ctx.config.join_timeout();
        let (done_tx, done_rx) = mpsc::channel();
        let ctx = self.ctx.clone();
        let submitted = self.lock_worker().submit(move || {
            ctx.teardown();
            let _ = done_tx.send(());
        });
        match submitted {
            Ok(()) => {
                if done_rx.recv_timeout(timeout).is_err() {
                    log::warn!("session dispose still running after {timeout:?}; continuing");
                }
            }
            Err(_) => self.ctx.teardown(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.ctx.lock().phase
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// The live link, while the room is acknowledged and open.
    pub fn link(&self) -> Option<Arc<RelayLink>> {
        let shared = self.ctx.lock();
        match shared.phase {
            SessionState::Active => shared.link.clone(),
            _ => None,
        }
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.link().and_then(|link| link.room_id())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    fn lock_worker(&self) -> MutexGuard<'_, Worker> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispose();
        let timeout = self.ctx.config.join_timeout();
        self.lock_worker().shutdown(timeout);
    }
}

impl Context {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn post<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.queue.post(Box::new(task));
    }

    /// Worker job for `create()`.
    fn open(
        self: &Arc<Self>,
        ip: &str,
        port: u16,
        password: Option<String>,
        callbacks: SessionCallbacks,
    ) {
        let SessionCallbacks {
            on_ok,
            on_fail,
            on_disconnected,
        } = callbacks;

        let (generation, stale_link, stale_thread) = {
            let mut shared = self.lock();
            if shared.phase != SessionState::Idle {
                drop(shared);
                log::info!("refusing to open a second relay session");
                self.post(move || on_fail(RelayError::SessionActive));
                return;
            }
            shared.phase = SessionState::Connecting;
            shared.generation += 1;
            shared.acknowledged = false;
            (
                shared.generation,
                shared.link.take(),
                shared.loop_thread.take(),
            )
        };
        self.retire(stale_link, stale_thread);

        // Fires either from a failed connect (below) or a rejection (link
        // callback), whichever comes first.
        let on_fail = Arc::new(Mutex::new(Some(on_fail)));
        let started = self.start_link(
            ip,
            port,
            password,
            generation,
            on_ok,
            on_disconnected,
            &on_fail,
        );
        if let Err(e) = started {
            log::warn!("relay session to {ip}:{port} failed: {e}");
            let (link, thread) = {
                let mut shared = self.lock();
                if shared.generation != generation {
                    (None, None)
                } else {
                    shared.phase = SessionState::Idle;
                    (shared.link.take(), shared.loop_thread.take())
                }
            };
            self.retire(link, thread);
            if let Some(on_fail) = take_once(&on_fail) {
                self.post(move || on_fail(e));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start_link(
        self: &Arc<Self>,
        ip: &str,
        port: u16,
        password: Option<String>,
        generation: u64,
        on_ok: OkFn,
        on_disconnected: DisconnectedFn,
        on_fail: &Arc<Mutex<Option<FailFn>>>,
    ) -> Result<(), RelayError> {
        let link = RelayLink::new(
            self.config.clone(),
            self.dispatcher.clone(),
            self.queue.clone(),
        )?;
        let runner = link.clone();
        let thread = TrackedThread::spawn("relay-link", move || {
            if let Err(e) = runner.run() {
                log::warn!("relay link event loop failed: {e}");
            }
        })?;
        {
            let mut shared = self.lock();
            shared.link = Some(link.clone());
            shared.loop_thread = Some(thread);
        }

        let on_created = {
            let ctx = self.clone();
            move |room_id: RoomId| ctx.room_created(generation, &room_id, on_ok)
        };
        let on_closed = {
            let ctx = self.clone();
            let on_fail = on_fail.clone();
            move |reason: CloseReason| ctx.room_closed(generation, reason, on_disconnected, &on_fail)
        };
        let stats = snapshot(&*self.host);
        link.connect(
            ip,
            port,
            password,
            stats,
            RoomCallbacks::new(on_created, on_closed),
        )
    }

    /// Link callback: the relay acknowledged the room. Runs on the host
    /// queue.
    fn room_created(&self, generation: u64, room_id: &RoomId, on_ok: OkFn) {
        let link = {
            let mut shared = self.lock();
            if shared.generation != generation {
                return;
            }
            shared.acknowledged = true;
            if shared.phase == SessionState::Connecting {
                shared.phase = SessionState::Active;
            }
            shared.link.clone()
        };
        log::info!("hosting relay room {room_id}");
        if let Some(link) = link {
            on_ok(link);
        }
    }

    /// Link callback: the room is gone. Runs on the host queue.
    fn room_closed(
        &self,
        generation: u64,
        reason: CloseReason,
        on_disconnected: DisconnectedFn,
        on_fail: &Mutex<Option<FailFn>>,
    ) {
        let (acknowledged, closing) = {
            let mut shared = self.lock();
            if shared.generation != generation || shared.phase == SessionState::Idle {
                return;
            }
            let closing = shared.phase == SessionState::Closing;
            shared.phase = SessionState::Idle;
            if let Some(link) = &shared.link {
                link.stop();
            }
            (shared.acknowledged, closing)
        };
        if acknowledged {
            log::info!("relay room closed: {reason}");
            on_disconnected(reason);
        } else if closing {
            // Cancelled by `close()`, not rejected.
            log::info!("room request cancelled before the relay answered");
            drop(take_once(on_fail));
        } else if let Some(on_fail) = take_once(on_fail) {
            log::info!("relay rejected the room: {reason}");
            on_fail(RelayError::Rejected(reason));
        }
    }

    /// Worker job for `close()`.
    fn close_room(&self) {
        let link = {
            let mut shared = self.lock();
            match shared.phase {
                SessionState::Connecting | SessionState::Active => {
                    shared.phase = SessionState::Closing;
                    shared.link.clone()
                }
                SessionState::Closing | SessionState::Idle => None,
            }
        };
        if let Some(link) = link {
            log::info!("closing relay room");
            link.close_room();
        }
    }

    /// Worker job for `dispose()`. Silent: no session callback fires.
    fn teardown(&self) {
        let (link, thread) = {
            let mut shared = self.lock();
            shared.phase = SessionState::Idle;
            shared.generation += 1;
            shared.acknowledged = false;
            (shared.link.take(), shared.loop_thread.take())
        };
        self.retire(link, thread);
    }

    fn retire(&self, link: Option<Arc<RelayLink>>, thread: Option<TrackedThread>) {
        if let Some(link) = link {
            link.stop();
        }
        if let Some(thread) = thread {
            thread.join_bounded(self.config.join_timeout());
        }
    }
}

fn take_once<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}
