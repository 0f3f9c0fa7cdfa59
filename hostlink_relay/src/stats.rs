// Room status reporting.
//
// While a room is hosted, the relay keeps a public listing for it (map, mode,
// player list, ...). `StatusBroadcaster` keeps that listing fresh by sending
// `StatsUpdate` envelopes over the session's link:
//
// - on a fixed schedule (`stats_interval`), from a small timer thread that
//   only posts `update` to the host task queue, so the snapshot is always
//   taken on the host's thread;
// - immediately, via `trigger()`, when players join or leave or a world loads.
//
// Outside an active session every update is a no-op. The host is read
// through the `HostState` trait; a snapshot is one pass over the player list.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hostlink_protocol::{Envelope, PlayerStats, RoomStats};

use crate::error::RelayError;
use crate::queue::TaskQueue;
use crate::session::SessionManager;
use crate::worker::TrackedThread;

/// Read-only view of the hosted game, consulted for every snapshot.
pub trait HostState: Send + Sync {
    fn map_name(&self) -> String;
    fn gamemode(&self) -> String;
    fn host_name(&self) -> String;
    fn mods(&self) -> Vec<String>;
    fn locale(&self) -> String;
    fn version(&self) -> String;
    fn players(&self) -> Vec<PlayerStats>;
}

/// A `HostState` that never changes. Used by headless hosts.
#[derive(Clone, Debug, Default)]
pub struct StaticHostState {
    pub stats: RoomStats,
}

impl HostState for StaticHostState {
    fn map_name(&self) -> String {
        self.stats.map_name.clone()
    }

    fn gamemode(&self) -> String {
        self.stats.gamemode.clone()
    }

    fn host_name(&self) -> String {
        self.stats.host_name.clone()
    }

    fn mods(&self) -> Vec<String> {
        self.stats.mods.clone()
    }

    fn locale(&self) -> String {
        self.stats.locale.clone()
    }

    fn version(&self) -> String {
        self.stats.version.clone()
    }

    fn players(&self) -> Vec<PlayerStats> {
        self.stats.players.clone()
    }
}

/// Host events that warrant an immediate stats refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsTrigger {
    PlayerJoined,
    PlayerLeft,
    WorldLoaded,
}

/// Build a stats snapshot stamped with the current wall-clock time.
pub fn snapshot(host: &dyn HostState) -> RoomStats {
    RoomStats {
        map_name: host.map_name(),
        gamemode: host.gamemode(),
        host_name: host.host_name(),
        mods: host.mods(),
        locale: host.locale(),
        version: host.version(),
        players: host.players(),
        created_at: now_millis(),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Send one `StatsUpdate` if `session` is hosting. Returns whether one went
/// out.
fn broadcast(session: &SessionManager, host: &dyn HostState) -> Result<bool, RelayError> {
    let Some(link) = session.link() else {
        return Ok(false);
    };
    let Some(room_id) = link.room_id() else {
        return Ok(false);
    };
    let stats = snapshot(host);
    log::debug!(
        "sending stats for room {room_id} ({} player(s))",
        stats.players.len()
    );
    link.send(Envelope::StatsUpdate { room_id, stats })?;
    Ok(true)
}

struct Schedule {
    stop: Sender<()>,
    thread: TrackedThread,
}

pub struct StatusBroadcaster {
    session: Arc<SessionManager>,
    host: Arc<dyn HostState>,
    queue: Arc<dyn TaskQueue>,
    interval: Duration,
    join_timeout: Duration,
    schedule: Mutex<Option<Schedule>>,
}

impl StatusBroadcaster {
    pub fn new(
        session: Arc<SessionManager>,
        host: Arc<dyn HostState>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let interval = session.config().stats_interval();
        let join_timeout = session.config().join_timeout();
        Self {
            session,
            host,
            queue,
            interval,
            join_timeout,
            schedule: Mutex::new(None),
        }
    }

    /// Send a snapshot now, on the calling thread. No-op unless hosting.
    pub fn update(&self) -> Result<bool, RelayError> {
        broadcast(&self.session, &*self.host)
    }

    /// Start the periodic schedule. Does nothing if it is already running.
    pub fn start(&self) -> Result<(), RelayError> {
        let mut schedule = self.lock_schedule();
        if schedule.is_some() {
            return Ok(());
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let interval = self.interval;
        let post_update = self.update_task();
        let thread = TrackedThread::spawn("relay-stats", move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => post_update(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        *schedule = Some(Schedule { stop, thread });
        log::debug!("stats schedule started ({interval:?})");
        Ok(())
    }

    /// Queue an immediate update in response to a host event.
    pub fn trigger(&self, trigger: StatsTrigger) {
        log::trace!("stats refresh requested: {trigger:?}");
        (self.update_task())();
    }

    /// End the periodic schedule. Idempotent.
    pub fn stop(&self) {
        let Some(schedule) = self.lock_schedule().take() else {
            return;
        };
        let _ = schedule.stop.send(());
        schedule.thread.join_bounded(self.join_timeout);
    }

    pub fn is_scheduled(&self) -> bool {
        self.lock_schedule().is_some()
    }

    /// A closure that posts one broadcast to the host queue.
    fn update_task(&self) -> impl Fn() + Send + 'static {
        let session = self.session.clone();
        let host = self.host.clone();
        let queue = self.queue.clone();
        move || {
            let session = session.clone();
            let host = host.clone();
            queue.post(Box::new(move || {
                if let Err(e) = broadcast(&session, &*host) {
                    log::warn!("stats update failed: {e}");
                }
            }));
        }
    }

    fn lock_schedule(&self) -> MutexGuard<'_, Option<Schedule>> {
        self.schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StatusBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}
