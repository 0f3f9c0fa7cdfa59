// Test-only relay and host harness for end-to-end relay tests.
//
// `MockRelay` is a blocking stand-in for the real relay server: it listens
// on an ephemeral localhost port and speaks the real framing
// (`hostlink_protocol::{read_message, write_message}`), so the code under
// test runs its production socket and event loop paths unchanged. Each
// accepted host becomes a `MockHost` with synchronous `recv` / `send`.
//
// On the host side, `Recorder` is a `ConnectionListener` that logs every
// callback and keeps the connections it saw, and `session_callbacks` turns
// `SessionManager` outcomes into a channel the test can block on.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hostlink_protocol::{
    CloseReason, ConnectionId, Envelope, RoomId, RoomStats, read_message, write_message,
};
use hostlink_relay::{
    Connection, ConnectionListener, ImmediateQueue, RelayConfig, RelayError, SessionCallbacks,
    SessionManager, StaticHostState,
};

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between polls of a condition.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Config with short timings so tests finish quickly.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        connect_timeout_ms: 2_000,
        poll_interval_ms: 20,
        probe_timeout_ms: 1_000,
        stats_interval_ms: 60_000,
        join_timeout_ms: 1_000,
        ..RelayConfig::default()
    }
}

/// Poll `condition` until it holds or `WAIT_TIMEOUT` passes.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < WAIT_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
    listener.local_addr().expect("local_addr failed").port()
}

// ---------------------------------------------------------------------------
// Relay side
// ---------------------------------------------------------------------------

pub struct MockRelay {
    listener: TcpListener,
}

impl MockRelay {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        listener
            .set_nonblocking(true)
            .expect("set_nonblocking failed");
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local_addr failed").port()
    }

    /// Wait for the next host to connect.
    pub fn accept(&self) -> MockHost {
        let start = Instant::now();
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => return MockHost::new(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    assert!(start.elapsed() < WAIT_TIMEOUT, "no host connected");
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }

    /// Accept a host and read its room creation request.
    pub fn accept_room(&self) -> (MockHost, Option<String>, RoomStats) {
        let mut host = self.accept();
        match host.recv() {
            Envelope::RoomCreationRequest {
                password, stats, ..
            } => (host, password, stats),
            other => panic!("expected RoomCreationRequest, got {other:?}"),
        }
    }
}

/// The relay's end of one host connection.
pub struct MockHost {
    stream: TcpStream,
}

impl MockHost {
    fn new(stream: TcpStream) -> Self {
        stream
            .set_nonblocking(false)
            .expect("set_nonblocking failed");
        stream
            .set_read_timeout(Some(WAIT_TIMEOUT))
            .expect("set_read_timeout failed");
        Self { stream }
    }

    pub fn send(&mut self, envelope: &Envelope) {
        let json = serde_json::to_vec(envelope).expect("serialize failed");
        write_message(&mut self.stream, &json).expect("write to host failed");
    }

    /// Send one frame with arbitrary content.
    pub fn send_raw(&mut self, frame: &[u8]) {
        write_message(&mut self.stream, frame).expect("write to host failed");
    }

    /// Read the next envelope, skipping `StatsUpdate`s.
    pub fn recv(&mut self) -> Envelope {
        loop {
            let envelope = self.recv_any().expect("read from host failed");
            if !matches!(envelope, Envelope::StatsUpdate { .. }) {
                return envelope;
            }
        }
    }

    /// Read the next envelope of any kind.
    pub fn recv_any(&mut self) -> io::Result<Envelope> {
        let frame = read_message(&mut self.stream)?;
        serde_json::from_slice(&frame).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
    }

    /// Acknowledge the room.
    pub fn ack(&mut self, room_id: &str) {
        self.send(&Envelope::RoomLink {
            room_id: RoomId::from(room_id),
        });
    }

    /// Deliver a remote player's packet to the host.
    pub fn wrap(&mut self, id: i32, payload: &[u8]) {
        self.send(&Envelope::ConnectionPacketWrap {
            connection_id: ConnectionId(id),
            is_tcp: true,
            payload: payload.to_vec(),
        });
    }

    /// True if the host closes the socket before the timeout, after
    /// discarding anything still in flight.
    pub fn wait_eof(&mut self) -> bool {
        loop {
            match self.recv_any() {
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return true,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return false;
                }
                // Resets count as closed.
                Err(_) => return true,
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connected(i32),
    Received(i32, Vec<u8>),
    Disconnected(i32, CloseReason),
    Idle(i32),
}

/// Dispatcher that records every callback.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    connections: Mutex<HashMap<i32, Arc<dyn Connection>>>,
}

impl Recorder {
    /// Events so far, without idle notifications.
    pub fn events(&self) -> Vec<Event> {
        self.all_events()
            .into_iter()
            .filter(|event| !matches!(event, Event::Idle(_)))
            .collect()
    }

    pub fn all_events(&self) -> Vec<Event> {
        self.events.lock().expect("events poisoned").clone()
    }

    pub fn connection(&self, id: i32) -> Option<Arc<dyn Connection>> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .get(&id)
            .cloned()
    }

    pub fn wait_for_events(&self, count: usize) -> Vec<Event> {
        wait_until(&format!("{count} connection event(s)"), || {
            self.events().len() >= count
        });
        self.events()
    }

    fn push(&self, event: Event) {
        self.events.lock().expect("events poisoned").push(event);
    }
}

impl ConnectionListener for Recorder {
    fn connected(&self, conn: &Arc<dyn Connection>) {
        self.connections
            .lock()
            .expect("connections poisoned")
            .insert(conn.id().0, conn.clone());
        self.push(Event::Connected(conn.id().0));
    }

    fn received(&self, conn: &Arc<dyn Connection>, payload: &[u8]) {
        self.push(Event::Received(conn.id().0, payload.to_vec()));
    }

    fn disconnected(&self, conn: &Arc<dyn Connection>, reason: CloseReason) {
        self.push(Event::Disconnected(conn.id().0, reason));
    }

    fn idle(&self, conn: &Arc<dyn Connection>) {
        self.push(Event::Idle(conn.id().0));
    }
}

#[derive(Debug)]
pub enum Outcome {
    Ok(Option<RoomId>),
    Failed(RelayError),
    Disconnected(CloseReason),
}

/// Session callbacks that report into a channel.
pub fn session_callbacks() -> (SessionCallbacks, Receiver<Outcome>) {
    let (tx, rx) = mpsc::channel();
    let fail_tx = tx.clone();
    let closed_tx = tx.clone();
    let callbacks = SessionCallbacks::new(
        move |link| {
            let _ = tx.send(Outcome::Ok(link.room_id()));
        },
        move |e| {
            let _ = fail_tx.send(Outcome::Failed(e));
        },
        move |reason| {
            let _ = closed_tx.send(Outcome::Disconnected(reason));
        },
    );
    (callbacks, rx)
}

pub fn next_outcome(outcomes: &Receiver<Outcome>) -> Outcome {
    outcomes
        .recv_timeout(WAIT_TIMEOUT)
        .expect("no session outcome")
}

/// A session manager wired to a `Recorder`, running callbacks inline.
pub fn test_session(config: RelayConfig) -> (SessionManager, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let host = StaticHostState {
        stats: RoomStats {
            map_name: "Thicket".into(),
            host_name: "tester".into(),
            version: "1".into(),
            ..RoomStats::default()
        },
    };
    let session = SessionManager::new(
        config,
        recorder.clone(),
        Arc::new(ImmediateQueue),
        Arc::new(host),
    )
    .expect("SessionManager::new failed");
    (session, recorder)
}

/// Open a session against `relay` and complete the room handshake.
pub fn open_room(
    relay: &MockRelay,
    session: &SessionManager,
    room_id: &str,
) -> (MockHost, Receiver<Outcome>) {
    let (callbacks, outcomes) = session_callbacks();
    session.create("127.0.0.1", relay.port(), None, callbacks);
    let (mut host, _, _) = relay.accept_room();
    host.ack(room_id);
    match next_outcome(&outcomes) {
        Outcome::Ok(Some(id)) => assert_eq!(id.as_str(), room_id),
        other => panic!("expected the room to open, got {other:?}"),
    }
    (host, outcomes)
}
