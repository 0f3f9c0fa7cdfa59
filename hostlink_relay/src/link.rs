// The host's single outbound connection to the relay, and its event loop.
//
// Architecture: one `mio` event loop thread owns the socket.
//
// - `connect()` runs on the caller's thread (the session worker). It resolves
//   the relay address, does a bounded blocking connect, switches the stream to
//   non-blocking and hands it to the loop as `LinkCommand::Attach`, followed by
//   the framed `RoomCreationRequest`. Failures of this first step are returned
//   to the caller instead of becoming room-closed events.
// - `run()` is the loop. Each iteration polls until the next idle check is
//   due, applies queued `LinkCommand`s, reads and dispatches every complete
//   frame, and flushes pending writes. Once per `poll_interval`, however many wakeups
//   fell in between, it runs the idle check over all connected virtual
//   connections. A connection opened during a window is not idle in it.
// - Any thread may call `send()`: the envelope is serialized and framed on the
//   calling thread and queued as `LinkCommand::Send`. Every queued command is
//   followed by a `Waker::wake`, so the loop never sits out a full poll
//   interval with work pending. `stop()` uses the same wakeup.
//
// The socket is registered for both readable and writable interest once, at
// attach time. mio is edge-triggered, so reads drain until `WouldBlock`, and
// writes are attempted whenever bytes are pending and resumed on the next
// writable edge after a `WouldBlock`.
//
// Teardown (relay `RoomClosed`, host `close_room()`, EOF, IO error, `stop()`)
// always goes through `drop_wire` → `teardown`: the room id is cleared,
// `on_room_closed` fires once with the first recorded reason, and every
// virtual connection is closed quietly. The relay is never told about those
// closes; it either initiated them or is unreachable.
//
// See also: `connection.rs` (what `ConnectionPacketWrap` is turned into),
// `session.rs` (who owns the loop thread).

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use hostlink_protocol::{
    CloseReason, ConnectionId, Envelope, FrameBuffer, RoomId, RoomStats, encode_frame,
};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::RelayConfig;
use crate::connection::{Connection, ConnectionListener, RelaySink, VirtualConnection};
use crate::error::RelayError;
use crate::queue::TaskQueue;
use crate::registry::ConnectionRegistry;

const WAKE_TOKEN: Token = Token(0);
const STREAM_TOKEN: Token = Token(1);

/// Size of the stack buffer used for each non-blocking read.
const READ_CHUNK: usize = 16 * 1024;

/// Work handed from other threads to the loop thread.
enum LinkCommand {
    Attach(TcpStream),
    Send(Vec<u8>),
    Disconnect(CloseReason),
}

type RoomCreatedFn = Box<dyn FnOnce(RoomId) + Send + 'static>;
type RoomClosedFn = Box<dyn FnOnce(CloseReason) + Send + 'static>;

/// Room lifecycle callbacks registered by `connect()`. Each fires at most
/// once, on the host task queue.
pub struct RoomCallbacks {
    on_created: RoomCreatedFn,
    on_closed: RoomClosedFn,
}

impl RoomCallbacks {
    pub fn new<C, D>(on_created: C, on_closed: D) -> Self
    where
        C: FnOnce(RoomId) + Send + 'static,
        D: FnOnce(CloseReason) + Send + 'static,
    {
        Self {
            on_created: Box::new(on_created),
            on_closed: Box::new(on_closed),
        }
    }
}

/// What a dispatched frame asks the loop to do next.
enum Flow {
    Continue,
    Close(CloseReason),
}

/// Persistent link to the relay, multiplexing every remote player.
pub struct RelayLink {
    config: RelayConfig,
    queue: Arc<dyn TaskQueue>,
    registry: ConnectionRegistry,
    commands: Sender<LinkCommand>,
    inbox: Mutex<Option<Receiver<LinkCommand>>>,
    poll: Mutex<Option<Poll>>,
    waker: Waker,
    connect_started: AtomicBool,
    attached: AtomicBool,
    running: AtomicBool,
    shutdown: AtomicBool,
    room_id: Mutex<Option<RoomId>>,
    close_reason: Mutex<Option<CloseReason>>,
    on_created: Mutex<Option<RoomCreatedFn>>,
    on_closed: Mutex<Option<RoomClosedFn>>,
}

impl RelayLink {
    /// Build an unconnected link. Every virtual connection it creates gets
    /// `dispatcher` as its first listener.
    pub fn new(
        config: RelayConfig,
        dispatcher: Arc<dyn ConnectionListener>,
        queue: Arc<dyn TaskQueue>,
    ) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (commands, inbox) = mpsc::channel();
        Ok(Arc::new_cyclic(|me: &Weak<RelayLink>| {
            let sink: Weak<dyn RelaySink> = me.clone();
            Self {
                config,
                registry: ConnectionRegistry::new(sink, dispatcher, queue.clone()),
                queue,
                commands,
                inbox: Mutex::new(Some(inbox)),
                poll: Mutex::new(Some(poll)),
                waker,
                connect_started: AtomicBool::new(false),
                attached: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                room_id: Mutex::new(None),
                close_reason: Mutex::new(None),
                on_created: Mutex::new(None),
                on_closed: Mutex::new(None),
            }
        }))
    }

    /// Open the socket to the relay and request a room.
    ///
    /// Returns once the request is queued; the room id arrives later through
    /// `on_created`. One link connects at most once.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        password: Option<String>,
        stats: RoomStats,
        callbacks: RoomCallbacks,
    ) -> Result<(), RelayError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RelayError::LinkDown);
        }
        if self.connect_started.swap(true, Ordering::AcqRel) {
            return Err(RelayError::AlreadyConnected);
        }

        let stream = dial(host, port, self.config.connect_timeout())?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        *lock(&self.on_created) = Some(callbacks.on_created);
        *lock(&self.on_closed) = Some(callbacks.on_closed);
        self.attached.store(true, Ordering::Release);
        self.push(LinkCommand::Attach(TcpStream::from_std(stream)))?;
        self.send(Envelope::RoomCreationRequest {
            version: self.config.protocol_version,
            password,
            stats,
        })?;
        log::info!("connected to relay {host}:{port}; requesting a room");
        Ok(())
    }

    /// Run the event loop on the current thread until `stop()`.
    ///
    /// Only the first call runs the loop; later calls fail with
    /// `AlreadyRunning`.
    pub fn run(&self) -> Result<(), RelayError> {
        let mut poll = lock(&self.poll).take().ok_or(RelayError::AlreadyRunning)?;
        let inbox = lock(&self.inbox).take().ok_or(RelayError::AlreadyRunning)?;
        self.running.store(true, Ordering::Release);
        log::debug!("relay link event loop started");

        let mut events = Events::with_capacity(128);
        let mut wire: Option<Wire> = None;
        let mut last_idle_check = Instant::now();

        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }
            let until_idle_check = self
                .config
                .poll_interval()
                .saturating_sub(last_idle_check.elapsed());
            if let Err(e) = poll.poll(&mut events, Some(until_idle_check)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(RelayError::Io(e));
            }

            let mut readable = false;
            for event in events.iter() {
                if event.token() == STREAM_TOKEN {
                    readable |= event.is_readable() || event.is_read_closed() || event.is_error();
                }
            }

            while let Ok(command) = inbox.try_recv() {
                match command {
                    LinkCommand::Attach(mut stream) => {
                        if let Err(e) = poll.registry().register(
                            &mut stream,
                            STREAM_TOKEN,
                            Interest::READABLE | Interest::WRITABLE,
                        ) {
                            log::warn!("could not register relay socket: {e}");
                            self.teardown(CloseReason::Error);
                            continue;
                        }
                        wire = Some(Wire::new(stream));
                        readable = true;
                    }
                    LinkCommand::Send(frame) => match wire.as_mut() {
                        Some(w) => w.queue(&frame),
                        None => log::debug!("dropping {} byte frame: no relay socket", frame.len()),
                    },
                    LinkCommand::Disconnect(reason) => {
                        if let Some(w) = wire.as_mut() {
                            // Best effort: get the closure request out first.
                            if let Err(e) = w.flush() {
                                log::debug!("final flush to relay failed: {e}");
                            }
                        }
                        self.drop_wire(&poll, &mut wire, reason);
                    }
                }
            }

            if readable {
                self.service_reads(&poll, &mut wire);
            }

            if let Some(Err(e)) = wire.as_mut().map(Wire::flush) {
                log::warn!("write to relay failed: {e}");
                self.drop_wire(&poll, &mut wire, CloseReason::Error);
            }

            if last_idle_check.elapsed() >= self.config.poll_interval() {
                self.check_idle();
                last_idle_check = Instant::now();
            }
        };

        let reason = if result.is_ok() {
            CloseReason::Closed
        } else {
            CloseReason::Error
        };
        if wire.is_some() || self.attached.load(Ordering::Acquire) {
            self.drop_wire(&poll, &mut wire, reason);
        }
        self.running.store(false, Ordering::Release);
        log::debug!("relay link event loop stopped");
        result
    }

    /// Ask the loop to exit. Wakes a blocked poll immediately. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                log::warn!("could not wake relay link event loop: {e}");
            }
        }
    }

    /// Tell the relay the room is closing, then drop the socket.
    /// Does nothing when there is no socket.
    pub fn close_room(&self) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = self.send(Envelope::RoomClosureRequest) {
            log::debug!("could not queue room closure request: {e}");
        }
        if let Err(e) = self.push(LinkCommand::Disconnect(CloseReason::Closed)) {
            log::debug!("could not queue relay disconnect: {e}");
        }
    }

    /// Serialize and queue an envelope for the relay.
    pub fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        if !self.is_alive() {
            return Err(RelayError::LinkDown);
        }
        let json = serde_json::to_vec(&envelope)?;
        let frame = encode_frame(&json)?;
        log::trace!("queueing {} ({} bytes)", envelope.kind(), frame.len());
        self.push(LinkCommand::Send(frame))
    }

    /// True while a relay socket is attached and the link is not stopping.
    pub fn is_alive(&self) -> bool {
        self.attached.load(Ordering::Acquire) && !self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Room id assigned by the relay; `None` until acknowledged and after
    /// the room closes.
    pub fn room_id(&self) -> Option<RoomId> {
        lock(&self.room_id).clone()
    }

    /// The reason the room closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.close_reason)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<VirtualConnection>> {
        self.registry.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn push(&self, command: LinkCommand) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .map_err(|_| RelayError::LinkDown)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Drain the socket, dispatch complete frames, and handle EOF.
    fn service_reads(&self, poll: &Poll, wire: &mut Option<Wire>) {
        let Some(w) = wire.as_mut() else {
            return;
        };
        let read = w.read_available();
        let mut frames = Vec::new();
        let mut bad_frame = false;
        loop {
            match w.frames.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("unrecoverable framing error from relay: {e}");
                    bad_frame = true;
                    break;
                }
            }
        }

        // Frames that arrived together with EOF still count.
        for frame in frames {
            if let Flow::Close(reason) = self.handle_frame(&frame) {
                self.drop_wire(poll, wire, reason);
                return;
            }
        }

        if bad_frame {
            self.drop_wire(poll, wire, CloseReason::Error);
            return;
        }
        match read {
            Ok(false) => {}
            Ok(true) => {
                log::info!("relay closed the connection");
                self.drop_wire(poll, wire, CloseReason::Closed);
            }
            Err(e) => {
                log::warn!("read from relay failed: {e}");
                self.drop_wire(poll, wire, CloseReason::Error);
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) -> Flow {
        let envelope: Envelope = match serde_json::from_slice(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping malformed envelope from relay: {e}");
                return Flow::Continue;
            }
        };
        log::trace!("received {} from relay", envelope.kind());

        match envelope {
            Envelope::ConnectionPacketWrap {
                connection_id,
                payload,
                ..
            } => {
                let (conn, created) = self.registry.get_or_add(connection_id);
                if created {
                    log::debug!("remote player {connection_id} joined through the relay");
                    conn.mark_active();
                    conn.fire_connected();
                }
                conn.fire_received(payload);
            }
            Envelope::ConnectionClosed {
                connection_id,
                reason,
            } => match self.registry.remove_id(connection_id) {
                Some(conn) => conn.close_quietly(reason),
                None => log::debug!("relay closed unknown connection {connection_id}"),
            },
            Envelope::RoomLink { room_id } => {
                log::info!("relay assigned room {room_id}");
                *lock(&self.room_id) = Some(room_id.clone());
                if let Some(on_created) = lock(&self.on_created).take() {
                    self.queue.post(Box::new(move || on_created(room_id)));
                }
            }
            Envelope::RoomClosed { reason } => {
                log::info!("relay closed the room: {reason}");
                lock(&self.close_reason).get_or_insert(reason);
                return Flow::Close(reason);
            }
            Envelope::RelayMessage { text } => {
                log::info!("message from relay: {text}");
            }
            other => {
                log::warn!("ignoring unexpected {} from relay", other.kind());
            }
        }
        Flow::Continue
    }

    /// Deregister and drop the socket (if any), then tear the room down.
    fn drop_wire(&self, poll: &Poll, wire: &mut Option<Wire>, reason: CloseReason) {
        if let Some(mut w) = wire.take() {
            if let Err(e) = poll.registry().deregister(&mut w.stream) {
                log::debug!("deregistering relay socket failed: {e}");
            }
            let _ = w.stream.shutdown(std::net::Shutdown::Both);
        }
        self.teardown(reason);
    }

    fn teardown(&self, reason: CloseReason) {
        self.attached.store(false, Ordering::Release);
        let had_room = lock(&self.room_id).take().is_some();
        let reason = *lock(&self.close_reason).get_or_insert(reason);
        lock(&self.on_created).take();
        if let Some(on_closed) = lock(&self.on_closed).take() {
            self.queue.post(Box::new(move || on_closed(reason)));
        }
        let closed = self.registry.close_all(reason);
        if had_room || closed > 0 {
            log::info!("room torn down ({reason}); closed {closed} relayed connection(s)");
        }
    }

    fn check_idle(&self) {
        for conn in self.registry.connections() {
            if conn.is_connected() && conn.rotate_idle() {
                conn.fire_idle();
            }
        }
    }
}

impl RelaySink for RelayLink {
    fn send_envelope(&self, envelope: Envelope) -> Result<(), RelayError> {
        self.send(envelope)
    }

    fn forget(&self, id: ConnectionId) {
        self.registry.remove_id(id);
    }
}

/// The attached socket plus its buffers. Owned by the loop thread.
struct Wire {
    stream: TcpStream,
    frames: FrameBuffer,
    pending: Vec<u8>,
}

impl Wire {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            frames: FrameBuffer::new(),
            pending: Vec::new(),
        }
    }

    fn queue(&mut self, frame: &[u8]) {
        self.pending.extend_from_slice(frame);
    }

    /// Read until `WouldBlock`. Returns true on EOF.
    fn read_available(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.frames.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much pending data as the socket takes right now.
    fn flush(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Resolve `host:port` and connect to the first address that answers.
/// `timeout` bounds the whole attempt, not each address. Blocking.
pub(crate) fn dial(host: &str, port: u16, timeout: Duration) -> Result<StdTcpStream, RelayError> {
    let addrs = resolve(host, port)?;
    connect_any(&addrs, timeout, &format!("{host}:{port}"))
}

pub(crate) fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, RelayError> {
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| RelayError::Resolve(target.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(RelayError::Resolve(target));
    }
    Ok(addrs)
}

/// Try `addrs` in order against one shared deadline.
pub(crate) fn connect_any(
    addrs: &[SocketAddr],
    timeout: Duration,
    target: &str,
) -> Result<StdTcpStream, RelayError> {
    let deadline = Instant::now() + timeout;
    let mut last_error = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::debug!("connect to {target} ran out of time before {addr}");
            last_error = Some(io::ErrorKind::TimedOut.into());
            break;
        }
        match StdTcpStream::connect_timeout(addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("connect to {addr} failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(RelayError::Connect {
        addr: target.to_owned(),
        source: last_error.unwrap_or_else(|| io::ErrorKind::AddrNotAvailable.into()),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
