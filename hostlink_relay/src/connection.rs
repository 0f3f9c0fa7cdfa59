// Virtual connections: one per remote player reached through the relay.
//
// The host's game layer talks to players through the `Connection` trait and
// receives events through `ConnectionListener`. A genuine socket connection
// and a `VirtualConnection` both implement `Connection`, so dispatch code does
// not care whether a player is local or relayed.
//
// A `VirtualConnection` holds no socket. Outbound sends are wrapped in a
// `ConnectionPacketWrap` envelope and handed to its `RelaySink` (the owning
// `RelayLink`), which queues the frame for the link's event loop thread.
// The sink is held weakly: a virtual connection never keeps its link alive,
// and once the link is gone every send fails with `RelayError::LinkDown`.
//
// State is two atomics, written by the link thread and read from whatever
// thread the game dispatches on:
// - `connected`: true until the first `close()`; the `swap` in `close` makes
//   teardown happen exactly once no matter how many threads race on it.
// - `idle`: set by the link after each idle check, cleared by every send.
//   See `RelayLink::run` for the idle window.
//
// Listener fan-out (`fire_*`) is posted to the host `TaskQueue` rather than
// run on the calling thread.
//
// See also: `registry.rs` (creation and lookup), `link.rs` (inbound dispatch
// and the idle check).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use hostlink_protocol::{CloseReason, ConnectionId, Envelope};

use crate::error::RelayError;
use crate::queue::TaskQueue;

/// Transport-agnostic view of a player connection.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Send over the reliable channel.
    fn send_tcp(&self, payload: &[u8]) -> Result<(), RelayError>;

    /// Send over the unreliable channel.
    fn send_udp(&self, payload: &[u8]) -> Result<(), RelayError>;

    /// Close the connection and tell the remote side. Idempotent.
    fn close(&self, reason: CloseReason);

    fn is_connected(&self) -> bool;
}

/// Receiver of connection events (the host's local dispatcher, or any
/// wrapper such as a traffic logger).
///
/// Every method has a no-op default so implementors pick what they need.
#[allow(unused_variables)]
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, conn: &Arc<dyn Connection>) {}

    fn received(&self, conn: &Arc<dyn Connection>, payload: &[u8]) {}

    fn disconnected(&self, conn: &Arc<dyn Connection>, reason: CloseReason) {}

    /// The connection sent nothing since the last idle check.
    fn idle(&self, conn: &Arc<dyn Connection>) {}
}

/// Where a virtual connection sends its envelopes.
pub trait RelaySink: Send + Sync {
    fn send_envelope(&self, envelope: Envelope) -> Result<(), RelayError>;

    /// Drop `id` from the sink's registry after a locally initiated close.
    fn forget(&self, id: ConnectionId);
}

/// Local stand-in for one remote player's connection.
pub struct VirtualConnection {
    id: ConnectionId,
    sink: Weak<dyn RelaySink>,
    queue: Arc<dyn TaskQueue>,
    connected: AtomicBool,
    idle: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    me: Weak<VirtualConnection>,
}

impl VirtualConnection {
    pub fn new(id: ConnectionId, sink: Weak<dyn RelaySink>, queue: Arc<dyn TaskQueue>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            sink,
            queue,
            connected: AtomicBool::new(true),
            idle: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.lock_listeners().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Close the connection. The first call wins; later calls do nothing.
    ///
    /// `notify_peer` says whether the relay still needs to hear about it. It
    /// is false when the relay announced the closure itself or is already
    /// gone, which avoids echoing `ConnectionClosed` back to it.
    pub fn close_with(&self, reason: CloseReason, notify_peer: bool) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if notify_peer {
            if let Some(sink) = self.sink.upgrade() {
                let envelope = Envelope::ConnectionClosed {
                    connection_id: self.id,
                    reason,
                };
                if let Err(e) = sink.send_envelope(envelope) {
                    log::debug!("could not notify relay about closing {}: {e}", self.id);
                }
                sink.forget(self.id);
            }
        }
        log::debug!("connection {} closed ({reason})", self.id);
        self.fire_disconnected(reason);
    }

    /// Close without telling the relay.
    pub fn close_quietly(&self, reason: CloseReason) {
        self.close_with(reason, false);
    }

    fn send(&self, payload: &[u8], is_tcp: bool) -> Result<(), RelayError> {
        if payload.is_empty() {
            return Err(RelayError::EmptyPayload);
        }
        if !self.is_connected() {
            return Err(RelayError::ConnectionClosed(self.id));
        }
        let sink = self.sink.upgrade().ok_or(RelayError::LinkDown)?;
        sink.send_envelope(Envelope::ConnectionPacketWrap {
            connection_id: self.id,
            is_tcp,
            payload: payload.to_vec(),
        })?;
        self.idle.store(false, Ordering::Release);
        Ok(())
    }

    /// Count the current idle window as busy.
    pub(crate) fn mark_active(&self) {
        self.idle.store(false, Ordering::Release);
    }

    /// Start a new idle window. Returns whether the window that just ended
    /// saw no sends.
    pub(crate) fn rotate_idle(&self) -> bool {
        self.idle.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn fire_connected(&self) {
        self.fan_out(|listener, conn| listener.connected(conn));
    }

    pub(crate) fn fire_received(&self, payload: Vec<u8>) {
        self.fan_out(move |listener, conn| listener.received(conn, &payload));
    }

    pub(crate) fn fire_disconnected(&self, reason: CloseReason) {
        self.fan_out(move |listener, conn| listener.disconnected(conn, reason));
    }

    pub(crate) fn fire_idle(&self) {
        self.fan_out(|listener, conn| listener.idle(conn));
    }

    /// Post one task that calls `f` for every listener registered right now.
    fn fan_out<F>(&self, f: F)
    where
        F: Fn(&Arc<dyn ConnectionListener>, &Arc<dyn Connection>) + Send + 'static,
    {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let listeners = self.lock_listeners().clone();
        if listeners.is_empty() {
            return;
        }
        let conn: Arc<dyn Connection> = me;
        self.queue.post(Box::new(move || {
            for listener in &listeners {
                f(listener, &conn);
            }
        }));
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn ConnectionListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Connection for VirtualConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_tcp(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.send(payload, true)
    }

    fn send_udp(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.send(payload, false)
    }

    fn close(&self, reason: CloseReason) {
        self.close_with(reason, true);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("idle", &self.is_idle())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queue::ImmediateQueue;

    /// Records everything a `VirtualConnection` hands to its link.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<Envelope>>,
        pub forgotten: Mutex<Vec<ConnectionId>>,
    }

    impl RelaySink for RecordingSink {
        fn send_envelope(&self, envelope: Envelope) -> Result<(), RelayError> {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        fn forget(&self, id: ConnectionId) {
            self.forgotten.lock().unwrap().push(id);
        }
    }

    /// Listener that logs every callback as a string.
    #[derive(Default)]
    pub(crate) struct EventLog {
        pub events: Mutex<Vec<String>>,
    }

    impl ConnectionListener for EventLog {
        fn connected(&self, conn: &Arc<dyn Connection>) {
            self.events.lock().unwrap().push(format!("connected {}", conn.id().0));
        }

        fn received(&self, conn: &Arc<dyn Connection>, payload: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("received {} {payload:?}", conn.id().0));
        }

        fn disconnected(&self, conn: &Arc<dyn Connection>, reason: CloseReason) {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnected {} {reason}", conn.id().0));
        }

        fn idle(&self, conn: &Arc<dyn Connection>) {
            self.events.lock().unwrap().push(format!("idle {}", conn.id().0));
        }
    }

    fn connection_with_sink(sink: &Arc<RecordingSink>) -> Arc<VirtualConnection> {
        let sink: Arc<dyn RelaySink> = sink.clone();
        VirtualConnection::new(ConnectionId(7), Arc::downgrade(&sink), Arc::new(ImmediateQueue))
    }

    #[test]
    fn send_wraps_payload_with_transport_flag() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);

        conn.send_tcp(&[1, 2]).unwrap();
        conn.send_udp(&[3]).unwrap();

        let sent = sink.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![
                Envelope::ConnectionPacketWrap {
                    connection_id: ConnectionId(7),
                    is_tcp: true,
                    payload: vec![1, 2],
                },
                Envelope::ConnectionPacketWrap {
                    connection_id: ConnectionId(7),
                    is_tcp: false,
                    payload: vec![3],
                },
            ]
        );
    }

    #[test]
    fn empty_payload_is_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);
        assert!(matches!(conn.send_tcp(&[]), Err(RelayError::EmptyPayload)));
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn send_clears_idle_and_rotation_reports_it() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);
        assert!(conn.is_idle());

        conn.send_tcp(&[9]).unwrap();
        assert!(!conn.is_idle());
        assert!(!conn.rotate_idle(), "window with a send is not idle");
        assert!(conn.rotate_idle(), "window without a send is idle");
    }

    #[test]
    fn close_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);
        let log = Arc::new(EventLog::default());
        conn.add_listener(log.clone());

        Connection::close(&*conn, CloseReason::Kicked);
        Connection::close(&*conn, CloseReason::Kicked);

        assert_eq!(*log.events.lock().unwrap(), vec!["disconnected 7 kicked"]);
        assert_eq!(
            *sink.sent.lock().unwrap(),
            vec![Envelope::ConnectionClosed {
                connection_id: ConnectionId(7),
                reason: CloseReason::Kicked,
            }]
        );
        assert_eq!(*sink.forgotten.lock().unwrap(), vec![ConnectionId(7)]);
    }

    #[test]
    fn quiet_close_never_talks_to_the_relay() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);
        let log = Arc::new(EventLog::default());
        conn.add_listener(log.clone());

        conn.close_quietly(CloseReason::Timeout);
        conn.close_quietly(CloseReason::Timeout);

        assert_eq!(*log.events.lock().unwrap(), vec!["disconnected 7 timeout"]);
        assert!(sink.sent.lock().unwrap().is_empty());
        assert!(sink.forgotten.lock().unwrap().is_empty());
    }

    #[test]
    fn send_after_close_fails() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);
        conn.close_quietly(CloseReason::Closed);
        assert!(matches!(
            conn.send_tcp(&[1]),
            Err(RelayError::ConnectionClosed(ConnectionId(7)))
        ));
    }

    #[test]
    fn send_without_link_is_link_down() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);
        drop(sink);
        assert!(matches!(conn.send_udp(&[1]), Err(RelayError::LinkDown)));
    }

    #[test]
    fn every_listener_hears_every_event() {
        let sink = Arc::new(RecordingSink::default());
        let conn = connection_with_sink(&sink);
        let dispatcher = Arc::new(EventLog::default());
        let tap = Arc::new(EventLog::default());
        conn.add_listener(dispatcher.clone());
        conn.add_listener(tap.clone());

        conn.fire_connected();
        conn.fire_received(vec![4, 2]);
        conn.fire_idle();

        let expected = vec!["connected 7", "received 7 [4, 2]", "idle 7"];
        assert_eq!(*dispatcher.events.lock().unwrap(), expected);
        assert_eq!(*tap.events.lock().unwrap(), expected);
    }
}
