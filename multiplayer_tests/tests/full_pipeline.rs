// End-to-end tests for relay-hosted sessions.
//
// Each test starts a `MockRelay` on an ephemeral port and drives a real
// `SessionManager` against it: real sockets, the real mio event loop, real
// framing. The mock plays the relay's part synchronously, so every scenario
// reads as the exchange a host would see in production:
// create → RoomCreationRequest → RoomLink → wrapped player traffic → close.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hostlink_protocol::{CloseReason, ConnectionId, Envelope};
use hostlink_relay::{RelayConfig, RelayError, SessionState, StatsTrigger, StatusBroadcaster};
use multiplayer_tests::{
    Event, MockRelay, Outcome, closed_port, next_outcome, open_room, session_callbacks,
    test_config, test_session, wait_until,
};

// ---------------------------------------------------------------------------
// Room lifecycle
// ---------------------------------------------------------------------------

#[test]
fn acknowledged_room_id_reaches_the_host() {
    let relay = MockRelay::start();
    let (session, _recorder) = test_session(test_config());

    let (_host, _outcomes) = open_room(&relay, &session, "abc123");

    assert_eq!(session.state(), SessionState::Active);
    assert!(session.is_active());
    assert_eq!(session.room_id().unwrap().as_str(), "abc123");
    let link = session.link().unwrap();
    assert_eq!(link.room_id().unwrap().as_str(), "abc123");
}

#[test]
fn creation_request_carries_password_and_stats() {
    let relay = MockRelay::start();
    let (session, _recorder) = test_session(test_config());
    let (callbacks, _outcomes) = session_callbacks();

    session.create("127.0.0.1", relay.port(), Some("hunter2".into()), callbacks);
    let (_host, password, stats) = relay.accept_room();

    assert_eq!(password.as_deref(), Some("hunter2"));
    assert_eq!(stats.map_name, "Thicket");
    assert_eq!(stats.host_name, "tester");
    assert!(stats.created_at > 0);
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(session.link().is_none(), "no link before the room is acknowledged");
}

#[test]
fn create_while_active_fails_without_touching_the_session() {
    let relay = MockRelay::start();
    let (session, _recorder) = test_session(test_config());
    let (_host, _outcomes) = open_room(&relay, &session, "abc123");

    let (callbacks, outcomes) = session_callbacks();
    session.create("127.0.0.1", relay.port(), None, callbacks);

    assert!(matches!(
        next_outcome(&outcomes),
        Outcome::Failed(RelayError::SessionActive)
    ));
    assert!(session.is_active());
    assert_eq!(session.room_id().unwrap().as_str(), "abc123");
}

#[test]
fn dispose_then_create_succeeds() {
    let relay = MockRelay::start();
    let (session, _recorder) = test_session(test_config());
    let (mut first, outcomes) = open_room(&relay, &session, "first");

    session.dispose();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(first.wait_eof(), "dispose should drop the relay socket");
    assert!(
        outcomes.recv_timeout(Duration::from_millis(200)).is_err(),
        "dispose is silent"
    );

    let (_second, _outcomes) = open_room(&relay, &session, "second");
    assert_eq!(session.room_id().unwrap().as_str(), "second");
}

#[test]
fn refused_connect_reports_on_fail() {
    let (session, _recorder) = test_session(test_config());
    let (callbacks, outcomes) = session_callbacks();

    session.create("127.0.0.1", closed_port(), None, callbacks);

    match next_outcome(&outcomes) {
        Outcome::Failed(RelayError::Connect { addr, .. }) => {
            assert!(addr.starts_with("127.0.0.1:"));
        }
        other => panic!("expected a connect failure, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn room_closed_before_ack_is_a_rejection() {
    let relay = MockRelay::start();
    let (session, _recorder) = test_session(test_config());
    let (callbacks, outcomes) = session_callbacks();

    session.create("127.0.0.1", relay.port(), Some("wrong".into()), callbacks);
    let (mut host, _, _) = relay.accept_room();
    host.send(&Envelope::RoomClosed {
        reason: CloseReason::Rejected,
    });

    assert!(matches!(
        next_outcome(&outcomes),
        Outcome::Failed(RelayError::Rejected(CloseReason::Rejected))
    ));
    wait_until("session to go idle", || session.state() == SessionState::Idle);

    // A rejected session does not block the next one.
    let (_host, _outcomes) = open_room(&relay, &session, "retry");
}

#[test]
fn close_before_ack_cancels_without_a_rejection() {
    let relay = MockRelay::start();
    let (session, _recorder) = test_session(test_config());
    let (callbacks, outcomes) = session_callbacks();

    session.create("127.0.0.1", relay.port(), None, callbacks);
    let (mut host, _, _) = relay.accept_room();
    session.close();

    assert_eq!(host.recv(), Envelope::RoomClosureRequest);
    assert!(host.wait_eof());
    wait_until("session to go idle", || session.state() == SessionState::Idle);
    let outcome = outcomes.recv_timeout(Duration::from_millis(300));
    assert!(outcome.is_err(), "cancelled request reported {outcome:?}");

    let (_host, _outcomes) = open_room(&relay, &session, "after-cancel");
}

#[test]
fn close_sends_closure_request_then_drops_the_socket() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, outcomes) = open_room(&relay, &session, "abc123");
    host.wrap(4, b"hi");
    recorder.wait_for_events(2);

    session.close();

    assert_eq!(host.recv(), Envelope::RoomClosureRequest);
    assert!(host.wait_eof());
    assert!(matches!(
        next_outcome(&outcomes),
        Outcome::Disconnected(CloseReason::Closed)
    ));
    assert_eq!(session.state(), SessionState::Idle);
    let events = recorder.wait_for_events(3);
    assert_eq!(events[2], Event::Disconnected(4, CloseReason::Closed));

    session.close();
}

#[test]
fn relay_room_closure_tears_down_every_connection_quietly() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, outcomes) = open_room(&relay, &session, "abc123");
    host.wrap(1, b"a");
    host.wrap(2, b"b");
    recorder.wait_for_events(4);
    let link = session.link().unwrap();

    host.send(&Envelope::RoomClosed {
        reason: CloseReason::ServerClosed,
    });

    assert!(matches!(
        next_outcome(&outcomes),
        Outcome::Disconnected(CloseReason::ServerClosed)
    ));
    let mut closes: Vec<_> = recorder
        .wait_for_events(6)
        .into_iter()
        .filter(|event| matches!(event, Event::Disconnected(..)))
        .collect();
    closes.sort_by_key(|event| match event {
        Event::Disconnected(id, _) => *id,
        _ => 0,
    });
    assert_eq!(
        closes,
        vec![
            Event::Disconnected(1, CloseReason::ServerClosed),
            Event::Disconnected(2, CloseReason::ServerClosed),
        ]
    );
    assert_eq!(link.connection_count(), 0);
    assert!(link.room_id().is_none());
    assert_eq!(link.close_reason(), Some(CloseReason::ServerClosed));

    // Nothing is echoed back before the host hangs up.
    loop {
        match host.recv_any() {
            Ok(envelope) => assert!(
                !matches!(envelope, Envelope::ConnectionClosed { .. }),
                "relay-initiated teardown must not be echoed: {envelope:?}"
            ),
            Err(_) => break,
        }
    }
}

#[test]
fn relay_hangup_ends_the_session() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, outcomes) = open_room(&relay, &session, "abc123");
    host.wrap(9, b"x");
    recorder.wait_for_events(2);

    host.shutdown();

    assert!(matches!(
        next_outcome(&outcomes),
        Outcome::Disconnected(CloseReason::Closed)
    ));
    let events = recorder.wait_for_events(3);
    assert_eq!(events[2], Event::Disconnected(9, CloseReason::Closed));
    assert_eq!(session.state(), SessionState::Idle);
}

// ---------------------------------------------------------------------------
// Relayed player traffic
// ---------------------------------------------------------------------------

#[test]
fn first_wrap_opens_a_connection_and_delivers_once() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");

    host.wrap(7, b"hello");

    let events = recorder.wait_for_events(2);
    assert_eq!(
        events,
        vec![Event::Connected(7), Event::Received(7, b"hello".to_vec())]
    );
    let link = session.link().unwrap();
    assert_eq!(link.connection_count(), 1);
    assert!(link.connection(ConnectionId(7)).is_some());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.events().len(), 2, "payload delivered exactly once");
}

#[test]
fn many_wraps_arrive_in_order_on_one_connection() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");

    for i in 0..50u8 {
        host.wrap(3, &[i, i.wrapping_mul(3)]);
    }

    let events = recorder.wait_for_events(51);
    assert_eq!(events[0], Event::Connected(3));
    let payloads: Vec<_> = events[1..]
        .iter()
        .map(|event| match event {
            Event::Received(3, payload) => payload.clone(),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    let expected: Vec<_> = (0..50u8).map(|i| vec![i, i.wrapping_mul(3)]).collect();
    assert_eq!(payloads, expected);
    assert_eq!(session.link().unwrap().connection_count(), 1);
}

#[test]
fn relay_connection_close_disconnects_once() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");
    host.wrap(7, b"x");
    recorder.wait_for_events(2);

    host.send(&Envelope::ConnectionClosed {
        connection_id: ConnectionId(7),
        reason: CloseReason::Timeout,
    });

    let events = recorder.wait_for_events(3);
    assert_eq!(events[2], Event::Disconnected(7, CloseReason::Timeout));
    let link = session.link().unwrap();
    wait_until("connection 7 to be unregistered", || {
        link.connection(ConnectionId(7)).is_none()
    });

    // A repeated close for an unknown id is ignored.
    host.send(&Envelope::ConnectionClosed {
        connection_id: ConnectionId(7),
        reason: CloseReason::Timeout,
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.events().len(), 3);
    assert!(!recorder.connection(7).unwrap().is_connected());
}

#[test]
fn host_replies_reach_the_relay_with_their_transport() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");
    host.wrap(5, b"ping");
    recorder.wait_for_events(2);
    let conn = recorder.connection(5).unwrap();

    conn.send_tcp(b"pong").unwrap();
    conn.send_udp(b"state").unwrap();

    assert_eq!(
        host.recv(),
        Envelope::ConnectionPacketWrap {
            connection_id: ConnectionId(5),
            is_tcp: true,
            payload: b"pong".to_vec(),
        }
    );
    assert_eq!(
        host.recv(),
        Envelope::ConnectionPacketWrap {
            connection_id: ConnectionId(5),
            is_tcp: false,
            payload: b"state".to_vec(),
        }
    );
    assert!(matches!(conn.send_tcp(&[]), Err(RelayError::EmptyPayload)));
}

#[test]
fn host_kick_notifies_the_relay() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");
    host.wrap(8, b"x");
    recorder.wait_for_events(2);
    let conn = recorder.connection(8).unwrap();

    conn.close(CloseReason::Kicked);
    conn.close(CloseReason::Kicked);

    assert_eq!(
        host.recv(),
        Envelope::ConnectionClosed {
            connection_id: ConnectionId(8),
            reason: CloseReason::Kicked,
        }
    );
    let events = recorder.wait_for_events(3);
    assert_eq!(events[2], Event::Disconnected(8, CloseReason::Kicked));
    assert_eq!(session.link().unwrap().connection_count(), 0);
    assert!(matches!(
        conn.send_tcp(b"late"),
        Err(RelayError::ConnectionClosed(ConnectionId(8)))
    ));
}

#[test]
fn quiet_connections_get_idle_notifications() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");

    host.wrap(2, b"x");

    wait_until("an idle notification", || {
        recorder.all_events().contains(&Event::Idle(2))
    });
}

#[test]
fn idle_windows_follow_the_clock_not_the_traffic() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(RelayConfig {
        poll_interval_ms: 250,
        ..test_config()
    });
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");

    host.wrap(2, b"quiet");
    host.wrap(3, b"busy");
    recorder.wait_for_events(4);
    assert!(
        !recorder.all_events().contains(&Event::Idle(2)),
        "a new connection is not idle in the window it opened in"
    );

    // Every send wakes the event loop; none of those wakeups may start a
    // new idle window early.
    let busy = recorder.connection(3).unwrap();
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(1_200) {
        busy.send_tcp(b"tick").unwrap();
        thread::sleep(Duration::from_millis(50));
    }

    let events = recorder.all_events();
    let quiet_windows = events.iter().filter(|e| **e == Event::Idle(2)).count();
    assert!(quiet_windows >= 1, "quiet connection never went idle");
    assert!(quiet_windows <= 7, "{quiet_windows} idle windows in 1.2 s");
    assert!(!events.contains(&Event::Idle(3)), "busy connection reported idle");
}

#[test]
fn malformed_frames_are_dropped_without_closing_the_room() {
    let relay = MockRelay::start();
    let (session, recorder) = test_session(test_config());
    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");

    host.send_raw(b"definitely not json");
    host.send(&Envelope::RoomClosureRequest);
    host.wrap(6, b"after");

    let events = recorder.wait_for_events(2);
    assert_eq!(
        events,
        vec![Event::Connected(6), Event::Received(6, b"after".to_vec())]
    );
    assert!(session.is_active());
}

// ---------------------------------------------------------------------------
// Room stats
// ---------------------------------------------------------------------------

#[test]
fn stats_updates_go_out_only_while_hosting() {
    let relay = MockRelay::start();
    let (session, _recorder) = test_session(test_config());
    let session = Arc::new(session);
    let host_state = Arc::new(hostlink_relay::StaticHostState {
        stats: hostlink_protocol::RoomStats {
            map_name: "Grove".into(),
            ..Default::default()
        },
    });
    let broadcaster = StatusBroadcaster::new(
        session.clone(),
        host_state,
        Arc::new(hostlink_relay::ImmediateQueue),
    );
    assert!(!broadcaster.update().unwrap(), "idle session sends nothing");

    let (mut host, _outcomes) = open_room(&relay, &session, "abc123");
    assert!(broadcaster.update().unwrap());
    broadcaster.trigger(StatsTrigger::PlayerJoined);

    for _ in 0..2 {
        match host.recv_any().unwrap() {
            Envelope::StatsUpdate { room_id, stats } => {
                assert_eq!(room_id.as_str(), "abc123");
                assert_eq!(stats.map_name, "Grove");
            }
            other => panic!("expected StatsUpdate, got {other:?}"),
        }
    }
}
