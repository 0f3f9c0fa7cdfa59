// hostlink_relay — host-side runtime for rooms hosted through a relay.
//
// A relay lets a player host a game without opening ports: the host keeps
// one outbound TCP connection to the relay, and every remote player's
// traffic arrives over it, wrapped in envelopes tagged with a relay-assigned
// connection id. This crate turns that single link back into one
// `Connection` per remote player, so the host's ordinary dispatch code never
// sees the relay.
//
// Module overview:
// - `link.rs`:       `RelayLink`: the socket, the mio event loop, inbound
//                    dispatch, room lifecycle callbacks.
// - `connection.rs`: `Connection` / `ConnectionListener` traits and
//                    `VirtualConnection`, the per-player stand-in.
// - `registry.rs`:   `ConnectionRegistry`, id → virtual connection.
// - `session.rs`:    `SessionManager`: create / close / dispose a hosted
//                    room, serialized on one worker thread.
// - `probe.rs`:      `LatencyProbe`: timed connects for relay lists.
// - `stats.rs`:      `StatusBroadcaster` and the `HostState` accessor.
// - `queue.rs`:      `TaskQueue`: how callbacks reach the host's thread.
// - `worker.rs`:     single-thread executor and bounded joins.
// - `config.rs`, `error.rs`: `RelayConfig`, `RelayError`.
//
// Dependencies: `hostlink_protocol` (envelopes and framing), `mio` (event
// loop), `log`, `thiserror`, `serde_json`.

pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod probe;
pub mod queue;
pub mod registry;
pub mod session;
pub mod stats;
pub mod worker;

pub use config::RelayConfig;
pub use connection::{Connection, ConnectionListener, RelaySink, VirtualConnection};
pub use error::RelayError;
pub use link::{RelayLink, RoomCallbacks};
pub use probe::{LatencyProbe, ProbeClient};
pub use queue::{ImmediateQueue, MainQueue, Task, TaskQueue};
pub use registry::ConnectionRegistry;
pub use session::{SessionCallbacks, SessionManager, SessionState};
pub use stats::{HostState, StaticHostState, StatsTrigger, StatusBroadcaster, snapshot};
