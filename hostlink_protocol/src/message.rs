// Envelopes exchanged between a NAT'd host and the relay.
//
// One enum covers both directions because the relay and the host share a
// single stream. Host → relay: `RoomCreationRequest`, `RoomClosureRequest`,
// `StatsUpdate`, plus `ConnectionPacketWrap` / `ConnectionClosed` for replies
// and host-side kicks. Relay → host: `RoomLink`, `RoomClosed`,
// `RelayMessage`, plus `ConnectionPacketWrap` / `ConnectionClosed` for
// remote-player traffic. `RoomJoin` is what a joining player sends the relay;
// the host never sees it, but it lives here so both sides build from one
// vocabulary.
//
// Payloads are opaque `Vec<u8>`: the relay and this crate never inspect the
// game protocol inside a wrap.

use serde::{Deserialize, Serialize};

use crate::types::{CloseReason, ConnectionId, RoomId, RoomStats};

/// A single relay protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Game traffic of one remote player.
    ConnectionPacketWrap {
        connection_id: ConnectionId,
        /// Transport the game asked for; the relay picks the socket.
        is_tcp: bool,
        payload: Vec<u8>,
    },
    /// A remote player's connection is gone (either direction).
    ConnectionClosed {
        connection_id: ConnectionId,
        reason: CloseReason,
    },
    /// Host asks the relay to open a room.
    RoomCreationRequest {
        version: u32,
        password: Option<String>,
        stats: RoomStats,
    },
    /// Relay acknowledges room creation.
    RoomLink { room_id: RoomId },
    /// Relay closed (or refused) the room.
    RoomClosed { reason: CloseReason },
    /// Host is shutting its room down.
    RoomClosureRequest,
    /// Periodic host state for the room browser.
    StatsUpdate { room_id: RoomId, stats: RoomStats },
    /// A player asks the relay to join a room.
    RoomJoin {
        room_id: RoomId,
        password: Option<String>,
    },
    /// Free-form notice from the relay operator.
    RelayMessage { text: String },
}

impl Envelope {
    /// Short variant name for log lines; never includes payload bytes.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ConnectionPacketWrap { .. } => "ConnectionPacketWrap",
            Envelope::ConnectionClosed { .. } => "ConnectionClosed",
            Envelope::RoomCreationRequest { .. } => "RoomCreationRequest",
            Envelope::RoomLink { .. } => "RoomLink",
            Envelope::RoomClosed { .. } => "RoomClosed",
            Envelope::RoomClosureRequest => "RoomClosureRequest",
            Envelope::StatsUpdate { .. } => "StatsUpdate",
            Envelope::RoomJoin { .. } => "RoomJoin",
            Envelope::RelayMessage { .. } => "RelayMessage",
        }
    }
}
