// Core ID and status types for the relay envelope protocol.
//
// `ConnectionId` and `RoomId` are relay-scoped identifiers: the relay assigns
// a compact integer to every remote player it forwards to the host, and a
// short string to every room it creates. Neither is globally unique across
// sessions.
//
// `CloseReason` is the relay's closed set of disconnect codes. On the wire it
// is a bare `u8`, and codes this crate does not know about survive a
// decode/encode cycle as `CloseReason::Other(code)` so the host never rejects
// a message just because the relay grew a new reason.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned id of one remote player's connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub i32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Relay-assigned id of a hosted room.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Why a connection or a room went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum CloseReason {
    /// Orderly close requested by either side.
    Closed,
    Timeout,
    /// Transport or protocol failure.
    Error,
    Kicked,
    /// Host and relay disagree on the protocol version.
    VersionMismatch,
    /// The relay refused the request (room creation, join).
    Rejected,
    /// The relay itself is shutting down.
    ServerClosed,
    /// A relay-defined code this build does not know.
    Other(u8),
}

impl CloseReason {
    /// Stable key for looking up a localized, user-facing message.
    pub fn message_key(self) -> &'static str {
        match self {
            CloseReason::Closed => "relay.closed.normal",
            CloseReason::Timeout => "relay.closed.timeout",
            CloseReason::Error => "relay.closed.error",
            CloseReason::Kicked => "relay.closed.kicked",
            CloseReason::VersionMismatch => "relay.closed.version",
            CloseReason::Rejected => "relay.closed.rejected",
            CloseReason::ServerClosed => "relay.closed.server",
            CloseReason::Other(_) => "relay.closed.unknown",
        }
    }
}

impl From<u8> for CloseReason {
    fn from(code: u8) -> Self {
        match code {
            0 => CloseReason::Closed,
            1 => CloseReason::Timeout,
            2 => CloseReason::Error,
            3 => CloseReason::Kicked,
            4 => CloseReason::VersionMismatch,
            5 => CloseReason::Rejected,
            6 => CloseReason::ServerClosed,
            other => CloseReason::Other(other),
        }
    }
}

impl From<CloseReason> for u8 {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Closed => 0,
            CloseReason::Timeout => 1,
            CloseReason::Error => 2,
            CloseReason::Kicked => 3,
            CloseReason::VersionMismatch => 4,
            CloseReason::Rejected => 5,
            CloseReason::ServerClosed => 6,
            CloseReason::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Closed => f.write_str("closed"),
            CloseReason::Timeout => f.write_str("timeout"),
            CloseReason::Error => f.write_str("error"),
            CloseReason::Kicked => f.write_str("kicked"),
            CloseReason::VersionMismatch => f.write_str("version mismatch"),
            CloseReason::Rejected => f.write_str("rejected"),
            CloseReason::ServerClosed => f.write_str("server closed"),
            CloseReason::Other(code) => write!(f, "relay code {code}"),
        }
    }
}

/// One connected player as reported in room stats.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub name: String,
    pub locale: String,
}

/// Snapshot of the host's state, shown by the relay's room browser.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub map_name: String,
    pub gamemode: String,
    pub host_name: String,
    pub mods: Vec<String>,
    pub locale: String,
    pub version: String,
    pub players: Vec<PlayerStats>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}
