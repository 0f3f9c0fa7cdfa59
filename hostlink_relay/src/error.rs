// Error type shared by every component of the host runtime.
//
// Errors raised on the link's event loop thread never travel across threads
// as `Result`s; the loop turns them into `on_room_closed` callbacks. The
// variants that do reach callers come from three places:
// - the first `connect()` of a link (`Resolve`, `Connect`), reported through
//   `SessionManager`'s `on_fail` or returned from `RelayLink::connect`,
// - misuse by the calling layer (`EmptyPayload`, `ConnectionClosed`,
//   `SessionActive`, ...), which fails loudly instead of dropping data,
// - the relay refusing a room (`Rejected`), which carries the relay's reason.

use std::io;

use hostlink_protocol::{CloseReason, ConnectionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not resolve relay address {0}")]
    Resolve(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("relay rejected the room: {0}")]
    Rejected(CloseReason),

    #[error("a relay session is already active")]
    SessionActive,

    #[error("relay link is already connected")]
    AlreadyConnected,

    #[error("relay link event loop is already running")]
    AlreadyRunning,

    #[error("relay link is down")]
    LinkDown,

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("refusing to send an empty payload")]
    EmptyPayload,

    #[error("malformed envelope: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("background worker has shut down")]
    WorkerGone,
}

impl RelayError {
    /// The close reason a host UI should show for this failure.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            RelayError::Rejected(reason) => *reason,
            RelayError::Connect { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                CloseReason::Timeout
            }
            _ => CloseReason::Error,
        }
    }
}
