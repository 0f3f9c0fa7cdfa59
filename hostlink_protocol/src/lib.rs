// hostlink_protocol — wire protocol between a NAT'd game host and the relay.
//
// A host that cannot accept inbound connections keeps one outbound TCP stream
// to a public relay. The relay accepts remote players and forwards their
// traffic over that stream wrapped in envelopes tagged with a relay-assigned
// connection id. This crate defines those envelopes and their framing; it is
// shared by the host runtime (`hostlink_relay`) and the test relay in
// `multiplayer_tests`.
//
// Module overview:
// - `types.rs`:    `ConnectionId`, `RoomId`, `CloseReason`, `RoomStats`,
//                  `PlayerStats`.
// - `message.rs`:  The `Envelope` enum covering both directions.
// - `framing.rs`:  4-byte big-endian length prefix + payload. Blocking
//                  `read_message`/`write_message` and an incremental
//                  `FrameBuffer` for non-blocking sockets.
//
// Design decisions:
// - **JSON serialization** of envelopes, length-delimited. Game payloads stay
//   opaque `Vec<u8>` inside a wrap.
// - **No async runtime.** Framing is plain `std::io`, usable from blocking
//   streams and from a `mio` event loop alike.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{FrameBuffer, MAX_MESSAGE_SIZE, encode_frame, read_message, write_message};
pub use message::Envelope;
pub use types::{CloseReason, ConnectionId, PlayerStats, RoomId, RoomStats};

/// Protocol version announced in `RoomCreationRequest`. The relay closes the
/// room with `CloseReason::VersionMismatch` if it does not speak it.
pub const PROTOCOL_VERSION: u32 = 1;
