// Runtime configuration for the relay link and its helpers.
//
// All timing knobs live in `RelayConfig` so tests can shrink them and hosts
// can tune them from a JSON file without recompiling. Every field has a
// default; a JSON document only needs the keys it wants to override.
//
// Durations are stored as integer milliseconds to keep the JSON readable and
// are exposed as `Duration` through accessor methods.

use std::time::Duration;

use hostlink_protocol::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};

/// Timeouts, cadences, and protocol settings for one host process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bound on the initial TCP connect to the relay.
    pub connect_timeout_ms: u64,
    /// Upper bound on one event loop poll. Also the idle-check window.
    pub poll_interval_ms: u64,
    /// Bound on a single latency probe connect.
    pub probe_timeout_ms: u64,
    /// Cadence of scheduled `StatsUpdate` broadcasts.
    pub stats_interval_ms: u64,
    /// How long `dispose()` waits for a worker thread before moving on.
    pub join_timeout_ms: u64,
    /// Version sent in `RoomCreationRequest`.
    pub protocol_version: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            poll_interval_ms: 250,
            probe_timeout_ms: 2_000,
            stats_interval_ms: 60_000,
            join_timeout_ms: 1_000,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl RelayConfig {
    /// Parse a (possibly partial) JSON config.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
