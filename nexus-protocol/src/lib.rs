//! NexusOps wire protocol
//!
//! Shared by the coordinator and every agent:
//! - `StreamSession` messages (heartbeat in, command response out)
//! - Activity label normalization ("Idle" vs application identifier)
//! - Length-prefixed JSON framing over any async byte stream
//! - Well-known ports, intervals and the discovery magic string

pub mod framing;

use serde::{Deserialize, Serialize};

pub use framing::{read_frame, write_frame, ProtocolError, MAX_FRAME_BYTES};

/// Name of the single bidirectional streaming method.
pub const STREAM_SESSION_METHOD: &str = "StreamSession";

/// Bumped whenever a message shape changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_SERVICE_PORT: u16 = 50051;
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;
pub const DEFAULT_BEACON_INTERVAL_SECS: u64 = 3;

/// Streams quiet for longer than this are dropped by the coordinator.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 30;

/// Ceiling for the agent poll interval. Coordinators must keep their idle
/// timeout above it so a healthy stream is never dropped between reports.
pub const MAX_POLL_INTERVAL_SECS: u64 = 20;

/// Payload of every discovery beacon datagram.
pub const DISCOVERY_MAGIC: &str = "NEXUSOPS_COORDINATOR_V1";

/// Label reported when nothing billable is in the foreground.
pub const IDLE_LABEL: &str = "Idle";

/// First frame sent by the agent on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpen {
    pub method: String,
    pub protocol_version: u32,
}

impl StreamOpen {
    pub fn stream_session() -> Self {
        Self {
            method: STREAM_SESSION_METHOD.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Check the preamble against what this build speaks.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.method != STREAM_SESSION_METHOD {
            return Err(ProtocolError::UnsupportedMethod(self.method.clone()));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.protocol_version,
            });
        }
        Ok(())
    }
}

/// Activity report, endpoint -> coordinator, once per polling interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pc_id: String,
    pub current_game: String,
    /// Unix seconds on the endpoint clock.
    pub timestamp: i64,
}

impl Heartbeat {
    pub fn new(pc_id: impl Into<String>, current_game: &str, timestamp: i64) -> Self {
        Self {
            pc_id: pc_id.into(),
            current_game: normalize_label(current_game),
            timestamp,
        }
    }
}

/// Directive, coordinator -> endpoint, exactly one per heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub close_active_game: bool,
}

impl CommandResponse {
    pub fn noop() -> Self {
        Self { close_active_game: false }
    }

    pub fn close_active_game() -> Self {
        Self { close_active_game: true }
    }
}

/// Empty or whitespace-only labels collapse to `"Idle"`.
pub fn normalize_label(label: &str) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        IDLE_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn is_idle(label: &str) -> bool {
    let trimmed = label.trim();
    trimmed.is_empty() || trimmed == IDLE_LABEL
}
