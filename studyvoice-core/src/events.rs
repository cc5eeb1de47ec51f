//! Status events broadcast by the live session controller.
//!
//! Both types serialise camelCase / lowercase so a host can forward them
//! as JSON without mapping.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No session; `start()` may be called.
    #[default]
    Idle,
    /// Connecting and opening the microphone.
    Connecting,
    /// Streaming in both directions.
    Active,
    /// Tearing down capture, playback and the connection.
    Closing,
    /// A fatal error is being surfaced; the next phase is `Idle`.
    Error,
}

/// Emitted on every phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionPhase,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}
