//! System event types

use serde::{Deserialize, Serialize};

use crate::webrtc::SessionState;

/// System event enumeration
///
/// Events serialize as `{"event": "<name>", "data": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// A local session moved to a new lifecycle state
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        session_id: String,
        camera_id: String,
        state: SessionState,
    },

    /// Stream health flipped after enough on-time or late frames
    #[serde(rename = "session.health_changed")]
    SessionHealthChanged {
        session_id: String,
        healthy: bool,
    },

    /// A stream request was answered
    #[serde(rename = "stream.dispatched")]
    StreamDispatched {
        camera_id: String,
        /// "local" or "remote"
        strategy: String,
        session_id: Option<String>,
    },

    /// A session was removed from the registry
    #[serde(rename = "session.removed")]
    SessionRemoved { session_id: String },

    /// Configuration file reloaded or updated
    #[serde(rename = "config.changed")]
    ConfigChanged { key: String },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::SessionHealthChanged { .. } => "session.health_changed",
            Self::StreamDispatched { .. } => "stream.dispatched",
            Self::SessionRemoved { .. } => "session.removed",
            Self::ConfigChanged { .. } => "config.changed",
        }
    }

    /// Terminal session state, if this event reports one
    pub fn terminal_session(&self) -> Option<&str> {
        match self {
            Self::SessionStateChanged {
                session_id, state, ..
            } if state.is_terminal() => Some(session_id),
            _ => None,
        }
    }
}
