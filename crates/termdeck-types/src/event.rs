//! Activity events published by the session manager.

use crate::ActivityState;
use serde::Serialize;
use uuid::Uuid;

/// Notifications consumed by transport and notification collaborators.
///
/// Raw terminal data is not carried here; clients subscribe to a session's
/// output channel directly. This stream only reports lifecycle and inferred
/// activity changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The inferred activity state changed.
    ActivityChanged {
        session_id: Uuid,
        state: ActivityState,
    },
    /// A processing run started.
    ProcessingStarted {
        session_id: Uuid,
        /// Dialect-reported activity description, if captured.
        status_text: Option<String>,
    },
    /// A processing run ended (completion marker, stall timer expiry, or
    /// external stop signal).
    ProcessingCompleted {
        session_id: Uuid,
        elapsed_seconds: Option<u64>,
    },
    /// The tool is waiting for a user confirmation.
    WaitingForUser { session_id: Uuid },
    /// The user interrupted the current request.
    Interrupted { session_id: Uuid },
    /// The session's child process exited.
    Disconnected { session_id: Uuid },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::ActivityChanged { session_id, .. }
            | SessionEvent::ProcessingStarted { session_id, .. }
            | SessionEvent::ProcessingCompleted { session_id, .. }
            | SessionEvent::WaitingForUser { session_id }
            | SessionEvent::Interrupted { session_id }
            | SessionEvent::Disconnected { session_id } => *session_id,
        }
    }
}
