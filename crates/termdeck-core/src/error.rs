//! Error types for Termdeck.

use termdeck_types::ToolKind;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TermdeckError {
    /// Allocating the OS virtual console failed. Distinct from process
    /// spawn failure so diagnostics can tell the two apart.
    #[error("console creation failed: {0}")]
    ConsoleCreationFailed(String),

    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    /// The configured tool binary could not be resolved at all.
    #[error("{} not found: '{command}' is not installed or not on PATH", kind.display_name())]
    ToolNotInstalled { kind: ToolKind, command: String },

    #[error("session limit exceeded: max {0} concurrent sessions")]
    CapacityExceeded(usize),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    /// Operation on a torn-down session. Never touches freed resources.
    #[error("session is disposed")]
    Disposed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
