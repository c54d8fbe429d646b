//! Core session hosting and activity inference for Termdeck.

pub mod analyzer;
mod buffered;
mod config;
mod error;
mod line_buffer;
pub mod logging;
mod pty;
mod session;
mod timer;

pub use buffered::{BufferedSession, OutputEvent, reconstruct_visible_lines};
pub use config::ManagerConfig;
pub use error::TermdeckError;
pub use line_buffer::LineBuffer;
pub use pty::{NativeSpawner, PtySession, SpawnSpec, TerminalSpawner};
pub use session::SessionManager;
pub use timer::StallTimer;

/// Result type for Termdeck operations.
pub type Result<T> = std::result::Result<T, TermdeckError>;
