//! Shared data model for Termdeck.

mod analysis;
mod event;
mod session;

pub use analysis::AnalysisResult;
pub use event::SessionEvent;
pub use session::{ActivityState, LaunchOptions, SessionRecord, ToolKind};
