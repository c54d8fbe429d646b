//! Session records and the activity state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Which hosted CLI tool a session runs.
///
/// Each kind maps to one output-analyzer dialect; `Shell` has no analyzer
/// and its output never produces activity updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Claude,
    Codex,
    Gemini,
    Shell,
}

impl ToolKind {
    /// Human-readable name used in error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ToolKind::Claude => "Claude Code",
            ToolKind::Codex => "Codex",
            ToolKind::Gemini => "Gemini CLI",
            ToolKind::Shell => "shell",
        }
    }
}

/// Inferred high-level status of a hosted tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Tool is at rest, waiting at its prompt.
    #[default]
    Idle,
    /// Tool is actively working on a request.
    Processing,
    /// Tool is blocked on a user confirmation.
    WaitingForUser,
    /// The current request was cancelled by the user.
    Interrupted,
}

impl ActivityState {
    /// Whether a transition to `next` is allowed.
    ///
    /// The machine is Idle -> Processing -> {Idle, WaitingForUser,
    /// Interrupted} -> back. Interruption only makes sense while work is in
    /// flight, so Idle never moves straight to Interrupted.
    pub fn can_transition_to(self, next: ActivityState) -> bool {
        use ActivityState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Idle, Processing) | (Idle, WaitingForUser) => true,
            (Idle, Interrupted) => false,
            (Processing, _) => true,
            (WaitingForUser, _) => true,
            (Interrupted, Idle) | (Interrupted, Processing) => true,
            (Interrupted, WaitingForUser) => false,
            _ => false,
        }
    }
}

/// Resolved launch configuration for a session.
///
/// Built by an external collaborator from user options; the core treats the
/// command and argument string as opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Executable name or path.
    pub command: String,
    /// Argument string, split on whitespace at spawn time.
    #[serde(default)]
    pub args: String,
    /// Extra argument asking the tool to resume its previous conversation.
    /// Stripped on restart when a prior resume attempt is known to have
    /// failed.
    #[serde(default)]
    pub resume_arg: Option<String>,
}

impl LaunchOptions {
    /// Argument list for spawning, optionally including the resume argument.
    pub fn argv(&self, include_resume: bool) -> Vec<String> {
        let mut argv: Vec<String> = self.args.split_whitespace().map(String::from).collect();
        if include_resume {
            if let Some(resume) = &self.resume_arg {
                argv.push(resume.clone());
            }
        }
        argv
    }
}

/// Manager-owned session metadata.
///
/// Every field is serializable so an external store can persist and reload
/// records; live terminal state is never part of the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique id, stable for the session's lifetime, never reused.
    pub id: Uuid,
    /// Name shown to the user.
    pub display_name: String,
    /// Working directory the tool runs in.
    pub workdir: PathBuf,
    /// Hosted tool kind, selects the output-analyzer dialect.
    pub kind: ToolKind,
    /// Resolved launch configuration.
    pub options: LaunchOptions,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Archived sessions stay registered but are hidden by default.
    #[serde(default)]
    pub archived: bool,
    /// Source session for forked/worktree sessions.
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    /// Line buffer capacity for this session; forks inherit the parent's.
    pub line_buffer_capacity: usize,
    /// Current inferred activity state.
    #[serde(default)]
    pub activity: ActivityState,
    /// When the current processing run started, if any.
    #[serde(default)]
    pub processing_since: Option<DateTime<Utc>>,
    /// When processing last stopped (timer expiry, completion marker, or
    /// external stop signal).
    #[serde(default)]
    pub last_stop_at: Option<DateTime<Utc>>,
    /// Set when a resume attempt failed; restart then strips the resume
    /// argument.
    #[serde(default)]
    pub resume_failed: bool,
}
