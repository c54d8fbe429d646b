//! Output analyzers: per-dialect classification of terminal text.
//!
//! The hosted CLI tools expose no structured status API, so activity is
//! inferred by matching the textual status lines each tool renders. Every
//! analyzer is a pure function of the cleaned input chunk: the only state
//! lives in the calling session record.
//!
//! Priority within a dialect is fixed: interrupted markers always win over
//! processing, then waiting-for-user, then completion markers. No match
//! means "no update" and the caller leaves prior state unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use termdeck_types::{AnalysisResult, ToolKind};

/// Matches terminal control sequences:
/// - CSI sequences (colors, cursor movement, private-mode toggles)
/// - OSC sequences ending with BEL or ST
/// - Character set selection
/// - Other single-char escapes, plus any stray bare ESC
static CONTROL_SEQ_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?]*[A-Za-z]",
        r"|\x1b\][^\x07]*\x07",
        r"|\x1b\][^\x1b]*\x1b\\",
        r"|\x1b[()][A-Z0-9]",
        r"|\x1b[=>MNOP78]",
        r"|\x1b",
    ))
    .unwrap()
});

/// Strip control sequences and non-printable control bytes (newline and tab
/// excepted), producing plain text suitable for pattern matching.
pub fn strip_control_sequences(text: &str) -> String {
    let stripped = CONTROL_SEQ_REGEX.replace_all(text, "");
    stripped
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect()
}

/// Classify a cleaned chunk for the given tool kind.
///
/// A kind with no analyzer (`Shell`) is a pass-through returning `None`.
pub fn analyze(kind: ToolKind, cleaned: &str) -> Option<AnalysisResult> {
    match kind {
        ToolKind::Claude => analyze_claude(cleaned),
        ToolKind::Codex => analyze_codex(cleaned),
        ToolKind::Gemini => analyze_gemini(cleaned),
        ToolKind::Shell => None,
    }
}

// ============================================================================
// Claude Code dialect
// ============================================================================

static CLAUDE_INTERRUPTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[Request interrupted by user|⎿\s*Interrupted").unwrap());

/// Status line while working, e.g.
/// `· Concocting… (7s · ↓ 100 tokens · esc to interrupt)`.
/// The verb rotates and the throughput segment may be absent; the
/// parenthesized elapsed count is required so ordinary bulleted prose with
/// an ellipsis never classifies as processing.
static CLAUDE_PROCESSING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*[·✢✳✶✻✽+*]\s*([A-Z][A-Za-z’' -]*?)…\s*\((\d+)s(?:\s*·\s*([↓↑])\s*([\d.,]+[kKmM]?)\s*tokens)?",
    )
    .unwrap()
});

static CLAUDE_WAITING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Do you want|Would you like to|❯\s*1\.").unwrap());

/// Claude Code renders no explicit completion marker; the stall timer is the
/// only completion signal for this dialect.
fn analyze_claude(text: &str) -> Option<AnalysisResult> {
    if CLAUDE_INTERRUPTED.is_match(text) {
        return Some(AnalysisResult::interrupted());
    }
    if let Some(caps) = CLAUDE_PROCESSING.captures(text) {
        return Some(AnalysisResult {
            is_processing: true,
            elapsed_seconds: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            status_text: caps.get(1).map(|m| m.as_str().to_string()),
            direction: caps.get(3).map(|m| m.as_str().to_string()),
            token_figure: caps.get(4).map(|m| m.as_str().to_string()),
            ..Default::default()
        });
    }
    if CLAUDE_WAITING.is_match(text) {
        return Some(AnalysisResult::waiting_for_user());
    }
    None
}

// ============================================================================
// Codex dialect
// ============================================================================

static CODEX_INTERRUPTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)conversation interrupted|task interrupted").unwrap());

static CODEX_PROCESSING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*[•▌]?\s*Working\s*\((\d+)s").unwrap());

static CODEX_WAITING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Allow command\?|Approve this action\?").unwrap());

/// Completion summary, e.g. `• Worked for 7s` or `• Worked for 1m 23s`.
static CODEX_COMPLETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Worked for\s+(?:(\d+)m\s+)?(\d+)s").unwrap());

fn analyze_codex(text: &str) -> Option<AnalysisResult> {
    if CODEX_INTERRUPTED.is_match(text) {
        return Some(AnalysisResult::interrupted());
    }
    if let Some(caps) = CODEX_PROCESSING.captures(text) {
        return Some(AnalysisResult {
            is_processing: true,
            elapsed_seconds: caps.get(1).and_then(|m| m.as_str().parse().ok()),
            status_text: Some("Working".to_string()),
            ..Default::default()
        });
    }
    if CODEX_WAITING.is_match(text) {
        return Some(AnalysisResult::waiting_for_user());
    }
    if let Some(caps) = CODEX_COMPLETED.captures(text) {
        let minutes: u64 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let seconds: u64 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        return Some(AnalysisResult::complete(Some(minutes * 60 + seconds)));
    }
    None
}

// ============================================================================
// Gemini CLI dialect
// ============================================================================

static GEMINI_INTERRUPTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"Request cancelled").unwrap());

/// Spinner line while working, e.g. `⠧ Reticulating... (esc to cancel, 12s)`.
static GEMINI_PROCESSING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:([A-Z][A-Za-z ]+?)\.{3}\s*)?\(esc to cancel(?:,\s*(\d+)s)?\)").unwrap()
});

static GEMINI_WAITING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Apply this change\?|Allow execution\?|Yes, allow once").unwrap());

fn analyze_gemini(text: &str) -> Option<AnalysisResult> {
    if GEMINI_INTERRUPTED.is_match(text) {
        return Some(AnalysisResult::interrupted());
    }
    if let Some(caps) = GEMINI_PROCESSING.captures(text) {
        return Some(AnalysisResult {
            is_processing: true,
            elapsed_seconds: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            status_text: caps.get(1).map(|m| m.as_str().to_string()),
            ..Default::default()
        });
    }
    if GEMINI_WAITING.is_match(text) {
        return Some(AnalysisResult::waiting_for_user());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_control_sequences() {
        let input = "\x1b[32mHello\x1b[0m World";
        assert_eq!(strip_control_sequences(input), "Hello World");

        // OSC title sequence, charset selection, bare ESC.
        let input = "\x1b]0;title\x07text\x1b(B more\x1b";
        assert_eq!(strip_control_sequences(input), "text more");
    }

    #[test]
    fn test_strip_keeps_newline_and_tab_only() {
        let input = "a\tb\nc\rd\x08e";
        assert_eq!(strip_control_sequences(input), "a\tb\ncde");
    }

    #[test]
    fn test_claude_processing_status_line() {
        let result =
            analyze(ToolKind::Claude, "· Concocting… (7s · ↓ 100 tokens · esc to interrupt)")
                .unwrap();
        assert!(result.is_processing);
        assert!(!result.is_interrupted);
        assert_eq!(result.elapsed_seconds, Some(7));
        assert_eq!(result.status_text.as_deref(), Some("Concocting"));
        assert_eq!(result.direction.as_deref(), Some("↓"));
        assert_eq!(result.token_figure.as_deref(), Some("100"));
    }

    #[test]
    fn test_claude_processing_without_throughput() {
        let result = analyze(ToolKind::Claude, "✻ Pondering… (3s · esc to interrupt)").unwrap();
        assert!(result.is_processing);
        assert_eq!(result.elapsed_seconds, Some(3));
        assert_eq!(result.status_text.as_deref(), Some("Pondering"));
        assert!(result.direction.is_none());
        assert!(result.token_figure.is_none());
    }

    #[test]
    fn test_claude_interrupted() {
        let result = analyze(ToolKind::Claude, "[Request interrupted by user]").unwrap();
        assert!(result.is_interrupted);
        assert!(!result.is_processing);
    }

    #[test]
    fn test_claude_interrupted_wins_over_processing() {
        let text = "· Concocting… (7s · esc to interrupt)\n[Request interrupted by user]";
        let result = analyze(ToolKind::Claude, text).unwrap();
        assert!(result.is_interrupted);
        assert!(!result.is_processing);
    }

    #[test]
    fn test_claude_waiting_for_user() {
        let result =
            analyze(ToolKind::Claude, "Do you want to make this edit?\n❯ 1. Yes").unwrap();
        assert!(result.is_waiting_for_user);
    }

    #[test]
    fn test_unrelated_text_yields_no_update() {
        assert!(analyze(ToolKind::Claude, "just some build output\nwarning: unused").is_none());
        assert!(analyze(ToolKind::Codex, "compiling crate foo v0.1.0").is_none());
        assert!(analyze(ToolKind::Gemini, "$ ls -la").is_none());
    }

    #[test]
    fn test_claude_spinner_without_elapsed_is_no_update() {
        // The elapsed count anchors the match; a bare spinner verb alone is
        // not enough evidence of processing.
        assert!(analyze(ToolKind::Claude, "· Thinking…").is_none());
    }

    #[test]
    fn test_prose_does_not_trigger_processing() {
        // The marker needs the bullet + ellipsis + elapsed shape, so ordinary
        // prose mentioning the words must not match.
        assert!(analyze(ToolKind::Claude, "I was Concocting a plan for 7s").is_none());
    }

    #[test]
    fn test_shell_is_pass_through() {
        assert!(analyze(ToolKind::Shell, "· Concocting… (7s · esc to interrupt)").is_none());
    }

    #[test]
    fn test_codex_processing_and_completed() {
        let result = analyze(ToolKind::Codex, "• Working (12s • Esc to interrupt)").unwrap();
        assert!(result.is_processing);
        assert_eq!(result.elapsed_seconds, Some(12));

        let result = analyze(ToolKind::Codex, "• Worked for 1m 23s").unwrap();
        assert!(result.is_complete);
        assert_eq!(result.elapsed_seconds, Some(83));

        let result = analyze(ToolKind::Codex, "• Worked for 9s").unwrap();
        assert!(result.is_complete);
        assert_eq!(result.elapsed_seconds, Some(9));
    }

    #[test]
    fn test_codex_interrupted_priority() {
        let text = "• Working (5s)\n■ Conversation interrupted";
        let result = analyze(ToolKind::Codex, text).unwrap();
        assert!(result.is_interrupted);
    }

    #[test]
    fn test_gemini_processing() {
        let result =
            analyze(ToolKind::Gemini, "⠧ Reticulating... (esc to cancel, 12s)").unwrap();
        assert!(result.is_processing);
        assert_eq!(result.elapsed_seconds, Some(12));
        assert_eq!(result.status_text.as_deref(), Some("Reticulating"));
    }

    #[test]
    fn test_gemini_waiting_and_cancelled() {
        assert!(
            analyze(ToolKind::Gemini, "Apply this change?")
                .unwrap()
                .is_waiting_for_user
        );
        assert!(
            analyze(ToolKind::Gemini, "Request cancelled.")
                .unwrap()
                .is_interrupted
        );
    }

    #[test]
    fn test_analyzer_is_deterministic() {
        let text = "· Concocting… (7s · ↓ 100 tokens · esc to interrupt)";
        let first = analyze(ToolKind::Claude, text);
        for _ in 0..10 {
            assert_eq!(analyze(ToolKind::Claude, text), first);
        }
    }
}
