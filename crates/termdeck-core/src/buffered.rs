//! Buffered sessions: a PTY drained continuously into a line buffer.
//!
//! The drain loop runs on a dedicated thread because PTY reads block. Raw
//! chunks fan out on a broadcast channel; the line buffer keeps a bounded
//! scrollback from which "last N visible lines" can be approximated for a
//! reconnecting client.

use crate::analyzer::strip_control_sequences;
use crate::line_buffer::LineBuffer;
use crate::pty::PtySession;
use crate::{Result, TermdeckError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Backoff after a zero-byte read.
const READ_IDLE_BACKOFF: Duration = Duration::from_millis(10);
/// Backoff after a read error that is not yet fatal.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Events published by the drain loop.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Raw terminal bytes, forwarded verbatim.
    Data(Vec<u8>),
    /// The child process exited; no further data will arrive.
    Disconnected,
}

/// Owns one [`PtySession`] and one [`LineBuffer`], with a background drain
/// loop feeding the latter from the former for the session's whole lifetime.
pub struct BufferedSession {
    pty: Arc<PtySession>,
    buffer: Arc<LineBuffer>,
    events_tx: broadcast::Sender<OutputEvent>,
    shutdown: Arc<AtomicBool>,
    drain: Mutex<Option<std::thread::JoinHandle<()>>>,
    dispose_join: Duration,
}

impl BufferedSession {
    pub fn new(pty: PtySession, buffer_capacity: usize, dispose_join: Duration) -> Self {
        let pty = Arc::new(pty);
        let buffer = Arc::new(LineBuffer::new(buffer_capacity));
        let (events_tx, _) = broadcast::channel(256);
        let shutdown = Arc::new(AtomicBool::new(false));

        let drain = spawn_drain_loop(
            pty.clone(),
            buffer.clone(),
            events_tx.clone(),
            shutdown.clone(),
        );

        Self {
            pty,
            buffer,
            events_tx,
            shutdown,
            drain: Mutex::new(Some(drain)),
            dispose_join,
        }
    }

    /// Write input bytes to the hosted tool.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.pty.write(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.pty.resize(cols, rows)
    }

    /// Subscribe to raw output chunks and the disconnect notification.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.events_tx.subscribe()
    }

    /// The most recent `max_lines` buffered lines (all of them when `None`).
    pub fn snapshot(&self, max_lines: Option<usize>) -> Vec<String> {
        match max_lines {
            Some(n) => self.buffer.last_lines(n),
            None => self.buffer.all_lines(),
        }
    }

    /// Approximate the most recent `rows` visually rendered lines.
    ///
    /// Best-effort: the buffer stores raw arrival-order lines that may embed
    /// screen-clear and cursor-movement sequences, and exact terminal
    /// emulation is out of scope.
    pub fn visible_lines(&self, rows: usize, max_data_lines: Option<usize>) -> Vec<String> {
        reconstruct_visible_lines(&self.buffer, rows, max_data_lines)
    }

    pub fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }

    pub fn pty(&self) -> &PtySession {
        &self.pty
    }

    /// Cancel the drain loop, await its exit with a bounded timeout, dispose
    /// the owned PTY, and clear the buffer.
    pub async fn dispose(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Disposing the PTY closes the master side, which unblocks a drain
        // loop parked in a blocking read.
        let pty = self.pty.clone();
        let _ = tokio::task::spawn_blocking(move || pty.dispose()).await;

        let handle = self.drain.lock().unwrap().take();
        if let Some(handle) = handle {
            let join = tokio::task::spawn_blocking(move || handle.join());
            match tokio::time::timeout(self.dispose_join, join).await {
                Ok(_) => debug!(target: "termdeck::buffer", "Drain loop joined"),
                Err(_) => warn!(target: "termdeck::buffer", "Drain loop did not exit within {:?}", self.dispose_join),
            }
        }

        self.buffer.clear();
    }
}

impl std::fmt::Debug for BufferedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSession")
            .field("buffered_lines", &self.buffer.len())
            .field("disposed", &self.pty.is_disposed())
            .finish()
    }
}

fn spawn_drain_loop(
    pty: Arc<PtySession>,
    buffer: Arc<LineBuffer>,
    events_tx: broadcast::Sender<OutputEvent>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        debug!(target: "termdeck::buffer", "Drain loop started");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            match pty.read(&mut buf) {
                Ok(0) => {
                    if pty.has_exited() {
                        debug!(target: "termdeck::buffer", "EOF after child exit");
                        let _ = events_tx.send(OutputEvent::Disconnected);
                        break;
                    }
                    std::thread::sleep(READ_IDLE_BACKOFF);
                }
                Ok(n) => {
                    let chunk = &buf[..n];
                    trace!(target: "termdeck::buffer", "Read {} bytes", n);

                    let text = String::from_utf8_lossy(chunk);
                    let mut segments: Vec<&str> = text.split('\n').collect();
                    if segments.last() == Some(&"") {
                        segments.pop();
                    }
                    buffer.push_lines(segments);

                    let _ = events_tx.send(OutputEvent::Data(chunk.to_vec()));
                }
                Err(TermdeckError::Disposed) => break,
                Err(e) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    if pty.has_exited() {
                        // A read error on a dead child is the normal end of
                        // stream on Linux PTYs, not a fault.
                        debug!(target: "termdeck::buffer", "Read error after child exit: {}", e);
                        let _ = events_tx.send(OutputEvent::Disconnected);
                        break;
                    }
                    warn!(target: "termdeck::buffer", "Transient read error, backing off: {}", e);
                    std::thread::sleep(READ_ERROR_BACKOFF);
                }
            }
        }

        debug!(target: "termdeck::buffer", "Drain loop exiting");
    })
}

/// Matches full screen clears: ED 2/3 (erase display) and RIS (full reset).
static CLEAR_SCREEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b(?:\[[23]J|c)").unwrap());

/// Matches CUU (cursor up), capturing the count.
static CURSOR_UP_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[(\d*)A").unwrap());

/// Reconstruct the most recent `rows` visually rendered lines from raw
/// buffered lines.
///
/// Fetches the last `max_data_lines` raw lines (default `rows * 5`),
/// discards everything before the last screen clear, estimates how many
/// lines actually render, and widens the fetch window when the estimate
/// falls short and no clear bounded it.
pub fn reconstruct_visible_lines(
    buffer: &LineBuffer,
    rows: usize,
    max_data_lines: Option<usize>,
) -> Vec<String> {
    if rows == 0 {
        return Vec::new();
    }
    let fetch = max_data_lines.unwrap_or(rows.saturating_mul(5)).max(1);
    reconstruct_inner(buffer, rows, fetch)
}

fn reconstruct_inner(buffer: &LineBuffer, rows: usize, fetch: usize) -> Vec<String> {
    let total = buffer.len();
    let fetch = fetch.min(total.max(1));
    let raw = buffer.last_lines(fetch);

    // Scan backward for the last screen clear; keep any trailing content on
    // the clearing line itself.
    let mut clear_at: Option<(usize, usize)> = None;
    for (i, line) in raw.iter().enumerate().rev() {
        if let Some(m) = CLEAR_SCREEN_REGEX.find_iter(line).last() {
            clear_at = Some((i, m.end()));
            break;
        }
    }

    let kept: Vec<String> = match clear_at {
        Some((i, end)) => {
            let mut kept = Vec::with_capacity(raw.len() - i);
            kept.push(raw[i][end..].to_string());
            kept.extend(raw[i + 1..].iter().cloned());
            kept
        }
        None => raw,
    };

    let estimate = estimate_visible_rows(&kept);
    // Widen and retry only when no clear bounded the window; never recurse
    // past the nearest screen clear.
    if clear_at.is_none() && estimate < rows && fetch < total {
        return reconstruct_inner(buffer, rows, fetch.saturating_mul(3).min(total));
    }

    clip_to_rows(kept, rows)
}

/// Estimate how many terminal rows a run of raw lines renders: one per
/// non-empty line, discounted by cursor-up sequences that rewind rendering.
fn estimate_visible_rows(lines: &[String]) -> usize {
    let total: i64 = lines.iter().map(line_row_contribution).sum();
    total.max(0) as usize
}

fn line_row_contribution(line: &String) -> i64 {
    let rendered = !strip_control_sequences(line).trim().is_empty();
    let mut contribution = i64::from(rendered);
    for caps in CURSOR_UP_REGEX.captures_iter(line) {
        let count: i64 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(1);
        contribution -= count;
    }
    contribution
}

/// Keep the trailing run of lines whose estimated rendering covers `rows`.
fn clip_to_rows(lines: Vec<String>, rows: usize) -> Vec<String> {
    let mut acc: i64 = 0;
    let mut start = 0;
    for (i, line) in lines.iter().enumerate().rev() {
        acc += line_row_contribution(line);
        start = i;
        if acc >= rows as i64 {
            break;
        }
    }
    lines[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{PtySession, SpawnSpec};
    use termdeck_types::ToolKind;

    fn filled_buffer(lines: &[&str]) -> LineBuffer {
        let buffer = LineBuffer::new(10_000);
        buffer.push_lines(lines.iter().copied());
        buffer
    }

    #[test]
    fn test_visible_lines_after_clear_screen() {
        let buffer = filled_buffer(&[
            "old scrollback one",
            "old scrollback two",
            "\x1b[2J",
            "fresh line 1",
            "fresh line 2",
            "fresh line 3",
        ]);
        let visible = reconstruct_visible_lines(&buffer, 10, None);
        // Only post-clear content, never pre-clear scrollback.
        assert_eq!(visible, vec!["", "fresh line 1", "fresh line 2", "fresh line 3"]);
        assert!(!visible.iter().any(|l| l.contains("old scrollback")));
    }

    #[test]
    fn test_clear_keeps_trailing_content_on_clearing_line() {
        let buffer = filled_buffer(&["stale", "\x1b[2Jheader after clear", "body"]);
        let visible = reconstruct_visible_lines(&buffer, 10, None);
        assert_eq!(visible, vec!["header after clear", "body"]);
    }

    #[test]
    fn test_last_clear_wins() {
        let buffer = filled_buffer(&["a", "\x1b[2J", "b", "\x1bc", "c"]);
        let visible = reconstruct_visible_lines(&buffer, 10, None);
        assert_eq!(visible, vec!["", "c"]);
    }

    #[test]
    fn test_no_clear_clips_to_rows() {
        let lines: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
        let buffer = LineBuffer::new(10_000);
        buffer.push_lines(lines);
        let visible = reconstruct_visible_lines(&buffer, 5, None);
        assert_eq!(
            visible,
            vec!["line 15", "line 16", "line 17", "line 18", "line 19"]
        );
    }

    #[test]
    fn test_window_widens_when_estimate_short() {
        let buffer = filled_buffer(&["one", "two", "three", "four", "five", "six"]);
        // A deliberately tiny first window must widen until it covers rows.
        let visible = reconstruct_visible_lines(&buffer, 3, Some(1));
        assert_eq!(visible, vec!["four", "five", "six"]);
    }

    #[test]
    fn test_cursor_up_discounts_estimate() {
        assert_eq!(
            estimate_visible_rows(&[
                "spinner frame".to_string(),
                "\x1b[1Aspinner frame 2".to_string(),
            ]),
            1
        );
        // Bare ESC[A counts as one row up.
        assert_eq!(
            estimate_visible_rows(&["a".to_string(), "\x1b[Ab".to_string()]),
            1
        );
    }

    #[test]
    fn test_blank_and_control_only_lines_render_nothing() {
        assert_eq!(
            estimate_visible_rows(&[
                "".to_string(),
                "\x1b[31m\x1b[0m".to_string(),
                "real".to_string(),
            ]),
            1
        );
    }

    fn shell_session(script: &str) -> BufferedSession {
        let spec = SpawnSpec {
            kind: ToolKind::Shell,
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            workdir: std::env::temp_dir(),
            cols: 80,
            rows: 24,
        };
        let pty = PtySession::spawn(&spec, Duration::from_millis(500)).unwrap();
        BufferedSession::new(pty, 1000, Duration::from_secs(1))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_loop_fills_buffer() {
        let session = shell_session("echo alpha; echo beta; sleep 5");

        let mut joined = String::new();
        for _ in 0..100 {
            joined = session.snapshot(None).join("\n");
            if joined.contains("alpha") && joined.contains("beta") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(joined.contains("alpha"), "buffer: {joined:?}");
        assert!(joined.contains("beta"), "buffer: {joined:?}");

        session.dispose().await;
        assert!(session.snapshot(None).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscriber_sees_data_and_disconnect() {
        let session = shell_session("read line; echo bye; exit 0");
        let mut rx = session.subscribe();

        session.write(b"\n").unwrap();

        let mut saw_data = false;
        let mut saw_disconnect = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(OutputEvent::Data(_))) => saw_data = true,
                Ok(Ok(OutputEvent::Disconnected)) => {
                    saw_disconnect = true;
                    break;
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
        assert!(saw_data, "expected at least one data chunk");
        assert!(saw_disconnect, "expected a disconnect notification");

        session.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_tears_down_pty() {
        let session = shell_session("sleep 30");
        session.dispose().await;
        assert!(session.pty().is_disposed());
        assert!(session.write(b"x").is_err());
    }
}
