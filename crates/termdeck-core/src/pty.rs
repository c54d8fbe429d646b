//! Pseudo-terminal sessions.
//!
//! One `PtySession` owns a virtual console, a child process, and the two
//! byte pipes connecting them. The four resources are created together and
//! released together: construction rolls back every already-allocated
//! resource on partial failure, and `dispose` is idempotent and leaves the
//! session in a terminal state checked by every public method.

use crate::{Result, TermdeckError};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use termdeck_types::ToolKind;
use tracing::{debug, info, warn};

/// Everything needed to spawn one terminal session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub kind: ToolKind,
    pub command: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Seam for terminal construction, so tests can count or stub spawns.
pub trait TerminalSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> Result<PtySession>;
}

/// Production spawner backed by the OS PTY facility.
pub struct NativeSpawner {
    kill_wait: Duration,
}

impl NativeSpawner {
    pub fn new(kill_wait: Duration) -> Self {
        Self { kill_wait }
    }
}

impl TerminalSpawner for NativeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<PtySession> {
        PtySession::spawn(spec, self.kill_wait)
    }
}

/// A live virtual console plus its child process.
pub struct PtySession {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Locking this serializes readers: concurrent reads on the same pipe
    /// corrupt chunk boundaries, so a second caller waits here.
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    size: Mutex<(u16, u16)>,
    disposed: AtomicBool,
    kill_wait: Duration,
}

impl PtySession {
    /// Spawn `spec.command` attached to a fresh virtual console.
    ///
    /// Construction is all-or-nothing. Console allocation and process spawn
    /// failures are reported as distinct error kinds carrying the OS error
    /// text.
    pub fn spawn(spec: &SpawnSpec, kill_wait: Duration) -> Result<PtySession> {
        let program = resolve_command(&spec.command)
            .ok_or_else(|| TermdeckError::ToolNotInstalled {
                kind: spec.kind,
                command: spec.command.clone(),
            })?;

        // The PTY layer defers the chdir failure to the forked child, which
        // would surface as an instant exit instead of a spawn error; check
        // the directory up front like the command resolution above.
        if !spec.workdir.is_dir() {
            return Err(TermdeckError::ProcessSpawnFailed(format!(
                "working directory {:?} does not exist",
                spec.workdir
            )));
        }

        debug!(
            target: "termdeck::pty",
            "Opening PTY {}x{} for {:?} in {:?}",
            spec.cols, spec.rows, program, spec.workdir
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermdeckError::ConsoleCreationFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.workdir);

        // From here on the pair is live; dropping it on any early return is
        // the rollback for the console and its pipe ends.
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermdeckError::ProcessSpawnFailed(e.to_string()))?;

        let pipes = (|| -> Result<_> {
            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| TermdeckError::ConsoleCreationFailed(e.to_string()))?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| TermdeckError::ConsoleCreationFailed(e.to_string()))?;
            Ok((reader, writer))
        })();

        let (reader, writer) = match pipes {
            Ok(p) => p,
            Err(e) => {
                // Single rollback path: the child is the only resource that
                // outlives an early return, so kill and reap it before the
                // pair is dropped.
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        info!(
            target: "termdeck::pty",
            "Spawned {} in {:?} (pid {:?})",
            spec.command, spec.workdir, child.process_id()
        );

        Ok(PtySession {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            child: Mutex::new(Some(child)),
            size: Mutex::new((spec.cols, spec.rows)),
            disposed: AtomicBool::new(false),
            kill_wait,
        })
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(TermdeckError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Write input bytes to the child. Independent of `read`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.check_disposed()?;
        let mut writer = self.writer.lock().unwrap();
        let writer = writer.as_mut().ok_or(TermdeckError::Disposed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Read output bytes into `buf`, blocking until data arrives, EOF, or
    /// the session is disposed. One logical reader at a time; a concurrent
    /// caller waits on the reader lock.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_disposed()?;
        let mut reader = self.reader.lock().unwrap();
        // Re-check after winning the lock: dispose may have run meanwhile.
        self.check_disposed()?;
        let reader = reader.as_mut().ok_or(TermdeckError::Disposed)?;
        Ok(reader.read(buf)?)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.check_disposed()?;
        let master = self.master.lock().unwrap();
        let master = master.as_ref().ok_or(TermdeckError::Disposed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermdeckError::ConsoleCreationFailed(e.to_string()))?;
        *self.size.lock().unwrap() = (cols, rows);
        debug!(target: "termdeck::pty", "Resized PTY to {}x{}", cols, rows);
        Ok(())
    }

    /// Current (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the child process has exited (or was already released).
    pub fn has_exited(&self) -> bool {
        let mut child = self.child.lock().unwrap();
        match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    /// Tear the session down: graceful signal, bounded wait, force kill,
    /// then release every handle regardless of the child's exit status.
    ///
    /// Idempotent; the second call returns immediately. Blocks up to the
    /// configured kill wait, so async callers should run it on a blocking
    /// thread.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pid = self
            .child
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|c| c.process_id());

        // Graceful first: hang up on the process group.
        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGHUP);
            }
        }

        let deadline = Instant::now() + self.kill_wait;
        let mut exited = false;
        while Instant::now() < deadline {
            {
                let mut child = self.child.lock().unwrap();
                match child.as_mut() {
                    Some(c) => {
                        if matches!(c.try_wait(), Ok(Some(_))) {
                            exited = true;
                            break;
                        }
                    }
                    None => {
                        exited = true;
                        break;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        if !exited {
            if let Some(c) = self.child.lock().unwrap().as_mut() {
                warn!(target: "termdeck::pty", "Child (pid {:?}) did not exit gracefully, killing", pid);
                let _ = c.kill();
            }
            // The hosted tools spawn their own subprocesses; take the whole
            // process group down with them.
            #[cfg(unix)]
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }

        // Reap, then release all handles. Closing the master unblocks any
        // reader still parked in `read`.
        if let Some(c) = self.child.lock().unwrap().as_mut() {
            let _ = c.try_wait();
        }
        *self.writer.lock().unwrap() = None;
        *self.master.lock().unwrap() = None;
        *self.child.lock().unwrap() = None;
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = None;
        }

        info!(target: "termdeck::pty", "PTY session disposed (pid {:?})", pid);
    }
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (cols, rows) = self.size();
        f.debug_struct("PtySession")
            .field("cols", &cols)
            .field("rows", &rows)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Resolve a command name against PATH, or verify an explicit path.
fn resolve_command(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.exists().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(command);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_spec(script: &str) -> SpawnSpec {
        SpawnSpec {
            kind: ToolKind::Shell,
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            workdir: std::env::temp_dir(),
            cols: 80,
            rows: 24,
        }
    }

    fn spawn(script: &str) -> PtySession {
        PtySession::spawn(&shell_spec(script), Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn test_spawn_and_read_output() {
        let session = spawn("echo termdeck-ready; sleep 5");
        let mut buf = [0u8; 4096];
        let mut collected = String::new();
        for _ in 0..50 {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if collected.contains("termdeck-ready") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(collected.contains("termdeck-ready"), "got: {collected:?}");
        session.dispose();
    }

    #[test]
    fn test_write_reaches_child() {
        let session = spawn("read line; echo got-$line; sleep 5");
        session.write(b"hello\n").unwrap();

        let mut buf = [0u8; 4096];
        let mut collected = String::new();
        for _ in 0..50 {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if collected.contains("got-hello") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(collected.contains("got-hello"), "got: {collected:?}");
        session.dispose();
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let session = spawn("sleep 30");
        session.dispose();
        // Second dispose is a no-op, never a double free or panic.
        session.dispose();
        assert!(session.is_disposed());
    }

    #[test]
    fn test_disposed_access_fails_cleanly() {
        let session = spawn("sleep 30");
        session.dispose();

        assert!(matches!(session.write(b"x"), Err(TermdeckError::Disposed)));
        let mut buf = [0u8; 16];
        assert!(matches!(session.read(&mut buf), Err(TermdeckError::Disposed)));
        assert!(matches!(session.resize(100, 40), Err(TermdeckError::Disposed)));
    }

    #[test]
    fn test_resize_updates_size() {
        let session = spawn("sleep 5");
        assert_eq!(session.size(), (80, 24));
        session.resize(120, 40).unwrap();
        assert_eq!(session.size(), (120, 40));
        session.dispose();
    }

    #[test]
    fn test_missing_tool_is_distinct_error() {
        let spec = SpawnSpec {
            kind: ToolKind::Claude,
            command: "definitely-not-a-real-tool-xyz".into(),
            args: vec![],
            workdir: std::env::temp_dir(),
            cols: 80,
            rows: 24,
        };
        let err = PtySession::spawn(&spec, Duration::from_millis(500)).unwrap_err();
        match err {
            TermdeckError::ToolNotInstalled { kind, command } => {
                assert_eq!(kind, ToolKind::Claude);
                assert_eq!(command, "definitely-not-a-real-tool-xyz");
            }
            other => panic!("expected ToolNotInstalled, got {other:?}"),
        }
    }

    #[test]
    fn test_spawn_failure_in_bad_workdir() {
        let mut spec = shell_spec("true");
        spec.workdir = PathBuf::from("/definitely/not/a/real/dir");
        match PtySession::spawn(&spec, Duration::from_millis(500)) {
            Err(TermdeckError::ProcessSpawnFailed(msg)) => {
                assert!(msg.contains("working directory"), "message: {msg}");
            }
            other => panic!("expected ProcessSpawnFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_repeated_create_dispose_cycles() {
        // No handle leaks across many cycles: each spawn must keep
        // succeeding after all earlier sessions were torn down.
        for _ in 0..20 {
            let session = spawn("sleep 30");
            session.dispose();
        }
    }

    #[test]
    fn test_has_exited_after_quick_child() {
        let session = spawn("true");
        for _ in 0..100 {
            if session.has_exited() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(session.has_exited());
        session.dispose();
    }
}
