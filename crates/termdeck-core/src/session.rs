//! Session manager: registry, lazy terminal construction, activity
//! inference, and lifecycle orchestration.
//!
//! Records and live terminals are tracked separately: a session can exist as
//! metadata long before (and after) its terminal does. Terminal construction
//! is lazy and guarded by a per-session init lock, so concurrent first
//! accesses spawn exactly one process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::analyzer::{analyze, strip_control_sequences};
use crate::buffered::{BufferedSession, OutputEvent};
use crate::config::ManagerConfig;
use crate::pty::{SpawnSpec, TerminalSpawner};
use crate::timer::StallTimer;
use crate::{Result, TermdeckError};
use termdeck_types::{
    ActivityState, AnalysisResult, LaunchOptions, SessionEvent, SessionRecord, ToolKind,
};

/// Live activity-inference state for one session. Never persisted; rebuilt
/// as Idle whenever a session is created or restarted.
#[derive(Debug, Default)]
struct ActivityTracker {
    state: ActivityState,
    /// When the current processing run started.
    processing_since: Option<Instant>,
    /// Analyzer-driven re-entry into processing is suppressed until then,
    /// set by an authoritative external stop signal.
    stop_cooldown_until: Option<Instant>,
    /// All analyzer-driven transitions are suppressed until then, set on
    /// client (re)attach while stale output replays.
    attach_grace_until: Option<Instant>,
}

/// Orchestrates every session: records, terminals, analysis tasks, stall
/// timers, and the activity event stream.
pub struct SessionManager {
    config: ManagerConfig,
    spawner: Arc<dyn TerminalSpawner>,
    records: DashMap<Uuid, SessionRecord>,
    /// Serializes the capacity check with the insert so concurrent
    /// registrations cannot slip past the cap together.
    registration: Mutex<()>,
    trackers: DashMap<Uuid, ActivityTracker>,
    terminals: DashMap<Uuid, Arc<BufferedSession>>,
    /// Per-session init locks serializing lazy terminal construction.
    init_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    analysis_tasks: DashMap<Uuid, JoinHandle<()>>,
    active_session: Mutex<Option<Uuid>>,
    event_tx: broadcast::Sender<SessionEvent>,
    timer: Arc<StallTimer>,
}

impl SessionManager {
    pub fn new(config: ManagerConfig, spawner: Arc<dyn TerminalSpawner>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let timer = StallTimer::new(config.stall_timeout());

        let manager = Arc::new(Self {
            config,
            spawner,
            records: DashMap::new(),
            registration: Mutex::new(()),
            trackers: DashMap::new(),
            terminals: DashMap::new(),
            init_locks: DashMap::new(),
            analysis_tasks: DashMap::new(),
            active_session: Mutex::new(None),
            event_tx,
            timer,
        });

        // The timer holds only a weak reference; a dropped manager silences
        // any expiry still in flight.
        let weak: Weak<SessionManager> = Arc::downgrade(&manager);
        manager.timer.set_on_expire(move |session_id| {
            if let Some(manager) = weak.upgrade() {
                manager.on_stall_expired(session_id);
            }
        });

        manager
    }

    /// Subscribe to the activity event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register a new session (metadata only; the terminal is constructed
    /// lazily on first access). Rejected outright when the cap is reached,
    /// never evicting an existing session.
    pub fn create_session(
        &self,
        workdir: PathBuf,
        display_name: String,
        kind: ToolKind,
        options: LaunchOptions,
    ) -> Result<SessionRecord> {
        let _registration = self.registration.lock().unwrap();
        if self.records.len() >= self.config.max_sessions {
            return Err(TermdeckError::CapacityExceeded(self.config.max_sessions));
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            display_name,
            workdir,
            kind,
            options,
            created_at: now,
            last_accessed_at: now,
            archived: false,
            parent_id: None,
            line_buffer_capacity: self.config.line_buffer_capacity,
            activity: ActivityState::Idle,
            processing_since: None,
            last_stop_at: None,
            resume_failed: false,
        };

        info!(
            target: "termdeck::session",
            session_id = %record.id,
            kind = ?kind,
            "Session created: {} in {:?}",
            record.display_name, record.workdir
        );

        self.trackers.insert(record.id, ActivityTracker::default());
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    /// Fork a session in the same working directory. The fork gets a fresh
    /// id and terminal but inherits the parent's launch configuration and
    /// buffer capacity.
    pub fn fork_session(&self, parent_id: Uuid) -> Result<SessionRecord> {
        let parent = self
            .records
            .get(&parent_id)
            .map(|r| r.clone())
            .ok_or(TermdeckError::SessionNotFound(parent_id))?;
        self.fork_from(&parent, parent.workdir.clone())
    }

    /// Fork a session into a sibling worktree directory derived from the
    /// parent's directory name and the branch name. Only the path is derived
    /// and the linkage recorded; creating the worktree itself is the
    /// caller's concern.
    pub fn fork_worktree_session(&self, parent_id: Uuid, branch: &str) -> Result<SessionRecord> {
        let parent = self
            .records
            .get(&parent_id)
            .map(|r| r.clone())
            .ok_or(TermdeckError::SessionNotFound(parent_id))?;
        let workdir = derive_worktree_path(&parent.workdir, branch);
        self.fork_from(&parent, workdir)
    }

    fn fork_from(&self, parent: &SessionRecord, workdir: PathBuf) -> Result<SessionRecord> {
        let _registration = self.registration.lock().unwrap();
        if self.records.len() >= self.config.max_sessions {
            return Err(TermdeckError::CapacityExceeded(self.config.max_sessions));
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            display_name: format!("{} (fork)", parent.display_name),
            workdir,
            kind: parent.kind,
            options: parent.options.clone(),
            created_at: now,
            last_accessed_at: now,
            archived: false,
            parent_id: Some(parent.id),
            line_buffer_capacity: parent.line_buffer_capacity,
            activity: ActivityState::Idle,
            processing_since: None,
            last_stop_at: None,
            resume_failed: false,
        };

        info!(
            target: "termdeck::session",
            session_id = %record.id,
            parent_id = %parent.id,
            "Session forked into {:?}",
            record.workdir
        );

        self.trackers.insert(record.id, ActivityTracker::default());
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    pub fn get_record(&self, id: Uuid) -> Option<SessionRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// All registered sessions, most recently accessed first. Archived
    /// sessions are hidden unless requested.
    pub fn list_sessions(&self, include_archived: bool) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self
            .records
            .iter()
            .filter(|r| include_archived || !r.archived)
            .map(|r| r.clone())
            .collect();
        sessions.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.records.len()
    }

    pub fn set_archived(&self, id: Uuid, archived: bool) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                record.archived = archived;
                true
            }
            None => false,
        }
    }

    /// Record that a resume attempt failed; the next restart then launches
    /// without the resume argument.
    pub fn mark_resume_failed(&self, id: Uuid) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                record.resume_failed = true;
                warn!(target: "termdeck::session", session_id = %id, "Resume marked failed");
                true
            }
            None => false,
        }
    }

    /// Mark the session as the one the client is viewing: bumps the
    /// last-access timestamp and opens the reconnect grace window during
    /// which replayed stale output must not flip the activity state.
    pub fn set_active(&self, id: Uuid) -> bool {
        let Some(mut record) = self.records.get_mut(&id) else {
            return false;
        };
        record.last_accessed_at = Utc::now();
        drop(record);

        if let Some(mut tracker) = self.trackers.get_mut(&id) {
            tracker.attach_grace_until = Some(Instant::now() + self.config.attach_grace());
        }
        *self.active_session.lock().unwrap() = Some(id);
        debug!(target: "termdeck::session", session_id = %id, "Session set active");
        true
    }

    pub fn active_session(&self) -> Option<Uuid> {
        *self.active_session.lock().unwrap()
    }

    pub fn activity_state(&self, id: Uuid) -> Option<ActivityState> {
        self.trackers.get(&id).map(|t| t.state)
    }

    // ========================================================================
    // Terminal lifecycle
    // ========================================================================

    /// The live terminal for `id`, if one has been constructed.
    pub fn get_terminal(&self, id: Uuid) -> Option<Arc<BufferedSession>> {
        self.terminals.get(&id).map(|t| t.clone())
    }

    /// Get the session's terminal, constructing it on first access.
    ///
    /// Double-checked under a per-session async lock: the fast path never
    /// locks, and concurrent first accesses serialize so exactly one spawn
    /// happens while the rest reuse it.
    pub async fn get_or_init_terminal(self: &Arc<Self>, id: Uuid) -> Result<Arc<BufferedSession>> {
        if let Some(terminal) = self.terminals.get(&id) {
            return Ok(terminal.clone());
        }

        let init_lock = self
            .init_locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = init_lock.lock().await;

        // Re-check: another caller may have finished construction while we
        // waited on the lock.
        if let Some(terminal) = self.terminals.get(&id) {
            return Ok(terminal.clone());
        }

        let record = self
            .records
            .get(&id)
            .map(|r| r.clone())
            .ok_or(TermdeckError::SessionNotFound(id))?;

        let spec = SpawnSpec {
            kind: record.kind,
            command: record.options.command.clone(),
            args: record.options.argv(!record.resume_failed),
            workdir: record.workdir.clone(),
            cols: self.config.default_cols,
            rows: self.config.default_rows,
        };

        debug!(
            target: "termdeck::session",
            session_id = %id,
            "Initializing terminal: {} {:?}",
            spec.command, spec.args
        );

        // Spawning opens the PTY and forks synchronously; keep it off the
        // async workers.
        let spawner = self.spawner.clone();
        let pty = tokio::task::spawn_blocking(move || spawner.spawn(&spec))
            .await
            .map_err(|e| TermdeckError::ProcessSpawnFailed(e.to_string()))??;

        let terminal = Arc::new(BufferedSession::new(
            pty,
            record.line_buffer_capacity,
            self.config.dispose_join(),
        ));
        self.terminals.insert(id, terminal.clone());
        self.spawn_analysis_task(id, &terminal);

        info!(target: "termdeck::session", session_id = %id, "Terminal initialized");
        Ok(terminal)
    }

    /// Remove a session entirely: terminal, analysis task, timer, tracker,
    /// record. Returns false when the id is unknown.
    pub async fn remove_session(&self, id: Uuid) -> bool {
        // Hold the init lock so a lazy construction already in flight
        // finishes and registers its terminal first; the teardown below then
        // disposes it instead of racing past it and leaking a live child.
        let init_lock = self
            .init_locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = init_lock.lock().await;

        if self.records.remove(&id).is_none() {
            self.init_locks.remove(&id);
            return false;
        }

        self.teardown_terminal(id).await;
        self.trackers.remove(&id);
        self.init_locks.remove(&id);

        let mut active = self.active_session.lock().unwrap();
        if *active == Some(id) {
            *active = None;
        }
        drop(active);

        info!(target: "termdeck::session", session_id = %id, "Session removed");
        true
    }

    /// Restart a session's terminal with the same record: dispose, settle,
    /// respawn. A prior resume failure drops the resume argument from the
    /// new launch. Returns `Ok(false)` for an unknown id.
    pub async fn restart_session(self: &Arc<Self>, id: Uuid) -> Result<bool> {
        if !self.records.contains_key(&id) {
            return Ok(false);
        }

        info!(target: "termdeck::session", session_id = %id, "Restarting session");
        {
            // Same guard as remove_session: never tear down underneath an
            // in-flight construction. Released before the respawn, which
            // takes the lock itself.
            let init_lock = self
                .init_locks
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let _guard = init_lock.lock().await;

            self.teardown_terminal(id).await;

            if let Some(mut tracker) = self.trackers.get_mut(&id) {
                *tracker = ActivityTracker::default();
            }
            if let Some(mut record) = self.records.get_mut(&id) {
                record.activity = ActivityState::Idle;
                record.processing_since = None;
            }
        }

        // Let the old process group finish dying before the respawn reuses
        // the working directory.
        tokio::time::sleep(self.config.restart_settle()).await;

        self.get_or_init_terminal(id).await?;
        Ok(true)
    }

    /// Dispose every session's terminal and stop all timers. Per-session
    /// failures are logged and skipped so one stuck session cannot block the
    /// rest of shutdown.
    pub async fn shutdown(&self) {
        info!(
            target: "termdeck::session",
            "Shutting down {} sessions",
            self.terminals.len()
        );

        let ids: Vec<Uuid> = self.terminals.iter().map(|t| *t.key()).collect();
        for id in ids {
            self.teardown_terminal(id).await;
        }
        self.timer.dispose();
    }

    async fn teardown_terminal(&self, id: Uuid) {
        if let Some((_, handle)) = self.analysis_tasks.remove(&id) {
            handle.abort();
        }
        self.timer.disarm(id);

        if let Some((_, terminal)) = self.terminals.remove(&id) {
            terminal.dispose().await;
            debug!(target: "termdeck::session", session_id = %id, "Terminal disposed");
        }
    }

    // ========================================================================
    // Activity inference
    // ========================================================================

    fn spawn_analysis_task(self: &Arc<Self>, id: Uuid, terminal: &Arc<BufferedSession>) {
        let mut rx = terminal.subscribe();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(OutputEvent::Data(chunk)) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.ingest_output(id, &chunk);
                    }
                    Ok(OutputEvent::Disconnected) => {
                        if let Some(manager) = weak.upgrade() {
                            manager.handle_disconnect(id);
                        }
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Analysis is per-chunk and stateless; dropped chunks
                        // only delay the next state update.
                        trace!(
                            target: "termdeck::analyzer",
                            session_id = %id,
                            "Analysis lagged, skipped {} chunks",
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.analysis_tasks.insert(id, handle) {
            old.abort();
        }
    }

    /// Run one raw output chunk through the session's analyzer dialect and
    /// apply whatever classification comes back.
    fn ingest_output(&self, id: Uuid, chunk: &[u8]) {
        let Some(kind) = self.records.get(&id).map(|r| r.kind) else {
            return;
        };

        let text = String::from_utf8_lossy(chunk);
        let cleaned = strip_control_sequences(&text);
        if let Some(result) = analyze(kind, &cleaned) {
            trace!(
                target: "termdeck::analyzer",
                session_id = %id,
                ?result,
                "Chunk classified"
            );
            self.apply_analysis(id, result);
        }
    }

    fn apply_analysis(&self, id: Uuid, result: AnalysisResult) {
        let Some(mut tracker) = self.trackers.get_mut(&id) else {
            return;
        };
        let now = Instant::now();

        // Replayed scrollback right after attach must not flip state.
        if tracker.attach_grace_until.is_some_and(|until| now < until) {
            trace!(target: "termdeck::session", session_id = %id, "Analysis suppressed by attach grace");
            return;
        }

        if result.is_interrupted {
            // Interruption only makes sense while work is in flight; the
            // state machine rejects Idle -> Interrupted.
            if self.transition(id, &mut tracker, ActivityState::Interrupted) {
                tracker.processing_since = None;
                self.timer.disarm(id);
                let _ = self.event_tx.send(SessionEvent::Interrupted { session_id: id });
            }
            return;
        }

        if result.is_processing {
            if tracker.stop_cooldown_until.is_some_and(|until| now < until) {
                trace!(target: "termdeck::session", session_id = %id, "Processing suppressed by stop cooldown");
                return;
            }

            if self.transition(id, &mut tracker, ActivityState::Processing) {
                tracker.processing_since = Some(now);
                if let Some(mut record) = self.records.get_mut(&id) {
                    record.processing_since = Some(Utc::now());
                }
                let _ = self.event_tx.send(SessionEvent::ProcessingStarted {
                    session_id: id,
                    status_text: result.status_text.clone(),
                });
            }
            // Every processing tick pushes the stall deadline out again.
            self.timer.arm(id);
            return;
        }

        if result.is_waiting_for_user {
            if self.transition(id, &mut tracker, ActivityState::WaitingForUser) {
                self.timer.disarm(id);
                let _ = self
                    .event_tx
                    .send(SessionEvent::WaitingForUser { session_id: id });
            }
            return;
        }

        if result.is_complete {
            self.complete_processing(id, &mut tracker, result.elapsed_seconds);
        }
    }

    /// Stall timer expiry: quiet output after processing means the run is
    /// presumed complete.
    fn on_stall_expired(&self, id: Uuid) {
        let Some(mut tracker) = self.trackers.get_mut(&id) else {
            return;
        };
        if tracker.state == ActivityState::Processing {
            debug!(target: "termdeck::session", session_id = %id, "Processing presumed complete after stall");
            self.complete_processing(id, &mut tracker, None);
        }
    }

    /// Authoritative stop signal from outside the output stream (e.g. a tool
    /// hook). Ends any processing run immediately and suppresses
    /// analyzer-driven re-entry while the tool's final output flushes.
    pub fn report_external_stop(&self, id: Uuid) -> bool {
        let Some(mut tracker) = self.trackers.get_mut(&id) else {
            return false;
        };
        tracker.stop_cooldown_until = Some(Instant::now() + self.config.stop_cooldown());
        debug!(target: "termdeck::session", session_id = %id, "External stop reported");

        if tracker.state == ActivityState::Processing {
            self.complete_processing(id, &mut tracker, None);
        } else if let Some(mut record) = self.records.get_mut(&id) {
            record.last_stop_at = Some(Utc::now());
        }
        true
    }

    fn complete_processing(
        &self,
        id: Uuid,
        tracker: &mut ActivityTracker,
        elapsed_seconds: Option<u64>,
    ) {
        if tracker.state != ActivityState::Processing {
            return;
        }

        let elapsed = elapsed_seconds
            .or_else(|| tracker.processing_since.map(|since| since.elapsed().as_secs()));
        tracker.processing_since = None;
        self.timer.disarm(id);
        self.transition(id, tracker, ActivityState::Idle);

        if let Some(mut record) = self.records.get_mut(&id) {
            record.processing_since = None;
            record.last_stop_at = Some(Utc::now());
        }

        let _ = self.event_tx.send(SessionEvent::ProcessingCompleted {
            session_id: id,
            elapsed_seconds: elapsed,
        });
    }

    fn handle_disconnect(&self, id: Uuid) {
        self.timer.disarm(id);
        if let Some(mut tracker) = self.trackers.get_mut(&id) {
            tracker.processing_since = None;
            self.transition(id, &mut tracker, ActivityState::Idle);
        }
        info!(target: "termdeck::session", session_id = %id, "Session process exited");
        let _ = self
            .event_tx
            .send(SessionEvent::Disconnected { session_id: id });
    }

    /// Apply a state-machine transition; no-op (returning false) when the
    /// machine rejects it or the state is unchanged.
    fn transition(&self, id: Uuid, tracker: &mut ActivityTracker, next: ActivityState) -> bool {
        if tracker.state == next {
            return false;
        }
        if !tracker.state.can_transition_to(next) {
            trace!(
                target: "termdeck::session",
                session_id = %id,
                "Rejected transition {:?} -> {:?}",
                tracker.state, next
            );
            return false;
        }

        debug!(
            target: "termdeck::session",
            session_id = %id,
            "Activity {:?} -> {:?}",
            tracker.state, next
        );
        tracker.state = next;
        if let Some(mut record) = self.records.get_mut(&id) {
            record.activity = next;
        }
        let _ = self.event_tx.send(SessionEvent::ActivityChanged {
            session_id: id,
            state: next,
        });
        true
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.timer.dispose();
        for task in self.analysis_tasks.iter() {
            task.abort();
        }
    }
}

/// Sibling worktree path: `<parent-dir>/<dirname>-<branch>` with path
/// separators in the branch name flattened.
fn derive_worktree_path(parent_workdir: &std::path::Path, branch: &str) -> PathBuf {
    let sanitized = branch.replace(['/', '\\'], "-");
    let dirname = parent_workdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "worktree".to_string());
    let base = parent_workdir
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(format!("{}-{}", dirname, sanitized))
}
