//! Per-session stall timers.
//!
//! A session that keeps emitting processing status lines re-arms its timer on
//! every tick; when the output goes quiet for the full duration the timer
//! fires once and the expiry callback marks the work complete. Arming is
//! last-writer-wins: a newer arm silently replaces any pending timer for the
//! same session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

type ExpiryCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Manages one pending expiry task per session id.
///
/// Each armed timer carries a generation number; on expiry the task only
/// fires the callback if its generation is still the registered one, so a
/// re-arm that races an in-flight expiry can never produce a stale fire.
/// The callback is invoked under the slot's read lock and `dispose` clears
/// the slot under the write lock, so once `dispose` returns no callback is
/// running or can still start.
pub struct StallTimer {
    duration: Duration,
    timers: DashMap<Uuid, (u64, JoinHandle<()>)>,
    generation: AtomicU64,
    on_expire: RwLock<Option<ExpiryCallback>>,
    disposed: AtomicBool,
}

impl StallTimer {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
            on_expire: RwLock::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Register the callback invoked when a timer expires. Replaces any
    /// previously registered callback.
    pub fn set_on_expire<F>(&self, callback: F)
    where
        F: Fn(Uuid) + Send + Sync + 'static,
    {
        *self.on_expire.write().unwrap() = Some(Arc::new(callback));
    }

    /// Arm (or re-arm) the timer for `session_id`. Any pending timer for the
    /// same session is aborted first.
    pub fn arm(self: &Arc<Self>, session_id: Uuid) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timer.duration).await;
            timer.fire(session_id, generation);
        });

        if let Some((_, old)) = self.timers.insert(session_id, (generation, handle)) {
            old.abort();
        }
        trace!(
            target: "termdeck::timer",
            session_id = %session_id,
            generation,
            "Stall timer armed"
        );
    }

    /// Cancel any pending timer for `session_id`. A no-op when none is armed.
    pub fn disarm(&self, session_id: Uuid) {
        if let Some((_, (generation, handle))) = self.timers.remove(&session_id) {
            handle.abort();
            trace!(
                target: "termdeck::timer",
                session_id = %session_id,
                generation,
                "Stall timer disarmed"
            );
        }
    }

    /// True when a timer is currently pending for `session_id`.
    pub fn is_armed(&self, session_id: Uuid) -> bool {
        self.timers.contains_key(&session_id)
    }

    fn fire(&self, session_id: Uuid, generation: u64) {
        // Only the registered generation may fire; anything else was
        // superseded by a re-arm and its entry belongs to the newer task.
        let current = self
            .timers
            .remove_if(&session_id, |_, (registered, _)| *registered == generation);
        if current.is_none() {
            return;
        }

        // Held across the invocation; pairs with the write lock in dispose.
        let callback = self.on_expire.read().unwrap();
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        debug!(
            target: "termdeck::timer",
            session_id = %session_id,
            "Stall timer expired"
        );
        if let Some(callback) = callback.as_ref() {
            callback(session_id);
        }
    }

    /// Cancel all pending timers and reject future arms. Blocks until any
    /// in-flight expiry callback has finished; nothing fires after this
    /// returns.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let ids: Vec<Uuid> = self.timers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, (_, handle))) = self.timers.remove(&id) {
                handle.abort();
            }
        }
        *self.on_expire.write().unwrap() = None;
    }
}

impl std::fmt::Debug for StallTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StallTimer")
            .field("duration", &self.duration)
            .field("pending", &self.timers.len())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}
