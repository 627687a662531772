//! Debounced scan scheduling.
//!
//! Each session has at most one armed single-shot timer. New output aborts
//! the pending timer and arms a fresh one, so a scan only runs once output
//! has been quiet for the whole quiet period.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::session::SessionId;

/// Default quiet period before a scan runs.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(500);

/// A fired timer, handed to the scan callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub session_id: SessionId,
    /// Process generation the timer was armed for.
    pub generation: u64,
    /// Monotonic arm counter. Later arms have larger values.
    pub seq: u64,
}

struct Armed {
    seq: u64,
    task: JoinHandle<()>,
}

type ScanCallback = dyn Fn(ScanRequest) + Send + Sync;

/// Per-session cancel-and-rearm timers.
///
/// Safe to call from any thread, including PTY reader threads outside the
/// runtime: timers are spawned on the runtime handle captured at
/// construction.
pub struct ScanScheduler {
    quiet_period: Duration,
    runtime: Handle,
    on_fire: Arc<ScanCallback>,
    pending: Arc<Mutex<HashMap<SessionId, Armed>>>,
    next_seq: AtomicU64,
}

impl ScanScheduler {
    /// Create a scheduler. Must be called from within a tokio runtime.
    pub fn new<F>(quiet_period: Duration, on_fire: F) -> Self
    where
        F: Fn(ScanRequest) + Send + Sync + 'static,
    {
        Self::with_handle(quiet_period, Handle::current(), on_fire)
    }

    pub fn with_handle<F>(quiet_period: Duration, runtime: Handle, on_fire: F) -> Self
    where
        F: Fn(ScanRequest) + Send + Sync + 'static,
    {
        Self {
            quiet_period,
            runtime,
            on_fire: Arc::new(on_fire),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Output arrived: (re)arm the session's timer.
    pub fn rearm(&self, session_id: &str, generation: u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let request = ScanRequest {
            session_id: session_id.to_string(),
            generation,
            seq,
        };

        let quiet_period = self.quiet_period;
        let pending = Arc::clone(&self.pending);
        let on_fire = Arc::clone(&self.on_fire);

        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(quiet_period).await;
            {
                let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                // A rearm that raced with this wakeup owns the slot now.
                match pending.get(&request.session_id) {
                    Some(armed) if armed.seq == request.seq => {
                        pending.remove(&request.session_id);
                    }
                    _ => return,
                }
            }
            trace!(session_id = %request.session_id, seq = request.seq, "Scan timer fired");
            on_fire(request);
        });

        if let Some(previous) = guard.insert(session_id.to_string(), Armed { seq, task }) {
            previous.task.abort();
        }
    }

    /// Drop any pending timer for the session.
    pub fn cancel(&self, session_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(armed) = pending.remove(session_id) {
            armed.task.abort();
            trace!(session_id = %session_id, "Scan timer cancelled");
        }
    }

    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, armed) in pending.drain() {
            armed.task.abort();
        }
    }

    /// Whether a timer is currently armed for the session.
    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }
}

impl Drop for ScanScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
