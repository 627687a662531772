//! The session registry: sole owner of every session, and the single
//! serialization point for state transitions, the attention counter and
//! event publication.
//!
//! Work that can be slow (launching processes, reading the screen,
//! notifying) happens outside the lock. Results are re-validated against
//! the session's process generation when the lock is re-taken, so a
//! callback or scan that belongs to a superseded process is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::error::RegistryError;
use super::path::{display_name, resolve_project_path};
use crate::attention::{
    Classifier, PatternClassifier, ScanRequest, ScanScheduler, DEFAULT_QUIET_PERIOD,
};
use crate::collaborators::{
    AttentionNotifier, LaunchRequest, ProcessHandle, ProcessLauncher, ScreenTextSource,
    SessionPersistence,
};
use crate::event::{EventBus, Subscription, EVENT_BUFFER};
use crate::notify::LogNotifier;
use crate::persistence::SessionRecord;
use crate::session::{
    CallerContext, FocusContext, SessionId, SessionMachine, SessionSnapshot, SessionState,
    Transition,
};

/// Handle given to a launched process for reporting output and exit.
///
/// Holds only the session id and a weak reference to the registry, so a
/// process outliving its session cannot keep the registry alive or touch a
/// newer process's session state.
#[derive(Debug, Clone)]
pub struct LifecycleSink {
    session_id: SessionId,
    generation: u64,
    shared: Weak<Shared>,
}

impl LifecycleSink {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// New bytes were written to the session's terminal.
    pub fn output_received(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_output(&self.session_id, self.generation);
        }
    }

    /// The process ended.
    pub fn process_exited(&self, exit_code: Option<i32>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_exit(&self.session_id, self.generation, exit_code);
        }
    }
}

/// Configures and builds a [`SessionRegistry`].
pub struct RegistryBuilder {
    screen: Arc<dyn ScreenTextSource>,
    launcher: Arc<dyn ProcessLauncher>,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn AttentionNotifier>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    quiet_period: Duration,
    global_args: Vec<String>,
    event_buffer: usize,
}

impl RegistryBuilder {
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn AttentionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    /// Arguments passed to every launched process, before per-session args.
    pub fn global_args(mut self, args: &str) -> Self {
        self.global_args = split_args(Some(args));
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Build the registry. Must be called from within a tokio runtime.
    pub fn build(self) -> SessionRegistry {
        let (attention_tx, _) = watch::channel(0);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let scheduler = ScanScheduler::new(self.quiet_period, move |request| {
                if let Some(shared) = weak.upgrade() {
                    shared.run_scan(&request);
                }
            });
            Shared {
                inner: Mutex::new(Inner::new(self.event_buffer)),
                scheduler,
                screen: self.screen,
                launcher: self.launcher,
                classifier: self.classifier,
                notifier: self.notifier,
                persistence: self.persistence,
                global_args: self.global_args,
                attention_tx,
                saved_revision: Mutex::new(0),
            }
        });
        SessionRegistry { shared }
    }
}

/// Owns all sessions and exposes the control surface.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    pub fn builder(
        screen: Arc<dyn ScreenTextSource>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> RegistryBuilder {
        RegistryBuilder {
            screen,
            launcher,
            classifier: Arc::new(PatternClassifier),
            notifier: Arc::new(LogNotifier),
            persistence: None,
            quiet_period: DEFAULT_QUIET_PERIOD,
            global_args: Vec::new(),
            event_buffer: EVENT_BUFFER,
        }
    }

    // ========== Control surface ==========

    /// Track a new project directory. The session starts `idle`.
    pub fn add_session(
        &self,
        path: impl AsRef<Path>,
        caller: &CallerContext,
    ) -> Result<SessionId, RegistryError> {
        let canonical = resolve_project_path(path.as_ref())?;

        let mut inner = self.shared.lock();
        if let Some(existing) = inner.find_by_path(&canonical) {
            return Err(RegistryError::DuplicateSession {
                path: canonical,
                existing,
            });
        }

        let session = Session::new(canonical, None, Utc::now());
        info!(
            session_id = %session.id,
            repo = %session.repo_name,
            caller = caller.label(),
            "Session added"
        );
        let id = inner.insert(session);
        let pending = inner.pending_save();
        drop(inner);

        self.shared.save(pending);
        Ok(id)
    }

    /// Stop tracking a session: kill its process, close its event streams.
    /// Unknown ids are ignored.
    pub fn remove_session(&self, session_id: &str, caller: &CallerContext) {
        let mut inner = self.shared.lock();
        let Some(mut session) = inner.remove(session_id) else {
            debug!(session_id = %session_id, "remove_session: unknown session");
            return;
        };

        self.shared.scheduler.cancel(session_id);
        inner.bus.close_session(session_id);
        if session.machine.state() == SessionState::Attention {
            inner.attention_count = inner.attention_count.saturating_sub(1);
            self.shared.attention_tx.send_replace(inner.attention_count);
        }
        let pending = inner.pending_save();
        drop(inner);

        if let Some(process) = session.process.take() {
            lock_process(&process).terminate();
        }
        self.shared.save(pending);

        info!(
            session_id = %session_id,
            repo = %session.repo_name,
            caller = caller.label(),
            "Session removed"
        );
    }

    /// Explicit start request: `idle -> running` and launch the process.
    /// No-op for unknown or already-live sessions.
    pub fn start_session(&self, session_id: &str, caller: &CallerContext) {
        let (request, generation) = {
            let mut inner = self.shared.lock();
            let Some(session) = inner.sessions.get_mut(session_id) else {
                debug!(session_id = %session_id, "start_session: unknown session");
                return;
            };
            let Some(transition) = session.machine.start() else {
                debug!(session_id = %session_id, state = %session.machine.state(), "start_session: already live");
                return;
            };
            session.generation += 1;
            let launch = (self.shared.launch_request(session), session.generation);
            inner.apply(session_id, &transition, &self.shared.attention_tx);
            launch
        };

        debug!(session_id = %session_id, caller = caller.label(), "Starting session");
        self.shared.spawn_process(&request, generation);
    }

    /// Kill the current process (if any), reset scanning and start a fresh
    /// one. No-op for unknown ids.
    pub fn restart_session(&self, session_id: &str, caller: &CallerContext) {
        let (old_process, request, generation) = {
            let mut inner = self.shared.lock();
            let Some(session) = inner.sessions.get_mut(session_id) else {
                debug!(session_id = %session_id, "restart_session: unknown session");
                return;
            };

            let old_process = session.process.take();
            self.shared.scheduler.cancel(session_id);

            let transition = session.machine.restart();
            session.restart_epoch += 1;
            session.generation += 1;
            info!(
                session_id = %session_id,
                restart_epoch = session.restart_epoch,
                caller = caller.label(),
                "Restarting session"
            );
            let launch = (
                old_process,
                self.shared.launch_request(session),
                session.generation,
            );
            inner.apply(session_id, &transition, &self.shared.attention_tx);
            launch
        };

        if let Some(process) = old_process {
            lock_process(&process).terminate();
        }
        self.shared.spawn_process(&request, generation);
    }

    /// Type into a session's terminal.
    ///
    /// Silently ignored unless the session exists, is `running` or
    /// `attention`, and the caller is the interactive front end.
    pub fn send_input(&self, session_id: &str, text: &str, caller: &CallerContext) {
        if !caller.may_send_input() {
            debug!(session_id = %session_id, caller = caller.label(), "send_input: caller not allowed");
            return;
        }

        let process = {
            let inner = self.shared.lock();
            let Some(session) = inner.sessions.get(session_id) else {
                return;
            };
            if !session.machine.state().is_live() {
                debug!(session_id = %session_id, state = %session.machine.state(), "send_input: session not live");
                return;
            }
            let Some(process) = session.process.as_ref() else {
                return;
            };
            Arc::clone(process)
        };

        if let Err(err) = lock_process(&process).write(text.as_bytes()) {
            warn!(session_id = %session_id, error = %err, "Failed to write to session");
        };
    }

    /// Change a session's extra launch arguments. Applies from the next
    /// (re)start.
    pub fn set_session_args(&self, session_id: &str, args: Option<String>, caller: &CallerContext) {
        let mut inner = self.shared.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return;
        };
        session.args = args.filter(|a| !a.trim().is_empty());
        debug!(session_id = %session_id, caller = caller.label(), "Session args updated");
        let pending = inner.pending_save();
        drop(inner);

        self.shared.save(pending);
    }

    /// Report UI focus, used to suppress notifications for the session the
    /// user is already looking at.
    pub fn set_focus(&self, focus: FocusContext) {
        self.shared.lock().focus = focus;
    }

    // ========== Lifecycle inbound ==========

    /// Output arrived for the session's current process.
    pub fn on_output_received(&self, session_id: &str) {
        let Some(generation) = self.shared.current_generation(session_id) else {
            return;
        };
        self.shared.handle_output(session_id, generation);
    }

    /// The session's current process exited.
    pub fn on_process_exited(&self, session_id: &str, exit_code: Option<i32>) {
        let Some(generation) = self.shared.current_generation(session_id) else {
            return;
        };
        self.shared.handle_exit(session_id, generation, exit_code);
    }

    // ========== Queries ==========

    /// Snapshots of all sessions, in the order they were added.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let inner = self.shared.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(Session::snapshot)
            .collect()
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.shared.lock().sessions.get(session_id).map(Session::snapshot)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.shared
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.machine.state())
    }

    /// Number of sessions currently in `attention`.
    pub fn attention_count(&self) -> usize {
        self.shared.lock().attention_count
    }

    /// Watch the attention count, e.g. for a dock badge.
    pub fn watch_attention_count(&self) -> watch::Receiver<usize> {
        self.shared.attention_tx.subscribe()
    }

    /// Events from every session.
    pub fn subscribe(&self) -> Subscription {
        self.shared.lock().bus.subscribe()
    }

    /// Events from one session; closed when the session is removed.
    pub fn subscribe_session(&self, session_id: &str) -> Option<Subscription> {
        self.shared.lock().bus.subscribe_session(session_id)
    }

    pub fn open_subscriptions(&self, session_id: &str) -> usize {
        self.shared.lock().bus.open_subscriptions(session_id)
    }

    // ========== Startup / shutdown ==========

    /// Load persisted sessions. Records whose path no longer validates, or
    /// duplicates a tracked path, are skipped.
    pub fn restore(&self) -> anyhow::Result<Vec<SessionId>> {
        let Some(store) = self.shared.persistence.as_ref() else {
            return Ok(Vec::new());
        };
        let records = store.load()?;

        let mut inner = self.shared.lock();
        let mut restored = Vec::with_capacity(records.len());
        let mut pruned = 0usize;
        for record in records {
            let canonical = match resolve_project_path(&record.path) {
                Ok(path) => path,
                Err(err) => {
                    warn!(error = %err, "Pruning persisted session");
                    pruned += 1;
                    continue;
                }
            };
            if inner.find_by_path(&canonical).is_some() {
                warn!(path = %canonical.display(), "Pruning duplicate persisted session");
                pruned += 1;
                continue;
            }
            let session = Session::new(canonical, record.args, record.added_at);
            restored.push(inner.insert(session));
        }
        // Rewrite the file now so pruned records don't linger until the next
        // unrelated change.
        let pending = (pruned > 0).then(|| inner.pending_save());
        drop(inner);

        if let Some(pending) = pending {
            self.shared.save(pending);
        }
        info!(count = restored.len(), pruned, "Restored sessions");
        Ok(restored)
    }

    /// Terminate every process and close every event stream. Sessions stay
    /// listed, all `idle`.
    pub fn shutdown(&self) {
        let mut inner = self.shared.lock();
        self.shared.scheduler.cancel_all();

        let ids: Vec<SessionId> = inner.order.clone();
        let mut processes = Vec::new();
        for id in ids {
            let Some(session) = inner.sessions.get_mut(&id) else {
                continue;
            };
            processes.extend(session.process.take());
            session.generation += 1;
            if let Some(transition) = session.machine.process_exited(None) {
                inner.apply(&id, &transition, &self.shared.attention_tx);
            }
        }
        inner.bus.close_all();
        drop(inner);

        for process in processes {
            lock_process(&process).terminate();
        }
        info!("Registry shut down");
    }
}

#[cfg(test)]
impl SessionRegistry {
    /// Run one scan for the session's current process as if a timer armed
    /// with `seq` had fired.
    pub(super) fn scan_with_seq(&self, session_id: &str, seq: u64) {
        let Some(generation) = self.shared.current_generation(session_id) else {
            return;
        };
        self.shared.run_scan(&ScanRequest {
            session_id: session_id.to_string(),
            generation,
            seq,
        });
    }
}

// ========== Internals ==========

/// A process handle shared between the registry and in-flight writes.
type SharedProcess = Arc<Mutex<Box<dyn ProcessHandle>>>;

fn lock_process(process: &SharedProcess) -> MutexGuard<'_, Box<dyn ProcessHandle>> {
    process.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session records captured under the lock, written after it is released.
struct PendingSave {
    revision: u64,
    records: Vec<SessionRecord>,
}

struct Shared {
    inner: Mutex<Inner>,
    scheduler: ScanScheduler,
    screen: Arc<dyn ScreenTextSource>,
    launcher: Arc<dyn ProcessLauncher>,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn AttentionNotifier>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    global_args: Vec<String>,
    attention_tx: watch::Sender<usize>,
    /// Revision of the last record list written to the store.
    saved_revision: Mutex<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_generation(&self, session_id: &str) -> Option<u64> {
        self.lock().sessions.get(session_id).map(|s| s.generation)
    }

    fn launch_request(&self, session: &Session) -> LaunchRequest {
        let mut args = self.global_args.clone();
        args.extend(split_args(session.args.as_deref()));
        LaunchRequest {
            session_id: session.id.clone(),
            working_dir: session.repo_path.clone(),
            args,
        }
    }

    /// Launch outside the lock, then attach the handle if the session still
    /// expects this generation.
    fn spawn_process(self: &Arc<Self>, request: &LaunchRequest, generation: u64) {
        let session_id = request.session_id.as_str();
        let sink = LifecycleSink {
            session_id: request.session_id.clone(),
            generation,
            shared: Arc::downgrade(self),
        };

        match self.launcher.launch(request, sink) {
            Ok(mut handle) => {
                let mut inner = self.lock();
                match inner.sessions.get_mut(session_id) {
                    Some(session)
                        if session.generation == generation && session.machine.state().is_live() =>
                    {
                        session.process = Some(Arc::new(Mutex::new(handle)));
                    }
                    _ => {
                        debug!(session_id = %session_id, "Launched process superseded, terminating");
                        handle.terminate();
                    }
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Failed to launch process");
                self.handle_exit(session_id, generation, None);
            }
        }
    }

    fn handle_output(&self, session_id: &str, generation: u64) {
        let inner = self.lock();
        match inner.sessions.get(session_id) {
            Some(session) if session.generation == generation && session.machine.state().is_live() => {
                self.scheduler.rearm(session_id, generation);
            }
            _ => trace!(session_id = %session_id, generation, "Ignoring stale output"),
        }
    }

    fn handle_exit(&self, session_id: &str, generation: u64, exit_code: Option<i32>) {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return;
        };
        if session.generation != generation {
            debug!(session_id = %session_id, generation, "Ignoring exit of superseded process");
            return;
        }

        session.process = None;
        self.scheduler.cancel(session_id);
        if let Some(transition) = session.machine.process_exited(exit_code) {
            info!(session_id = %session_id, exit_code = ?exit_code, "Process exited");
            inner.apply(session_id, &transition, &self.attention_tx);
        }
    }

    /// One debounced classification pass.
    fn run_scan(&self, request: &ScanRequest) {
        let session_id = request.session_id.as_str();

        {
            let inner = self.lock();
            match inner.sessions.get(session_id) {
                Some(s) if s.generation == request.generation && s.machine.state().is_live() => {}
                _ => {
                    trace!(session_id = %session_id, "Discarding scan for stale process");
                    return;
                }
            }
        }

        let lines = self.screen.visible_lines(session_id);
        let matched = self.classifier.classify(&lines);

        let notification = {
            let mut inner = self.lock();
            let Some(session) = inner.sessions.get_mut(session_id) else {
                return;
            };
            // Read of the scan flag and write of the state happen here, under
            // the registry lock, as one step.
            if session.generation != request.generation || request.seq <= session.last_scan_seq {
                debug!(session_id = %session_id, seq = request.seq, "Discarding superseded scan");
                return;
            }
            session.last_scan_seq = request.seq;

            let Some(transition) = session.machine.apply_scan(matched.as_deref()) else {
                return;
            };
            if let Transition::AttentionRaised { pattern } = &transition {
                debug!(session_id = %session_id, pattern = %pattern, "Attention pattern matched");
            }
            inner.apply(session_id, &transition, &self.attention_tx)
        };

        if let Some(repo_name) = notification {
            self.notifier.notify_attention(session_id, &repo_name);
        }
    }

    /// Write a captured record list. Must be called without the registry
    /// lock held. A capture older than what is already on disk is dropped.
    fn save(&self, pending: PendingSave) {
        let Some(store) = self.persistence.as_ref() else {
            return;
        };
        let mut saved = self
            .saved_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.revision <= *saved {
            return;
        }
        match store.save(&pending.records) {
            Ok(()) => *saved = pending.revision,
            Err(err) => warn!(error = %err, "Failed to save sessions"),
        }
    }
}

/// State guarded by the registry lock.
struct Inner {
    sessions: HashMap<SessionId, Session>,
    order: Vec<SessionId>,
    bus: EventBus,
    attention_count: usize,
    focus: FocusContext,
    records_revision: u64,
}

impl Inner {
    fn new(event_buffer: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            bus: EventBus::with_capacity(event_buffer),
            attention_count: 0,
            focus: FocusContext::default(),
            records_revision: 0,
        }
    }

    fn insert(&mut self, session: Session) -> SessionId {
        let id = session.id.clone();
        self.bus.register(&id);
        self.order.push(id.clone());
        self.sessions.insert(id.clone(), session);
        id
    }

    fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        self.order.retain(|id| id != session_id);
        Some(session)
    }

    fn find_by_path(&self, canonical: &Path) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.repo_path == canonical)
            .map(|s| s.id.clone())
    }

    /// Capture the record list after a change to it.
    fn pending_save(&mut self) -> PendingSave {
        self.records_revision += 1;
        PendingSave {
            revision: self.records_revision,
            records: self
                .order
                .iter()
                .filter_map(|id| self.sessions.get(id))
                .map(Session::record)
                .collect(),
        }
    }

    /// Publish a transition and update the aggregate counter.
    ///
    /// Returns the repo name to notify about when the transition is into
    /// `attention` and the user is not already watching this session.
    fn apply(
        &mut self,
        session_id: &str,
        transition: &Transition,
        attention_tx: &watch::Sender<usize>,
    ) -> Option<String> {
        let session_id = session_id.to_string();

        match transition.attention_delta() {
            0 => {}
            delta if delta > 0 => self.attention_count += 1,
            _ => self.attention_count = self.attention_count.saturating_sub(1),
        }
        if transition.attention_delta() != 0 {
            attention_tx.send_replace(self.attention_count);
        }

        for event in transition.events(&session_id) {
            self.bus.publish(&event);
        }
        info!(
            session_id = %session_id,
            state = %transition.new_state(),
            attention_count = self.attention_count,
            "Session state changed"
        );

        let raised = matches!(transition, Transition::AttentionRaised { .. });
        if !raised || self.focus.is_watching(&session_id) {
            return None;
        }
        self.sessions.get(&session_id).map(|s| s.repo_name.clone())
    }
}

/// Canonical session object. Only the registry holds these.
struct Session {
    id: SessionId,
    repo_path: PathBuf,
    repo_name: String,
    added_at: DateTime<Utc>,
    args: Option<String>,
    restart_epoch: u64,
    /// Bumped on every process start; callbacks and scans carry the value
    /// they were created for.
    generation: u64,
    last_scan_seq: u64,
    machine: SessionMachine,
    process: Option<SharedProcess>,
}

impl Session {
    fn new(repo_path: PathBuf, args: Option<String>, added_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            repo_name: display_name(&repo_path),
            repo_path,
            added_at,
            args,
            restart_epoch: 0,
            generation: 0,
            last_scan_seq: 0,
            machine: SessionMachine::new(),
            process: None,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            repo_path: self.repo_path.clone(),
            repo_name: self.repo_name.clone(),
            state: self.machine.state(),
            restart_epoch: self.restart_epoch,
            args: self.args.clone(),
        }
    }

    fn record(&self) -> SessionRecord {
        SessionRecord {
            path: self.repo_path.clone(),
            name: self.repo_name.clone(),
            added_at: self.added_at,
            args: self.args.clone(),
        }
    }
}

fn split_args(args: Option<&str>) -> Vec<String> {
    args.map(|a| a.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
