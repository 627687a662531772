use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::*;
use crate::attention::Classifier;
use crate::collaborators::{
    AttentionNotifier, LaunchRequest, ProcessHandle, ProcessLauncher, ScreenTextSource,
    SessionPersistence,
};
use crate::event::SessionEvent;
use crate::persistence::{JsonSessionStore, SessionRecord};
use crate::session::{CallerContext, FocusContext, SessionState};

const UI: CallerContext = CallerContext::Interactive;

// ========== Fakes ==========

#[derive(Default)]
struct FakeScreen {
    lines: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeScreen {
    fn show(&self, session_id: &str, lines: &[&str]) {
        self.lines.lock().unwrap().insert(
            session_id.to_string(),
            lines.iter().map(|l| (*l).to_string()).collect(),
        );
    }
}

impl ScreenTextSource for FakeScreen {
    fn visible_lines(&self, session_id: &str) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct ProcessLog {
    writes: Vec<String>,
    terminated: bool,
}

struct FakeProcess {
    log: Arc<Mutex<ProcessLog>>,
}

impl ProcessHandle for FakeProcess {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .writes
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    fn terminate(&mut self) {
        self.log.lock().unwrap().terminated = true;
    }
}

struct Launch {
    request: LaunchRequest,
    sink: LifecycleSink,
    log: Arc<Mutex<ProcessLog>>,
}

#[derive(Default)]
struct FakeLauncher {
    launches: Mutex<Vec<Launch>>,
    fail: Mutex<bool>,
}

impl FakeLauncher {
    fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    fn last_sink(&self) -> LifecycleSink {
        self.launches.lock().unwrap().last().unwrap().sink.clone()
    }

    fn sink(&self, index: usize) -> LifecycleSink {
        self.launches.lock().unwrap()[index].sink.clone()
    }

    fn last_request(&self) -> LaunchRequest {
        self.launches.lock().unwrap().last().unwrap().request.clone()
    }

    fn log(&self, index: usize) -> Arc<Mutex<ProcessLog>> {
        Arc::clone(&self.launches.lock().unwrap()[index].log)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest, sink: LifecycleSink) -> Result<Box<dyn ProcessHandle>> {
        if *self.fail.lock().unwrap() {
            return Err(anyhow!("spawn failed"));
        }
        let log = Arc::new(Mutex::new(ProcessLog::default()));
        self.launches.lock().unwrap().push(Launch {
            request: request.clone(),
            sink,
            log: Arc::clone(&log),
        });
        Ok(Box::new(FakeProcess { log }))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<(String, String)>>,
}

impl AttentionNotifier for RecordingNotifier {
    fn notify_attention(&self, session_id: &str, repo_name: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((session_id.to_string(), repo_name.to_string()));
    }
}

struct Harness {
    registry: SessionRegistry,
    screen: Arc<FakeScreen>,
    launcher: Arc<FakeLauncher>,
    notifier: Arc<RecordingNotifier>,
    dir: tempfile::TempDir,
    project: std::path::PathBuf,
}

fn harness() -> Harness {
    let screen = Arc::new(FakeScreen::default());
    let launcher = Arc::new(FakeLauncher::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let registry = SessionRegistry::builder(screen.clone(), launcher.clone())
        .notifier(notifier.clone())
        .global_args("--verbose")
        .build();
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("widget");
    std::fs::create_dir(&project).unwrap();
    Harness {
        registry,
        screen,
        launcher,
        notifier,
        dir,
        project,
    }
}

/// Let the debounce timer elapse.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(600)).await;
}

fn state_changes(events: &[SessionEvent]) -> Vec<SessionState> {
    events.iter().filter_map(SessionEvent::new_state).collect()
}

// ========== Tests ==========

#[tokio::test(start_paused = true)]
async fn test_full_cycle_emits_four_state_changes_in_order() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    let mut events = h.registry.subscribe_session(&id).unwrap();
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Idle));

    h.registry.start_session(&id, &UI);
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Running));
    let sink = h.launcher.last_sink();

    h.screen.show(&id, &["Do you want to proceed?", "❯ 1. Yes", "  2. No"]);
    sink.output_received();
    settle().await;
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Attention));
    assert_eq!(h.registry.attention_count(), 1);

    h.screen.show(&id, &["⏺ Running tests..."]);
    sink.output_received();
    settle().await;
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Running));
    assert_eq!(h.registry.attention_count(), 0);

    sink.process_exited(Some(0));
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Idle));

    let received = events.drain();
    assert_eq!(
        state_changes(&received),
        vec![
            SessionState::Running,
            SessionState::Attention,
            SessionState::Running,
            SessionState::Idle
        ]
    );
    assert!(received.contains(&SessionEvent::AttentionDetected {
        session_id: id.clone(),
        pattern: "Do you want to proceed?".to_string(),
    }));
    assert!(received.contains(&SessionEvent::ProcessExited {
        session_id: id.clone(),
        exit_code: Some(0),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_output_scans_once() {
    struct CountingClassifier(Mutex<usize>);
    impl Classifier for CountingClassifier {
        fn classify(&self, _lines: &[String]) -> Option<String> {
            *self.0.lock().unwrap() += 1;
            None
        }
    }

    let screen = Arc::new(FakeScreen::default());
    let launcher = Arc::new(FakeLauncher::default());
    let classifier = Arc::new(CountingClassifier(Mutex::new(0)));
    let registry = SessionRegistry::builder(screen, launcher.clone())
        .classifier(classifier.clone())
        .build();
    let dir = tempfile::tempdir().unwrap();
    let id = registry.add_session(dir.path(), &UI).unwrap();
    registry.start_session(&id, &UI);
    let sink = launcher.last_sink();

    for _ in 0..20 {
        sink.output_received();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(*classifier.0.lock().unwrap(), 0);

    settle().await;
    assert_eq!(*classifier.0.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_attention_does_not_double_count() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    let sink = h.launcher.last_sink();

    h.screen.show(&id, &["Allow Bash to run `cargo test`?"]);
    sink.output_received();
    settle().await;
    sink.output_received();
    settle().await;

    assert_eq!(h.registry.session_state(&id), Some(SessionState::Attention));
    assert_eq!(h.registry.attention_count(), 1);
    assert_eq!(h.notifier.calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attention_count_is_aggregated_and_watchable() {
    let h = harness();
    let other = h.dir.path().join("gadget");
    std::fs::create_dir(&other).unwrap();
    let a = h.registry.add_session(&h.project, &UI).unwrap();
    let b = h.registry.add_session(&other, &UI).unwrap();
    let badge = h.registry.watch_attention_count();

    h.registry.start_session(&a, &UI);
    h.registry.start_session(&b, &UI);
    h.screen.show(&a, &["Allow Edit to main.rs?"]);
    h.screen.show(&b, &["Overwrite? (y/n)"]);
    h.launcher.sink(0).output_received();
    h.launcher.sink(1).output_received();
    settle().await;

    assert_eq!(h.registry.attention_count(), 2);
    assert_eq!(*badge.borrow(), 2);

    h.launcher.sink(1).process_exited(Some(130));
    assert_eq!(h.registry.attention_count(), 1);
    assert_eq!(*badge.borrow(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_notification_carries_only_id_and_name() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);

    h.screen.show(&id, &["Allow Read of ~/.ssh/id_rsa?"]);
    h.launcher.last_sink().output_received();
    settle().await;

    let calls = h.notifier.calls.lock().unwrap();
    assert_eq!(calls.as_slice(), &[(id.clone(), "widget".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_notification_suppressed_when_user_is_watching() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.set_focus(FocusContext {
        app_focused: true,
        selected: Some(id.clone()),
    });
    h.registry.start_session(&id, &UI);

    h.screen.show(&id, &["Allow Bash?"]);
    h.launcher.last_sink().output_received();
    settle().await;

    assert_eq!(h.registry.session_state(&id), Some(SessionState::Attention));
    assert!(h.notifier.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_notification_not_suppressed_when_app_unfocused() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.set_focus(FocusContext {
        app_focused: false,
        selected: Some(id.clone()),
    });
    h.registry.start_session(&id, &UI);

    h.screen.show(&id, &["Allow Bash?"]);
    h.launcher.last_sink().output_received();
    settle().await;

    assert_eq!(h.notifier.calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_discards_pending_scan_and_old_callbacks() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    let old_sink = h.launcher.sink(0);

    h.screen.show(&id, &["Allow Bash?"]);
    old_sink.output_received();
    h.registry.restart_session(&id, &UI);
    settle().await;

    // The timer armed for the old process never produced a transition.
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Running));
    assert!(h.launcher.log(0).lock().unwrap().terminated);
    assert_eq!(h.launcher.launch_count(), 2);

    // Late output and exit from the old process are ignored.
    old_sink.output_received();
    settle().await;
    old_sink.process_exited(Some(143));
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Running));
    assert_eq!(h.registry.snapshot(&id).unwrap().restart_epoch, 1);

    // The new process is scanned normally.
    h.launcher.sink(1).output_received();
    settle().await;
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Attention));
}

#[tokio::test(start_paused = true)]
async fn test_restart_from_attention_releases_counter() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    h.screen.show(&id, &["Allow Bash?"]);
    h.launcher.last_sink().output_received();
    settle().await;
    assert_eq!(h.registry.attention_count(), 1);

    let mut events = h.registry.subscribe_session(&id).unwrap();
    h.registry.restart_session(&id, &UI);
    assert_eq!(h.registry.attention_count(), 0);
    assert_eq!(state_changes(&events.drain()), vec![SessionState::Running]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_of_idle_session_starts_it() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.restart_session(&id, &UI);
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Running));
    assert_eq!(h.launcher.launch_count(), 1);

    h.registry.restart_session("no-such-session", &UI);
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_is_noop_when_already_running() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    h.registry.start_session(&id, &UI);
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_input_authorization() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();

    // Idle: ignored.
    h.registry.send_input(&id, "hello\r", &UI);

    h.registry.start_session(&id, &UI);
    h.registry.send_input(&id, "from ui\r", &UI);
    h.registry.send_input(
        &id,
        "from url\r",
        &CallerContext::ExternalScheme {
            source: "shortcuts".to_string(),
        },
    );
    h.registry.send_input(
        &id,
        "from token\r",
        &CallerContext::PrivilegedChannel {
            token: "t0k3n".to_string(),
        },
    );
    h.registry.send_input("unknown", "x", &UI);

    let log = h.launcher.log(0);
    assert_eq!(log.lock().unwrap().writes, vec!["from ui\r".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_send_input_allowed_during_attention() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    h.screen.show(&id, &["Allow Bash?"]);
    h.launcher.last_sink().output_received();
    settle().await;

    h.registry.send_input(&id, "1", &UI);
    assert_eq!(h.launcher.log(0).lock().unwrap().writes, vec!["1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_remove_closes_every_subscription() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    let mut a = h.registry.subscribe_session(&id).unwrap();
    let mut b = h.registry.subscribe_session(&id).unwrap();
    h.registry.start_session(&id, &UI);

    h.registry.remove_session(&id, &UI);

    let ev = SessionEvent::StateChanged {
        session_id: id.clone(),
        state: SessionState::Running,
    };
    assert_eq!(a.next().await, Some(ev.clone()));
    assert_eq!(b.next().await, Some(ev));
    assert_eq!(a.next().await, None);
    assert_eq!(b.next().await, None);
    assert!(h.launcher.log(0).lock().unwrap().terminated);
}

#[tokio::test(start_paused = true)]
async fn test_add_then_remove_leaves_nothing_behind() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    let _sub = h.registry.subscribe_session(&id).unwrap();
    h.registry.remove_session(&id, &UI);

    assert!(h.registry.list_sessions().is_empty());
    assert_eq!(h.registry.open_subscriptions(&id), 0);
    assert!(h.registry.subscribe_session(&id).is_none());
    assert_eq!(h.registry.session_state(&id), None);

    // Second removal is harmless.
    h.registry.remove_session(&id, &UI);
}

#[tokio::test(start_paused = true)]
async fn test_remove_during_attention_releases_counter() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    h.screen.show(&id, &["Allow Bash?"]);
    h.launcher.last_sink().output_received();
    settle().await;
    assert_eq!(h.registry.attention_count(), 1);

    h.registry.remove_session(&id, &UI);
    assert_eq!(h.registry.attention_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remove_cancels_pending_scan() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    h.screen.show(&id, &["Allow Bash?"]);
    h.launcher.last_sink().output_received();
    h.registry.remove_session(&id, &UI);
    settle().await;

    assert_eq!(h.registry.attention_count(), 0);
    assert!(h.notifier.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_add_session_errors() {
    let h = harness();
    let missing = h.registry.add_session(h.project.join("missing"), &UI);
    assert!(matches!(missing, Err(RegistryError::InvalidPath { .. })));

    let file = h.project.join("README.md");
    std::fs::write(&file, "hi").unwrap();
    let not_dir = h.registry.add_session(&file, &UI);
    assert!(matches!(not_dir, Err(RegistryError::InvalidPath { .. })));

    let dotdot = h.registry.add_session(h.project.join("..").join("widget"), &UI);
    assert!(matches!(dotdot, Err(RegistryError::InvalidPath { .. })));

    let id = h.registry.add_session(&h.project, &UI).unwrap();
    match h.registry.add_session(&h.project, &UI) {
        Err(RegistryError::DuplicateSession { existing, .. }) => assert_eq!(existing, id),
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test(start_paused = true)]
async fn test_symlinked_duplicate_is_rejected() {
    let h = harness();
    let link = h.dir.path().join("widget-link");
    std::os::unix::fs::symlink(&h.project, &link).unwrap();

    h.registry.add_session(&h.project, &UI).unwrap();
    let dup = h.registry.add_session(&link, &UI);
    assert!(matches!(dup, Err(RegistryError::DuplicateSession { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_launch_args_combine_global_and_session() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry
        .set_session_args(&id, Some("--model  opus".to_string()), &UI);
    h.registry.start_session(&id, &UI);

    let request = h.launcher.last_request();
    assert_eq!(request.args, vec!["--verbose", "--model", "opus"]);
    assert_eq!(request.working_dir, std::fs::canonicalize(&h.project).unwrap());
    assert_eq!(request.session_id, id);
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_returns_to_idle() {
    let h = harness();
    *h.launcher.fail.lock().unwrap() = true;
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    let mut events = h.registry.subscribe_session(&id).unwrap();

    h.registry.start_session(&id, &UI);

    assert_eq!(h.registry.session_state(&id), Some(SessionState::Idle));
    let received = events.drain();
    assert_eq!(
        state_changes(&received),
        vec![SessionState::Running, SessionState::Idle]
    );
    assert!(received.contains(&SessionEvent::ProcessExited {
        session_id: id,
        exit_code: None,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_external_lifecycle_entry_points() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);

    h.screen.show(&id, &["Allow Bash?"]);
    h.registry.on_output_received(&id);
    settle().await;
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Attention));

    h.registry.on_process_exited(&id, None);
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Idle));
    assert_eq!(h.registry.attention_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_global_subscription_sees_all_sessions() {
    let h = harness();
    let other = h.dir.path().join("gadget");
    std::fs::create_dir(&other).unwrap();
    let mut global = h.registry.subscribe();

    let a = h.registry.add_session(&h.project, &UI).unwrap();
    let b = h.registry.add_session(&other, &UI).unwrap();
    h.registry.start_session(&a, &UI);
    h.registry.start_session(&b, &UI);
    h.registry.remove_session(&a, &UI);

    let ids: Vec<String> = global
        .drain()
        .iter()
        .map(|e| e.session_id().clone())
        .collect();
    assert_eq!(ids, vec![a, b]);
}

#[tokio::test(start_paused = true)]
async fn test_list_sessions_in_insertion_order() {
    let h = harness();
    let other = h.dir.path().join("gadget");
    std::fs::create_dir(&other).unwrap();
    h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.add_session(&other, &UI).unwrap();

    let names: Vec<String> = h
        .registry
        .list_sessions()
        .into_iter()
        .map(|s| s.repo_name)
        .collect();
    assert_eq!(names, vec!["widget".to_string(), "gadget".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_terminates_and_closes_streams() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);
    let sink = h.launcher.last_sink();
    let mut global = h.registry.subscribe();

    h.registry.shutdown();

    assert!(h.launcher.log(0).lock().unwrap().terminated);
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Idle));
    let mut tail = Vec::new();
    while let Some(ev) = global.next().await {
        tail.push(ev);
    }
    assert_eq!(state_changes(&tail), vec![SessionState::Idle]);

    // The killed process reporting its exit afterwards changes nothing.
    sink.process_exited(Some(143));
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("widget");
    std::fs::create_dir(&project).unwrap();
    let store = Arc::new(JsonSessionStore::at(dir.path().join("sessions.json")));

    let first = SessionRegistry::builder(
        Arc::new(FakeScreen::default()),
        Arc::new(FakeLauncher::default()),
    )
    .persistence(store.clone())
    .build();
    let id = first.add_session(&project, &UI).unwrap();
    first.set_session_args(&id, Some("--continue".to_string()), &UI);

    let second = SessionRegistry::builder(
        Arc::new(FakeScreen::default()),
        Arc::new(FakeLauncher::default()),
    )
    .persistence(store)
    .build();
    let restored = second.restore().unwrap();
    assert_eq!(restored.len(), 1);

    let snapshot = second.snapshot(&restored[0]).unwrap();
    assert_eq!(snapshot.repo_name, "widget");
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.args.as_deref(), Some("--continue"));
}

#[tokio::test(start_paused = true)]
async fn test_restore_prunes_vanished_projects() {
    let dir = tempfile::tempdir().unwrap();
    let keep = dir.path().join("keep");
    let gone = dir.path().join("gone");
    std::fs::create_dir(&keep).unwrap();
    std::fs::create_dir(&gone).unwrap();
    let store = Arc::new(JsonSessionStore::at(dir.path().join("sessions.json")));

    let first = SessionRegistry::builder(
        Arc::new(FakeScreen::default()),
        Arc::new(FakeLauncher::default()),
    )
    .persistence(store.clone())
    .build();
    first.add_session(&keep, &UI).unwrap();
    first.add_session(&gone, &UI).unwrap();
    std::fs::remove_dir(&gone).unwrap();

    let second = SessionRegistry::builder(
        Arc::new(FakeScreen::default()),
        Arc::new(FakeLauncher::default()),
    )
    .persistence(store.clone())
    .build();
    let restored = second.restore().unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(second.list_sessions()[0].repo_name, "keep");

    // The file is rewritten right away, without waiting for another change.
    let on_disk = store.load().unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].name, "keep");
}

#[tokio::test]
async fn test_older_scan_finishing_last_is_discarded() {
    /// Holds any scan that sees a prompt until the test lets it go.
    struct GatedClassifier {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }
    impl Classifier for GatedClassifier {
        fn classify(&self, lines: &[String]) -> Option<String> {
            let matched = crate::attention::classify(lines);
            if matched.is_some() {
                self.entered.lock().unwrap().send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            matched
        }
    }

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let screen = Arc::new(FakeScreen::default());
    let registry = SessionRegistry::builder(screen.clone(), Arc::new(FakeLauncher::default()))
        .classifier(Arc::new(GatedClassifier {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }))
        .build();
    let dir = tempfile::tempdir().unwrap();
    let id = registry.add_session(dir.path(), &UI).unwrap();
    registry.start_session(&id, &UI);
    let mut events = registry.subscribe_session(&id).unwrap();

    // The older scan reads a prompt and stalls inside classification.
    screen.show(&id, &["Allow Bash to run `rm -rf target`?"]);
    let older = {
        let registry = registry.clone();
        let id = id.clone();
        std::thread::spawn(move || registry.scan_with_seq(&id, 1))
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Meanwhile the prompt was answered and a newer scan completes.
    screen.show(&id, &["⏺ Cleaning build output"]);
    registry.scan_with_seq(&id, 2);

    release_tx.send(()).unwrap();
    older.join().unwrap();

    assert_eq!(registry.session_state(&id), Some(SessionState::Running));
    assert_eq!(registry.attention_count(), 0);
    assert!(events.drain().is_empty());
}

#[tokio::test]
async fn test_scan_with_repeated_seq_is_discarded() {
    let h = harness();
    let id = h.registry.add_session(&h.project, &UI).unwrap();
    h.registry.start_session(&id, &UI);

    h.registry.scan_with_seq(&id, 7);
    h.screen.show(&id, &["Allow Bash?"]);
    h.registry.scan_with_seq(&id, 7);
    h.registry.scan_with_seq(&id, 6);
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Running));

    h.registry.scan_with_seq(&id, 8);
    assert_eq!(h.registry.session_state(&id), Some(SessionState::Attention));
}

/// Collaborators that call back into the registry from inside their I/O.
#[derive(Default)]
struct Reentrant {
    registry: OnceLock<SessionRegistry>,
    seen: Mutex<Vec<&'static str>>,
}

impl Reentrant {
    fn peek(&self, what: &'static str) {
        if let Some(registry) = self.registry.get() {
            registry.list_sessions();
            self.seen.lock().unwrap().push(what);
        }
    }
}

struct ReentrantStore(Arc<Reentrant>);

impl SessionPersistence for ReentrantStore {
    fn load(&self) -> Result<Vec<SessionRecord>> {
        Ok(Vec::new())
    }

    fn save(&self, _records: &[SessionRecord]) -> Result<()> {
        self.0.peek("save");
        Ok(())
    }
}

struct ReentrantLauncher(Arc<Reentrant>);

impl ProcessLauncher for ReentrantLauncher {
    fn launch(&self, _request: &LaunchRequest, _sink: LifecycleSink) -> Result<Box<dyn ProcessHandle>> {
        Ok(Box::new(ReentrantProcess(Arc::clone(&self.0))))
    }
}

struct ReentrantProcess(Arc<Reentrant>);

impl ProcessHandle for ReentrantProcess {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        self.0.peek("write");
        Ok(())
    }

    fn terminate(&mut self) {
        self.0.peek("terminate");
    }
}

#[tokio::test]
async fn test_store_and_process_io_run_outside_registry_lock() {
    let hooks = Arc::new(Reentrant::default());
    let registry = SessionRegistry::builder(
        Arc::new(FakeScreen::default()),
        Arc::new(ReentrantLauncher(Arc::clone(&hooks))),
    )
    .persistence(Arc::new(ReentrantStore(Arc::clone(&hooks))))
    .build();
    let _ = hooks.registry.set(registry.clone());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let id = registry.add_session(&path, &UI).unwrap();
        registry.start_session(&id, &UI);
        registry.send_input(&id, "y", &UI);
        registry.set_session_args(&id, Some("--continue".to_string()), &UI);
        registry.restart_session(&id, &UI);
        registry.remove_session(&id, &UI);
        let _ = done_tx.send(());
    });

    // A callback that needs the lock would never return if it were held.
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        *hooks.seen.lock().unwrap(),
        vec!["save", "write", "save", "terminate", "terminate", "save"]
    );
}
