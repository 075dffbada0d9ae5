//! Automatic hiding of newly started processes.
//!
//! Consumes watcher messages, filters them through the autohide list, waits
//! for the new process to show a main window, then hides it.

use crate::config::AutohideSettings;
use crate::error::HideResult;
use crate::events::{AppEvent, EmitAppEvent};
use crate::matcher::{file_name, should_hide};
use crate::procinfo::{ProcessEntry, MAX_SYSTEM_PID};
use crate::resolver::WindowProbe;
use crate::watcher::{ProcessNotification, WatcherMessage};
use log::{debug, info, warn};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const WINDOW_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Hides every window of a process from capture.
pub trait VisibilityController: Send + Sync {
    fn hide_process(&self, pid: u32) -> HideResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutohideOutcome {
    NotMatched,
    /// Matched, but no main window appeared within the wait limit.
    NoWindow,
    Hidden,
    Failed(String),
}

pub struct Autohider<V, P, E> {
    controller: V,
    probe: P,
    emitter: E,
    list: Mutex<Vec<String>>,
    notify: bool,
    max_window_wait: Duration,
}

impl<V, P, E> Autohider<V, P, E>
where
    V: VisibilityController,
    P: WindowProbe,
    E: EmitAppEvent + Send + Sync,
{
    pub fn new(controller: V, probe: P, emitter: E, settings: &AutohideSettings) -> Self {
        Self {
            controller,
            probe,
            emitter,
            list: Mutex::new(settings.list.clone()),
            notify: settings.notify,
            max_window_wait: Duration::from_millis(settings.max_window_wait_ms),
        }
    }

    pub fn set_list(&self, list: Vec<String>) {
        if let Ok(mut current) = self.list.lock() {
            *current = list;
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.list.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn emit(&self, event: AppEvent) {
        if let Err(e) = self.emitter.emit_app_event(&event) {
            warn!("[autohide] Dropped {} event: {}", event.event_name(), e);
        }
    }

    pub fn handle_message(&self, message: WatcherMessage) -> Option<AutohideOutcome> {
        match message {
            WatcherMessage::ProcessCreated(n) => Some(self.handle_process_created(&n)),
            WatcherMessage::Error(message) => {
                self.emit(AppEvent::ErrorOccurred {
                    message: format!("WMI Error: {}", message),
                });
                None
            }
        }
    }

    pub fn handle_process_created(&self, n: &ProcessNotification) -> AutohideOutcome {
        self.emit(AppEvent::ProcessDetected {
            pid: n.pid,
            name: n.name.clone(),
            executable_path: n.executable_path.clone(),
        });

        let list = self.list();
        if !should_hide(&n.executable_path, &list) {
            debug!("[autohide] {} not in list", n.name);
            return AutohideOutcome::NotMatched;
        }

        if !self.wait_for_window(n.pid) {
            info!(
                "[autohide] {} (PID: {}) showed no window within {:?}, skipping",
                n.name, n.pid, self.max_window_wait
            );
            return AutohideOutcome::NoWindow;
        }

        match self.controller.hide_process(n.pid) {
            Ok(()) => {
                info!("[autohide] Hid {} (PID: {})", n.name, n.pid);
                self.emit(AppEvent::ProcessHidden {
                    pid: n.pid,
                    name: n.name.clone(),
                });
                if self.notify {
                    self.emit(AppEvent::NotificationRequested {
                        title: "Process Hidden".into(),
                        message: format!("Process '{}' has been automatically hidden", n.name),
                    });
                }
                AutohideOutcome::Hidden
            }
            Err(e) => {
                let message = format!("Failed to hide process {} (PID: {}): {}", n.name, n.pid, e);
                self.emit(AppEvent::ErrorOccurred {
                    message: message.clone(),
                });
                AutohideOutcome::Failed(message)
            }
        }
    }

    /// Polls for a main window every 100 ms up to the configured limit.
    pub fn wait_for_window(&self, pid: u32) -> bool {
        if self.probe.has_window(pid) {
            return true;
        }
        let deadline = Instant::now() + self.max_window_wait;
        while Instant::now() < deadline {
            std::thread::sleep(WINDOW_CHECK_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
            if self.probe.has_window(pid) {
                return true;
            }
        }
        false
    }

    /// Applies the list to processes that were already running. Returns the
    /// number hidden.
    pub fn hide_existing(&self, processes: &[ProcessEntry]) -> usize {
        let list = self.list();
        if list.is_empty() {
            debug!("[autohide] Empty list, nothing to hide on start");
            return 0;
        }

        let mut hidden = 0;
        for process in processes.iter().filter(|p| p.pid > MAX_SYSTEM_PID) {
            let Some(path) = process.executable_path.as_ref() else {
                continue;
            };
            let path = path.to_string_lossy();
            if !should_hide(&path, &list) || !self.wait_for_window(process.pid) {
                continue;
            }
            let name = file_name(&path).to_string();
            match self.controller.hide_process(process.pid) {
                Ok(()) => {
                    hidden += 1;
                    self.emit(AppEvent::ProcessHidden {
                        pid: process.pid,
                        name: name.clone(),
                    });
                    if self.notify {
                        self.emit(AppEvent::NotificationRequested {
                            title: "Process Hidden".into(),
                            message: format!("Existing process '{}' has been hidden", name),
                        });
                    }
                }
                Err(e) => warn!(
                    "[autohide] Failed to hide existing {} (PID: {}): {}",
                    name, process.pid, e
                ),
            }
        }
        info!(
            "[autohide] Checked {} running processes, hid {}",
            processes.len(),
            hidden
        );
        hidden
    }
}

impl<V, P, E> Autohider<V, P, E>
where
    V: VisibilityController + 'static,
    P: WindowProbe + 'static,
    E: EmitAppEvent + Send + Sync + 'static,
{
    /// Handles watcher messages on a separate thread until every sender is
    /// dropped.
    pub fn spawn_dispatcher(self: Arc<Self>, rx: Receiver<WatcherMessage>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("autohide-dispatch".into())
            .spawn(move || {
                for message in rx {
                    self.handle_message(message);
                }
                debug!("[autohide] Dispatcher finished");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HideError;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc::{self, Sender};

    #[derive(Default)]
    struct FakeController {
        hidden: Mutex<Vec<u32>>,
        fail: bool,
    }

    impl VisibilityController for Arc<FakeController> {
        fn hide_process(&self, pid: u32) -> HideResult<()> {
            if self.fail {
                return Err(HideError::ProcessGone(pid));
            }
            self.hidden.lock().unwrap().push(pid);
            Ok(())
        }
    }

    /// Window appears after `after` probes.
    struct FakeProbe {
        with_window: HashSet<u32>,
        after: u32,
        calls: AtomicU32,
    }

    impl FakeProbe {
        fn new(pids: &[u32], after: u32) -> Self {
            Self {
                with_window: pids.iter().copied().collect(),
                after,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl WindowProbe for FakeProbe {
        fn has_window(&self, pid: u32) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.with_window.contains(&pid) && n >= self.after
        }
    }

    fn settings(list: &[&str], wait_ms: u64) -> AutohideSettings {
        AutohideSettings {
            enabled: true,
            notify: true,
            max_window_wait_ms: wait_ms,
            hide_existing_on_start: false,
            list: list.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn notification(pid: u32, path: &str) -> ProcessNotification {
        ProcessNotification {
            pid,
            name: file_name(path).to_string(),
            executable_path: path.to_string(),
        }
    }

    type TestAutohider = Autohider<Arc<FakeController>, FakeProbe, Sender<AppEvent>>;

    fn autohider(
        controller: Arc<FakeController>,
        probe: FakeProbe,
        s: &AutohideSettings,
    ) -> (TestAutohider, mpsc::Receiver<AppEvent>) {
        let (tx, rx) = mpsc::channel();
        (Autohider::new(controller, probe, tx, s), rx)
    }

    #[test]
    fn test_match_waits_then_hides() {
        let controller = Arc::new(FakeController::default());
        let (a, rx) = autohider(controller.clone(), FakeProbe::new(&[50], 2), &settings(&["notepad.exe"], 2000));

        let outcome = a.handle_process_created(&notification(50, "C:\\Windows\\notepad.exe"));
        assert_eq!(outcome, AutohideOutcome::Hidden);
        assert_eq!(*controller.hidden.lock().unwrap(), vec![50]);

        let events: Vec<AppEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_name(), "process-detected");
        assert_eq!(
            events[1],
            AppEvent::ProcessHidden {
                pid: 50,
                name: "notepad.exe".into()
            }
        );
        assert_eq!(
            events[2],
            AppEvent::NotificationRequested {
                title: "Process Hidden".into(),
                message: "Process 'notepad.exe' has been automatically hidden".into()
            }
        );
    }

    #[test]
    fn test_unmatched_only_reports_detection() {
        let controller = Arc::new(FakeController::default());
        let (a, rx) = autohider(controller.clone(), FakeProbe::new(&[51], 0), &settings(&["notepad.exe"], 0));
        let outcome = a.handle_process_created(&notification(51, "C:\\Tools\\notepad2.exe"));
        assert_eq!(outcome, AutohideOutcome::NotMatched);
        assert!(controller.hidden.lock().unwrap().is_empty());
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_no_window_is_not_an_error() {
        let controller = Arc::new(FakeController::default());
        let (a, rx) = autohider(controller.clone(), FakeProbe::new(&[], 0), &settings(&["app.exe"], 250));
        let started = Instant::now();
        let outcome = a.handle_process_created(&notification(52, "C:\\app.exe"));
        assert_eq!(outcome, AutohideOutcome::NoWindow);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(rx
            .try_iter()
            .all(|e| !matches!(e, AppEvent::ErrorOccurred { .. })));
    }

    #[test]
    fn test_failure_emits_error_message() {
        let controller = Arc::new(FakeController {
            fail: true,
            ..Default::default()
        });
        let (a, rx) = autohider(controller, FakeProbe::new(&[53], 0), &settings(&["app.exe"], 0));
        let outcome = a.handle_process_created(&notification(53, "C:\\app.exe"));
        assert!(matches!(outcome, AutohideOutcome::Failed(_)));
        let last = rx.try_iter().last().unwrap();
        assert_eq!(
            last,
            AppEvent::ErrorOccurred {
                message: "Failed to hide process app.exe (PID: 53): Process 53 is no longer running".into()
            }
        );
    }

    #[test]
    fn test_watcher_error_is_forwarded() {
        let (a, rx) = autohider(Arc::default(), FakeProbe::new(&[], 0), &settings(&[], 0));
        assert!(a.handle_message(WatcherMessage::Error("access denied".into())).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            AppEvent::ErrorOccurred {
                message: "WMI Error: access denied".into()
            }
        );
    }

    #[test]
    fn test_list_update_applies_to_next_process() {
        let controller = Arc::new(FakeController::default());
        let (a, _rx) = autohider(controller.clone(), FakeProbe::new(&[60], 0), &settings(&[], 0));
        assert_eq!(
            a.handle_process_created(&notification(60, "C:\\x\\tool.exe")),
            AutohideOutcome::NotMatched
        );
        a.set_list(vec!["x/tool.exe".into()]);
        assert_eq!(
            a.handle_process_created(&notification(60, "C:\\x\\tool.exe")),
            AutohideOutcome::Hidden
        );
    }

    #[test]
    fn test_hide_existing_skips_system_pids() {
        let controller = Arc::new(FakeController::default());
        let (a, _rx) = autohider(controller.clone(), FakeProbe::new(&[4, 70, 71], 0), &settings(&["app.exe"], 0));
        let processes = vec![
            ProcessEntry {
                pid: 4,
                name: "app.exe".into(),
                executable_path: Some("C:\\app.exe".into()),
            },
            ProcessEntry {
                pid: 70,
                name: "app.exe".into(),
                executable_path: Some("C:\\app.exe".into()),
            },
            ProcessEntry {
                pid: 71,
                name: "app.exe".into(),
                executable_path: None,
            },
            ProcessEntry {
                pid: 72,
                name: "other.exe".into(),
                executable_path: Some("C:\\other.exe".into()),
            },
        ];
        assert_eq!(a.hide_existing(&processes), 1);
        assert_eq!(*controller.hidden.lock().unwrap(), vec![70]);
    }

    #[test]
    fn test_dispatcher_drains_queue() {
        let controller = Arc::new(FakeController::default());
        let (a, events) = autohider(controller.clone(), FakeProbe::new(&[80, 81], 0), &settings(&["a.exe"], 0));
        let (tx, rx) = mpsc::channel();
        let handle = Arc::new(a).spawn_dispatcher(rx).unwrap();
        tx.send(WatcherMessage::ProcessCreated(notification(80, "C:\\a.exe"))).unwrap();
        tx.send(WatcherMessage::ProcessCreated(notification(81, "C:\\b.exe"))).unwrap();
        drop(tx);
        handle.join().unwrap();
        assert_eq!(*controller.hidden.lock().unwrap(), vec![80]);
        assert_eq!(events.try_iter().count(), 4);
    }
}
