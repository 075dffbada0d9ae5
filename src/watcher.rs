//! Process-creation watcher.
//!
//! A dedicated worker thread owns the OS subscription (WMI on Windows) and
//! forwards notifications over a channel. The worker blocks on "stop
//! requested OR OS message"; `stop()` signals, waits a grace period for the
//! worker to finish, and only then kills it.
//!
//! ```text
//! Idle --start()--> Starting --ready--> Running --stop()--> Stopping --> Idle
//!                       \___ setup failure (reported as Error) ______/
//! ```

use crate::error::{HideError, HideResult};
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(3000);

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNotification {
    pub pid: u32,
    pub name: String,
    pub executable_path: String,
}

impl ProcessNotification {
    /// Builds a notification, filling a missing path from `lookup` and then
    /// from the process name.
    pub fn with_fallbacks(
        pid: u32,
        name: Option<String>,
        path: Option<String>,
        lookup: impl FnOnce(u32) -> Option<String>,
    ) -> Self {
        let name = name.filter(|n| !n.is_empty()).unwrap_or_default();
        let executable_path = path
            .filter(|p| !p.is_empty())
            .or_else(|| lookup(pid))
            .unwrap_or_else(|| name.clone());
        Self {
            pid,
            name,
            executable_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherMessage {
    ProcessCreated(ProcessNotification),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Starting,
    Running,
    Stopping,
}

// ============================================================================
// Stop signal
// ============================================================================

struct StopInner {
    stopped: Mutex<bool>,
    cond: Condvar,
    #[cfg(target_os = "windows")]
    event: crate::platform::handle::ManualResetEvent,
}

/// Cooperative cancellation shared by the controller and the worker.
///
/// On Windows it is backed by a manual-reset event as well, so a worker can
/// include it in `MsgWaitForMultipleObjects`.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> HideResult<Self> {
        Ok(Self {
            inner: Arc::new(StopInner {
                stopped: Mutex::new(false),
                cond: Condvar::new(),
                #[cfg(target_os = "windows")]
                event: crate::platform::handle::ManualResetEvent::new()?,
            }),
        })
    }

    pub fn signal(&self) {
        if let Ok(mut stopped) = self.inner.stopped.lock() {
            *stopped = true;
        }
        self.inner.cond.notify_all();
        #[cfg(target_os = "windows")]
        self.inner.event.set();
    }

    pub fn reset(&self) {
        if let Ok(mut stopped) = self.inner.stopped.lock() {
            *stopped = false;
        }
        #[cfg(target_os = "windows")]
        self.inner.event.reset();
    }

    pub fn is_set(&self) -> bool {
        self.inner.stopped.lock().map(|s| *s).unwrap_or(true)
    }

    /// Blocks until signalled or `timeout` elapses. Returns whether the
    /// signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.inner.stopped.lock() else {
            return true;
        };
        match self.inner.cond.wait_timeout_while(guard, timeout, |stopped| !*stopped) {
            Ok((stopped, _)) => *stopped,
            Err(_) => true,
        }
    }

    #[cfg(target_os = "windows")]
    pub fn event_handle(&self) -> windows::Win32::Foundation::HANDLE {
        self.inner.event.handle()
    }
}

// ============================================================================
// Event sources
// ============================================================================

/// Hands notifications from the worker to the consumer.
#[derive(Clone)]
pub struct NotificationSink {
    tx: Sender<WatcherMessage>,
    state: Arc<Mutex<WatcherState>>,
}

impl NotificationSink {
    /// Subscription is established; moves `Starting` to `Running`.
    pub fn ready(&self) {
        if let Ok(mut state) = self.state.lock() {
            if *state == WatcherState::Starting {
                *state = WatcherState::Running;
            }
        }
        info!("[watcher] Subscribed to process creation events");
    }

    pub fn process_created(&self, notification: ProcessNotification) {
        debug!(
            "[watcher] Process created: {} ({})",
            notification.name, notification.pid
        );
        self.deliver(WatcherMessage::ProcessCreated(notification));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("[watcher] {}", message);
        self.deliver(WatcherMessage::Error(message));
    }

    /// Returns false when the consumer is gone and `message` was dropped.
    fn deliver(&self, message: WatcherMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(mpsc::SendError(message)) => {
                debug!("[watcher] No consumer, dropped {:?}", message);
                false
            }
        }
    }
}

/// Something that delivers process-creation notifications until stopped.
pub trait ProcessEventSource: Clone + Send + 'static {
    /// Runs on the worker thread. Returns when `stop` is signalled; setup
    /// failures are returned as errors, per-event problems go to `sink`.
    fn run(&mut self, sink: &NotificationSink, stop: &StopSignal) -> HideResult<()>;
}

// ============================================================================
// Watcher
// ============================================================================

pub struct ProcessWatcher<S: ProcessEventSource> {
    source: S,
    tx: Sender<WatcherMessage>,
    state: Arc<Mutex<WatcherState>>,
    stop: StopSignal,
    worker: Option<JoinHandle<()>>,
    done: Option<Receiver<()>>,
    grace: Duration,
}

impl<S: ProcessEventSource> ProcessWatcher<S> {
    pub fn new(source: S, tx: Sender<WatcherMessage>, grace: Duration) -> HideResult<Self> {
        Ok(Self {
            source,
            tx,
            state: Arc::new(Mutex::new(WatcherState::Idle)),
            stop: StopSignal::new()?,
            worker: None,
            done: None,
            grace,
        })
    }

    pub fn state(&self) -> WatcherState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(WatcherState::Idle)
    }

    fn set_state(&self, next: WatcherState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Starts the worker. Does nothing unless the watcher is idle.
    pub fn start(&mut self) -> HideResult<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| HideError::SubscriptionFailed("watcher state poisoned".into()))?;
            if *state != WatcherState::Idle {
                return Ok(());
            }
            *state = WatcherState::Starting;
        }
        self.reap();
        self.stop.reset();

        let (done_tx, done_rx) = mpsc::channel();
        let mut source = self.source.clone();
        let stop = self.stop.clone();
        let state = self.state.clone();
        let sink = NotificationSink {
            tx: self.tx.clone(),
            state: self.state.clone(),
        };

        let spawned = std::thread::Builder::new()
            .name("process-watcher".into())
            .spawn(move || {
                if let Err(e) = source.run(&sink, &stop) {
                    sink.error(e.to_string());
                }
                if let Ok(mut s) = state.lock() {
                    if *s != WatcherState::Stopping {
                        *s = WatcherState::Idle;
                    }
                }
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.done = Some(done_rx);
                info!("[watcher] Started");
                Ok(())
            }
            Err(e) => {
                self.set_state(WatcherState::Idle);
                Err(HideError::Io(e))
            }
        }
    }

    /// Stops the worker, waiting up to the grace period before killing it.
    pub fn stop(&mut self) {
        if self.worker.is_none() {
            self.set_state(WatcherState::Idle);
            return;
        }
        self.set_state(WatcherState::Stopping);
        self.stop.signal();

        let finished = match self.done.take() {
            Some(done) => match done.recv_timeout(self.grace) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
            None => true,
        };

        if let Some(handle) = self.worker.take() {
            if finished {
                if handle.join().is_err() {
                    warn!("[watcher] Worker panicked");
                }
            } else {
                warn!(
                    "[watcher] Worker did not stop within {:?}, terminating",
                    self.grace
                );
                force_terminate(handle);
            }
        }
        self.set_state(WatcherState::Idle);
        info!("[watcher] Stopped");
    }

    /// Joins a worker that already exited on its own.
    fn reap(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.done = None;
    }
}

impl<S: ProcessEventSource> Drop for ProcessWatcher<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(target_os = "windows")]
fn force_terminate(handle: JoinHandle<()>) {
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Threading::TerminateThread;

    // SAFETY: last resort after the grace period. The worker may hold COM
    // state that is never released.
    unsafe {
        if let Err(e) = TerminateThread(HANDLE(handle.as_raw_handle()), 1) {
            error!("[watcher] TerminateThread failed: {}", e);
        }
    }
    drop(handle);
}

#[cfg(not(target_os = "windows"))]
fn force_terminate(handle: JoinHandle<()>) {
    // Threads cannot be killed here; detach it.
    drop(handle);
}
