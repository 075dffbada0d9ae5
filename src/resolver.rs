//! Process ⇄ main-window resolution and liveness checks.

use crate::error::{HideError, HideResult, OsError};
use crate::target::{ResolvedTarget, Target, WindowHandle};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(u32),
    Missing,
    AccessDenied(OsError),
}

/// The window manager queries the resolver needs.
pub trait WindowSystem {
    /// Top-level windows in the platform's enumeration order.
    fn top_level_windows(&self) -> Vec<WindowHandle>;
    fn is_window(&self, window: WindowHandle) -> bool;
    fn is_visible(&self, window: WindowHandle) -> bool;
    fn owner(&self, window: WindowHandle) -> Option<WindowHandle>;
    fn window_process(&self, window: WindowHandle) -> Option<u32>;
    fn process_liveness(&self, pid: u32) -> Liveness;
}

/// Answers "does this process have a main window yet?".
pub trait WindowProbe: Send + Sync {
    fn has_window(&self, pid: u32) -> bool;
}

pub struct TargetResolver<W> {
    windows: W,
}

impl<W: WindowSystem> TargetResolver<W> {
    pub fn new(windows: W) -> Self {
        Self { windows }
    }

    pub fn windows(&self) -> &W {
        &self.windows
    }

    /// First visible, unowned top-level window of `pid`. When several
    /// qualify, the enumeration order decides.
    pub fn find_main_window(&self, pid: u32) -> Option<WindowHandle> {
        self.windows.top_level_windows().into_iter().find(|&w| {
            self.windows.window_process(w) == Some(pid)
                && self.windows.is_visible(w)
                && self.windows.owner(w).is_none()
        })
    }

    pub fn resolve(&self, target: Target) -> HideResult<ResolvedTarget> {
        let resolved = match target {
            Target::Window(window) => {
                self.check_window(window)?;
                let pid = self.windows.window_process(window).ok_or_else(|| {
                    HideError::TargetNotFound(format!("no process owns window {}", window))
                })?;
                ResolvedTarget { pid, window }
            }
            Target::Process(pid) => {
                let window = self.find_main_window(pid).ok_or_else(|| {
                    HideError::TargetNotFound(format!("no main window for process {}", pid))
                })?;
                ResolvedTarget { pid, window }
            }
        };
        self.check_running(resolved.pid)?;
        debug!(
            "[resolver] {} -> pid {} window {}",
            target, resolved.pid, resolved.window
        );
        Ok(resolved)
    }

    /// Re-checks a resolved target right before acting on it.
    pub fn revalidate(&self, target: &ResolvedTarget) -> HideResult<()> {
        self.check_window(target.window)?;
        match self.windows.window_process(target.window) {
            Some(pid) if pid == target.pid => {}
            Some(other) => {
                return Err(HideError::TargetNotFound(format!(
                    "window {} now belongs to process {}, expected {}",
                    target.window, other, target.pid
                )))
            }
            None => return Err(HideError::ProcessGone(target.pid)),
        }
        self.check_running(target.pid)
    }

    fn check_window(&self, window: WindowHandle) -> HideResult<()> {
        if !self.windows.is_window(window) {
            return Err(HideError::TargetNotFound(format!(
                "window {} has been closed or is invalid",
                window
            )));
        }
        if !self.windows.is_visible(window) {
            return Err(HideError::TargetNotFound(format!(
                "window {} is not visible",
                window
            )));
        }
        Ok(())
    }

    fn check_running(&self, pid: u32) -> HideResult<()> {
        match self.windows.process_liveness(pid) {
            Liveness::Running => Ok(()),
            Liveness::Exited(code) => {
                debug!("[resolver] Process {} exited with {}", pid, code);
                Err(HideError::ProcessGone(pid))
            }
            Liveness::Missing => Err(HideError::ProcessGone(pid)),
            Liveness::AccessDenied(os_error) => Err(HideError::PermissionDenied { pid, os_error }),
        }
    }
}

impl<W: WindowSystem + Send + Sync> WindowProbe for TargetResolver<W> {
    fn has_window(&self, pid: u32) -> bool {
        self.find_main_window(pid).is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    pub struct FakeWindow {
        pub handle: usize,
        pub pid: u32,
        pub visible: bool,
        pub owner: Option<usize>,
    }

    #[derive(Default)]
    pub struct FakeWindows {
        pub windows: Mutex<Vec<FakeWindow>>,
        pub processes: Mutex<HashMap<u32, Liveness>>,
    }

    impl FakeWindows {
        pub fn with(windows: &[FakeWindow], running: &[u32]) -> Self {
            Self {
                windows: Mutex::new(windows.to_vec()),
                processes: Mutex::new(running.iter().map(|&p| (p, Liveness::Running)).collect()),
            }
        }

        fn get(&self, w: WindowHandle) -> Option<FakeWindow> {
            self.windows.lock().unwrap().iter().find(|f| f.handle == w.0).copied()
        }
    }

    impl WindowSystem for FakeWindows {
        fn top_level_windows(&self) -> Vec<WindowHandle> {
            self.windows.lock().unwrap().iter().map(|f| WindowHandle(f.handle)).collect()
        }
        fn is_window(&self, w: WindowHandle) -> bool {
            self.get(w).is_some()
        }
        fn is_visible(&self, w: WindowHandle) -> bool {
            self.get(w).is_some_and(|f| f.visible)
        }
        fn owner(&self, w: WindowHandle) -> Option<WindowHandle> {
            self.get(w).and_then(|f| f.owner).map(WindowHandle)
        }
        fn window_process(&self, w: WindowHandle) -> Option<u32> {
            self.get(w).map(|f| f.pid)
        }
        fn process_liveness(&self, pid: u32) -> Liveness {
            self.processes
                .lock()
                .unwrap()
                .get(&pid)
                .copied()
                .unwrap_or(Liveness::Missing)
        }
    }

    pub fn win(handle: usize, pid: u32, visible: bool, owner: Option<usize>) -> FakeWindow {
        FakeWindow {
            handle,
            pid,
            visible,
            owner,
        }
    }

    fn desktop() -> FakeWindows {
        FakeWindows::with(
            &[
                win(0x100, 10, false, None),       // hidden
                win(0x200, 10, true, Some(0x300)), // owned dialog
                win(0x300, 10, true, None),        // main
                win(0x400, 10, true, None),        // second candidate
                win(0x500, 20, true, None),
            ],
            &[10, 20],
        )
    }

    #[test]
    fn test_pid_resolves_to_first_visible_unowned_window() {
        let r = TargetResolver::new(desktop());
        let t = r.resolve(Target::Process(10)).unwrap();
        assert_eq!(
            t,
            ResolvedTarget {
                pid: 10,
                window: WindowHandle(0x300)
            }
        );
    }

    #[test]
    fn test_pid_and_window_targets_agree() {
        let r = TargetResolver::new(desktop());
        let by_pid = r.resolve(Target::Process(20)).unwrap();
        let by_window = r.resolve(Target::Window(by_pid.window)).unwrap();
        assert_eq!(by_pid, by_window);
    }

    #[test]
    fn test_unknown_pid_is_not_found() {
        let r = TargetResolver::new(desktop());
        assert!(matches!(
            r.resolve(Target::Process(99)),
            Err(HideError::TargetNotFound(_))
        ));
    }

    #[test]
    fn test_invisible_window_is_rejected() {
        let r = TargetResolver::new(desktop());
        assert!(matches!(
            r.resolve(Target::Window(WindowHandle(0x100))),
            Err(HideError::TargetNotFound(_))
        ));
        assert!(matches!(
            r.resolve(Target::Window(WindowHandle(0xDEAD))),
            Err(HideError::TargetNotFound(_))
        ));
    }

    #[test]
    fn test_exited_process_is_gone() {
        let fake = desktop();
        fake.processes.lock().unwrap().insert(20, Liveness::Exited(0));
        let r = TargetResolver::new(fake);
        assert!(matches!(
            r.resolve(Target::Window(WindowHandle(0x500))),
            Err(HideError::ProcessGone(20))
        ));
    }

    #[test]
    fn test_access_denied_is_permission_error() {
        let fake = desktop();
        fake.processes
            .lock()
            .unwrap()
            .insert(20, Liveness::AccessDenied(OsError(5)));
        let r = TargetResolver::new(fake);
        assert!(matches!(
            r.resolve(Target::Process(20)),
            Err(HideError::PermissionDenied { pid: 20, .. })
        ));
    }

    #[test]
    fn test_revalidate_detects_changes() {
        let r = TargetResolver::new(desktop());
        let t = r.resolve(Target::Process(10)).unwrap();
        assert!(r.revalidate(&t).is_ok());

        r.windows().windows.lock().unwrap()[2].visible = false;
        assert!(matches!(r.revalidate(&t), Err(HideError::TargetNotFound(_))));

        r.windows().windows.lock().unwrap()[2].visible = true;
        r.windows().windows.lock().unwrap()[2].pid = 30;
        assert!(r.revalidate(&t).is_err());

        r.windows().windows.lock().unwrap()[2].pid = 10;
        r.windows().processes.lock().unwrap().remove(&10);
        assert!(matches!(r.revalidate(&t), Err(HideError::ProcessGone(10))));
    }

    #[test]
    fn test_has_window_probe() {
        let r = TargetResolver::new(desktop());
        assert!(r.has_window(10));
        assert!(!r.has_window(99));
    }
}
