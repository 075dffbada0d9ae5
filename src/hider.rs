//! Window Hider facade.
//!
//! One entry point for the GUI, the CLI and autohide: resolve the target,
//! open it, check architectures, re-validate, then run the configured
//! method. The OS services it drives sit behind [`HidePlatform`].

use crate::autohide::VisibilityController;
use crate::config::{InjectionMethod, Settings};
use crate::error::{HideError, HideResult};
use crate::executor::{RemoteExecutor, RemoteProcess};
use crate::loader::{LibraryInjector, ParamPublisher};
use crate::payload::{self, CaptureState, PayloadImports};
use crate::resolver::{TargetResolver, WindowSystem};
use crate::target::{Architecture, ResolvedTarget, Target, WindowHandle};
use evanesco_ipc::{Operation, OperationParams};
use log::{debug, info, warn};
use std::time::Duration;

/// First Windows build that honours `WDA_EXCLUDEFROMCAPTURE`.
pub const MIN_CAPTURE_EXCLUSION_BUILD: u64 = 19041;

/// `Some(false)` for a Windows version that predates capture exclusion,
/// `None` when the version cannot be interpreted.
pub fn supports_capture_exclusion(version: &os_info::Version) -> Option<bool> {
    match *version {
        os_info::Version::Semantic(major, _, build) => {
            Some(major > 10 || (major == 10 && build >= MIN_CAPTURE_EXCLUSION_BUILD))
        }
        _ => None,
    }
}

fn check_os_build() {
    let info = os_info::get();
    if info.os_type() != os_info::Type::Windows {
        return;
    }
    match supports_capture_exclusion(info.version()) {
        Some(true) => {}
        Some(false) => warn!(
            "[hider] Windows {} predates build {}; hidden windows will show as black instead",
            info.version(),
            MIN_CAPTURE_EXCLUSION_BUILD
        ),
        None => warn!("[hider] Could not determine OS build ({})", info.version()),
    }
}

/// The OS services behind one hide or unhide.
pub trait HidePlatform {
    type Windows: WindowSystem;
    type Process: RemoteProcess;
    type Publisher: ParamPublisher;

    fn window_system(&self) -> Self::Windows;
    /// Opens `pid` with the rights needed to run code in it.
    fn open_process(&self, pid: u32) -> HideResult<Self::Process>;
    fn architecture(&self, process: &Self::Process) -> Architecture;
    fn payload_imports(&self, process: &Self::Process) -> HideResult<PayloadImports>;
    /// `LoadLibraryW` as seen from inside the target.
    fn load_library_entry(&self, process: &Self::Process) -> HideResult<u64>;
    fn publisher(&self) -> &Self::Publisher;
    fn set_taskbar_icon_hidden(&self, window: WindowHandle, hidden: bool) -> HideResult<bool>;
    fn display_affinity(&self, window: WindowHandle) -> HideResult<u32>;
}

pub struct Hider<P: HidePlatform> {
    settings: Settings,
    resolver: TargetResolver<P::Windows>,
    platform: P,
}

impl<P: HidePlatform> Hider<P> {
    pub fn with_platform(settings: Settings, platform: P) -> HideResult<Self> {
        settings.validate()?;
        check_os_build();
        Ok(Self {
            settings,
            resolver: TargetResolver::new(platform.window_system()),
            platform,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn resolver(&self) -> &TargetResolver<P::Windows> {
        &self.resolver
    }

    pub fn apply(&self, target: Target, operation: Operation) -> HideResult<ResolvedTarget> {
        let resolved = self.resolver.resolve(target)?;
        let process = self.platform.open_process(resolved.pid)?;

        let arch = self.platform.architecture(&process);
        let controller = Architecture::current();
        if !controller.can_target(arch) {
            return Err(HideError::ArchitectureMismatch(format!(
                "an {} controller cannot reach {} process {}",
                controller, arch, resolved.pid
            )));
        }

        // The window may have closed or changed hands while we were opening.
        self.resolver.revalidate(&resolved)?;

        let hide_taskbar = self.settings.hide_target_taskbar_icons;
        match self.settings.injection_method {
            InjectionMethod::Payload => {
                let imports = self.platform.payload_imports(&process)?;
                let payload = payload::build(operation, arch, resolved.window, imports)?;
                let timeout = Duration::from_millis(self.settings.thread_timeout_ms);
                let report = RemoteExecutor::new(timeout).execute(&process, &payload)?;
                debug!("[hider] Payload report {:?}", report);

                if hide_taskbar {
                    if let Err(e) = self
                        .platform
                        .set_taskbar_icon_hidden(resolved.window, operation.is_hide())
                    {
                        warn!(
                            "[hider] Taskbar toggle failed for {}: {}",
                            resolved.window, e
                        );
                    }
                }
            }
            InjectionMethod::Library => {
                let library = self.settings.hook_library(arch);
                let loader_entry = self.platform.load_library_entry(&process)?;
                let timeout = Duration::from_millis(self.settings.library_timeout_ms);
                LibraryInjector::new(timeout, self.settings.randomize_library_name)
                    .inject_library(
                        &process,
                        self.platform.publisher(),
                        loader_entry,
                        &library,
                        OperationParams::new(operation, hide_taskbar),
                    )?;
            }
        }

        info!(
            "[hider] {} done for pid {} window {} ({}, {:?})",
            operation, resolved.pid, resolved.window, arch, self.settings.injection_method
        );
        Ok(resolved)
    }

    pub fn hide(&self, target: Target) -> HideResult<ResolvedTarget> {
        self.apply(target, Operation::Hide)
    }

    pub fn unhide(&self, target: Target) -> HideResult<ResolvedTarget> {
        self.apply(target, Operation::Unhide)
    }

    pub fn capture_state(&self, window: WindowHandle) -> HideResult<CaptureState> {
        self.platform
            .display_affinity(window)
            .map(CaptureState::from_affinity)
    }
}

impl<P> VisibilityController for Hider<P>
where
    P: HidePlatform + Send + Sync,
    P::Windows: Send + Sync,
{
    fn hide_process(&self, pid: u32) -> HideResult<()> {
        self.hide(Target::Process(pid)).map(|_| ())
    }
}

#[cfg(target_os = "windows")]
mod imp {
    use super::*;
    use crate::platform::{process, Win32Platform};

    pub type WindowHider = Hider<Win32Platform>;

    impl Hider<Win32Platform> {
        pub fn new(settings: Settings) -> HideResult<Self> {
            Self::with_platform(settings, Win32Platform::default())
        }

        pub fn is_elevated() -> HideResult<bool> {
            process::is_elevated()
        }
    }
}

#[cfg(not(target_os = "windows"))]
mod imp {
    use super::*;

    const UNSUPPORTED: &str = "capture exclusion requires Windows";

    pub struct WindowHider {
        settings: Settings,
    }

    impl WindowHider {
        pub fn new(settings: Settings) -> HideResult<Self> {
            settings.validate()?;
            check_os_build();
            Ok(Self { settings })
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn apply(&self, _target: Target, _operation: Operation) -> HideResult<ResolvedTarget> {
            Err(HideError::Unsupported(UNSUPPORTED))
        }

        pub fn hide(&self, target: Target) -> HideResult<ResolvedTarget> {
            self.apply(target, Operation::Hide)
        }

        pub fn unhide(&self, target: Target) -> HideResult<ResolvedTarget> {
            self.apply(target, Operation::Unhide)
        }

        pub fn capture_state(&self, _window: WindowHandle) -> HideResult<CaptureState> {
            Err(HideError::Unsupported(UNSUPPORTED))
        }

        pub fn is_elevated() -> HideResult<bool> {
            Err(HideError::Unsupported(UNSUPPORTED))
        }
    }

    impl VisibilityController for WindowHider {
        fn hide_process(&self, pid: u32) -> HideResult<()> {
            self.hide(Target::Process(pid)).map(|_| ())
        }
    }
}

pub use imp::WindowHider;
