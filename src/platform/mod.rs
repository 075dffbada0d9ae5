//! Win32 implementations of the engine's OS seams.
//!
//! Everything here is `unsafe` FFI glue; the control flow that drives it
//! lives in the platform-neutral modules and is tested against fakes there.

pub mod handle;
pub mod imports;
pub mod process;
pub mod shared_memory;
pub mod window;
pub mod wmi;

use crate::error::{HideError, HideResult, OsError};
use crate::hider::HidePlatform;
use crate::payload::PayloadImports;
use crate::target::{Architecture, WindowHandle};
use imports::ImportResolver;
use process::ProcessHandle;
use shared_memory::SharedMemoryPublisher;
use window::Win32Windows;

/// Wraps a `windows` error as `HideError::Io`, keeping the Win32 code.
pub(crate) fn io_error(e: windows::core::Error) -> HideError {
    HideError::Io(std::io::Error::from_raw_os_error(OsError::from(e).code() as i32))
}

/// NUL-terminated UTF-16 copy of `s`.
pub(crate) fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// The live desktop, reached through Win32.
#[derive(Default)]
pub struct Win32Platform {
    imports: ImportResolver,
    publisher: SharedMemoryPublisher,
}

impl HidePlatform for Win32Platform {
    type Windows = Win32Windows;
    type Process = ProcessHandle;
    type Publisher = SharedMemoryPublisher;

    fn window_system(&self) -> Win32Windows {
        Win32Windows
    }

    fn open_process(&self, pid: u32) -> HideResult<ProcessHandle> {
        ProcessHandle::open_for_injection(pid)
    }

    fn architecture(&self, process: &ProcessHandle) -> Architecture {
        process.architecture()
    }

    fn payload_imports(&self, process: &ProcessHandle) -> HideResult<PayloadImports> {
        self.imports.payload_imports(process)
    }

    fn load_library_entry(&self, process: &ProcessHandle) -> HideResult<u64> {
        self.imports.load_library(process)
    }

    fn publisher(&self) -> &SharedMemoryPublisher {
        &self.publisher
    }

    fn set_taskbar_icon_hidden(&self, window: WindowHandle, hidden: bool) -> HideResult<bool> {
        window::set_taskbar_icon_hidden(window, hidden)
    }

    fn display_affinity(&self, window: WindowHandle) -> HideResult<u32> {
        window::display_affinity(window)
    }
}
