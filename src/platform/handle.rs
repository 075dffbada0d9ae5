use super::io_error;
use crate::error::HideResult;
use log::warn;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, FALSE, HANDLE, TRUE};
use windows::Win32::System::Threading::{CreateEventW, ResetEvent, SetEvent};

/// Kernel handle closed on drop.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

// SAFETY: kernel handles are process-wide values; the objects behind them are
// safe to use from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    /// # Safety
    /// `handle` must be open and not closed by anyone else.
    pub unsafe fn from_raw(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.0.is_invalid() {
            return;
        }
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            warn!("[platform] CloseHandle failed: {}", e);
        }
    }
}

/// Unnamed manual-reset event, initially clear.
#[derive(Debug)]
pub struct ManualResetEvent(OwnedHandle);

impl ManualResetEvent {
    pub fn new() -> HideResult<Self> {
        let handle = unsafe { CreateEventW(None, TRUE, FALSE, PCWSTR::null()) }.map_err(io_error)?;
        Ok(Self(unsafe { OwnedHandle::from_raw(handle) }))
    }

    pub fn set(&self) {
        if let Err(e) = unsafe { SetEvent(self.0.raw()) } {
            warn!("[platform] SetEvent failed: {}", e);
        }
    }

    pub fn reset(&self) {
        if let Err(e) = unsafe { ResetEvent(self.0.raw()) } {
            warn!("[platform] ResetEvent failed: {}", e);
        }
    }

    pub fn handle(&self) -> HANDLE {
        self.0.raw()
    }
}
