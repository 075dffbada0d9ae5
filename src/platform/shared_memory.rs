//! Named shared-memory block carrying the hook library's operation flags.

use super::handle::OwnedHandle;
use super::{io_error, wide};
use crate::error::HideResult;
use crate::loader::ParamPublisher;
use evanesco_ipc::{mapping_name, OperationParams};
use log::{debug, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::INVALID_HANDLE_VALUE;
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_WRITE,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

/// Keeps the block alive; unmapped and closed on drop.
pub struct PublishedParams {
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    _mapping: OwnedHandle,
    name: String,
}

impl Drop for PublishedParams {
    fn drop(&mut self) {
        if let Err(e) = unsafe { UnmapViewOfFile(self.view) } {
            warn!("[shm] Failed to unmap {}: {}", self.name, e);
        }
        debug!("[shm] Released {}", self.name);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SharedMemoryPublisher;

impl ParamPublisher for SharedMemoryPublisher {
    type Guard = PublishedParams;

    fn publish(&self, pid: u32, params: OperationParams) -> HideResult<PublishedParams> {
        let name = mapping_name(pid);
        let wide_name = wide(&name);

        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                OperationParams::SIZE as u32,
                PCWSTR(wide_name.as_ptr()),
            )
        }
        .map_err(io_error)?;
        let mapping = unsafe { OwnedHandle::from_raw(mapping) };

        let view = unsafe { MapViewOfFile(mapping.raw(), FILE_MAP_WRITE, 0, 0, OperationParams::SIZE) };
        if view.Value.is_null() {
            return Err(std::io::Error::last_os_error().into());
        }

        let bytes = params.to_bytes();
        // SAFETY: the view is at least SIZE bytes and writable.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), view.Value as *mut u8, bytes.len());
        }
        debug!("[shm] Published {} as {}", params, name);

        Ok(PublishedParams {
            view,
            _mapping: mapping,
            name,
        })
    }
}
