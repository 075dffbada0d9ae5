//! Process handles: remote memory, remote threads, liveness and identity.

use super::handle::OwnedHandle;
use super::io_error;
use crate::error::{HideError, HideResult, OsError};
use crate::executor::{Protection, RemoteProcess, RemoteThread, WaitOutcome};
use crate::resolver::Liveness;
use crate::target::Architecture;
use std::ffi::c_void;
use std::path::PathBuf;
use std::time::Duration;
use windows::core::PWSTR;
use windows::Win32::Foundation::{BOOL, FALSE, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    PAGE_READWRITE,
};
use windows::Win32::System::ProcessStatus::LIST_MODULES_ALL;
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetCurrentProcess, GetExitCodeProcess, GetExitCodeThread, IsWow64Process,
    OpenProcess, OpenProcessToken, QueryFullProcessImageNameW, TerminateThread,
    WaitForSingleObject, PROCESS_ACCESS_RIGHTS, PROCESS_CREATE_THREAD, PROCESS_NAME_WIN32,
    PROCESS_QUERY_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

const STILL_ACTIVE: u32 = 259;

const INJECTION_ACCESS: PROCESS_ACCESS_RIGHTS = PROCESS_ACCESS_RIGHTS(
    PROCESS_CREATE_THREAD.0
        | PROCESS_QUERY_INFORMATION.0
        | PROCESS_VM_OPERATION.0
        | PROCESS_VM_WRITE.0
        | PROCESS_VM_READ.0,
);

fn open(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Result<OwnedHandle, OsError> {
    let handle = unsafe { OpenProcess(access, FALSE, pid) }.map_err(OsError::from)?;
    Ok(unsafe { OwnedHandle::from_raw(handle) })
}

fn is_wow64(handle: HANDLE) -> Result<bool, OsError> {
    let mut wow = BOOL::default();
    unsafe { IsWow64Process(handle, &mut wow) }.map_err(OsError::from)?;
    Ok(wow.as_bool())
}

/// Whether the OS itself is 64-bit, whatever this build is.
fn os_is_64bit() -> bool {
    cfg!(target_pointer_width = "64") || is_wow64(unsafe { GetCurrentProcess() }).unwrap_or(false)
}

/// Target opened with the rights needed to run code in it.
pub struct ProcessHandle {
    pid: u32,
    handle: OwnedHandle,
    arch: Architecture,
}

impl ProcessHandle {
    pub fn open_for_injection(pid: u32) -> HideResult<Self> {
        let handle = open(pid, INJECTION_ACCESS).map_err(|e| HideError::from_open(pid, e))?;
        let wow = is_wow64(handle.raw()).map_err(|e| HideError::from_open(pid, e))?;
        let arch = if os_is_64bit() && !wow {
            Architecture::X64
        } else {
            Architecture::X86
        };
        Ok(Self { pid, handle, arch })
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    pub fn raw(&self) -> HANDLE {
        self.handle.raw()
    }
}

impl RemoteProcess for ProcessHandle {
    type Thread = RemoteThreadHandle;

    fn pid(&self) -> u32 {
        self.pid
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u64, OsError> {
        let protect = match protection {
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        };
        let address =
            unsafe { VirtualAllocEx(self.raw(), None, size, MEM_COMMIT | MEM_RESERVE, protect) };
        if address.is_null() {
            return Err(OsError::last());
        }
        Ok(address as u64)
    }

    fn free(&self, address: u64) -> Result<(), OsError> {
        unsafe { VirtualFreeEx(self.raw(), address as usize as *mut c_void, 0, MEM_RELEASE) }
            .map_err(OsError::from)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), OsError> {
        unsafe {
            WriteProcessMemory(
                self.raw(),
                address as usize as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                None,
            )
        }
        .map_err(OsError::from)
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), OsError> {
        unsafe {
            ReadProcessMemory(
                self.raw(),
                address as usize as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                None,
            )
        }
        .map_err(OsError::from)
    }

    fn spawn_thread(&self, start: u64, param: u64) -> Result<RemoteThreadHandle, OsError> {
        // SAFETY: `start` is an address inside the target; it is only ever
        // called there, never in this process.
        let routine: unsafe extern "system" fn(*mut c_void) -> u32 =
            unsafe { std::mem::transmute(start as usize) };
        let param = (param != 0).then_some(param as usize as *const c_void);
        let handle =
            unsafe { CreateRemoteThread(self.raw(), None, 0, Some(routine), param, 0, None) }
                .map_err(OsError::from)?;
        Ok(RemoteThreadHandle(unsafe { OwnedHandle::from_raw(handle) }))
    }

    fn module_loaded(&self, file_name: &str) -> Option<bool> {
        let modules = super::imports::module_bases(self, LIST_MODULES_ALL).ok()?;
        Some(modules.contains_key(&file_name.to_ascii_lowercase()))
    }
}

pub struct RemoteThreadHandle(OwnedHandle);

impl RemoteThread for RemoteThreadHandle {
    fn wait(&self, timeout: Duration) -> WaitOutcome {
        let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        match unsafe { WaitForSingleObject(self.0.raw(), ms) } {
            WAIT_OBJECT_0 => WaitOutcome::Signaled,
            WAIT_TIMEOUT => WaitOutcome::TimedOut,
            _ => WaitOutcome::Failed(OsError::last()),
        }
    }

    fn exit_code(&self) -> Result<u32, OsError> {
        let mut code = 0u32;
        unsafe { GetExitCodeThread(self.0.raw(), &mut code) }.map_err(OsError::from)?;
        Ok(code)
    }

    unsafe fn terminate(&self) -> Result<(), OsError> {
        TerminateThread(self.0.raw(), 1).map_err(OsError::from)
    }
}

pub fn liveness(pid: u32) -> Liveness {
    let handle = match open(pid, PROCESS_QUERY_LIMITED_INFORMATION) {
        Ok(h) => h,
        Err(e) if e.is_access_denied() => return Liveness::AccessDenied(e),
        Err(_) => return Liveness::Missing,
    };
    let mut code = 0u32;
    match unsafe { GetExitCodeProcess(handle.raw(), &mut code) } {
        Ok(()) if code == STILL_ACTIVE => Liveness::Running,
        Ok(()) => Liveness::Exited(code),
        Err(e) => Liveness::AccessDenied(OsError::from(e)),
    }
}

/// Full Win32 path of the process image.
pub fn image_path(pid: u32) -> Option<PathBuf> {
    let handle = open(pid, PROCESS_QUERY_LIMITED_INFORMATION).ok()?;
    let mut buf = vec![0u16; 1024];
    let mut len = buf.len() as u32;
    unsafe {
        QueryFullProcessImageNameW(
            handle.raw(),
            PROCESS_NAME_WIN32,
            PWSTR(buf.as_mut_ptr()),
            &mut len,
        )
    }
    .ok()?;
    Some(PathBuf::from(String::from_utf16_lossy(&buf[..len as usize])))
}

pub fn is_elevated() -> HideResult<bool> {
    let mut token = HANDLE::default();
    unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) }.map_err(io_error)?;
    let token = unsafe { OwnedHandle::from_raw(token) };

    let mut elevation = TOKEN_ELEVATION::default();
    let mut returned = 0u32;
    unsafe {
        GetTokenInformation(
            token.raw(),
            TokenElevation,
            Some(&mut elevation as *mut TOKEN_ELEVATION as *mut c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    }
    .map_err(io_error)?;
    Ok(elevation.TokenIsElevated != 0)
}
