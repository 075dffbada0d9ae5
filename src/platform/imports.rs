//! Addresses of the functions a payload or loader thread calls, as seen from
//! inside the target.
//!
//! A target of the controller's own architecture shares the system DLL
//! bases with us, so our own `GetProcAddress` answers. A WOW64 target is
//! resolved from the 32-bit DLLs on disk plus the target's 32-bit module
//! bases.

use super::process::ProcessHandle;
use crate::error::{HideError, HideResult, OsError};
use crate::executor::RemoteProcess;
use crate::exports::{normalize_module, remote_address, PeFileExports};
use crate::payload::PayloadImports;
use crate::target::Architecture;
use log::debug;
use std::collections::HashMap;
use windows::core::{PCSTR, PCWSTR};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::ProcessStatus::{
    EnumProcessModulesEx, GetModuleBaseNameW, ENUM_PROCESS_MODULES_EX_FLAGS, LIST_MODULES_32BIT,
};

const USER32: &str = "user32.dll";
const KERNEL32: &str = "kernel32.dll";

fn local_address(module: &str, symbol: &str) -> HideResult<u64> {
    let wide_module = super::wide(module);
    let ansi_symbol: Vec<u8> = symbol.bytes().chain(std::iter::once(0)).collect();
    let missing = || {
        HideError::ArchitectureMismatch(format!("{}!{} is not available locally", module, symbol))
    };

    let base = unsafe { GetModuleHandleW(PCWSTR(wide_module.as_ptr())) }.map_err(|_| missing())?;
    let function = unsafe { GetProcAddress(base, PCSTR(ansi_symbol.as_ptr())) }.ok_or_else(missing)?;
    Ok(function as usize as u64)
}

/// Base addresses of the 32-bit modules loaded in `process`, keyed by
/// lower-case file name.
pub fn module_bases_32(process: &ProcessHandle) -> HideResult<HashMap<String, u64>> {
    module_bases(process, LIST_MODULES_32BIT)
}

/// Base addresses of the modules selected by `filter`, keyed by lower-case
/// file name.
pub fn module_bases(
    process: &ProcessHandle,
    filter: ENUM_PROCESS_MODULES_EX_FLAGS,
) -> HideResult<HashMap<String, u64>> {
    let mut modules = vec![HMODULE::default(); 256];
    loop {
        let capacity = (modules.len() * std::mem::size_of::<HMODULE>()) as u32;
        let mut needed = 0u32;
        unsafe {
            EnumProcessModulesEx(
                process.raw(),
                modules.as_mut_ptr(),
                capacity,
                &mut needed,
                filter,
            )
        }
        .map_err(|e| HideError::from_open(process.pid(), OsError::from(e)))?;

        let count = needed as usize / std::mem::size_of::<HMODULE>();
        if needed <= capacity {
            modules.truncate(count);
            break;
        }
        modules.resize(count, HMODULE::default());
    }

    let mut bases = HashMap::with_capacity(modules.len());
    let mut name = [0u16; 260];
    for module in modules {
        let len = unsafe { GetModuleBaseNameW(process.raw(), module, &mut name) } as usize;
        if len == 0 {
            continue;
        }
        let file = String::from_utf16_lossy(&name[..len]);
        bases.insert(normalize_module(&file), module.0 as u64);
    }
    debug!(
        "[imports] {} modules in {}",
        bases.len(),
        process.pid()
    );
    Ok(bases)
}

/// Resolves payload imports and `LoadLibraryW` for one target.
pub struct ImportResolver {
    wow64: PeFileExports,
}

impl Default for ImportResolver {
    fn default() -> Self {
        Self {
            wow64: PeFileExports::wow64(),
        }
    }
}

impl ImportResolver {
    fn address(&self, process: &ProcessHandle, module: &str, symbol: &str) -> HideResult<u64> {
        if process.architecture() == Architecture::current() {
            return local_address(module, symbol);
        }
        let bases = module_bases_32(process)?;
        remote_address(&self.wow64, &bases, module, symbol)
    }

    pub fn payload_imports(&self, process: &ProcessHandle) -> HideResult<PayloadImports> {
        Ok(PayloadImports {
            set_window_display_affinity: self.address(process, USER32, "SetWindowDisplayAffinity")?,
            get_last_error: self.address(process, KERNEL32, "GetLastError")?,
        })
    }

    pub fn load_library(&self, process: &ProcessHandle) -> HideResult<u64> {
        self.address(process, KERNEL32, "LoadLibraryW")
    }
}
