use core::ffi::c_void;

use evanesco_ipc::{mapping_name, Operation, OperationParams};
use windows::core::PCWSTR;
use windows::Win32::Foundation::*;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::LibraryLoader::{DisableThreadLibraryCalls, FreeLibraryAndExitThread};
use windows::Win32::System::Memory::{
    MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_READ,
};
use windows::Win32::System::Threading::{CreateThread, GetCurrentProcessId, THREAD_CREATION_FLAGS};
use windows::Win32::UI::WindowsAndMessaging::*;

use crate::tree::process_and_descendants;

const DLL_PROCESS_ATTACH: u32 = 1;

struct EnumState {
    pids: Vec<u32>,
    operation: Operation,
    hide_taskbar_icon: bool,
    processed: u32,
}

#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
    if reason != DLL_PROCESS_ATTACH {
        return TRUE;
    }

    let module = HMODULE(module.0);
    unsafe {
        let _ = DisableThreadLibraryCalls(module);
    }

    let Some(params) = read_params() else {
        return FALSE;
    };

    let processed = unsafe { apply(params) };
    if processed == 0 {
        return FALSE;
    }

    schedule_unload(module);
    TRUE
}

fn read_params() -> Option<OperationParams> {
    let name: Vec<u16> = mapping_name(unsafe { GetCurrentProcessId() })
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let mapping = OpenFileMappingW(FILE_MAP_READ.0, FALSE, PCWSTR(name.as_ptr())).ok()?;
        let view = MapViewOfFile(mapping, FILE_MAP_READ, 0, 0, OperationParams::SIZE);
        let params = if view.Value.is_null() {
            None
        } else {
            let flags = std::ptr::read_unaligned(view.Value as *const u32);
            let _ = UnmapViewOfFile(view);
            OperationParams::from_flags(flags).ok()
        };
        let _ = CloseHandle(mapping);
        params
    }
}

unsafe fn apply(params: OperationParams) -> u32 {
    let current = GetCurrentProcessId();
    let mut state = EnumState {
        pids: process_and_descendants(current, &snapshot_processes()),
        operation: params.operation(),
        hide_taskbar_icon: params.hide_taskbar_icon(),
        processed: 0,
    };

    let _ = EnumWindows(
        Some(enum_window_proc),
        LPARAM(&mut state as *mut EnumState as isize),
    );
    state.processed
}

/// `(pid, parent_pid)` for every process in a toolhelp snapshot. Empty if
/// the snapshot cannot be taken.
unsafe fn snapshot_processes() -> Vec<(u32, u32)> {
    let mut entries = Vec::new();
    let Ok(snapshot) = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) else {
        return entries;
    };

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    if Process32FirstW(snapshot, &mut entry).is_ok() {
        loop {
            entries.push((entry.th32ProcessID, entry.th32ParentProcessID));
            if Process32NextW(snapshot, &mut entry).is_err() {
                break;
            }
        }
    }
    let _ = CloseHandle(snapshot);
    entries
}

unsafe extern "system" fn enum_window_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let state = &mut *(lparam.0 as *mut EnumState);

    let mut window_pid = 0u32;
    GetWindowThreadProcessId(hwnd, Some(&mut window_pid));
    if !state.pids.contains(&window_pid) || !IsWindowVisible(hwnd).as_bool() {
        return TRUE;
    }

    let affinity = match state.operation {
        Operation::Hide => WDA_EXCLUDEFROMCAPTURE,
        Operation::Unhide => WDA_NONE,
    };
    if SetWindowDisplayAffinity(hwnd, affinity).is_ok() {
        state.processed += 1;
        if state.hide_taskbar_icon {
            set_tool_window(hwnd, state.operation.is_hide());
        }
    }
    TRUE
}

unsafe fn set_tool_window(hwnd: HWND, tool: bool) {
    let ex_style = GetWindowLongPtrW(hwnd, GWL_EXSTYLE);
    let updated = if tool {
        ex_style | WS_EX_TOOLWINDOW.0 as isize
    } else {
        ex_style & !(WS_EX_TOOLWINDOW.0 as isize)
    };
    if updated != ex_style {
        SetWindowLongPtrW(hwnd, GWL_EXSTYLE, updated);
        let _ = SetWindowPos(
            hwnd,
            HWND::default(),
            0,
            0,
            0,
            0,
            SWP_NOMOVE | SWP_NOSIZE | SWP_NOZORDER | SWP_NOACTIVATE | SWP_FRAMECHANGED,
        );
    }
}

/// Unloads this library from a fresh thread once `DllMain` has returned.
fn schedule_unload(module: HMODULE) {
    unsafe extern "system" fn unload(param: *mut c_void) -> u32 {
        FreeLibraryAndExitThread(HMODULE(param), 0)
    }

    unsafe {
        if let Ok(thread) = CreateThread(
            None,
            0,
            Some(unload),
            Some(module.0 as *const c_void),
            THREAD_CREATION_FLAGS(0),
            None,
        ) {
            let _ = CloseHandle(thread);
        }
    }
}
