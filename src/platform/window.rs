use super::io_error;
use super::process;
use crate::error::HideResult;
use crate::resolver::{Liveness, WindowSystem};
use crate::target::WindowHandle;
use log::debug;
use std::ffi::c_void;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindow, GetWindowDisplayAffinity, GetWindowLongPtrW,
    GetWindowThreadProcessId, IsWindow, IsWindowVisible, SetWindowLongPtrW, SetWindowPos,
    GWL_EXSTYLE, GW_OWNER, SWP_FRAMECHANGED, SWP_NOACTIVATE, SWP_NOMOVE, SWP_NOSIZE,
    SWP_NOZORDER, WS_EX_TOOLWINDOW,
};

fn hwnd(window: WindowHandle) -> HWND {
    HWND(window.0 as *mut c_void)
}

fn handle(hwnd: HWND) -> WindowHandle {
    WindowHandle(hwnd.0 as usize)
}

/// The live desktop window manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Win32Windows;

impl WindowSystem for Win32Windows {
    fn top_level_windows(&self) -> Vec<WindowHandle> {
        unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
            let windows = &mut *(lparam.0 as *mut Vec<WindowHandle>);
            windows.push(handle(hwnd));
            BOOL(1)
        }

        let mut windows: Vec<WindowHandle> = Vec::new();
        unsafe {
            let _ = EnumWindows(
                Some(collect),
                LPARAM(&mut windows as *mut Vec<WindowHandle> as isize),
            );
        }
        windows
    }

    fn is_window(&self, window: WindowHandle) -> bool {
        !window.is_null() && unsafe { IsWindow(hwnd(window)) }.as_bool()
    }

    fn is_visible(&self, window: WindowHandle) -> bool {
        unsafe { IsWindowVisible(hwnd(window)) }.as_bool()
    }

    fn owner(&self, window: WindowHandle) -> Option<WindowHandle> {
        unsafe { GetWindow(hwnd(window), GW_OWNER) }
            .ok()
            .filter(|h| !h.0.is_null())
            .map(handle)
    }

    fn window_process(&self, window: WindowHandle) -> Option<u32> {
        let mut pid = 0u32;
        let thread = unsafe { GetWindowThreadProcessId(hwnd(window), Some(&mut pid)) };
        (thread != 0 && pid != 0).then_some(pid)
    }

    fn process_liveness(&self, pid: u32) -> Liveness {
        process::liveness(pid)
    }
}

/// Adds or removes `WS_EX_TOOLWINDOW` so the window leaves or rejoins the
/// taskbar. Returns whether the style changed.
pub fn set_taskbar_icon_hidden(window: WindowHandle, hidden: bool) -> HideResult<bool> {
    let hwnd = hwnd(window);
    unsafe {
        let style = GetWindowLongPtrW(hwnd, GWL_EXSTYLE);
        let tool = WS_EX_TOOLWINDOW.0 as isize;
        let updated = if hidden { style | tool } else { style & !tool };
        if updated == style {
            return Ok(false);
        }
        SetWindowLongPtrW(hwnd, GWL_EXSTYLE, updated);
        SetWindowPos(
            hwnd,
            HWND::default(),
            0,
            0,
            0,
            0,
            SWP_NOMOVE | SWP_NOSIZE | SWP_NOZORDER | SWP_NOACTIVATE | SWP_FRAMECHANGED,
        )
        .map_err(io_error)?;
    }
    debug!(
        "[window] Taskbar icon of {} {}",
        window,
        if hidden { "hidden" } else { "restored" }
    );
    Ok(true)
}

/// Raw display affinity of `window`.
pub fn display_affinity(window: WindowHandle) -> HideResult<u32> {
    let mut affinity = 0u32;
    unsafe { GetWindowDisplayAffinity(hwnd(window), &mut affinity) }.map_err(io_error)?;
    Ok(affinity)
}
