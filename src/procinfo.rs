//! Process table lookups through `sysinfo`.

use std::path::PathBuf;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// pid 0 (idle) and 4 (System) are never targets.
pub const MAX_SYSTEM_PID: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<PathBuf>,
}

impl ProcessEntry {
    /// Full path if known, otherwise the bare name.
    pub fn path_or_name(&self) -> String {
        self.executable_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet)
}

pub fn running_processes() -> Vec<ProcessEntry> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());

    let mut entries: Vec<ProcessEntry> = system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessEntry {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            executable_path: process.exe().map(|p| p.to_path_buf()),
        })
        .collect();
    entries.sort_by_key(|e| e.pid);
    entries
}

pub fn process_entry(pid: u32) -> Option<ProcessEntry> {
    let mut system = System::new();
    let pid_obj = Pid::from_u32(pid);
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid_obj]), true, refresh_kind());
    system.process(pid_obj).map(|process| ProcessEntry {
        pid,
        name: process.name().to_string_lossy().into_owned(),
        executable_path: process.exe().map(|p| p.to_path_buf()),
    })
}

pub fn executable_path(pid: u32) -> Option<PathBuf> {
    process_entry(pid).and_then(|e| e.executable_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_listed() {
        let me = std::process::id();
        assert!(running_processes().iter().any(|p| p.pid == me));
        let entry = process_entry(me).unwrap();
        assert!(!entry.name.is_empty());
    }

    #[test]
    fn test_path_or_name_fallback() {
        let e = ProcessEntry {
            pid: 9,
            name: "app.exe".into(),
            executable_path: None,
        };
        assert_eq!(e.path_or_name(), "app.exe");
    }
}
