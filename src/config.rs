//! Engine settings.
//!
//! A plain value passed into the components that need it. Persisted as
//! camelCase JSON; every field has a default so partial files load.

use crate::error::{HideError, HideResult};
use crate::target::Architecture;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use typeshare::typeshare;

pub const HOOK_LIBRARY_X64: &str = "evanesco_hook.dll";
pub const HOOK_LIBRARY_X86: &str = "evanesco_hook32.dll";

#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InjectionMethod {
    /// Position-independent payload calling `SetWindowDisplayAffinity`.
    #[default]
    Payload,
    /// Load the hook library into the target.
    Library,
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutohideSettings {
    pub enabled: bool,
    pub notify: bool,
    pub max_window_wait_ms: u64,
    pub hide_existing_on_start: bool,
    /// Executable names (`notepad.exe`) or path fragments (`tools\app.exe`).
    pub list: Vec<String>,
}

impl Default for AutohideSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            notify: true,
            max_window_wait_ms: 5000,
            hide_existing_on_start: false,
            list: Vec::new(),
        }
    }
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub auto_refresh: bool,
    pub refresh_interval_secs: f64,
    pub injection_method: InjectionMethod,
    pub thread_timeout_ms: u64,
    pub library_timeout_ms: u64,
    pub hide_target_taskbar_icons: bool,
    pub randomize_library_name: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_library_x64: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_library_x86: Option<PathBuf>,
    pub autohide: AutohideSettings,
    pub watcher_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_refresh: false,
            refresh_interval_secs: 1.0,
            injection_method: InjectionMethod::Payload,
            thread_timeout_ms: 2000,
            library_timeout_ms: 5000,
            hide_target_taskbar_icons: false,
            randomize_library_name: true,
            hook_library_x64: None,
            hook_library_x86: None,
            autohide: AutohideSettings::default(),
            watcher_grace_ms: 3000,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> HideResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| HideError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        info!("[config] Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Loads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> HideResult<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                warn!("[config] {} not found, using defaults", p.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> HideResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HideError::ConfigInvalid(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> HideResult<()> {
        if !self.refresh_interval_secs.is_finite() || self.refresh_interval_secs <= 0.0 {
            return Err(HideError::ConfigInvalid(format!(
                "refreshIntervalSecs must be positive, got {}",
                self.refresh_interval_secs
            )));
        }
        if self.thread_timeout_ms == 0 || self.library_timeout_ms == 0 {
            return Err(HideError::ConfigInvalid(
                "timeouts must be greater than zero".into(),
            ));
        }
        if let Some(bad) = self.autohide.list.iter().find(|e| e.trim().is_empty()) {
            return Err(HideError::ConfigInvalid(format!(
                "empty autohide entry {:?}",
                bad
            )));
        }
        Ok(())
    }

    /// Hook library for targets of `arch`; defaults to a file next to the
    /// running executable.
    pub fn hook_library(&self, arch: Architecture) -> PathBuf {
        let (configured, default_name) = match arch {
            Architecture::X64 => (&self.hook_library_x64, HOOK_LIBRARY_X64),
            Architecture::X86 => (&self.hook_library_x86, HOOK_LIBRARY_X86),
        };
        configured.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(default_name)))
                .unwrap_or_else(|| PathBuf::from(default_name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.thread_timeout_ms, 2000);
        assert_eq!(s.watcher_grace_ms, 3000);
        assert_eq!(s.autohide.max_window_wait_ms, 5000);
        assert!(s.autohide.notify);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let s: Settings = serde_json::from_str(
            r#"{"injectionMethod":"library","autohide":{"enabled":true,"list":["notepad.exe"]}}"#,
        )
        .unwrap();
        assert_eq!(s.injection_method, InjectionMethod::Library);
        assert!(s.autohide.enabled);
        assert_eq!(s.autohide.list, vec!["notepad.exe".to_string()]);
        assert_eq!(s.autohide.max_window_wait_ms, 5000);
        assert_eq!(s.refresh_interval_secs, 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut s = Settings {
            refresh_interval_secs: 0.0,
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(HideError::ConfigInvalid(_))));
        s.refresh_interval_secs = 1.0;
        s.thread_timeout_ms = 0;
        assert!(s.validate().is_err());
        s.thread_timeout_ms = 2000;
        s.autohide.list.push("  ".into());
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut s = Settings::default();
        s.hide_target_taskbar_icons = true;
        s.autohide.list = vec!["C:\\Tools\\app.exe".into()];
        s.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(HideError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load_or_default(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_hook_library_override() {
        let s = Settings {
            hook_library_x86: Some(PathBuf::from("D:/hooks/h32.dll")),
            ..Default::default()
        };
        assert_eq!(
            s.hook_library(Architecture::X86),
            PathBuf::from("D:/hooks/h32.dll")
        );
        assert!(s
            .hook_library(Architecture::X64)
            .ends_with(HOOK_LIBRARY_X64));
    }
}
