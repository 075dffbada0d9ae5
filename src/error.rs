use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub const ERROR_ACCESS_DENIED: u32 = 5;

/// Raw Win32 error code, displayed with the system message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsError(pub u32);

impl OsError {
    pub fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32)
    }

    pub fn code(self) -> u32 {
        self.0
    }

    pub fn is_access_denied(self) -> bool {
        self.0 == ERROR_ACCESS_DENIED
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0 as i32))
    }
}

#[cfg(target_os = "windows")]
impl From<windows::core::Error> for OsError {
    fn from(e: windows::core::Error) -> Self {
        // HRESULT_FROM_WIN32 keeps the Win32 code in the low word.
        let hr = e.code().0 as u32;
        if hr & 0xFFFF_0000 == 0x8007_0000 {
            Self(hr & 0xFFFF)
        } else {
            Self(hr)
        }
    }
}

#[derive(Debug, Error)]
pub enum HideError {
    #[error("Target not found: {0}")]
    TargetNotFound(String),
    #[error("Process {0} is no longer running")]
    ProcessGone(u32),
    #[error("Access denied to process {pid}: {os_error}")]
    PermissionDenied { pid: u32, os_error: OsError },
    #[error("Architecture mismatch: {0}")]
    ArchitectureMismatch(String),
    #[error("Remote allocation failed: {0}")]
    AllocationFailed(OsError),
    #[error("Remote write failed: {0}")]
    WriteFailed(OsError),
    #[error("Failed to start remote thread: {0}")]
    ExecutionStartFailed(OsError),
    #[error("Remote thread did not finish within {ms} ms")]
    Timeout { ms: u64 },
    #[error("Failed to read remote results: {0}")]
    ReadBackFailed(OsError),
    #[error("Operation rejected by target (exit code {exit_code}, last error {last_error})")]
    OperationRejected { exit_code: u32, last_error: u32 },
    #[error("Hook library not found: {}", .0.display())]
    LibraryNotFound(PathBuf),
    #[error("Library path is {0} UTF-16 units, limit is 260")]
    PathTooLong(usize),
    #[error("WMI: {0}")]
    SubscriptionFailed(String),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Event receiver closed")]
    EventSinkClosed,
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl HideError {
    /// Maps an `OpenProcess`-style failure onto the right variant.
    pub fn from_open(pid: u32, err: OsError) -> Self {
        if err.is_access_denied() {
            Self::PermissionDenied { pid, os_error: err }
        } else {
            Self::ProcessGone(pid)
        }
    }
}

impl From<evanesco_ipc::FlagsError> for HideError {
    fn from(e: evanesco_ipc::FlagsError) -> Self {
        Self::ConfigInvalid(e.to_string())
    }
}

// Serialized as a plain string for the front end.
impl Serialize for HideError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

pub type HideResult<T> = Result<T, HideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_maps_to_permission_denied() {
        let err = HideError::from_open(42, OsError(ERROR_ACCESS_DENIED));
        assert!(matches!(err, HideError::PermissionDenied { pid: 42, .. }));
        let err = HideError::from_open(42, OsError(87));
        assert!(matches!(err, HideError::ProcessGone(42)));
    }

    #[test]
    fn test_serializes_as_display_string() {
        let err = HideError::OperationRejected {
            exit_code: 0,
            last_error: 5,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(
            json,
            "\"Operation rejected by target (exit code 0, last error 5)\""
        );
    }

    #[test]
    fn test_flags_error_is_config_invalid() {
        let err: HideError = evanesco_ipc::FlagsError::UndefinedBits(4).into();
        assert!(matches!(err, HideError::ConfigInvalid(_)));
    }

    #[test]
    fn test_os_error_display_carries_code() {
        assert!(OsError(5).to_string().contains("os error 5"));
    }
}
