//! Wire types shared between the controller and the hook library.
//!
//! The controller publishes an [`OperationParams`] record into a named
//! shared-memory block before asking the OS loader to load the hook library
//! into a target. Both sides derive the block name from the target pid with
//! [`mapping_name`], so nothing else has to be exchanged.

use std::fmt;
use thiserror::Error;

/// Salt prepended to the decimal pid before hashing the mapping name.
pub const MAPPING_SALT: &str = "evanesco";

pub const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
pub const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Name of the shared-memory block carrying the parameters for `pid`:
/// eight uppercase hex digits of `fnv1a("evanesco" + pid)`.
pub fn mapping_name(pid: u32) -> String {
    let input = format!("{MAPPING_SALT}{pid}");
    format!("{:08X}", fnv1a(input.as_bytes()))
}

// ============================================================================
// Operation parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Hide,
    Unhide,
}

impl Operation {
    pub fn is_hide(self) -> bool {
        self == Operation::Hide
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Hide => f.write_str("hide"),
            Operation::Unhide => f.write_str("unhide"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlagsError {
    #[error("undefined flag bits set: 0x{0:08X}")]
    UndefinedBits(u32),
    #[error("parameter block is {0} bytes, expected 4")]
    BadLength(usize),
}

/// Fixed-size record written into the shared-memory block.
///
/// Bit 0 selects the operation (0 = hide, 1 = unhide), bit 1 asks the hook
/// library to also hide (or restore) the taskbar icon. All other bits must
/// stay zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationParams {
    flags: u32,
}

impl OperationParams {
    pub const OPERATION_MASK: u32 = 0x1;
    pub const HIDE_TASKBAR_ICON_MASK: u32 = 0x2;
    pub const VALID_MASK: u32 = Self::OPERATION_MASK | Self::HIDE_TASKBAR_ICON_MASK;
    pub const SIZE: usize = std::mem::size_of::<u32>();

    pub fn new(operation: Operation, hide_taskbar_icon: bool) -> Self {
        let mut flags = 0;
        if operation == Operation::Unhide {
            flags |= Self::OPERATION_MASK;
        }
        if hide_taskbar_icon {
            flags |= Self::HIDE_TASKBAR_ICON_MASK;
        }
        Self { flags }
    }

    pub fn from_flags(flags: u32) -> Result<Self, FlagsError> {
        if flags & !Self::VALID_MASK != 0 {
            return Err(FlagsError::UndefinedBits(flags & !Self::VALID_MASK));
        }
        Ok(Self { flags })
    }

    pub fn flags(self) -> u32 {
        self.flags
    }

    pub fn operation(self) -> Operation {
        if self.flags & Self::OPERATION_MASK != 0 {
            Operation::Unhide
        } else {
            Operation::Hide
        }
    }

    pub fn hide_taskbar_icon(self) -> bool {
        self.flags & Self::HIDE_TASKBAR_ICON_MASK != 0
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        self.flags.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FlagsError> {
        let raw: [u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| FlagsError::BadLength(bytes.len()))?;
        Self::from_flags(u32::from_le_bytes(raw))
    }
}

impl fmt::Display for OperationParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operation() {
            Operation::Hide => "HIDE",
            Operation::Unhide => "UNHIDE",
        };
        let taskbar = if self.hide_taskbar_icon() {
            "HIDE_TASKBAR_ICON"
        } else {
            "SHOW_TASKBAR_ICON"
        };
        write!(f, "{op} | {taskbar}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0x811C_9DC5);
        assert_eq!(fnv1a(b"a"), 0xE40C_292C);
    }

    #[test]
    fn test_mapping_name_golden() {
        assert_eq!(mapping_name(1234), "40166C6B");
        assert_eq!(mapping_name(1234), format!("{:08X}", fnv1a(b"evanesco1234")));
    }

    #[test]
    fn test_mapping_name_is_eight_uppercase_hex_digits() {
        for pid in [0, 4, 1234, u32::MAX] {
            let name = mapping_name(pid);
            assert_eq!(name.len(), 8);
            assert!(name.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }

    #[test]
    fn test_params_bits() {
        let p = OperationParams::new(Operation::Hide, false);
        assert_eq!(p.flags(), 0);
        let p = OperationParams::new(Operation::Unhide, true);
        assert_eq!(p.flags(), 0b11);
        assert_eq!(p.operation(), Operation::Unhide);
        assert!(p.hide_taskbar_icon());
    }

    #[test]
    fn test_params_reject_undefined_bits() {
        assert_eq!(
            OperationParams::from_flags(0x4),
            Err(FlagsError::UndefinedBits(0x4))
        );
        assert!(OperationParams::from_flags(0x8000_0001).is_err());
        assert!(OperationParams::from_flags(0x3).is_ok());
    }

    #[test]
    fn test_params_from_bytes() {
        let p = OperationParams::from_bytes(&[0x02, 0, 0, 0]).unwrap();
        assert_eq!(p.operation(), Operation::Hide);
        assert!(p.hide_taskbar_icon());
        assert_eq!(
            OperationParams::from_bytes(&[1, 0]),
            Err(FlagsError::BadLength(2))
        );
    }

    #[test]
    fn test_params_display() {
        assert_eq!(
            OperationParams::new(Operation::Hide, true).to_string(),
            "HIDE | HIDE_TASKBAR_ICON"
        );
        assert_eq!(
            OperationParams::new(Operation::Unhide, false).to_string(),
            "UNHIDE | SHOW_TASKBAR_ICON"
        );
    }
}
