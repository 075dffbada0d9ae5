//! Position-independent payloads that call `SetWindowDisplayAffinity` inside
//! a target process.
//!
//! Each payload is a short code sequence followed by a parameter block:
//!
//! ```text
//! x64 (40 bytes)                      x86 (24 bytes)
//!  0  window handle     u64            0  window handle     u32
//!  8  affinity          u32 (+4 pad)   4  affinity          u32
//! 16  SetWindowDisplayAffinity  u64    8  SetWindowDisplayAffinity  u32
//! 24  GetLastError      u64           12  GetLastError      u32
//! 32  result            u32           16  result            u32
//! 36  last error        u32           20  last error        u32
//! ```
//!
//! The code locates the block relative to itself, calls the API with the
//! stored handle and affinity, stores the BOOL result and `GetLastError`, and
//! returns 0 as the thread exit code.

use crate::error::{HideError, HideResult};
use crate::target::{Architecture, WindowHandle};
use evanesco_ipc::Operation;

pub const WDA_NONE: u32 = 0x00;
pub const WDA_MONITOR: u32 = 0x01;
pub const WDA_EXCLUDEFROMCAPTURE: u32 = 0x11;

pub fn affinity_for(operation: Operation) -> u32 {
    match operation {
        Operation::Hide => WDA_EXCLUDEFROMCAPTURE,
        Operation::Unhide => WDA_NONE,
    }
}

/// Current display affinity of a window, as reported by
/// `GetWindowDisplayAffinity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "affinity")]
pub enum CaptureState {
    Visible,
    Excluded,
    /// Shown black in captures (`WDA_MONITOR`).
    Blacked,
    Other(u32),
}

impl CaptureState {
    pub fn from_affinity(affinity: u32) -> Self {
        match affinity {
            WDA_NONE => CaptureState::Visible,
            WDA_EXCLUDEFROMCAPTURE => CaptureState::Excluded,
            WDA_MONITOR => CaptureState::Blacked,
            other => CaptureState::Other(other),
        }
    }

    pub fn is_hidden(self) -> bool {
        !matches!(self, CaptureState::Visible)
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Where the code refers to its parameter block. The 32-bit operand at
/// `operand_at` holds `data_offset - anchor`, where `anchor` is the code
/// offset the reference is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSlot {
    pub operand_at: usize,
    pub anchor: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub window: usize,
    pub affinity: usize,
    pub set_affinity_fn: usize,
    pub get_last_error_fn: usize,
    pub result: usize,
    pub last_error: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PayloadTemplate {
    pub arch: Architecture,
    pub code: &'static [u8],
    pub data: DataSlot,
    pub alignment: usize,
    pub layout: BlockLayout,
}

#[rustfmt::skip]
const CODE_X64: [u8; 38] = [
    0x53,                               // push rbx
    0x48, 0x83, 0xEC, 0x20,             // sub rsp, 0x20
    0x48, 0x8D, 0x1D, 0, 0, 0, 0,       // lea rbx, [rip + disp32]
    0x48, 0x8B, 0x0B,                   // mov rcx, [rbx]
    0x8B, 0x53, 0x08,                   // mov edx, [rbx + 0x08]
    0xFF, 0x53, 0x10,                   // call [rbx + 0x10]
    0x89, 0x43, 0x20,                   // mov [rbx + 0x20], eax
    0xFF, 0x53, 0x18,                   // call [rbx + 0x18]
    0x89, 0x43, 0x24,                   // mov [rbx + 0x24], eax
    0x31, 0xC0,                         // xor eax, eax
    0x48, 0x83, 0xC4, 0x20,             // add rsp, 0x20
    0x5B,                               // pop rbx
    0xC3,                               // ret
];

#[rustfmt::skip]
const CODE_X86: [u8; 36] = [
    0x56,                               // push esi
    0xE8, 0, 0, 0, 0,                   // call $+5
    0x5E,                               // pop esi
    0x81, 0xC6, 0, 0, 0, 0,             // add esi, imm32
    0xFF, 0x76, 0x04,                   // push dword [esi + 0x04]
    0xFF, 0x36,                         // push dword [esi]
    0xFF, 0x56, 0x08,                   // call [esi + 0x08]
    0x89, 0x46, 0x10,                   // mov [esi + 0x10], eax
    0xFF, 0x56, 0x0C,                   // call [esi + 0x0C]
    0x89, 0x46, 0x14,                   // mov [esi + 0x14], eax
    0x31, 0xC0,                         // xor eax, eax
    0x5E,                               // pop esi
    0xC2, 0x04, 0x00,                   // ret 4
];

pub const TEMPLATE_X64: PayloadTemplate = PayloadTemplate {
    arch: Architecture::X64,
    code: &CODE_X64,
    data: DataSlot {
        operand_at: 8,
        anchor: 12,
    },
    alignment: 8,
    layout: BlockLayout {
        window: 0,
        affinity: 8,
        set_affinity_fn: 16,
        get_last_error_fn: 24,
        result: 32,
        last_error: 36,
        size: 40,
    },
};

pub const TEMPLATE_X86: PayloadTemplate = PayloadTemplate {
    arch: Architecture::X86,
    code: &CODE_X86,
    data: DataSlot {
        operand_at: 9,
        anchor: 6,
    },
    alignment: 4,
    layout: BlockLayout {
        window: 0,
        affinity: 4,
        set_affinity_fn: 8,
        get_last_error_fn: 12,
        result: 16,
        last_error: 20,
        size: 24,
    },
};

impl PayloadTemplate {
    pub fn for_arch(arch: Architecture) -> &'static PayloadTemplate {
        match arch {
            Architecture::X64 => &TEMPLATE_X64,
            Architecture::X86 => &TEMPLATE_X86,
        }
    }

    pub fn data_offset(&self) -> usize {
        self.code.len().next_multiple_of(self.alignment)
    }
}

// ============================================================================
// Building
// ============================================================================

/// Addresses of the two imports, as seen from inside the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadImports {
    pub set_window_display_affinity: u64,
    pub get_last_error: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub arch: Architecture,
    pub bytes: Vec<u8>,
    pub data_offset: usize,
}

/// What the payload stored in its block before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadResults {
    pub result: u32,
    pub last_error: u32,
}

impl Payload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn layout(&self) -> &'static BlockLayout {
        &PayloadTemplate::for_arch(self.arch).layout
    }

    /// Offset from the start of the payload to the result field.
    pub fn results_offset(&self) -> usize {
        self.data_offset + self.layout().result
    }

    /// Bytes to read back starting at [`Payload::results_offset`].
    pub fn results_len(&self) -> usize {
        let layout = self.layout();
        layout.last_error + 4 - layout.result
    }

    pub fn decode_results(&self, raw: &[u8]) -> Option<PayloadResults> {
        let layout = self.layout();
        let error_at = layout.last_error - layout.result;
        Some(PayloadResults {
            result: read_u32(raw, 0)?,
            last_error: read_u32(raw, error_at)?,
        })
    }
}

fn read_u32(raw: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = raw.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn write_ptr(buf: &mut [u8], at: usize, arch: Architecture, value: u64) {
    match arch {
        Architecture::X64 => buf[at..at + 8].copy_from_slice(&value.to_le_bytes()),
        Architecture::X86 => buf[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes()),
    }
}

fn check_width(arch: Architecture, what: &str, value: u64) -> HideResult<()> {
    if value == 0 {
        return Err(HideError::ArchitectureMismatch(format!(
            "{} resolved to a null address",
            what
        )));
    }
    if arch == Architecture::X86 && value > u64::from(u32::MAX) {
        return Err(HideError::ArchitectureMismatch(format!(
            "{} 0x{:X} does not fit a 32-bit target",
            what, value
        )));
    }
    Ok(())
}

pub fn build(
    operation: Operation,
    arch: Architecture,
    window: WindowHandle,
    imports: PayloadImports,
) -> HideResult<Payload> {
    check_width(arch, "window handle", window.as_u64())?;
    check_width(arch, "SetWindowDisplayAffinity", imports.set_window_display_affinity)?;
    check_width(arch, "GetLastError", imports.get_last_error)?;

    let template = PayloadTemplate::for_arch(arch);
    let data_offset = template.data_offset();
    let layout = template.layout;

    let mut bytes = vec![0xCC; data_offset + layout.size];
    bytes[..template.code.len()].copy_from_slice(template.code);

    let rel = (data_offset - template.data.anchor) as u32;
    let at = template.data.operand_at;
    bytes[at..at + 4].copy_from_slice(&rel.to_le_bytes());

    let block = &mut bytes[data_offset..];
    block.fill(0);
    write_ptr(block, layout.window, arch, window.as_u64());
    block[layout.affinity..layout.affinity + 4]
        .copy_from_slice(&affinity_for(operation).to_le_bytes());
    write_ptr(block, layout.set_affinity_fn, arch, imports.set_window_display_affinity);
    write_ptr(block, layout.get_last_error_fn, arch, imports.get_last_error);

    Ok(Payload {
        arch,
        bytes,
        data_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMPORTS: PayloadImports = PayloadImports {
        set_window_display_affinity: 0x7FF8_1000_2000,
        get_last_error: 0x7FF8_3000_4000,
    };

    const IMPORTS_32: PayloadImports = PayloadImports {
        set_window_display_affinity: 0x7550_1234,
        get_last_error: 0x7620_5678,
    };

    fn operand(p: &Payload, at: usize) -> u32 {
        u32::from_le_bytes(p.bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_x64_offset_points_at_block() {
        let p = build(Operation::Hide, Architecture::X64, WindowHandle(0xABCDEF), IMPORTS).unwrap();
        assert_eq!(p.data_offset, 40);
        assert_eq!(p.len(), 80);
        // RIP after the lea is the anchor; anchor + disp must land on the block.
        let disp = operand(&p, TEMPLATE_X64.data.operand_at);
        assert_eq!(TEMPLATE_X64.data.anchor + disp as usize, p.data_offset);
        assert_eq!(&p.bytes[5..8], &[0x48, 0x8D, 0x1D]);
        assert_eq!(&p.bytes[38..40], &[0xCC, 0xCC]);
    }

    #[test]
    fn test_x64_block_contents() {
        let p = build(Operation::Hide, Architecture::X64, WindowHandle(0xABCDEF), IMPORTS).unwrap();
        let block = &p.bytes[p.data_offset..];
        assert_eq!(u64::from_le_bytes(block[0..8].try_into().unwrap()), 0xABCDEF);
        assert_eq!(u32::from_le_bytes(block[8..12].try_into().unwrap()), WDA_EXCLUDEFROMCAPTURE);
        assert_eq!(&block[12..16], &[0, 0, 0, 0]);
        assert_eq!(
            u64::from_le_bytes(block[16..24].try_into().unwrap()),
            IMPORTS.set_window_display_affinity
        );
        assert_eq!(
            u64::from_le_bytes(block[24..32].try_into().unwrap()),
            IMPORTS.get_last_error
        );
        assert_eq!(&block[32..40], &[0; 8]);
    }

    #[test]
    fn test_x86_offset_points_at_block() {
        let p = build(Operation::Unhide, Architecture::X86, WindowHandle(0x1_0042), IMPORTS_32).unwrap();
        assert_eq!(p.data_offset, 36);
        assert_eq!(p.len(), 60);
        // esi holds the return address of `call $+5`, i.e. base + anchor.
        let imm = operand(&p, TEMPLATE_X86.data.operand_at);
        assert_eq!(TEMPLATE_X86.data.anchor + imm as usize, p.data_offset);
        assert_eq!(&p.bytes[33..36], &[0xC2, 0x04, 0x00]);

        let block = &p.bytes[p.data_offset..];
        assert_eq!(u32::from_le_bytes(block[0..4].try_into().unwrap()), 0x1_0042);
        assert_eq!(u32::from_le_bytes(block[4..8].try_into().unwrap()), WDA_NONE);
        assert_eq!(u32::from_le_bytes(block[8..12].try_into().unwrap()), 0x7550_1234);
        assert_eq!(u32::from_le_bytes(block[12..16].try_into().unwrap()), 0x7620_5678);
    }

    #[test]
    fn test_x86_rejects_wide_values() {
        let err = build(Operation::Hide, Architecture::X86, WindowHandle(0x10), IMPORTS).unwrap_err();
        assert!(matches!(err, HideError::ArchitectureMismatch(_)));

        #[cfg(target_pointer_width = "64")]
        assert!(build(Operation::Hide, Architecture::X86, WindowHandle(usize::MAX), IMPORTS_32).is_err());
    }

    #[test]
    fn test_null_import_rejected() {
        let imports = PayloadImports {
            set_window_display_affinity: 0,
            get_last_error: 1,
        };
        assert!(build(Operation::Hide, Architecture::X64, WindowHandle(1), imports).is_err());
    }

    #[test]
    fn test_capture_state_from_affinity() {
        assert_eq!(CaptureState::from_affinity(0), CaptureState::Visible);
        assert_eq!(CaptureState::from_affinity(0x11), CaptureState::Excluded);
        assert_eq!(CaptureState::from_affinity(1), CaptureState::Blacked);
        assert_eq!(CaptureState::from_affinity(7), CaptureState::Other(7));
        assert!(!CaptureState::Visible.is_hidden());
        assert!(CaptureState::Blacked.is_hidden());
    }

    #[test]
    fn test_results_decoding() {
        let p = build(Operation::Hide, Architecture::X64, WindowHandle(1), IMPORTS).unwrap();
        assert_eq!(p.results_offset(), 72);
        assert_eq!(p.results_len(), 8);
        let r = p.decode_results(&[1, 0, 0, 0, 5, 0, 0, 0]).unwrap();
        assert_eq!(r, PayloadResults { result: 1, last_error: 5 });
        assert!(p.decode_results(&[1, 0]).is_none());

        let p = build(Operation::Hide, Architecture::X86, WindowHandle(1), IMPORTS_32).unwrap();
        assert_eq!(p.results_offset(), 52);
    }
}
