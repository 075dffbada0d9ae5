//! Export lookup for 32-bit targets.
//!
//! A 64-bit controller cannot use its own `GetProcAddress` results for a
//! WOW64 target, so function addresses are computed from the 32-bit system
//! DLLs on disk: RVA from the export table, plus the module's base in the
//! target. Forwarded exports (`"NTDLL.RtlGetLastWin32Error"`) are followed to
//! the module that actually implements the function.

use crate::error::{HideError, HideResult};
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const MAX_FORWARD_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Export {
    Address(u32),
    Forwarded { module: String, symbol: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExport {
    /// Lower-case file name of the module that implements the symbol.
    pub module: String,
    pub rva: u32,
}

pub trait ExportSource {
    fn lookup(&self, module: &str, symbol: &str) -> HideResult<Export>;
}

/// `"NTDLL"` → `"ntdll.dll"`, `"User32.dll"` → `"user32.dll"`.
pub fn normalize_module(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if Path::new(&lower).extension().is_some() {
        lower
    } else {
        format!("{}.dll", lower)
    }
}

pub fn resolve_export<S: ExportSource + ?Sized>(
    source: &S,
    module: &str,
    symbol: &str,
) -> HideResult<ResolvedExport> {
    let mut module = normalize_module(module);
    let mut symbol = symbol.to_string();

    for _ in 0..=MAX_FORWARD_DEPTH {
        match source.lookup(&module, &symbol)? {
            Export::Address(rva) => return Ok(ResolvedExport { module, rva }),
            Export::Forwarded {
                module: next_module,
                symbol: next_symbol,
            } => {
                debug!(
                    "[exports] {}!{} forwards to {}.{}",
                    module, symbol, next_module, next_symbol
                );
                module = normalize_module(&next_module);
                symbol = next_symbol;
            }
        }
    }

    Err(HideError::ArchitectureMismatch(format!(
        "forwarder chain for {} exceeds {} hops",
        symbol, MAX_FORWARD_DEPTH
    )))
}

/// Absolute address of `module!symbol` in a target whose 32-bit modules are
/// loaded at `bases` (keys are lower-case file names). The base is taken
/// from the module the forwarder chain ends in.
pub fn remote_address<S: ExportSource + ?Sized>(
    source: &S,
    bases: &HashMap<String, u64>,
    module: &str,
    symbol: &str,
) -> HideResult<u64> {
    let resolved = resolve_export(source, module, symbol)?;
    let base = bases.get(&resolved.module).ok_or_else(|| {
        HideError::ArchitectureMismatch(format!(
            "{} is not loaded in the target (needed for {})",
            resolved.module, symbol
        ))
    })?;
    Ok(base + u64::from(resolved.rva))
}

// ============================================================================
// PE files on disk
// ============================================================================

type ExportTable = HashMap<String, Export>;

/// Reads export tables of 32-bit DLLs from a directory, normally
/// `%SystemRoot%\SysWOW64`. Parsed tables are cached per module.
pub struct PeFileExports {
    dir: PathBuf,
    cache: Mutex<HashMap<String, ExportTable>>,
}

impl PeFileExports {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn wow64() -> Self {
        let root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
        Self::new(PathBuf::from(root).join("SysWOW64"))
    }

    fn parse(&self, module: &str) -> HideResult<ExportTable> {
        let path = self.dir.join(module);
        let bytes = std::fs::read(&path)?;
        parse_exports(&bytes).map_err(|e| {
            HideError::ArchitectureMismatch(format!("{}: {}", path.display(), e))
        })
    }
}

impl ExportSource for PeFileExports {
    fn lookup(&self, module: &str, symbol: &str) -> HideResult<Export> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| HideError::ArchitectureMismatch("export cache poisoned".into()))?;
        if !cache.contains_key(module) {
            let table = self.parse(module)?;
            cache.insert(module.to_string(), table);
        }
        cache
            .get(module)
            .and_then(|table| table.get(&symbol.to_ascii_lowercase()))
            .cloned()
            .ok_or_else(|| {
                HideError::ArchitectureMismatch(format!("{} does not export {}", module, symbol))
            })
    }
}

/// Export table of a 32-bit PE image, keyed by lower-case symbol name.
pub fn parse_exports(bytes: &[u8]) -> Result<ExportTable, String> {
    let pe = goblin::pe::PE::parse(bytes).map_err(|e| e.to_string())?;
    if pe.is_64 {
        return Err("expected a 32-bit image".into());
    }

    let mut table = HashMap::new();
    for export in &pe.exports {
        let Some(name) = export.name else { continue };
        let entry = match &export.reexport {
            Some(goblin::pe::export::Reexport::DLLName { export, lib }) => Export::Forwarded {
                module: lib.to_string(),
                symbol: export.to_string(),
            },
            // Ordinal forwarders are not used by the functions we need.
            Some(goblin::pe::export::Reexport::DLLOrdinal { .. }) => continue,
            None => Export::Address(export.rva as u32),
        };
        table.insert(name.to_ascii_lowercase(), entry);
    }
    Ok(table)
}
