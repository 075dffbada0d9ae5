//! In-target hook library for Evanesco.
//!
//! Loaded into a target through the target's own `LoadLibraryW`. On attach it
//! reads the operation flags the controller published in a named shared-memory
//! block (see `evanesco_ipc::mapping_name`), applies the display affinity to
//! every visible top-level window of the process and its descendants, and
//! optionally toggles the taskbar icon.
//!
//! Attach returns TRUE only when at least one window was processed. In that
//! case the library schedules its own unload; otherwise the loader discards it
//! and the controller sees a zero `LoadLibraryW` result.

mod tree;

#[cfg(target_os = "windows")]
mod entry;

pub use tree::process_and_descendants;
