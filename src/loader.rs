//! Library-based variant: have the target's own loader map the hook library.
//!
//! The operation flags travel through a named shared-memory block that the
//! library opens from `DllMain`; the block must exist before the load starts
//! and outlive it.

use crate::error::{HideError, HideResult};
use crate::executor::{run_remote_thread, Protection, RemoteAllocation, RemoteProcess};
use evanesco_ipc::OperationParams;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;

pub const DEFAULT_LIBRARY_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MAX_PATH: usize = 260;
const RANDOM_NAME_LEN: usize = 12;

/// Makes `params` visible to the library loaded into `pid` for as long as
/// the returned guard lives.
pub trait ParamPublisher {
    type Guard;

    fn publish(&self, pid: u32, params: OperationParams) -> HideResult<Self::Guard>;
}

enum StagedLibrary {
    Original(PathBuf),
    Copy(TempPath),
}

impl StagedLibrary {
    fn path(&self) -> &Path {
        match self {
            StagedLibrary::Original(p) => p,
            StagedLibrary::Copy(p) => p,
        }
    }

    fn finish(self) {
        if let StagedLibrary::Copy(path) = self {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                warn!("[loader] Could not remove staged copy {}: {}", shown, e);
            }
        }
    }
}

/// Copies `library` into the temp directory under a random alphanumeric
/// `.dll` name. The copy is deleted when the returned path is dropped.
fn stage_copy(library: &Path, dir: &Path) -> HideResult<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("")
        .rand_bytes(RANDOM_NAME_LEN)
        .suffix(".dll")
        .tempfile_in(dir)?;
    let mut source = std::fs::File::open(library)?;
    std::io::copy(&mut source, file.as_file_mut())?;
    Ok(file.into_temp_path())
}

/// NUL-terminated UTF-16 form of `path`, as `LoadLibraryW` expects.
pub fn wide_path(path: &Path) -> Vec<u16> {
    #[cfg(target_os = "windows")]
    let units = {
        use std::os::windows::ffi::OsStrExt;
        path.as_os_str().encode_wide().collect::<Vec<u16>>()
    };
    #[cfg(not(target_os = "windows"))]
    let units = path.to_string_lossy().encode_utf16().collect::<Vec<u16>>();

    let mut units = units;
    units.push(0);
    units
}

#[derive(Debug, Clone)]
pub struct LibraryInjector {
    timeout: Duration,
    randomize: bool,
    staging_dir: PathBuf,
}

impl Default for LibraryInjector {
    fn default() -> Self {
        Self::new(DEFAULT_LIBRARY_TIMEOUT, true)
    }
}

impl LibraryInjector {
    pub fn new(timeout: Duration, randomize: bool) -> Self {
        Self {
            timeout,
            randomize,
            staging_dir: std::env::temp_dir(),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Loads `library` into `process` by starting a thread at `loader_entry`
    /// (the target's `LoadLibraryW`). A zero thread exit code means the
    /// library refused to attach.
    pub fn inject_library<P, B>(
        &self,
        process: &P,
        publisher: &B,
        loader_entry: u64,
        library: &Path,
        params: OperationParams,
    ) -> HideResult<()>
    where
        P: RemoteProcess,
        B: ParamPublisher,
    {
        if !library.is_file() {
            return Err(HideError::LibraryNotFound(library.to_path_buf()));
        }

        let staged = if self.randomize {
            StagedLibrary::Copy(stage_copy(library, &self.staging_dir)?)
        } else {
            StagedLibrary::Original(library.to_path_buf())
        };
        debug!("[loader] Using {}", staged.path().display());

        let result = self.load(process, publisher, loader_entry, staged.path(), params);
        staged.finish();
        result
    }

    /// The thread exit code is only the low 32 bits of the module handle, so
    /// a 64-bit module based on a 4 GiB boundary reads as 0. Such a load is
    /// recognised only while the library is still mapped; one that already
    /// unloaded itself is still reported as rejected.
    fn still_mapped<P: RemoteProcess>(process: &P, path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let mapped = process.module_loaded(file_name) == Some(true);
        if mapped {
            debug!(
                "[loader] Zero exit code but {} is mapped in {}",
                file_name,
                process.pid()
            );
        }
        mapped
    }

    fn load<P, B>(
        &self,
        process: &P,
        publisher: &B,
        loader_entry: u64,
        path: &Path,
        params: OperationParams,
    ) -> HideResult<()>
    where
        P: RemoteProcess,
        B: ParamPublisher,
    {
        let wide = wide_path(path);
        if wide.len() > MAX_PATH {
            return Err(HideError::PathTooLong(wide.len()));
        }
        let bytes: Vec<u8> = wide.iter().flat_map(|u| u.to_le_bytes()).collect();

        let _published = publisher.publish(process.pid(), params)?;

        let memory = RemoteAllocation::new(process, bytes.len(), Protection::ReadWrite)
            .map_err(HideError::AllocationFailed)?;
        process
            .write(memory.address(), &bytes)
            .map_err(HideError::WriteFailed)?;

        let exit_code = run_remote_thread(process, loader_entry, memory.address(), self.timeout)?;
        if exit_code == 0 && !Self::still_mapped(process, path) {
            return Err(HideError::OperationRejected {
                exit_code,
                last_error: 0,
            });
        }

        info!(
            "[loader] Library loaded in {} ({})",
            process.pid(),
            params
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{Counters, MockProcess, Script};
    use evanesco_ipc::Operation;
    use std::cell::RefCell;
    use std::rc::Rc;

    const LOAD_LIBRARY: u64 = 0x7FFB_0000_1230;

    struct RecordingPublisher {
        counters: Rc<Counters>,
        log: Rc<RefCell<Vec<String>>>,
    }

    struct Published {
        counters: Rc<Counters>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Drop for Published {
        fn drop(&mut self) {
            let threads = self.counters.threads.borrow().len();
            self.log.borrow_mut().push(format!("unpublish after {threads} threads"));
        }
    }

    impl ParamPublisher for RecordingPublisher {
        type Guard = Published;

        fn publish(&self, pid: u32, params: OperationParams) -> HideResult<Published> {
            let threads = self.counters.threads.borrow().len();
            self.log.borrow_mut().push(format!(
                "publish {} {} after {threads} threads",
                pid,
                params.flags()
            ));
            Ok(Published {
                counters: self.counters.clone(),
                log: self.log.clone(),
            })
        }
    }

    fn setup(script: Script) -> (MockProcess, RecordingPublisher, Rc<RefCell<Vec<String>>>) {
        let process = MockProcess::new(script);
        let log = Rc::new(RefCell::new(Vec::new()));
        let publisher = RecordingPublisher {
            counters: process.counters.clone(),
            log: log.clone(),
        };
        (process, publisher, log)
    }

    fn written_path(process: &MockProcess) -> PathBuf {
        let writes = process.counters.writes.borrow();
        let units: Vec<u16> = writes[0]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        PathBuf::from(String::from_utf16(&units).unwrap())
    }

    fn library(dir: &Path) -> PathBuf {
        let path = dir.join("evanesco_hook.dll");
        std::fs::write(&path, b"MZ fake library").unwrap();
        path
    }

    #[test]
    fn test_params_published_before_load_and_kept_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let (process, publisher, log) = setup(Script::Exit(0x7FF0_0000));
        let params = OperationParams::new(Operation::Hide, true);

        LibraryInjector::new(DEFAULT_LIBRARY_TIMEOUT, false)
            .inject_library(&process, &publisher, LOAD_LIBRARY, &library(dir.path()), params)
            .unwrap();

        assert_eq!(
            log.borrow().as_slice(),
            &[
                "publish 4242 2 after 0 threads".to_string(),
                "unpublish after 1 threads".to_string()
            ]
        );
        let threads = process.counters.threads.borrow();
        assert_eq!(threads[0].0, LOAD_LIBRARY);
        assert_eq!(written_path(&process), dir.path().join("evanesco_hook.dll"));
        assert_eq!(process.counters.allocs.get(), process.counters.frees.get());
    }

    #[test]
    fn test_randomized_copy_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let (process, publisher, _log) = setup(Script::Exit(1));

        LibraryInjector::new(DEFAULT_LIBRARY_TIMEOUT, true)
            .with_staging_dir(staging.path())
            .inject_library(
                &process,
                &publisher,
                LOAD_LIBRARY,
                &library(dir.path()),
                OperationParams::new(Operation::Unhide, false),
            )
            .unwrap();

        let staged = written_path(&process);
        assert_eq!(staged.parent(), Some(staging.path()));
        let stem = staged.file_stem().unwrap().to_str().unwrap();
        assert_eq!(stem.len(), RANDOM_NAME_LEN);
        assert!(stem.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(staged.extension().unwrap(), "dll");
        assert!(!staged.exists());
    }

    #[test]
    fn test_copy_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let (process, publisher, _log) = setup(Script::Exit(0));

        let err = LibraryInjector::new(DEFAULT_LIBRARY_TIMEOUT, true)
            .with_staging_dir(staging.path())
            .inject_library(
                &process,
                &publisher,
                LOAD_LIBRARY,
                &library(dir.path()),
                OperationParams::default(),
            )
            .unwrap_err();

        assert!(matches!(err, HideError::OperationRejected { exit_code: 0, .. }));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_zero_exit_code_with_mapped_module_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut process, publisher, _log) = setup(Script::Exit(0));
        process.modules = vec!["EVANESCO_HOOK.DLL".into()];

        LibraryInjector::new(DEFAULT_LIBRARY_TIMEOUT, false)
            .inject_library(
                &process,
                &publisher,
                LOAD_LIBRARY,
                &library(dir.path()),
                OperationParams::default(),
            )
            .unwrap();

        let (mut process, publisher, _log) = setup(Script::Exit(0));
        process.modules = vec!["other.dll".into()];
        let err = LibraryInjector::new(DEFAULT_LIBRARY_TIMEOUT, false)
            .inject_library(
                &process,
                &publisher,
                LOAD_LIBRARY,
                &library(dir.path()),
                OperationParams::default(),
            )
            .unwrap_err();
        assert!(matches!(err, HideError::OperationRejected { exit_code: 0, .. }));
    }

    #[test]
    fn test_missing_library() {
        let (process, publisher, log) = setup(Script::Exit(1));
        let err = LibraryInjector::default()
            .inject_library(
                &process,
                &publisher,
                LOAD_LIBRARY,
                Path::new("/nonexistent/evanesco_hook.dll"),
                OperationParams::default(),
            )
            .unwrap_err();
        assert!(matches!(err, HideError::LibraryNotFound(_)));
        assert!(log.borrow().is_empty());
        assert_eq!(process.counters.allocs.get(), 0);
    }

    #[test]
    fn test_path_too_long() {
        let dir = tempfile::tempdir().unwrap();
        let (process, publisher, log) = setup(Script::Exit(1));
        let long = dir.path().join("a".repeat(300));
        let err = LibraryInjector::new(DEFAULT_LIBRARY_TIMEOUT, false)
            .load(&process, &publisher, LOAD_LIBRARY, &long, OperationParams::default())
            .unwrap_err();
        assert!(matches!(err, HideError::PathTooLong(n) if n > MAX_PATH));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_wide_path_terminated() {
        let w = wide_path(Path::new("ab"));
        assert_eq!(w, vec![b'a' as u16, b'b' as u16, 0]);
    }
}
