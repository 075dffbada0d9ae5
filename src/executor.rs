//! Runs a payload inside another process: allocate, write, start a thread,
//! wait, read back, release.
//!
//! Everything OS-specific sits behind [`RemoteProcess`] so the control flow
//! (and its cleanup on every failure path) can be exercised without a real
//! target.

use crate::error::{HideError, HideResult, OsError};
use crate::payload::Payload;
use log::{debug, error, warn};
use std::time::Duration;

pub const DEFAULT_THREAD_TIMEOUT: Duration = Duration::from_millis(2000);
pub const EXTRA_PADDING: usize = 64;

const ERROR_PARTIAL_COPY: u32 = 299;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadWriteExecute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    Failed(OsError),
}

pub trait RemoteThread {
    fn wait(&self, timeout: Duration) -> WaitOutcome;
    fn exit_code(&self) -> Result<u32, OsError>;

    /// Kills the thread wherever it currently is.
    ///
    /// # Safety
    /// The target may be left with locks held or heap state half-updated.
    /// Only for threads that overran their timeout.
    unsafe fn terminate(&self) -> Result<(), OsError>;
}

/// A process we can allocate in, copy to and from, and start threads in.
pub trait RemoteProcess {
    type Thread: RemoteThread;

    fn pid(&self) -> u32;
    fn allocate(&self, size: usize, protection: Protection) -> Result<u64, OsError>;
    fn free(&self, address: u64) -> Result<(), OsError>;
    fn write(&self, address: u64, data: &[u8]) -> Result<(), OsError>;
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), OsError>;
    fn spawn_thread(&self, start: u64, param: u64) -> Result<Self::Thread, OsError>;

    /// Whether a module with this file name is mapped in the process, or
    /// `None` when that cannot be determined.
    fn module_loaded(&self, _file_name: &str) -> Option<bool> {
        None
    }
}

// ============================================================================
// Remote allocation guard
// ============================================================================

/// Memory in the target, released when dropped.
pub struct RemoteAllocation<'a, P: RemoteProcess> {
    process: &'a P,
    address: u64,
    size: usize,
}

impl<'a, P: RemoteProcess> RemoteAllocation<'a, P> {
    pub fn new(process: &'a P, size: usize, protection: Protection) -> Result<Self, OsError> {
        let address = process.allocate(size, protection)?;
        debug!(
            "[executor] Allocated {} bytes at 0x{:X} in {}",
            size,
            address,
            process.pid()
        );
        Ok(Self {
            process,
            address,
            size,
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl<P: RemoteProcess> Drop for RemoteAllocation<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.process.free(self.address) {
            warn!(
                "[executor] Failed to release 0x{:X} in {}: {}",
                self.address,
                self.process.pid(),
                e
            );
        }
    }
}

/// Starts a thread at `start` and waits for it. On timeout the thread is
/// terminated before returning, so callers may free its memory.
pub fn run_remote_thread<P: RemoteProcess>(
    process: &P,
    start: u64,
    param: u64,
    timeout: Duration,
) -> HideResult<u32> {
    let thread = process
        .spawn_thread(start, param)
        .map_err(HideError::ExecutionStartFailed)?;

    match thread.wait(timeout) {
        WaitOutcome::Signaled => thread.exit_code().map_err(HideError::ReadBackFailed),
        WaitOutcome::TimedOut => {
            error!(
                "[executor] Remote thread in {} exceeded {:?}, terminating",
                process.pid(),
                timeout
            );
            kill(&thread);
            Err(HideError::Timeout {
                ms: timeout.as_millis() as u64,
            })
        }
        WaitOutcome::Failed(e) => {
            kill(&thread);
            Err(HideError::ReadBackFailed(e))
        }
    }
}

fn kill<T: RemoteThread>(thread: &T) {
    // SAFETY: the thread overran or could not be waited on; leaving it running
    // would let it execute from memory we are about to release.
    if let Err(e) = unsafe { thread.terminate() } {
        warn!("[executor] TerminateThread failed: {}", e);
    }
    // Termination is asynchronous.
    let _ = thread.wait(Duration::from_millis(100));
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    pub exit_code: u32,
    pub result: u32,
    pub last_error: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteExecutor {
    timeout: Duration,
    padding: usize,
}

impl Default for RemoteExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_THREAD_TIMEOUT)
    }
}

impl RemoteExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            padding: EXTRA_PADDING,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn execute<P: RemoteProcess>(
        &self,
        process: &P,
        payload: &Payload,
    ) -> HideResult<ExecutionReport> {
        let memory = RemoteAllocation::new(
            process,
            payload.len() + self.padding,
            Protection::ReadWriteExecute,
        )
        .map_err(HideError::AllocationFailed)?;

        process
            .write(memory.address(), &payload.bytes)
            .map_err(HideError::WriteFailed)?;

        let exit_code = run_remote_thread(process, memory.address(), 0, self.timeout)?;

        let mut raw = vec![0u8; payload.results_len()];
        process
            .read(memory.address() + payload.results_offset() as u64, &mut raw)
            .map_err(HideError::ReadBackFailed)?;
        let results = payload
            .decode_results(&raw)
            .ok_or(HideError::ReadBackFailed(OsError(ERROR_PARTIAL_COPY)))?;

        let report = ExecutionReport {
            exit_code,
            result: results.result,
            last_error: results.last_error,
        };
        debug!("[executor] {} -> {:?}", process.pid(), report);

        if report.exit_code != 0 || report.result == 0 {
            return Err(HideError::OperationRejected {
                exit_code: report.exit_code,
                last_error: report.last_error,
            });
        }
        Ok(report)
    }
}
