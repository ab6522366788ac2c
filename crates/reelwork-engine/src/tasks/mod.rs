//! Concrete task kinds.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use reelwork_core::TaskError;
use reelwork_platform::{media_tool, ProcessHandle, ProcessState};

use crate::task::TaskContext;

pub mod capture;
pub mod process;
pub mod service;
pub mod transcode;

pub use capture::{CaptureConfig, CaptureTask, Region};
pub use process::ProcessTask;
pub use service::{RewriteTask, ScrapeTask, ServiceTaskConfig, SynthesisParams, SynthesisTask};
pub use transcode::{SilenceTrim, TranscodeConfig, TranscodeTask};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An explicit path wins over `REELWORK_FFMPEG` and PATH lookup.
pub(crate) fn resolve_ffmpeg(explicit: Option<&Path>) -> Result<PathBuf, TaskError> {
    match explicit {
        Some(p) => Ok(p.to_path_buf()),
        None => media_tool::resolve_ffmpeg().map_err(|e| TaskError::Spawn {
            program: "ffmpeg".to_string(),
            not_found: true,
            message: e.to_string(),
        }),
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessEnd {
    /// Exited on its own.
    Exited(i32),
    /// Stopped because a finish was requested.
    Finished(ProcessState),
}

/// Poll `handle` until it exits, honouring cancel and finish requests.
/// Cancellation terminates the process and returns `TaskError::Cancelled`
/// once it is gone.
pub(crate) fn supervise(
    handle: &mut ProcessHandle,
    ctx: &TaskContext,
    grace: Duration,
) -> Result<ProcessEnd, TaskError> {
    loop {
        if ctx.is_cancelled() {
            handle.terminate(grace);
            return Err(TaskError::Cancelled);
        }
        if ctx.finish_requested() {
            return Ok(ProcessEnd::Finished(handle.terminate(grace)));
        }
        if let Some(code) = handle.wait_timeout(POLL_INTERVAL) {
            return Ok(ProcessEnd::Exited(code));
        }
    }
}

/// Non-zero exit becomes `ProcessFailed` with the diagnostic tail.
pub(crate) fn exit_to_result(handle: &mut ProcessHandle, code: i32) -> Result<(), TaskError> {
    if code == 0 {
        return Ok(());
    }
    handle.drain_readers(Duration::from_millis(500));
    Err(TaskError::ProcessFailed {
        exit_code: code,
        tail: handle.diagnostic_tail(),
    })
}
