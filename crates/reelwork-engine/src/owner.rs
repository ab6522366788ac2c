use std::path::PathBuf;

use anyhow::{anyhow, Result};
use reelwork_core::{OwnerId, TaskState};
use reelwork_observability::env;

use crate::{
    scheduler::{Scheduler, TaskHandle},
    supervisor::SupervisedOwner,
    tasks::{CaptureConfig, CaptureTask},
};

/// Starts a screen recording per supervisor "start" and finishes it on
/// "stop". Each recording goes to its own timestamped file.
pub struct CaptureOwner {
    scheduler: Scheduler,
    base: CaptureConfig,
    output_dir: PathBuf,
    owner: OwnerId,
    current: Option<TaskHandle>,
}

impl CaptureOwner {
    /// `base.output` is ignored; files land in `output_dir`.
    pub fn new(scheduler: Scheduler, base: CaptureConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            scheduler,
            base,
            output_dir: output_dir.into(),
            owner: OwnerId::new("supervisor"),
            current: None,
        }
    }

    pub fn owner_id(mut self, owner: OwnerId) -> Self {
        self.owner = owner;
        self
    }

    pub fn current(&self) -> Option<&TaskHandle> {
        self.current.as_ref()
    }

    fn current_is_live(&self) -> bool {
        self.current
            .as_ref()
            .and_then(|h| self.scheduler.state(h))
            .is_some_and(|s| matches!(s, TaskState::Pending | TaskState::Running))
    }
}

impl SupervisedOwner for CaptureOwner {
    fn start(&mut self) -> Result<()> {
        if self.current_is_live() {
            return Ok(());
        }
        let mut cfg = self.base.clone();
        cfg.output = self
            .output_dir
            .join(format!("capture-{}.mkv", env::now_ms()));
        let h = self
            .scheduler
            .submit(Box::new(CaptureTask::new(cfg)), &self.owner)
            .map_err(|e| anyhow!(e).context("submit capture failed"))?;
        self.current = Some(h);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(h) = self.current.take() {
            // Already-terminal tasks make this a no-op.
            let _ = self.scheduler.request_finish(&h);
        }
    }

    fn is_live(&mut self) -> bool {
        self.current_is_live()
    }
}
