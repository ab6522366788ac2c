use std::time::Duration;

use reelwork_core::{ResourceKey, TaskError, TaskKind, TaskOutput};
use reelwork_platform::{CommandSpec, ProcessHandle};
use serde_json::{json, Value};

use super::{exit_to_result, supervise, ProcessEnd, DEFAULT_GRACE};
use crate::task::{Task, TaskContext};

/// Runs an arbitrary command. Completes with the last diagnostic line on
/// exit 0.
pub struct ProcessTask {
    spec: CommandSpec,
    resource: Option<ResourceKey>,
    grace: Duration,
}

impl ProcessTask {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            resource: None,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn exclusive(mut self, resource: ResourceKey) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Task for ProcessTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Process
    }

    fn resource(&self) -> Option<ResourceKey> {
        self.resource.clone()
    }

    fn describe(&self) -> Value {
        json!({
            "program": self.spec.program_name(),
            "args": self.spec.args.len(),
            "grace_ms": self.grace.as_millis(),
        })
    }

    fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let mut handle = ProcessHandle::spawn(&self.spec)?;
        ctx.progress(0);
        let end = supervise(&mut handle, ctx, self.grace)?;
        if let ProcessEnd::Exited(code) = end {
            exit_to_result(&mut handle, code)?;
        }
        handle.drain_readers(Duration::from_millis(500));
        let last = handle
            .diagnostic_tail()
            .into_iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        ctx.progress(100);
        Ok(TaskOutput::Text(last))
    }
}
