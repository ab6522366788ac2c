//! Subscriptions to task events.

use crossbeam_channel::Sender;
use reelwork_core::{TaskEvent, TaskId, TaskOutput};

/// Receives events on the scheduler's dispatcher thread, in emission order
/// for each task. Implementations should return quickly.
pub trait TaskObserver: Send + Sync {
    fn on_event(&self, event: &TaskEvent);
}

type ProgressFn = Box<dyn Fn(&TaskId, u8) + Send + Sync>;
type CompleteFn = Box<dyn Fn(&TaskId, &TaskOutput) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&TaskId, &str, &str) + Send + Sync>;
type CancelledFn = Box<dyn Fn(&TaskId) + Send + Sync>;

/// Closure-based observer; unset callbacks are ignored.
#[derive(Default)]
pub struct Callbacks {
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
    error: Option<ErrorFn>,
    cancelled: Option<CancelledFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(&TaskId, u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn on_complete(
        mut self,
        f: impl Fn(&TaskId, &TaskOutput) + Send + Sync + 'static,
    ) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    /// `f(task_id, code, message)`
    pub fn on_error(mut self, f: impl Fn(&TaskId, &str, &str) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_cancelled(mut self, f: impl Fn(&TaskId) + Send + Sync + 'static) -> Self {
        self.cancelled = Some(Box::new(f));
        self
    }
}

impl TaskObserver for Callbacks {
    fn on_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Progress { task_id, percent } => {
                if let Some(f) = &self.progress {
                    f(task_id, *percent);
                }
            }
            TaskEvent::Completed { task_id, output } => {
                if let Some(f) = &self.complete {
                    f(task_id, output);
                }
            }
            TaskEvent::Failed {
                task_id,
                code,
                message,
            } => {
                if let Some(f) = &self.error {
                    f(task_id, code, message);
                }
            }
            TaskEvent::Cancelled { task_id } => {
                if let Some(f) = &self.cancelled {
                    f(task_id);
                }
            }
        }
    }
}

/// Forwards events into a channel. A dropped receiver is ignored.
pub struct ChannelObserver {
    tx: Sender<TaskEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<TaskEvent>) -> Self {
        Self { tx }
    }
}

impl TaskObserver for ChannelObserver {
    fn on_event(&self, event: &TaskEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn callbacks_route_by_event_kind() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
        let cb = Callbacks::new()
            .on_progress(move |_, p| l1.lock().expect("lock").push(format!("p{p}")))
            .on_error(move |_, code, _| l2.lock().expect("lock").push(code.to_string()))
            .on_cancelled(move |_| l3.lock().expect("lock").push("cancelled".to_string()));
        let id = TaskId::new();
        cb.on_event(&TaskEvent::Progress {
            task_id: id.clone(),
            percent: 30,
        });
        cb.on_event(&TaskEvent::Completed {
            task_id: id.clone(),
            output: TaskOutput::Text("x".to_string()),
        });
        cb.on_event(&TaskEvent::Failed {
            task_id: id.clone(),
            code: "E_X".to_string(),
            message: "m".to_string(),
        });
        cb.on_event(&TaskEvent::Cancelled { task_id: id });
        assert_eq!(*log.lock().expect("lock"), vec!["p30", "E_X", "cancelled"]);
    }
}
