//! The task runner: admission, per-task worker threads, event delivery and
//! terminal bookkeeping.
//!
//! All task records live in one registry behind one mutex. Resource claims
//! are checked and taken under that same lock, and every event is queued to
//! the dispatcher while it is held, so per-task event order is the order of
//! state changes and the terminal event is always the last one queued.

use std::{
    collections::{HashMap, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use reelwork_core::{
    OwnerId, ResourceKey, TaskError, TaskEvent, TaskId, TaskKind, TaskOutput, TaskState,
};
use reelwork_observability::{data_dir, debug_log, env, metrics, trace, Span};
use reelwork_storage::{history, HistoryRecord};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    observer::{ChannelObserver, TaskObserver},
    task::{Task, TaskContext},
};

const DEFAULT_RETAIN_FINISHED: usize = 256;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Trace, metrics and debug payload root.
    pub data_dir: PathBuf,
    /// Terminal tasks are journaled here when set.
    pub history_db: Option<PathBuf>,
    /// How many finished task records stay queryable in memory.
    pub retain_finished: usize,
}

impl SchedulerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            history_db: None,
            retain_finished: DEFAULT_RETAIN_FINISHED,
        }
    }

    /// `REELWORK_DATA_DIR` (or its default) with the history journal on.
    pub fn from_env() -> Self {
        Self {
            data_dir: data_dir::data_dir(),
            history_db: Some(data_dir::history_db_path()),
            retain_finished: DEFAULT_RETAIN_FINISHED,
        }
    }

    pub fn with_history(mut self, db: impl Into<PathBuf>) -> Self {
        self.history_db = Some(db.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    Failed(TaskError),
    Cancelled,
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    fn event(&self, task_id: &TaskId) -> TaskEvent {
        let task_id = task_id.clone();
        match self {
            TaskOutcome::Completed(output) => TaskEvent::Completed {
                task_id,
                output: output.clone(),
            },
            TaskOutcome::Failed(e) => TaskEvent::Failed {
                task_id,
                code: e.code().to_string(),
                message: e.to_string(),
            },
            TaskOutcome::Cancelled => TaskEvent::Cancelled { task_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    id: TaskId,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }
}

struct TaskRecord {
    kind: TaskKind,
    owner: OwnerId,
    resource: Option<ResourceKey>,
    describe: Value,
    state: TaskState,
    progress: u8,
    outcome: Option<TaskOutcome>,
    /// Terminal bookkeeping (history, metrics) is done.
    settled: bool,
    cancel: CancellationToken,
    finish: CancellationToken,
    pending: Option<Box<dyn Task>>,
    observers: Vec<Arc<dyn TaskObserver>>,
    created_at_ms: i64,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, TaskRecord>,
    claims: HashMap<ResourceKey, TaskId>,
    finished: VecDeque<TaskId>,
}

struct Dispatch {
    observers: Vec<Arc<dyn TaskObserver>>,
    event: TaskEvent,
}

/// Snapshot taken at the terminal transition, recorded outside the lock.
struct Terminal {
    id: TaskId,
    kind: TaskKind,
    owner: OwnerId,
    created_at_ms: i64,
    outcome: TaskOutcome,
}

struct Shared {
    cfg: SchedulerConfig,
    reg: Mutex<Registry>,
    changed: Condvar,
    dispatch: Sender<Dispatch>,
}

fn unknown(id: &TaskId) -> TaskError {
    TaskError::Internal(format!("unknown task {id}"))
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.reg.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn queue(&self, observers: Vec<Arc<dyn TaskObserver>>, event: TaskEvent) {
        if observers.is_empty() {
            return;
        }
        // Unbounded; only fails once the dispatcher is gone.
        let _ = self.dispatch.send(Dispatch { observers, event });
    }

    fn publish_progress(&self, id: &TaskId, percent: u8) {
        let mut reg = self.lock();
        let Some(rec) = reg.tasks.get_mut(id) else {
            return;
        };
        if rec.state != TaskState::Running {
            return;
        }
        rec.progress = percent;
        let observers = rec.observers.clone();
        self.queue(
            observers,
            TaskEvent::Progress {
                task_id: id.clone(),
                percent,
            },
        );
    }

    /// Pending -> Running. False when the task was cancelled first.
    fn begin_running(&self, id: &TaskId) -> bool {
        let mut reg = self.lock();
        let Some(rec) = reg.tasks.get_mut(id) else {
            return false;
        };
        if !rec.state.can_transition_to(TaskState::Running) {
            return false;
        }
        rec.state = TaskState::Running;
        self.changed.notify_all();
        true
    }

    fn transition_locked(
        &self,
        reg: &mut Registry,
        id: &TaskId,
        outcome: TaskOutcome,
    ) -> Option<Terminal> {
        let rec = reg.tasks.get_mut(id)?;
        if !rec.state.can_transition_to(outcome.state()) {
            return None;
        }
        rec.state = outcome.state();
        rec.outcome = Some(outcome.clone());
        rec.pending = None;
        let observers = std::mem::take(&mut rec.observers);
        let resource = rec.resource.clone();
        let terminal = Terminal {
            id: id.clone(),
            kind: rec.kind,
            owner: rec.owner.clone(),
            created_at_ms: rec.created_at_ms,
            outcome,
        };
        self.queue(observers, terminal.outcome.event(id));

        if let Some(r) = resource {
            if reg.claims.get(&r) == Some(id) {
                reg.claims.remove(&r);
            }
        }
        reg.finished.push_back(id.clone());
        while reg.finished.len() > self.cfg.retain_finished {
            if let Some(old) = reg.finished.pop_front() {
                reg.tasks.remove(&old);
            }
        }
        self.changed.notify_all();
        Some(terminal)
    }

    fn finish(&self, id: &TaskId, outcome: TaskOutcome) {
        let terminal = {
            let mut reg = self.lock();
            self.transition_locked(&mut reg, id, outcome)
        };
        if let Some(t) = terminal {
            self.settle(t);
        }
    }

    fn settle(&self, t: Terminal) {
        record_terminal(&self.cfg, &t);
        let mut reg = self.lock();
        if let Some(rec) = reg.tasks.get_mut(&t.id) {
            rec.settled = true;
        }
        self.changed.notify_all();
    }
}

fn record_terminal(cfg: &SchedulerConfig, t: &Terminal) {
    let (error_code, message, summary) = match &t.outcome {
        TaskOutcome::Completed(o) => (None, None, Some(o.summary())),
        TaskOutcome::Failed(e) => (Some(e.code().to_string()), Some(e.to_string()), None),
        TaskOutcome::Cancelled => (Some("E_CANCELLED".to_string()), None, None),
    };
    let status = t.outcome.state().as_str();

    trace::event(
        &cfg.data_dir,
        Some(t.id.as_str()),
        "Task",
        "TASK.terminal",
        status,
        Some(json!({
            "kind": t.kind.as_str(),
            "owner": t.owner.as_str(),
            "error_code": error_code,
            "message": message,
            "result": summary,
        })),
    );

    if let Err(e) = metrics::append_jsonl(
        &cfg.data_dir,
        &json!({
            "type": "task_event",
            "task_id": t.id.as_str(),
            "kind": t.kind.as_str(),
            "status": status,
            "error_code": error_code,
            "message": message,
            "elapsed_ms": env::now_ms() - t.created_at_ms,
        }),
    ) {
        reelwork_observability::safe_eprintln!("metrics append failed (task_event): {e:#}");
    }

    if let TaskOutcome::Failed(TaskError::ProcessFailed { exit_code, tail }) = &t.outcome {
        if let Some(info) = debug_log::write_payload_best_effort(
            &cfg.data_dir,
            t.id.as_str(),
            "diagnostic_tail.txt",
            tail.join("\n").into_bytes(),
        ) {
            debug_log::emit_debug_event_best_effort(
                &cfg.data_dir,
                "debug_process_tail",
                t.id.as_str(),
                &info,
                Some(format!("exit_code={exit_code}")),
            );
        }
    }

    if let Some(db) = &cfg.history_db {
        let rec = HistoryRecord {
            task_id: t.id.to_string(),
            kind: t.kind.as_str().to_string(),
            owner: t.owner.to_string(),
            state: status.to_string(),
            error_code,
            message,
            result_summary: summary,
            created_at_ms: t.created_at_ms,
            finished_at_ms: env::now_ms(),
        };
        if let Err(e) = history::append(db, &rec) {
            reelwork_observability::safe_eprintln!("history append failed: {e:#}");
        }
    }
}

fn panic_message(p: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = p.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

/// A task that comes back after cancellation is reported as cancelled,
/// whatever it returned.
fn classify(
    result: std::thread::Result<Result<TaskOutput, TaskError>>,
    ctx: &TaskContext,
) -> TaskOutcome {
    match result {
        Ok(Ok(_)) if ctx.is_cancelled() => TaskOutcome::Cancelled,
        Ok(Ok(out)) => TaskOutcome::Completed(out),
        Ok(Err(e)) if e.is_cancelled() || ctx.is_cancelled() => TaskOutcome::Cancelled,
        Ok(Err(e)) => TaskOutcome::Failed(e),
        Err(p) => TaskOutcome::Failed(TaskError::Internal(format!(
            "task panicked: {}",
            panic_message(p.as_ref())
        ))),
    }
}

fn run_worker(
    shared: Arc<Shared>,
    id: TaskId,
    kind: TaskKind,
    describe: Value,
    task: Box<dyn Task>,
    ctx: TaskContext,
) {
    if !shared.begin_running(&id) {
        return;
    }
    let span = Span::start(
        &shared.cfg.data_dir,
        Some(id.as_str()),
        "Task",
        &format!("TASK.run.{}", kind.as_str()),
        Some(describe),
    );
    let result = catch_unwind(AssertUnwindSafe(|| task.run(&ctx)));
    let outcome = classify(result, &ctx);
    match &outcome {
        TaskOutcome::Completed(o) => span.ok(Some(json!({ "result": o.summary() }))),
        TaskOutcome::Failed(e) => span.err("task", e.code(), &e.to_string(), None),
        TaskOutcome::Cancelled => span.skipped("cancelled", None),
    }
    shared.finish(&id, outcome);
}

fn dispatch_loop(rx: Receiver<Dispatch>) {
    for d in rx.iter() {
        for obs in &d.observers {
            if catch_unwind(AssertUnwindSafe(|| obs.on_event(&d.event))).is_err() {
                reelwork_observability::safe_eprintln!(
                    "scheduler: observer panicked on event for task {}",
                    d.event.task_id()
                );
            }
        }
    }
}

/// Runs tasks on their own threads and relays their events. Cheap to clone;
/// clones share the same registry.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Result<Self, TaskError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Dispatch>();
        std::thread::Builder::new()
            .name("task-dispatch".to_string())
            .spawn(move || dispatch_loop(rx))
            .map_err(|e| TaskError::io("spawn dispatcher thread", e))?;
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                reg: Mutex::new(Registry::default()),
                changed: Condvar::new(),
                dispatch: tx,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.cfg
    }

    /// Register a task as Pending and claim its resource. Nothing runs until
    /// [`Scheduler::launch`].
    pub fn enqueue(&self, task: Box<dyn Task>, owner: &OwnerId) -> Result<TaskHandle, TaskError> {
        let id = TaskId::new();
        let kind = task.kind();
        let resource = task.resource();
        let describe = task.describe();
        let data_dir = &self.shared.cfg.data_dir;

        let mut reg = self.shared.lock();
        if let Some(r) = &resource {
            if let Some(holder) = reg.claims.get(r) {
                let err = TaskError::ResourceBusy {
                    resource: r.to_string(),
                    holder: holder.to_string(),
                };
                drop(reg);
                trace::event(
                    data_dir,
                    None,
                    "Task",
                    "TASK.enqueue",
                    "err",
                    Some(json!({
                        "kind": kind.as_str(),
                        "owner": owner.as_str(),
                        "code": err.code(),
                        "message": err.to_string(),
                    })),
                );
                return Err(err);
            }
            reg.claims.insert(r.clone(), id.clone());
        }
        reg.tasks.insert(
            id.clone(),
            TaskRecord {
                kind,
                owner: owner.clone(),
                resource: resource.clone(),
                describe,
                state: TaskState::Pending,
                progress: 0,
                outcome: None,
                settled: false,
                cancel: CancellationToken::new(),
                finish: CancellationToken::new(),
                pending: Some(task),
                observers: Vec::new(),
                created_at_ms: env::now_ms(),
            },
        );
        drop(reg);

        trace::event(
            data_dir,
            Some(id.as_str()),
            "Task",
            "TASK.enqueue",
            "ok",
            Some(json!({
                "kind": kind.as_str(),
                "owner": owner.as_str(),
                "resource": resource.as_ref().map(ResourceKey::as_str),
            })),
        );
        Ok(TaskHandle { id })
    }

    /// Start the worker thread. Launching twice, or after a cancel, does
    /// nothing.
    pub fn launch(&self, handle: &TaskHandle) -> Result<(), TaskError> {
        let id = handle.id.clone();
        let (task, ctx, kind, describe) = {
            let mut reg = self.shared.lock();
            let rec = reg.tasks.get_mut(&id).ok_or_else(|| unknown(&id))?;
            let Some(task) = rec.pending.take() else {
                return Ok(());
            };
            let sink_shared = self.shared.clone();
            let ctx = TaskContext::new(
                id.clone(),
                self.shared.cfg.data_dir.clone(),
                rec.cancel.clone(),
                rec.finish.clone(),
                Arc::new(move |tid: &TaskId, p: u8| sink_shared.publish_progress(tid, p)),
            );
            (task, ctx, rec.kind, rec.describe.clone())
        };

        let shared = self.shared.clone();
        let worker_id = id.clone();
        let short: String = id.as_str().chars().take(8).collect();
        let spawned = std::thread::Builder::new()
            .name(format!("task-{short}"))
            .spawn(move || run_worker(shared, worker_id, kind, describe, task, ctx));
        if let Err(e) = spawned {
            let err = TaskError::io("spawn task thread", e);
            self.shared.begin_running(&id);
            self.shared.finish(&id, TaskOutcome::Failed(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Enqueue and launch in one step. Returns without waiting for the task.
    pub fn submit(&self, task: Box<dyn Task>, owner: &OwnerId) -> Result<TaskHandle, TaskError> {
        let h = self.enqueue(task, owner)?;
        self.launch(&h)?;
        Ok(h)
    }

    /// Request cancellation. A Pending task is cancelled on the spot; a
    /// Running task sees its token and stops at its next checkpoint.
    pub fn cancel(&self, handle: &TaskHandle) -> Result<(), TaskError> {
        let terminal = {
            let mut reg = self.shared.lock();
            let rec = reg.tasks.get_mut(&handle.id).ok_or_else(|| unknown(&handle.id))?;
            rec.cancel.cancel();
            if rec.state == TaskState::Pending {
                self.shared
                    .transition_locked(&mut reg, &handle.id, TaskOutcome::Cancelled)
            } else {
                None
            }
        };
        trace::event(
            &self.shared.cfg.data_dir,
            Some(handle.id.as_str()),
            "Task",
            "TASK.cancel_requested",
            "ok",
            Some(json!({ "was_pending": terminal.is_some() })),
        );
        if let Some(t) = terminal {
            self.shared.settle(t);
        }
        Ok(())
    }

    /// Ask a long-running task to wrap up and complete with its result.
    pub fn request_finish(&self, handle: &TaskHandle) -> Result<(), TaskError> {
        let reg = self.shared.lock();
        let rec = reg.tasks.get(&handle.id).ok_or_else(|| unknown(&handle.id))?;
        if !rec.state.is_terminal() {
            rec.finish.cancel();
        }
        Ok(())
    }

    /// Cancel every live task of `owner`. Returns how many were signalled.
    pub fn cancel_owned(&self, owner: &OwnerId) -> usize {
        let live: Vec<TaskHandle> = {
            let reg = self.shared.lock();
            reg.tasks
                .iter()
                .filter(|(_, r)| &r.owner == owner && !r.state.is_terminal())
                .map(|(id, _)| TaskHandle { id: id.clone() })
                .collect()
        };
        for h in &live {
            let _ = self.cancel(h);
        }
        live.len()
    }

    /// Observe a task. Subscribing after the task has finished replays its
    /// terminal event; earlier events are not replayed.
    pub fn subscribe(
        &self,
        handle: &TaskHandle,
        observer: Arc<dyn TaskObserver>,
    ) -> Result<(), TaskError> {
        let mut reg = self.shared.lock();
        let rec = reg.tasks.get_mut(&handle.id).ok_or_else(|| unknown(&handle.id))?;
        match &rec.outcome {
            Some(o) => {
                let ev = o.event(&handle.id);
                self.shared.queue(vec![observer], ev);
            }
            None => rec.observers.push(observer),
        }
        Ok(())
    }

    pub fn events(&self, handle: &TaskHandle) -> Result<Receiver<TaskEvent>, TaskError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribe(handle, Arc::new(ChannelObserver::new(tx)))?;
        Ok(rx)
    }

    pub fn state(&self, handle: &TaskHandle) -> Option<TaskState> {
        self.shared.lock().tasks.get(&handle.id).map(|r| r.state)
    }

    pub fn progress(&self, handle: &TaskHandle) -> Option<u8> {
        self.shared.lock().tasks.get(&handle.id).map(|r| r.progress)
    }

    pub fn outcome(&self, handle: &TaskHandle) -> Option<TaskOutcome> {
        self.shared
            .lock()
            .tasks
            .get(&handle.id)
            .and_then(|r| r.outcome.clone())
    }

    /// Block until the task is terminal and its bookkeeping is written, or
    /// until `timeout`.
    pub fn wait(&self, handle: &TaskHandle, timeout: Duration) -> Option<TaskOutcome> {
        let reg = self.shared.lock();
        let (reg, _) = self
            .shared
            .changed
            .wait_timeout_while(reg, timeout, |reg| {
                reg.tasks
                    .get(&handle.id)
                    .map(|r| !r.settled)
                    .unwrap_or(false)
            })
            .unwrap_or_else(|p| p.into_inner());
        reg.tasks.get(&handle.id).and_then(|r| r.outcome.clone())
    }

    /// Block until every task is terminal and settled. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let reg = self.shared.lock();
        let (_reg, res) = self
            .shared
            .changed
            .wait_timeout_while(reg, timeout, |reg| reg.tasks.values().any(|r| !r.settled))
            .unwrap_or_else(|p| p.into_inner());
        !res.timed_out()
    }

    /// Tasks not yet terminal.
    pub fn active_count(&self) -> usize {
        self.shared
            .lock()
            .tasks
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    pub fn holder_of(&self, resource: &ResourceKey) -> Option<TaskId> {
        self.shared.lock().claims.get(resource).cloned()
    }
}
