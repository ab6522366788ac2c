use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use reelwork_core::{ProgressTracker, ResourceKey, TaskError, TaskId, TaskKind, TaskOutput};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// One unit of background work. The scheduler runs it on a dedicated thread
/// and turns its return value into exactly one terminal event.
pub trait Task: Send + 'static {
    fn kind(&self) -> TaskKind;

    /// Exclusive resource this task needs while it runs, if any.
    fn resource(&self) -> Option<ResourceKey> {
        None
    }

    /// Trace context describing the configuration.
    fn describe(&self) -> Value {
        Value::Null
    }

    fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError>;
}

pub(crate) type ProgressSink = Arc<dyn Fn(&TaskId, u8) + Send + Sync>;

/// What a running task may see of its surroundings.
pub struct TaskContext {
    task_id: TaskId,
    data_dir: PathBuf,
    cancel: CancellationToken,
    finish: CancellationToken,
    tracker: Mutex<ProgressTracker>,
    sink: ProgressSink,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        data_dir: PathBuf,
        cancel: CancellationToken,
        finish: CancellationToken,
        sink: ProgressSink,
    ) -> Self {
        Self {
            task_id,
            data_dir,
            cancel,
            finish,
            tracker: Mutex::new(ProgressTracker::new()),
            sink,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Report progress. Values are clamped to [0,100]; anything that does not
    /// move progress forward is dropped.
    pub fn progress(&self, percent: i64) {
        let next = {
            let mut t = self.tracker.lock().unwrap_or_else(|p| p.into_inner());
            t.advance(percent)
        };
        if let Some(p) = next {
            (self.sink)(&self.task_id, p);
        }
    }

    pub fn current_progress(&self) -> u8 {
        self.tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .current()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A graceful stop was requested: end the work and complete with what
    /// has been produced so far.
    pub fn finish_requested(&self) -> bool {
        self.finish.is_cancelled()
    }

    /// Root for trace and debug payloads.
    pub fn trace_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Write `bytes` so that `path` only ever holds a complete, synced file.
pub fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), TaskError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| TaskError::io(format!("create {}", parent.display()), e))?;
        }
    }
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    {
        let mut f = fs::File::create(&part)
            .map_err(|e| TaskError::io(format!("create {}", part.display()), e))?;
        f.write_all(bytes)
            .map_err(|e| TaskError::io(format!("write {}", part.display()), e))?;
        f.sync_all()
            .map_err(|e| TaskError::io(format!("sync {}", part.display()), e))?;
    }
    fs::rename(&part, path).map_err(|e| {
        let _ = fs::remove_file(&part);
        TaskError::io(format!("rename to {}", path.display()), e)
    })
}

/// Flush a file another process produced before handing its path out.
pub fn sync_existing(path: &Path) -> Result<(), TaskError> {
    let f = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| TaskError::io(format!("open {}", path.display()), e))?;
    f.sync_all()
        .map_err(|e| TaskError::io(format!("sync {}", path.display()), e))
}

/// Fresh location for an artifact when the caller did not choose one.
pub fn temp_artifact_path(task_id: &TaskId, ext: &str) -> PathBuf {
    let ext = ext.trim_start_matches('.');
    std::env::temp_dir()
        .join("reelwork")
        .join(format!("{}.{}", task_id.as_str(), ext))
}

#[cfg(test)]
pub(crate) fn test_context(data_dir: &Path) -> (TaskContext, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s2 = seen.clone();
    let ctx = TaskContext::new(
        TaskId::new(),
        data_dir.to_path_buf(),
        CancellationToken::new(),
        CancellationToken::new(),
        Arc::new(move |_id: &TaskId, p: u8| s2.lock().expect("lock").push(p)),
    );
    (ctx, seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_progress_is_monotonic() {
        let td = tempfile::tempdir().expect("tempdir");
        let (ctx, seen) = test_context(td.path());
        for p in [0, 10, 10, 5, 40, 120, 100] {
            ctx.progress(p);
        }
        assert_eq!(*seen.lock().expect("lock"), vec![0, 10, 40, 100]);
        assert_eq!(ctx.current_progress(), 100);
    }

    #[test]
    fn write_artifact_leaves_no_part_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let out = td.path().join("nested").join("speech.mp3");
        write_artifact(&out, b"ID3").expect("write");
        assert_eq!(fs::read(&out).expect("read"), b"ID3");
        assert!(!td.path().join("nested").join("speech.mp3.part").exists());
        sync_existing(&out).expect("sync");
    }

    #[test]
    fn temp_artifact_path_uses_task_id() {
        let id = TaskId::new();
        let p = temp_artifact_path(&id, ".wav");
        assert!(p.to_string_lossy().ends_with(&format!("{}.wav", id.as_str())));
    }
}
