//! Append-only JSONL trace of task and supervisor activity.
//!
//! Every record is one line in `<data_dir>/trace.jsonl`. The file is rotated
//! by size (`trace.jsonl.1` .. `trace.jsonl.N`). Writes are serialized through
//! a process-wide lock so concurrent task threads never interleave lines.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::Instant,
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::env;

const DEFAULT_MAX_BYTES: u64 = 10_000_000;
const DEFAULT_MAX_FILES: usize = 5;
const BACKTRACE_MAX_CHARS: usize = 12_000;

pub fn enabled() -> bool {
    env::bool_default_true("REELWORK_TRACE_ENABLED")
}

fn backtrace_enabled() -> bool {
    env::bool_default_true("REELWORK_TRACE_BACKTRACE")
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join("trace.jsonl")
}

fn rotated_path(data_dir: &Path, n: usize) -> PathBuf {
    data_dir.join(format!("trace.jsonl.{n}"))
}

fn rotate_if_needed(data_dir: &Path) {
    let max_files = env::usize_or("REELWORK_TRACE_MAX_FILES", DEFAULT_MAX_FILES);
    if max_files == 0 {
        return;
    }
    let current = trace_path(data_dir);
    let len = match std::fs::metadata(&current) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if len <= env::u64_or("REELWORK_TRACE_MAX_BYTES", DEFAULT_MAX_BYTES) {
        return;
    }

    // Drop the oldest first; rename onto an existing file fails on Windows.
    let _ = std::fs::remove_file(rotated_path(data_dir, max_files));
    for i in (1..max_files).rev() {
        let src = rotated_path(data_dir, i);
        if src.exists() {
            let _ = std::fs::rename(&src, rotated_path(data_dir, i + 1));
        }
    }
    let _ = std::fs::rename(&current, rotated_path(data_dir, 1));
}

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    if !enabled() {
        return;
    }
    let mut line = match serde_json::to_string(ev) {
        Ok(s) => s,
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };
    line.push('\n');

    // A panicking writer must not poison tracing for every other thread.
    let _guard = write_lock().lock().unwrap_or_else(|p| p.into_inner());
    let _ = std::fs::create_dir_all(data_dir);
    rotate_if_needed(data_dir);

    let p = trace_path(data_dir);
    let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
        Ok(f) => f,
        Err(e) => {
            crate::safe_eprintln!("trace: open failed: {}: {e}", p.display());
            return;
        }
    };
    if let Err(e) = f.write_all(line.as_bytes()) {
        crate::safe_eprintln!("trace: write failed: {e}");
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

/// Replace the user segment of home-directory paths with `<redacted>`.
pub fn redact_user_paths(s: &str) -> String {
    fn scrub(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut rest = hay;
        while let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos + marker.len()]);
            out.push_str("<redacted>");
            let after = &rest[pos + marker.len()..];
            let end = after.find(sep).unwrap_or(after.len());
            rest = &after[end..];
        }
        out.push_str(rest);
        out
    }

    let t = scrub(s, "\\Users\\", '\\');
    let t = scrub(&t, "/Users/", '/');
    scrub(&t, "/home/", '/')
}

fn backtrace_string() -> Option<String> {
    if !backtrace_enabled() {
        return None;
    }
    let bt = std::backtrace::Backtrace::force_capture();
    Some(clamp_chars(
        &redact_user_paths(&format!("{bt:?}")),
        BACKTRACE_MAX_CHARS,
    ))
}

fn merge_ctx(mut base: Map<String, Value>, extra: Option<Value>) -> Value {
    match extra {
        None => {}
        Some(Value::Object(m)) => base.extend(m),
        Some(v) => {
            base.insert("extra".to_string(), v);
        }
    }
    Value::Object(base)
}

fn ctx_with_backtrace(extra: Option<Value>) -> Option<Value> {
    match backtrace_string() {
        Some(bt) => {
            let mut m = Map::new();
            m.insert("backtrace".to_string(), Value::String(bt));
            Some(merge_ctx(m, extra))
        }
        None => extra,
    }
}

fn ctx_for_anyhow(err: &AnyhowError, extra: Option<Value>) -> Value {
    let mut m = Map::new();
    let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
    m.insert("err_chain".to_string(), serde_json::json!(chain));
    if let Some(bt) = backtrace_string() {
        m.insert("backtrace".to_string(), Value::String(bt));
    }
    merge_ctx(m, extra)
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String, // process|service|io|logic|internal
    pub code: String, // E_*
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub task_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

impl TraceEvent {
    fn new(task_id: Option<&str>, stage: &str, step_id: &str, op: &str, status: &str) -> Self {
        Self {
            ts_ms: env::now_ms(),
            task_id: task_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: op.to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx: None,
        }
    }
}

pub fn event(
    data_dir: &Path,
    task_id: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    let mut ev = TraceEvent::new(task_id, stage, step_id, "event", status);
    ev.ctx = ctx;
    emit_best_effort(data_dir, &ev);
}

/// Start/end pair around one step. Dropping a span without calling one of
/// the finishing methods records it as `aborted`.
pub struct Span {
    data_dir: PathBuf,
    task_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        task_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let mut ev = TraceEvent::new(task_id, stage, step_id, "start", "ok");
        ev.ctx = ctx;
        emit_best_effort(data_dir, &ev);
        Self {
            data_dir: data_dir.to_path_buf(),
            task_id: task_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        }
    }

    fn finish(&mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        let mut ev = TraceEvent::new(
            self.task_id.as_deref(),
            &self.stage,
            &self.step_id,
            "end",
            status,
        );
        ev.duration_ms = Some(self.t0.elapsed().as_millis());
        ev.error = error;
        ev.ctx = ctx;
        emit_best_effort(&self.data_dir, &ev);
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.finish("ok", None, ctx);
    }

    pub fn skipped(mut self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.finish("skipped", Some(error), ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.finish("err", Some(error), ctx_with_backtrace(ctx));
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.finish("err", Some(error), Some(ctx_for_anyhow(err, ctx)));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        let ctx = ctx_with_backtrace(None);
        self.finish("aborted", Some(error), ctx);
    }
}
