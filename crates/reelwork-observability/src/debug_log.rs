//! Opt-in persistence of bulky diagnostics (process stderr tails, service
//! response bodies) next to the trace. Only active with
//! `REELWORK_DEBUG_VERBOSE=1`.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use sha2::{Digest, Sha256};

use crate::{env, metrics};

const DEFAULT_MAX_PAYLOAD_BYTES: usize = 2_000_000;
const DEFAULT_MAX_TASKS: usize = 50;
const TRUNCATED_SUFFIX: &[u8] = b"\n...(truncated)\n";

pub fn verbose_enabled() -> bool {
    env::bool_default_false("REELWORK_DEBUG_VERBOSE")
}

fn max_payload_bytes() -> usize {
    env::usize_or("REELWORK_DEBUG_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)
}

fn max_tasks() -> usize {
    env::usize_or("REELWORK_DEBUG_MAX_TASKS", DEFAULT_MAX_TASKS)
}

pub fn debug_root(data_dir: &Path) -> PathBuf {
    data_dir.join("debug")
}

pub fn debug_task_dir(data_dir: &Path, task_id: &str) -> PathBuf {
    debug_root(data_dir).join(task_id)
}

#[derive(Debug, Clone)]
pub struct PayloadInfo {
    pub path: PathBuf,
    pub bytes_written: usize,
    pub truncated: bool,
    pub sha256: String,
}

fn sha256_hex(b: &[u8]) -> String {
    hex::encode(Sha256::digest(b))
}

fn truncate_with_suffix(mut b: Vec<u8>, max_bytes: usize) -> (Vec<u8>, bool) {
    if b.len() <= max_bytes {
        return (b, false);
    }
    b.truncate(max_bytes.saturating_sub(TRUNCATED_SUFFIX.len()));
    b.extend_from_slice(TRUNCATED_SUFFIX);
    (b, true)
}

/// Write `bytes` under `debug/<task_id>/<filename>` regardless of the verbose
/// switch. Callers normally go through [`write_payload_best_effort`].
pub fn write_payload(
    data_dir: &Path,
    task_id: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Option<PayloadInfo> {
    let (out, truncated) = truncate_with_suffix(bytes, max_payload_bytes());
    let dir = debug_task_dir(data_dir, task_id);
    if let Err(e) = fs::create_dir_all(&dir) {
        crate::safe_eprintln!("debug_log: create_dir_all failed: {}: {e}", dir.display());
        return None;
    }
    let path = dir.join(filename);
    if let Err(e) = fs::write(&path, &out) {
        crate::safe_eprintln!("debug_log: write failed: {}: {e}", path.display());
        return None;
    }
    prune(data_dir);
    Some(PayloadInfo {
        path,
        bytes_written: out.len(),
        truncated,
        sha256: sha256_hex(&out),
    })
}

pub fn write_payload_best_effort(
    data_dir: &Path,
    task_id: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Option<PayloadInfo> {
    if !verbose_enabled() {
        return None;
    }
    write_payload(data_dir, task_id, filename, bytes)
}

pub fn emit_debug_event_best_effort(
    data_dir: &Path,
    event_type: &str,
    task_id: &str,
    info: &PayloadInfo,
    note: Option<String>,
) {
    if !verbose_enabled() {
        return;
    }
    let obj = serde_json::json!({
        "type": event_type,
        "ts_ms": env::now_ms(),
        "task_id": task_id,
        "payload_path": info.path.to_string_lossy(),
        "payload_bytes": info.bytes_written,
        "truncated": info.truncated,
        "sha256": info.sha256,
        "note": note,
    });
    if let Err(e) = metrics::append_jsonl(data_dir, &obj) {
        crate::safe_eprintln!("debug_log: metrics append failed: {e:#}");
    }
}

/// Keep only the newest `REELWORK_DEBUG_MAX_TASKS` task directories.
fn prune(data_dir: &Path) {
    let entries = match fs::read_dir(debug_root(data_dir)) {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut dirs: Vec<(SystemTime, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| {
            let modified = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();
    let keep = max_tasks();
    if dirs.len() <= keep {
        return;
    }
    dirs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, p) in dirs.into_iter().skip(keep) {
        if let Err(e) = fs::remove_dir_all(&p) {
            crate::safe_eprintln!("debug_log: remove_dir_all failed: {}: {e}", p.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_limit_and_marks_payload() {
        let (out, truncated) = truncate_with_suffix(vec![b'x'; 100], 40);
        assert!(truncated);
        assert_eq!(out.len(), 40);
        assert!(out.ends_with(TRUNCATED_SUFFIX));

        let (out, truncated) = truncate_with_suffix(vec![b'x'; 10], 40);
        assert!(!truncated);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn write_payload_records_hash() {
        let td = tempfile::tempdir().expect("tempdir");
        let info = write_payload(td.path(), "task-9", "stderr_tail.txt", b"hello".to_vec())
            .expect("payload");
        assert_eq!(
            info.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(std::fs::read(&info.path).expect("read"), b"hello");
    }
}
