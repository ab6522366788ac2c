use std::path::Path;

use anyhow::{Context, Result};
use reelwork_observability::Span;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// One finished task. Written once, when the task reaches its terminal
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub task_id: String,
    pub kind: String,
    pub owner: String,
    pub state: String, // completed|failed|cancelled
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub result_summary: Option<String>,
    pub created_at_ms: i64,
    pub finished_at_ms: i64,
}

const SELECT_COLUMNS: &str = "task_id, kind, owner, state, error_code, message, result_summary, created_at_ms, finished_at_ms";

fn conn(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let c = Connection::open(db_path).context("open sqlite failed")?;
    c.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS task_history (
          task_id TEXT PRIMARY KEY,
          kind TEXT NOT NULL,
          owner TEXT NOT NULL,
          state TEXT NOT NULL,
          error_code TEXT NULL,
          message TEXT NULL,
          result_summary TEXT NULL,
          created_at_ms INTEGER NOT NULL,
          finished_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_history_finished ON task_history(finished_at_ms DESC);
        "#,
    )
    .context("init sqlite schema failed")?;
    Ok(c)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        task_id: row.get(0)?,
        kind: row.get(1)?,
        owner: row.get(2)?,
        state: row.get(3)?,
        error_code: row.get(4)?,
        message: row.get(5)?,
        result_summary: row.get(6)?,
        created_at_ms: row.get(7)?,
        finished_at_ms: row.get(8)?,
    })
}

fn data_dir_of(db_path: &Path) -> &Path {
    db_path.parent().unwrap_or_else(|| Path::new("."))
}

pub fn append(db_path: &Path, rec: &HistoryRecord) -> Result<()> {
    let span = Span::start(
        data_dir_of(db_path),
        Some(rec.task_id.as_str()),
        "History",
        "HISTORY.append",
        Some(serde_json::json!({"kind": rec.kind, "state": rec.state})),
    );
    let c = match conn(db_path) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_HISTORY_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    let r = c.execute(
        r#"
        INSERT OR REPLACE INTO task_history
        (task_id, kind, owner, state, error_code, message, result_summary, created_at_ms, finished_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            rec.task_id,
            rec.kind,
            rec.owner,
            rec.state,
            rec.error_code,
            rec.message,
            rec.result_summary,
            rec.created_at_ms,
            rec.finished_at_ms,
        ],
    );
    match r {
        Ok(_) => {
            span.ok(None);
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_HISTORY_INSERT", &e.to_string(), None);
            Err(anyhow::anyhow!(e).context("insert history failed"))
        }
    }
}

/// Newest first. `before_ms` pages backwards by finish time.
pub fn list(db_path: &Path, limit: i64, before_ms: Option<i64>) -> Result<Vec<HistoryRecord>> {
    let span = Span::start(
        data_dir_of(db_path),
        None,
        "History",
        "HISTORY.list",
        Some(serde_json::json!({"limit": limit, "before_ms": before_ms})),
    );
    let c = match conn(db_path) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_HISTORY_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM task_history WHERE finished_at_ms < ?1 ORDER BY finished_at_ms DESC LIMIT ?2"
    );
    let mut stmt = c.prepare(&sql).context("prepare history list failed")?;
    let before = before_ms.unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(params![before, limit], from_row)
        .context("query history list failed")?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.context("read history row failed")?);
    }
    span.ok(Some(serde_json::json!({"items": out.len()})));
    Ok(out)
}

pub fn get(db_path: &Path, task_id: &str) -> Result<Option<HistoryRecord>> {
    let c = conn(db_path)?;
    let sql = format!("SELECT {SELECT_COLUMNS} FROM task_history WHERE task_id = ?1");
    let mut stmt = c.prepare(&sql).context("prepare history get failed")?;
    let mut rows = stmt
        .query_map(params![task_id], from_row)
        .context("query history get failed")?;
    match rows.next() {
        Some(r) => Ok(Some(r.context("read history row failed")?)),
        None => Ok(None),
    }
}

pub fn clear(db_path: &Path) -> Result<()> {
    let span = Span::start(data_dir_of(db_path), None, "History", "HISTORY.clear", None);
    let c = match conn(db_path) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_HISTORY_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    match c.execute("DELETE FROM task_history", []) {
        Ok(_) => {
            span.ok(None);
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_HISTORY_CLEAR", &e.to_string(), None);
            Err(anyhow::anyhow!(e).context("clear history failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, finished_at_ms: i64, state: &str) -> HistoryRecord {
        HistoryRecord {
            task_id: id.to_string(),
            kind: "transcode".to_string(),
            owner: "ui".to_string(),
            state: state.to_string(),
            error_code: None,
            message: None,
            result_summary: Some("/tmp/out.wav".to_string()),
            created_at_ms: finished_at_ms - 10,
            finished_at_ms,
        }
    }

    #[test]
    fn list_is_newest_first_and_pages_backwards() {
        std::env::set_var("REELWORK_TRACE_ENABLED", "0");
        let td = tempfile::tempdir().expect("tempdir");
        let db = td.path().join("history.sqlite3");
        append(&db, &rec("a", 100, "completed")).expect("append a");
        append(&db, &rec("b", 200, "failed")).expect("append b");
        append(&db, &rec("c", 300, "cancelled")).expect("append c");

        let all = list(&db, 10, None).expect("list");
        let ids: Vec<&str> = all.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let page = list(&db, 1, Some(300)).expect("page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].task_id, "b");
    }

    #[test]
    fn get_and_clear() {
        std::env::set_var("REELWORK_TRACE_ENABLED", "0");
        let td = tempfile::tempdir().expect("tempdir");
        let db = td.path().join("history.sqlite3");
        let mut r = rec("x", 50, "failed");
        r.error_code = Some("E_PROCESS_FAILED".to_string());
        append(&db, &r).expect("append");
        assert_eq!(get(&db, "x").expect("get"), Some(r));
        assert_eq!(get(&db, "missing").expect("get"), None);

        clear(&db).expect("clear");
        assert!(list(&db, 10, None).expect("list").is_empty());
    }
}
