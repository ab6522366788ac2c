use std::path::PathBuf;

use crate::env;

pub const DATA_DIR_ENV: &str = "REELWORK_DATA_DIR";

/// Root for trace, metrics, debug payloads and the history journal.
/// `REELWORK_DATA_DIR` wins; otherwise a per-user directory under the system
/// temp dir.
pub fn data_dir() -> PathBuf {
    if let Some(p) = env::string(DATA_DIR_ENV) {
        return PathBuf::from(p);
    }
    std::env::temp_dir().join("reelwork-data")
}

pub fn history_db_path() -> PathBuf {
    data_dir().join("history.sqlite3")
}
