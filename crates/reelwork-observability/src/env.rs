use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn is_falsy(v: &str) -> bool {
    let t = v.trim().to_ascii_lowercase();
    t == "0" || t == "false" || t == "no" || t == "off"
}

fn is_truthy(v: &str) -> bool {
    let t = v.trim().to_ascii_lowercase();
    t == "1" || t == "true" || t == "yes" || t == "on"
}

/// Unset means enabled; only an explicit falsy value turns it off.
pub fn bool_default_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => !is_falsy(&v),
        Err(_) => true,
    }
}

/// Unset means disabled; only an explicit truthy value turns it on.
pub fn bool_default_false(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => is_truthy(&v),
        Err(_) => false,
    }
}

pub fn u64_or(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn usize_or(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

/// Non-empty trimmed value, if any.
pub fn string(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    Some(t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_parsing() {
        assert!(is_falsy(" Off "));
        assert!(is_falsy("0"));
        assert!(!is_falsy("yes"));
        assert!(is_truthy("TRUE"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn numeric_fallbacks() {
        std::env::set_var("REELWORK_TEST_U64_BAD", "abc");
        assert_eq!(u64_or("REELWORK_TEST_U64_BAD", 7), 7);
        std::env::set_var("REELWORK_TEST_U64_OK", " 42 ");
        assert_eq!(u64_or("REELWORK_TEST_U64_OK", 7), 42);
        assert_eq!(usize_or("REELWORK_TEST_USIZE_MISSING", 3), 3);
        std::env::remove_var("REELWORK_TEST_U64_BAD");
        std::env::remove_var("REELWORK_TEST_U64_OK");
    }
}
