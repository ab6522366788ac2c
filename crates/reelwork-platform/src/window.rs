//! Enumeration of top-level window titles.
//!
//! Titles are an untrusted, racy signal: a window may appear or vanish
//! between enumeration and use. Callers treat the result as a sample.

use anyhow::Result;

pub trait WindowTitleSource: Send {
    fn window_titles(&mut self) -> Result<Vec<String>>;
}

/// The desktop's visible top-level windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopWindows;

impl WindowTitleSource for DesktopWindows {
    fn window_titles(&mut self) -> Result<Vec<String>> {
        imp::list_titles()
    }
}

/// Case-insensitive substring match of any needle against any title.
pub fn any_title_contains(titles: &[String], needles: &[String]) -> bool {
    let needles: Vec<String> = needles
        .iter()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .collect();
    titles.iter().any(|t| {
        let t = t.to_lowercase();
        needles.iter().any(|n| t.contains(n.as_str()))
    })
}

#[cfg(windows)]
mod imp {
    use anyhow::{anyhow, Result};
    use windows_sys::Win32::Foundation::{GetLastError, HWND, LPARAM};
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowTextLengthW, GetWindowTextW, IsWindowVisible,
    };

    fn window_title(hwnd: HWND) -> Option<String> {
        let len = unsafe { GetWindowTextLengthW(hwnd) };
        if len <= 0 {
            return None;
        }
        let mut buf = vec![0u16; (len as usize) + 1];
        let n = unsafe { GetWindowTextW(hwnd, buf.as_mut_ptr(), buf.len() as i32) };
        if n <= 0 {
            return None;
        }
        buf.truncate(n as usize);
        let s = String::from_utf16_lossy(&buf).trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }

    unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> i32 {
        // SAFETY: lparam is the &mut Vec passed to EnumWindows below and
        // outlives the enumeration.
        let out = &mut *(lparam as *mut Vec<String>);
        if IsWindowVisible(hwnd) != 0 {
            if let Some(t) = window_title(hwnd) {
                out.push(t);
            }
        }
        1
    }

    pub fn list_titles() -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        let ok = unsafe { EnumWindows(Some(collect), &mut out as *mut Vec<String> as LPARAM) };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            return Err(anyhow!("EnumWindows failed: last_error={err}"));
        }
        Ok(out)
    }
}

#[cfg(not(windows))]
mod imp {
    use std::process::{Command, Stdio};

    use anyhow::{anyhow, Context, Result};

    /// `wmctrl -l` prints `<id> <desktop> <host> <title...>` per window.
    pub(super) fn parse_wmctrl(out: &str) -> Vec<String> {
        out.lines()
            .filter_map(|line| {
                let mut rest = line.trim_start();
                for _ in 0..3 {
                    let end = rest.find(char::is_whitespace)?;
                    rest = rest[end..].trim_start();
                }
                let title = rest.trim();
                if title.is_empty() {
                    None
                } else {
                    Some(title.to_string())
                }
            })
            .collect()
    }

    pub fn list_titles() -> Result<Vec<String>> {
        let out = Command::new("wmctrl")
            .arg("-l")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .context("wmctrl failed")?;
        if !out.status.success() {
            return Err(anyhow!("wmctrl exit={}", out.status));
        }
        Ok(parse_wmctrl(&String::from_utf8_lossy(&out.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn needle_match_is_case_insensitive_substring() {
        let titles = v(&["Inbox - Mail", "Zoom Meeting", "Terminal"]);
        assert!(any_title_contains(&titles, &v(&["zoom meeting"])));
        assert!(!any_title_contains(&titles, &v(&["Teams"])));
    }

    #[test]
    fn blank_needles_never_match() {
        let titles = v(&["anything"]);
        assert!(!any_title_contains(&titles, &v(&["", "   "])));
        assert!(!any_title_contains(&titles, &[]));
    }

    #[cfg(not(windows))]
    #[test]
    fn parses_wmctrl_listing() {
        let raw = "0x03c00003  0 host Zoom Meeting\n0x04000001 -1 host  \n0x04a00007  1 host  Mail - Inbox \n";
        assert_eq!(imp::parse_wmctrl(raw), v(&["Zoom Meeting", "Mail - Inbox"]));
    }
}
