//! Locating the external media tool (ffmpeg).

use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub const FFMPEG_ENV: &str = "REELWORK_FFMPEG";

/// `REELWORK_FFMPEG` when set, otherwise `ffmpeg` resolved through `PATH` at
/// spawn time. An explicit path that does not exist is an error here so the
/// caller can report it before starting work.
pub fn resolve_ffmpeg() -> Result<PathBuf> {
    resolve_tool(FFMPEG_ENV, "ffmpeg")
}

pub fn resolve_tool(env_key: &str, default_name: &str) -> Result<PathBuf> {
    if let Some(raw) = reelwork_observability::env::string(env_key) {
        let p = PathBuf::from(raw.trim());
        if p.exists() {
            return Ok(p);
        }
        return Err(anyhow!(
            "E_TOOL_NOT_FOUND: {} points to missing file: {}",
            env_key,
            p.display()
        ));
    }
    Ok(PathBuf::from(default_name))
}

/// Platform screen-grab input for ffmpeg: (`-f` format, `-i` input).
/// On Windows and X11 the input is the whole desktop; a single monitor is
/// selected by cropping to its bounds (see [`crate::monitor`]).
pub fn screen_grab_input(monitor: u32) -> (&'static str, String) {
    if cfg!(windows) {
        ("gdigrab", "desktop".to_string())
    } else if cfg!(target_os = "macos") {
        ("avfoundation", format!("Capture screen {monitor}:none"))
    } else {
        let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
        ("x11grab", display)
    }
}
