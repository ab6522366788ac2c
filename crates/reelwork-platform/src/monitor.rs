//! Monitor bounds in virtual-desktop coordinates.

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Whether screen grabbing picks a monitor by cropping the desktop to its
/// bounds. macOS selects the screen device by name instead.
pub fn selects_by_bounds() -> bool {
    !cfg!(target_os = "macos")
}

/// All monitors, the primary first.
pub fn list_monitors() -> Result<Vec<MonitorRect>> {
    imp::list()
}

pub fn monitor_rect(index: u32) -> Result<MonitorRect> {
    let all = list_monitors()?;
    all.get(index as usize).copied().ok_or_else(|| {
        anyhow!("E_MONITOR_NOT_FOUND: monitor {index} not found ({} connected)", all.len())
    })
}

/// Windows hands monitors out in no particular order; the primary is the one
/// at the origin.
#[cfg_attr(not(windows), allow(dead_code))]
fn primary_first(mut v: Vec<MonitorRect>) -> Vec<MonitorRect> {
    v.sort_by_key(|m| (!(m.x == 0 && m.y == 0), m.x, m.y));
    v
}

/// `W/mmxH/mm+X+Y` from `xrandr --listmonitors`.
fn parse_xrandr_geometry(s: &str) -> Option<MonitorRect> {
    let (w, rest) = s.split_once('x')?;
    let width: u32 = w.split('/').next()?.parse().ok()?;
    let (h, rest) = rest.split_once('/')?;
    let height: u32 = h.parse().ok()?;
    let off = rest.find(|c| c == '+' || c == '-')?;
    // "+1920+0", "+-1280+56", "-1280+56"
    let offsets = rest[off..].replace('-', "+-");
    let mut nums = offsets.split('+').filter(|t| !t.is_empty());
    let x: i32 = nums.next()?.parse().ok()?;
    let y: i32 = nums.next()?.parse().ok()?;
    Some(MonitorRect {
        x,
        y,
        width,
        height,
    })
}

/// ```text
/// Monitors: 2
///  0: +*eDP-1 1920/344x1080/194+0+0  eDP-1
///  1: +HDMI-1 2560/597x1440/336+1920+0  HDMI-1
/// ```
pub(crate) fn parse_xrandr_monitors(out: &str) -> Vec<MonitorRect> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            parts.next().filter(|idx| idx.ends_with(':'))?;
            parts.next()?;
            parse_xrandr_geometry(parts.next()?)
        })
        .collect()
}

#[cfg(windows)]
mod imp {
    use anyhow::{anyhow, Result};
    use windows_sys::Win32::Foundation::{LPARAM, RECT};
    use windows_sys::Win32::Graphics::Gdi::{EnumDisplayMonitors, HDC, HMONITOR};

    use super::MonitorRect;

    unsafe extern "system" fn collect(
        _monitor: HMONITOR,
        _dc: HDC,
        rect: *mut RECT,
        lparam: LPARAM,
    ) -> i32 {
        // SAFETY: lparam is the &mut Vec passed to EnumDisplayMonitors below.
        let out = &mut *(lparam as *mut Vec<MonitorRect>);
        if let Some(r) = rect.as_ref() {
            out.push(MonitorRect {
                x: r.left,
                y: r.top,
                width: (r.right - r.left).max(0) as u32,
                height: (r.bottom - r.top).max(0) as u32,
            });
        }
        1
    }

    pub fn list() -> Result<Vec<MonitorRect>> {
        let mut out: Vec<MonitorRect> = Vec::new();
        let ok = unsafe {
            EnumDisplayMonitors(
                std::ptr::null_mut(),
                std::ptr::null(),
                Some(collect),
                &mut out as *mut Vec<MonitorRect> as LPARAM,
            )
        };
        if ok == 0 {
            return Err(anyhow!("EnumDisplayMonitors failed"));
        }
        Ok(super::primary_first(out))
    }
}

#[cfg(all(not(windows), not(target_os = "macos")))]
mod imp {
    use std::process::{Command, Stdio};

    use anyhow::{anyhow, Context, Result};

    use super::MonitorRect;

    pub fn list() -> Result<Vec<MonitorRect>> {
        let out = Command::new("xrandr")
            .arg("--listmonitors")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .context("xrandr failed")?;
        if !out.status.success() {
            return Err(anyhow!("xrandr exit={}", out.status));
        }
        Ok(super::parse_xrandr_monitors(&String::from_utf8_lossy(&out.stdout)))
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use anyhow::{anyhow, Result};

    use super::MonitorRect;

    pub fn list() -> Result<Vec<MonitorRect>> {
        Err(anyhow!("monitor bounds are not used on macOS"))
    }
}
