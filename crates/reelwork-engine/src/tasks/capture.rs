use std::{path::PathBuf, time::Duration};

use reelwork_core::{ResourceKey, TaskError, TaskKind, TaskOutput};
use reelwork_platform::{media_tool, monitor, CommandSpec, MonitorRect, ProcessHandle};
use serde_json::{json, Value};

use super::{exit_to_result, resolve_ffmpeg, supervise, ProcessEnd, DEFAULT_GRACE};
use crate::task::{sync_existing, Task, TaskContext};

/// Capture area. `CaptureConfig::region` is relative to the monitor;
/// `CaptureConfig::geometry` is in desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl From<MonitorRect> for Region {
    fn from(m: MonitorRect) -> Self {
        Self {
            x: m.x,
            y: m.y,
            width: m.width,
            height: m.height,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub monitor: u32,
    pub output: PathBuf,
    pub framerate: u32,
    pub region: Option<Region>,
    /// Monitor bounds; looked up from the desktop when unset.
    pub geometry: Option<Region>,
    pub video_codec: String,
    pub preset: Option<String>,
    pub grace: Duration,
    /// Overrides `REELWORK_FFMPEG`/PATH lookup.
    pub ffmpeg: Option<PathBuf>,
}

impl CaptureConfig {
    pub fn new(monitor: u32, output: impl Into<PathBuf>) -> Self {
        Self {
            monitor,
            output: output.into(),
            framerate: 30,
            region: None,
            geometry: None,
            video_codec: "libx264".to_string(),
            preset: Some("ultrafast".to_string()),
            grace: DEFAULT_GRACE,
            ffmpeg: None,
        }
    }
}

/// ffmpeg arguments for one screen recording, output path last. `bounds` is
/// the monitor's desktop rectangle on platforms that crop to select it.
pub fn capture_args(cfg: &CaptureConfig, bounds: Option<Region>) -> Vec<String> {
    let (format, input) = media_tool::screen_grab_input(cfg.monitor);
    let mut a: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "warning", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    a.extend(["-f".to_string(), format.to_string()]);
    a.extend(["-framerate".to_string(), cfg.framerate.to_string()]);

    let area = match (bounds, cfg.region) {
        (Some(b), Some(r)) => Some(Region {
            x: b.x + r.x,
            y: b.y + r.y,
            ..r
        }),
        (Some(b), None) => Some(b),
        (None, r) => r,
    };
    let mut input = input;
    if let Some(r) = area {
        a.extend(["-video_size".to_string(), format!("{}x{}", r.width, r.height)]);
        match format {
            "gdigrab" => {
                a.extend(["-offset_x".to_string(), r.x.to_string()]);
                a.extend(["-offset_y".to_string(), r.y.to_string()]);
            }
            "x11grab" => input = format!("{input}+{},{}", r.x, r.y),
            _ => {}
        }
    }
    a.extend(["-i".to_string(), input]);
    a.extend(["-c:v".to_string(), cfg.video_codec.clone()]);
    if let Some(p) = &cfg.preset {
        a.extend(["-preset".to_string(), p.clone()]);
    }
    a.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
    a.push(cfg.output.display().to_string());
    a
}

/// Screen recording of one monitor. Runs until a finish request (completes
/// with the file) or a cancel.
pub struct CaptureTask {
    cfg: CaptureConfig,
}

impl CaptureTask {
    pub fn new(cfg: CaptureConfig) -> Self {
        Self { cfg }
    }
}

impl Task for CaptureTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Capture
    }

    fn resource(&self) -> Option<ResourceKey> {
        Some(ResourceKey::monitor(self.cfg.monitor))
    }

    fn describe(&self) -> Value {
        json!({
            "monitor": self.cfg.monitor,
            "framerate": self.cfg.framerate,
            "codec": self.cfg.video_codec,
            "region": self.cfg.region.map(|r| format!("{}x{}+{},{}", r.width, r.height, r.x, r.y)),
            "output": reelwork_observability::trace::redact_user_paths(&self.cfg.output.display().to_string()),
        })
    }

    fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let cfg = self.cfg;
        let program = resolve_ffmpeg(cfg.ffmpeg.as_deref())?;
        let bounds = match cfg.geometry {
            Some(g) => Some(g),
            None if monitor::selects_by_bounds() => {
                let m = monitor::monitor_rect(cfg.monitor).map_err(|e| TaskError::Spawn {
                    program: "ffmpeg".to_string(),
                    not_found: false,
                    message: format!("{e:#}"),
                })?;
                Some(Region::from(m))
            }
            None => None,
        };
        // A leftover file from an earlier run must not pass for this one's.
        match std::fs::remove_file(&cfg.output) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TaskError::io(
                    format!("remove stale {}", cfg.output.display()),
                    e,
                ))
            }
        }
        if let Some(parent) = cfg.output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TaskError::io(format!("create {}", parent.display()), e))?;
            }
        }
        let spec = CommandSpec::new(program)
            .args(capture_args(&cfg, bounds))
            .quit_input("q");
        let mut handle = ProcessHandle::spawn(&spec)?;
        ctx.progress(0);

        match supervise(&mut handle, ctx, cfg.grace)? {
            ProcessEnd::Exited(code) => exit_to_result(&mut handle, code)?,
            ProcessEnd::Finished(state) => {
                let code = state.exit_code().unwrap_or(-1);
                if code != 0 && !cfg.output.exists() {
                    exit_to_result(&mut handle, code)?;
                }
            }
        }

        if !cfg.output.exists() {
            return Err(TaskError::Io {
                context: "capture output".to_string(),
                message: format!("{} was not produced", cfg.output.display()),
            });
        }
        sync_existing(&cfg.output)?;
        ctx.progress(100);
        Ok(TaskOutput::File(cfg.output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_end_with_output_and_carry_codec_and_rate() {
        let mut cfg = CaptureConfig::new(0, "/tmp/out.mkv");
        cfg.framerate = 24;
        cfg.region = Some(Region {
            x: 10,
            y: 20,
            width: 1280,
            height: 720,
        });
        let a = capture_args(&cfg, None);
        assert_eq!(a.last().map(String::as_str), Some("/tmp/out.mkv"));
        let joined = a.join(" ");
        assert!(joined.contains("-framerate 24"));
        assert!(joined.contains("-video_size 1280x720"));
        assert!(joined.contains("-c:v libx264"));
        if cfg!(target_os = "linux") {
            assert!(joined.contains("-f x11grab"));
            assert!(joined.contains("+10,20"));
        }
    }

    #[test]
    fn distinct_monitors_crop_distinct_areas() {
        let left = Region { x: 0, y: 0, width: 1920, height: 1080 };
        let right = Region { x: 1920, y: 0, width: 2560, height: 1440 };
        let a = capture_args(&CaptureConfig::new(0, "/tmp/a.mkv"), Some(left)).join(" ");
        let b = capture_args(&CaptureConfig::new(1, "/tmp/b.mkv"), Some(right)).join(" ");
        assert_ne!(a.replace("/tmp/a.mkv", ""), b.replace("/tmp/b.mkv", ""));
        assert!(b.contains("-video_size 2560x1440"));

        let mut sub = CaptureConfig::new(1, "/tmp/c.mkv");
        sub.region = Some(Region { x: 100, y: 50, width: 640, height: 480 });
        let c = capture_args(&sub, Some(right)).join(" ");
        assert!(c.contains("-video_size 640x480"));
        if cfg!(windows) {
            assert!(c.contains("-offset_x 2020"));
            assert!(c.contains("-offset_y 50"));
        } else if cfg!(target_os = "linux") {
            assert!(b.contains("+1920,0"));
            assert!(c.contains("+2020,50"));
        }
    }

    #[cfg(unix)]
    mod scenarios {
        use std::time::Instant;

        use reelwork_core::{OwnerId, TaskState};

        use super::*;
        use crate::{
            scheduler::{tests::scheduler, TaskOutcome},
            tasks::fake_tool,
        };

        fn config(dir: &std::path::Path, script: &str) -> CaptureConfig {
            let mut cfg = CaptureConfig::new(0, dir.join("rec").join("capture.mkv"));
            cfg.ffmpeg = Some(fake_tool::write(dir, "fake-ffmpeg", script));
            cfg.grace = Duration::from_secs(2);
            cfg.geometry = Some(Region { x: 0, y: 0, width: 1920, height: 1080 });
            cfg
        }

        #[test]
        fn cancel_stops_process_within_grace_and_reports_cancelled() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            // Waits for ffmpeg's `q` on stdin like the real tool.
            let cfg = config(td.path(), "read cmd\nexit 0");
            let grace = cfg.grace;
            let h = s
                .submit(Box::new(CaptureTask::new(cfg)), &OwnerId::new("t"))
                .expect("submit");

            std::thread::sleep(crate::tasks::POLL_INTERVAL * 2);
            assert_eq!(s.state(&h), Some(TaskState::Running));
            assert!(s.holder_of(&ResourceKey::monitor(0)).is_some());

            let t0 = Instant::now();
            s.cancel(&h).expect("cancel");
            assert_eq!(s.wait(&h, Duration::from_secs(10)), Some(TaskOutcome::Cancelled));
            assert!(t0.elapsed() <= grace + Duration::from_secs(1));
            assert_eq!(s.holder_of(&ResourceKey::monitor(0)), None);
        }

        #[test]
        fn stubborn_process_is_killed_after_grace() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            let mut cfg = config(td.path(), "trap '' TERM\nexec sleep 30");
            cfg.grace = Duration::from_millis(300);
            let h = s
                .submit(Box::new(CaptureTask::new(cfg)), &OwnerId::new("t"))
                .expect("submit");
            std::thread::sleep(Duration::from_millis(200));
            let t0 = Instant::now();
            s.cancel(&h).expect("cancel");
            assert_eq!(s.wait(&h, Duration::from_secs(10)), Some(TaskOutcome::Cancelled));
            assert!(t0.elapsed() < Duration::from_secs(3));
        }

        #[test]
        fn finish_request_completes_with_file() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            let script = format!("{}\necho frames > \"$last\"\nread cmd\nexit 0", fake_tool::LAST_ARG);
            let cfg = config(td.path(), &script);
            let out = cfg.output.clone();
            let h = s
                .submit(Box::new(CaptureTask::new(cfg)), &OwnerId::new("t"))
                .expect("submit");
            std::thread::sleep(Duration::from_millis(300));
            s.request_finish(&h).expect("finish");
            assert_eq!(
                s.wait(&h, Duration::from_secs(10)),
                Some(TaskOutcome::Completed(TaskOutput::File(out.clone())))
            );
            assert_eq!(std::fs::read_to_string(&out).expect("read"), "frames\n");
        }

        #[test]
        fn early_failure_surfaces_diagnostic_tail() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            let cfg = config(td.path(), "echo 'Cannot open display :0.0' >&2\nexit 1");
            let h = s
                .submit(Box::new(CaptureTask::new(cfg)), &OwnerId::new("t"))
                .expect("submit");
            match s.wait(&h, Duration::from_secs(10)) {
                Some(TaskOutcome::Failed(TaskError::ProcessFailed { exit_code, tail })) => {
                    assert_eq!(exit_code, 1);
                    assert_eq!(tail, vec!["Cannot open display :0.0".to_string()]);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn stale_output_is_not_reported_as_this_recording() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            // Quits on request but fails without writing anything.
            let cfg = config(td.path(), "read cmd\necho 'Conversion failed!' >&2\nexit 1");
            std::fs::create_dir_all(cfg.output.parent().expect("parent")).expect("mkdir");
            std::fs::write(&cfg.output, b"old recording").expect("stale");
            let h = s
                .submit(Box::new(CaptureTask::new(cfg.clone())), &OwnerId::new("t"))
                .expect("submit");
            std::thread::sleep(Duration::from_millis(300));
            s.request_finish(&h).expect("finish");
            match s.wait(&h, Duration::from_secs(10)) {
                Some(TaskOutcome::Failed(TaskError::ProcessFailed { exit_code, .. })) => {
                    assert_eq!(exit_code, 1)
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(!cfg.output.exists());
        }

        #[test]
        fn second_capture_on_same_monitor_is_busy() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            let cfg = config(td.path(), "read cmd\nexit 0");
            let first = s
                .submit(Box::new(CaptureTask::new(cfg.clone())), &OwnerId::new("t"))
                .expect("first");
            let second = s.submit(Box::new(CaptureTask::new(cfg)), &OwnerId::new("t"));
            assert!(matches!(second, Err(TaskError::ResourceBusy { .. })));
            s.cancel(&first).expect("cancel");
            s.wait(&first, Duration::from_secs(10));
        }
    }
}
