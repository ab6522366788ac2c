use std::{path::PathBuf, time::Duration};

use reelwork_core::{TaskError, TaskKind, TaskOutput};
use reelwork_platform::{CommandSpec, NextLine, ProcessHandle};
use serde_json::{json, Value};

use super::{exit_to_result, resolve_ffmpeg, DEFAULT_GRACE, POLL_INTERVAL};
use crate::task::{sync_existing, Task, TaskContext};

/// Leading and trailing silence removal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceTrim {
    pub threshold_db: f64,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Default for SilenceTrim {
    fn default() -> Self {
        Self {
            threshold_db: -50.0,
            start_ms: 300,
            end_ms: 300,
        }
    }
}

impl SilenceTrim {
    /// Trims the head, reverses, trims the (former) tail, reverses back.
    pub fn filter(&self) -> String {
        let one = |ms: u64| {
            format!(
                "silenceremove=start_periods=1:start_duration={:.3}:start_threshold={}dB",
                ms as f64 / 1000.0,
                self.threshold_db
            )
        };
        format!("{},areverse,{},areverse", one(self.start_ms), one(self.end_ms))
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub silence_trim: Option<SilenceTrim>,
    /// Codec/format arguments placed before the output path.
    pub output_args: Vec<String>,
    pub grace: Duration,
    pub ffmpeg: Option<PathBuf>,
}

impl TranscodeConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            silence_trim: None,
            output_args: Vec::new(),
            grace: DEFAULT_GRACE,
            ffmpeg: None,
        }
    }
}

pub fn transcode_args(cfg: &TranscodeConfig) -> Vec<String> {
    let mut a: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "info", "-y", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    a.push(cfg.input.display().to_string());
    if let Some(trim) = &cfg.silence_trim {
        a.extend(["-af".to_string(), trim.filter()]);
    }
    a.extend(cfg.output_args.iter().cloned());
    a.extend(["-progress".to_string(), "pipe:2".to_string()]);
    a.push(cfg.output.display().to_string());
    a
}

/// `Duration: 00:01:02.50, start: ...` from the input banner.
pub fn parse_duration_us(line: &str) -> Option<u64> {
    let rest = line.trim_start().strip_prefix("Duration:")?.trim_start();
    let stamp = rest.split(',').next()?.trim();
    let mut parts = stamp.split(':');
    let h: u64 = parts.next()?.parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !s.is_finite() || s < 0.0 {
        return None;
    }
    Some((h * 3600 + m * 60) * 1_000_000 + (s * 1_000_000.0).round() as u64)
}

/// `out_time_us=` (and the historically misnamed `out_time_ms=`, which is
/// also microseconds) from `-progress` output.
pub fn parse_out_time_us(line: &str) -> Option<u64> {
    let t = line.trim();
    let v = t
        .strip_prefix("out_time_us=")
        .or_else(|| t.strip_prefix("out_time_ms="))?;
    v.trim().parse::<u64>().ok()
}

/// Converts one file with ffmpeg, reporting progress from `-progress`
/// output against the input duration.
pub struct TranscodeTask {
    cfg: TranscodeConfig,
}

impl TranscodeTask {
    pub fn new(cfg: TranscodeConfig) -> Self {
        Self { cfg }
    }
}

impl Task for TranscodeTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Transcode
    }

    fn describe(&self) -> Value {
        let redact = |p: &PathBuf| {
            reelwork_observability::trace::redact_user_paths(&p.display().to_string())
        };
        json!({
            "input": redact(&self.cfg.input),
            "output": redact(&self.cfg.output),
            "silence_trim": self.cfg.silence_trim.is_some(),
            "silence_threshold_db": self.cfg.silence_trim.map(|t| t.threshold_db),
            "trim_start_ms": self.cfg.silence_trim.map(|t| t.start_ms),
            "trim_end_ms": self.cfg.silence_trim.map(|t| t.end_ms),
        })
    }

    fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let cfg = self.cfg;
        if !cfg.input.exists() {
            return Err(TaskError::Io {
                context: "transcode input".to_string(),
                message: format!("{} not found", cfg.input.display()),
            });
        }
        let program = resolve_ffmpeg(cfg.ffmpeg.as_deref())?;
        let spec = CommandSpec::new(program)
            .args(transcode_args(&cfg))
            .stream_diagnostics(true);
        let mut handle = ProcessHandle::spawn(&spec)?;
        let lines = handle
            .stream_diagnostics()
            .ok_or_else(|| TaskError::internal("diagnostic stream unavailable"))?;
        ctx.progress(0);

        let mut total_us: Option<u64> = None;
        let code = loop {
            if ctx.is_cancelled() {
                handle.terminate(cfg.grace);
                return Err(TaskError::Cancelled);
            }
            match lines.next_timeout(POLL_INTERVAL) {
                NextLine::Line(l) => {
                    if total_us.is_none() {
                        total_us = parse_duration_us(&l).filter(|t| *t > 0);
                    }
                    if let (Some(total), Some(done)) = (total_us, parse_out_time_us(&l)) {
                        // 100 is reserved for the synced output.
                        ctx.progress((done.saturating_mul(100) / total).min(99) as i64);
                    }
                }
                NextLine::Timeout => {
                    if let Some(c) = handle.poll() {
                        break c;
                    }
                }
                NextLine::Closed => break wait_exit(&mut handle, ctx, cfg.grace)?,
            }
        };

        exit_to_result(&mut handle, code)?;
        if !cfg.output.exists() {
            return Err(TaskError::Io {
                context: "transcode output".to_string(),
                message: format!("{} was not produced", cfg.output.display()),
            });
        }
        sync_existing(&cfg.output)?;
        ctx.progress(100);
        Ok(TaskOutput::File(cfg.output))
    }
}

fn wait_exit(
    handle: &mut ProcessHandle,
    ctx: &TaskContext,
    grace: Duration,
) -> Result<i32, TaskError> {
    loop {
        if ctx.is_cancelled() {
            handle.terminate(grace);
            return Err(TaskError::Cancelled);
        }
        if let Some(code) = handle.wait_timeout(POLL_INTERVAL) {
            return Ok(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_banner_duration() {
        assert_eq!(
            parse_duration_us("  Duration: 00:01:02.50, start: 0.000000, bitrate: 128 kb/s"),
            Some(62_500_000)
        );
        assert_eq!(parse_duration_us("  Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration_us("Stream #0:0: Audio: pcm_s16le"), None);
    }

    #[test]
    fn parses_progress_times() {
        assert_eq!(parse_out_time_us("out_time_us=1500000"), Some(1_500_000));
        assert_eq!(parse_out_time_us("out_time_ms=20"), Some(20));
        assert_eq!(parse_out_time_us("out_time_us=N/A"), None);
        assert_eq!(parse_out_time_us("out_time=00:00:01.500000"), None);
    }

    #[test]
    fn args_include_filter_and_progress_pipe() {
        let mut cfg = TranscodeConfig::new("/in/a.m4a", "/out/a.wav");
        cfg.silence_trim = Some(SilenceTrim::default());
        cfg.output_args = vec!["-ac".into(), "1".into(), "-ar".into(), "16000".into()];
        let a = transcode_args(&cfg);
        let joined = a.join(" ");
        assert!(joined.contains("-i /in/a.m4a"));
        assert!(joined.contains("-af silenceremove=start_periods=1:start_duration=0.300:start_threshold=-50dB,areverse,"));
        assert!(joined.contains("-ac 1 -ar 16000 -progress pipe:2 /out/a.wav"));
        assert_eq!(a.last().map(String::as_str), Some("/out/a.wav"));
    }

    #[cfg(unix)]
    mod scenarios {
        use reelwork_core::{OwnerId, TaskEvent};

        use super::*;
        use crate::{
            scheduler::{tests::{collect, scheduler}, TaskOutcome},
            tasks::fake_tool,
        };

        #[test]
        fn progress_follows_out_time_and_ends_at_100() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            let input = td.path().join("in.m4a");
            std::fs::write(&input, b"x").expect("input");
            let script = format!(
                "{}\n\
                 echo '  Duration: 00:00:10.00, start: 0.000000, bitrate: 256 kb/s' >&2\n\
                 echo out_time_us=2500000 >&2\n\
                 echo out_time_us=5000000 >&2\n\
                 echo out_time_us=N/A >&2\n\
                 echo out_time_us=4000000 >&2\n\
                 echo progress=end >&2\n\
                 echo audio > \"$last\"\n\
                 exit 0",
                fake_tool::LAST_ARG
            );
            let mut cfg = TranscodeConfig::new(&input, td.path().join("out.wav"));
            cfg.ffmpeg = Some(fake_tool::write(td.path(), "fake-ffmpeg", &script));
            let out = cfg.output.clone();

            let h = s
                .enqueue(Box::new(TranscodeTask::new(cfg)), &OwnerId::new("t"))
                .expect("enqueue");
            let rx = s.events(&h).expect("events");
            s.launch(&h).expect("launch");
            let evs = collect(&rx);
            let progress: Vec<u8> = evs
                .iter()
                .filter_map(|e| match e {
                    TaskEvent::Progress { percent, .. } => Some(*percent),
                    _ => None,
                })
                .collect();
            assert_eq!(progress, vec![0, 25, 50, 100]);
            assert_eq!(
                evs.last(),
                Some(&TaskEvent::Completed {
                    task_id: h.id().clone(),
                    output: TaskOutput::File(out),
                })
            );
        }

        #[test]
        fn missing_input_fails_without_spawning() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            let mut cfg = TranscodeConfig::new(td.path().join("nope.wav"), td.path().join("o.wav"));
            cfg.ffmpeg = Some(td.path().join("never-run"));
            let h = s
                .submit(Box::new(TranscodeTask::new(cfg)), &OwnerId::new("t"))
                .expect("submit");
            match s.wait(&h, Duration::from_secs(10)) {
                Some(TaskOutcome::Failed(e)) => assert_eq!(e.code(), "E_IO"),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn cancel_mid_transcode() {
            let td = tempfile::tempdir().expect("tempdir");
            let s = scheduler(td.path());
            let input = td.path().join("in.wav");
            std::fs::write(&input, b"x").expect("input");
            let mut cfg = TranscodeConfig::new(&input, td.path().join("out.wav"));
            cfg.grace = Duration::from_millis(500);
            cfg.ffmpeg = Some(fake_tool::write(
                td.path(),
                "fake-ffmpeg",
                "echo '  Duration: 00:01:00.00, start: 0' >&2\nexec sleep 30",
            ));
            let h = s
                .submit(Box::new(TranscodeTask::new(cfg)), &OwnerId::new("t"))
                .expect("submit");
            std::thread::sleep(Duration::from_millis(200));
            s.cancel(&h).expect("cancel");
            assert_eq!(s.wait(&h, Duration::from_secs(10)), Some(TaskOutcome::Cancelled));
        }
    }
}
