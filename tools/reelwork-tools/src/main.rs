//! reelwork - run capture, transcode and service tasks from the shell and
//! print their events as JSON lines.

use std::{
    ffi::OsString,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use reelwork_core::{OwnerId, TaskEvent};
use reelwork_engine::{
    tasks::{
        CaptureConfig, CaptureTask, ProcessTask, RewriteTask, ScrapeTask, SilenceTrim,
        SynthesisParams, SynthesisTask, TranscodeConfig, TranscodeTask,
    },
    CaptureOwner, ConditionSupervisor, Scheduler, SchedulerConfig, SupervisorConfig,
    SupervisorHandle, Task, TaskHandle, WindowTitleCondition,
};
use reelwork_observability::{data_dir, env};
use reelwork_platform::{CommandSpec, DesktopWindows};
use reelwork_providers::{HttpServiceConfig, RewriteClient, ScrapeClient, SpeechClient};
use reelwork_storage::history;
use serde_json::json;

#[derive(Parser)]
#[command(name = "reelwork", version, about)]
struct Cli {
    /// Owner id recorded with every submitted task
    #[arg(long, default_value = "cli", global = true)]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a monitor for a fixed time, then finish the recording
    Capture {
        #[arg(long, default_value_t = 0)]
        monitor: u32,

        #[arg(long)]
        out: PathBuf,

        /// Recording length before the finish request
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        #[arg(long, default_value_t = 30)]
        framerate: u32,
    },

    /// Convert one media file, optionally trimming leading/trailing silence
    Transcode {
        input: PathBuf,
        output: PathBuf,

        #[arg(long)]
        trim_silence: bool,

        #[arg(long, default_value_t = -50.0, allow_negative_numbers = true)]
        threshold_db: f64,

        /// Extra output arguments passed to ffmpeg (after --)
        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Text to speech through REELWORK_SPEECH_BASE_URL
    Synthesize {
        text: String,

        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        voice: Option<String>,

        #[arg(long)]
        speed: Option<f32>,

        #[arg(long)]
        format: Option<String>,
    },

    /// LLM rewrite through REELWORK_LLM_BASE_URL
    Rewrite {
        text: String,

        #[arg(long)]
        system: Option<String>,
    },

    /// Comment scraping through REELWORK_SCRAPE_BASE_URL
    Scrape {
        url: String,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Run any command as a supervised task
    Run {
        /// Cancel after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Record while a window whose title matches a needle is open
    Watch {
        /// Title substring (case-insensitive); repeatable
        #[arg(long = "needle", required = true)]
        needles: Vec<String>,

        #[arg(long, default_value_t = 0)]
        monitor: u32,

        #[arg(long)]
        out_dir: PathBuf,

        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop watching after this long; forever when unset
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Show or clear the task history journal
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,

        #[arg(long)]
        clear: bool,
    },
}

fn main() {
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            reelwork_observability::safe_eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let owner = OwnerId::new(cli.owner);
    match cli.command {
        Commands::Capture {
            monitor,
            out,
            seconds,
            framerate,
        } => {
            let mut cfg = CaptureConfig::new(monitor, out);
            cfg.framerate = framerate;
            let s = scheduler()?;
            let finish_after = Duration::from_secs(seconds);
            run_task(&s, Box::new(CaptureTask::new(cfg)), &owner, |s, h, t0| {
                if t0.elapsed() >= finish_after {
                    let _ = s.request_finish(h);
                }
            })
        }
        Commands::Transcode {
            input,
            output,
            trim_silence,
            threshold_db,
            extra,
        } => {
            let mut cfg = TranscodeConfig::new(input, output);
            cfg.output_args = extra;
            if trim_silence {
                cfg.silence_trim = Some(SilenceTrim {
                    threshold_db,
                    ..SilenceTrim::default()
                });
            }
            let s = scheduler()?;
            run_task(&s, Box::new(TranscodeTask::new(cfg)), &owner, |_, _, _| {})
        }
        Commands::Synthesize {
            text,
            out,
            voice,
            speed,
            format,
        } => {
            let client = Arc::new(SpeechClient::new(service_config("SPEECH")?));
            let params = SynthesisParams {
                voice,
                speed,
                format,
                output: out,
            };
            let s = scheduler()?;
            run_task(&s, Box::new(SynthesisTask::new(client, text, params)), &owner, |_, _, _| {})
        }
        Commands::Rewrite { text, system } => {
            let client = Arc::new(RewriteClient::new(service_config("LLM")?));
            let mut task = RewriteTask::new(client, text);
            if let Some(p) = system {
                task = task.system_prompt(p);
            }
            let s = scheduler()?;
            run_task(&s, Box::new(task), &owner, |_, _, _| {})
        }
        Commands::Scrape { url, limit } => {
            let client = Arc::new(ScrapeClient::new(service_config("SCRAPE")?));
            let mut task = ScrapeTask::new(client, url);
            if let Some(l) = limit {
                task = task.limit(l);
            }
            let s = scheduler()?;
            run_task(&s, Box::new(task), &owner, |_, _, _| {})
        }
        Commands::Run { timeout_secs, cmd } => {
            let (program, args) = cmd
                .split_first()
                .ok_or_else(|| anyhow!("missing command"))?;
            let spec = CommandSpec::new(program).args(args.iter().map(OsString::from));
            let s = scheduler()?;
            let limit = timeout_secs.map(Duration::from_secs);
            run_task(&s, Box::new(ProcessTask::new(spec)), &owner, |s, h, t0| {
                if limit.is_some_and(|l| t0.elapsed() >= l) {
                    let _ = s.cancel(h);
                }
            })
        }
        Commands::Watch {
            needles,
            monitor,
            out_dir,
            interval_ms,
            duration_secs,
        } => watch(needles, monitor, out_dir, interval_ms, duration_secs, owner),
        Commands::History { limit, clear } => {
            let db = data_dir::history_db_path();
            if clear {
                history::clear(&db)?;
                return Ok(0);
            }
            for rec in history::list(&db, limit, None)? {
                println!("{}", serde_json::to_string(&rec)?);
            }
            Ok(0)
        }
    }
}

fn scheduler() -> Result<Scheduler> {
    Scheduler::new(SchedulerConfig::from_env()).map_err(|e| anyhow!(e))
}

/// `REELWORK_<PREFIX>_BASE_URL` (required), `_API_KEY`, `_MODEL`,
/// `_TIMEOUT_MS`.
fn service_config(prefix: &str) -> Result<HttpServiceConfig> {
    let key = format!("REELWORK_{prefix}_BASE_URL");
    let base = env::string(&key).with_context(|| format!("{key} is not set"))?;
    let mut cfg = HttpServiceConfig::new(base);
    if let Some(k) = env::string(&format!("REELWORK_{prefix}_API_KEY")) {
        cfg = cfg.api_key(k);
    }
    if let Some(m) = env::string(&format!("REELWORK_{prefix}_MODEL")) {
        cfg = cfg.model(m);
    }
    let timeout_ms = env::u64_or(&format!("REELWORK_{prefix}_TIMEOUT_MS"), 0);
    if timeout_ms > 0 {
        cfg = cfg.timeout(Duration::from_millis(timeout_ms));
    }
    Ok(cfg)
}

fn print_event(ev: &TaskEvent) {
    let line = json!({
        "ts": chrono::Local::now().to_rfc3339(),
        "event": ev,
    });
    println!("{line}");
}

/// Submit, print every event, and map the terminal event to an exit code.
/// `tick` runs between events so callers can finish or cancel.
fn run_task(
    s: &Scheduler,
    task: Box<dyn Task>,
    owner: &OwnerId,
    tick: impl Fn(&Scheduler, &TaskHandle, Instant),
) -> Result<i32> {
    let h = s.enqueue(task, owner).map_err(|e| anyhow!(e))?;
    let rx = s.events(&h).map_err(|e| anyhow!(e))?;
    s.launch(&h).map_err(|e| anyhow!(e))?;
    let t0 = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(ev) => {
                print_event(&ev);
                match ev {
                    TaskEvent::Completed { .. } => return Ok(0),
                    TaskEvent::Failed { .. } => return Ok(1),
                    TaskEvent::Cancelled { .. } => return Ok(130),
                    TaskEvent::Progress { .. } => {}
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => tick(s, &h, t0),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                bail!("event stream closed before the task finished")
            }
        }
    }
}

fn watch(
    needles: Vec<String>,
    monitor: u32,
    out_dir: PathBuf,
    interval_ms: Option<u64>,
    duration_secs: Option<u64>,
    owner: OwnerId,
) -> Result<i32> {
    let s = scheduler()?;
    let base = CaptureConfig::new(monitor, out_dir.join("capture.mkv"));
    let grace = base.grace;
    let capture_owner = CaptureOwner::new(s.clone(), base, out_dir).owner_id(owner.clone());
    let mut cfg = SupervisorConfig::from_env();
    if let Some(ms) = interval_ms {
        cfg = cfg.interval(Duration::from_millis(ms.max(1)));
    }
    let condition = WindowTitleCondition::new(DesktopWindows, needles);
    let handle = ConditionSupervisor::new(condition, capture_owner, cfg)
        .spawn()
        .map_err(|e| anyhow!(e))?;
    print_line(json!({"supervisor": "started"}));
    let deadline = duration_secs.map(|d| Instant::now() + Duration::from_secs(d));
    let mut last = handle.state();
    loop {
        std::thread::sleep(Duration::from_millis(250));
        let now = handle.state();
        if now != last {
            print_line(json!({"supervisor": format!("{now:?}").to_lowercase()}));
            last = now;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }
    let left = stop_and_drain(&s, handle, &owner, grace);
    print_line(json!({"supervisor": "stopped", "active_tasks": left}));
    Ok(0)
}

/// Slack on top of the capture grace for ffmpeg to exit and the outcome to
/// be journaled.
const DRAIN_MARGIN: Duration = Duration::from_secs(3);

/// Stop the supervisor, then let the recording it finished flush to disk.
/// Cancels what is still running after `grace`. Returns the tasks left live.
fn stop_and_drain(
    s: &Scheduler,
    handle: SupervisorHandle,
    owner: &OwnerId,
    grace: Duration,
) -> usize {
    handle.shutdown();
    if !s.wait_idle(grace + DRAIN_MARGIN) {
        let n = s.cancel_owned(owner);
        print_line(json!({"supervisor": "cancelling", "tasks": n}));
        s.wait_idle(grace + DRAIN_MARGIN);
    }
    s.active_count()
}

fn print_line(mut v: serde_json::Value) {
    if let Some(m) = v.as_object_mut() {
        m.insert("ts".to_string(), json!(chrono::Local::now().to_rfc3339()));
    }
    println!("{v}");
}

#[cfg(test)]
mod tests {
    use reelwork_core::{TaskError, TaskKind, TaskOutput};
    use reelwork_engine::TaskContext;

    use super::*;

    struct Outcome(Result<TaskOutput, TaskError>);

    impl Task for Outcome {
        fn kind(&self) -> TaskKind {
            TaskKind::Process
        }

        fn run(self: Box<Self>, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
            self.0
        }
    }

    struct UntilCancelled;

    impl Task for UntilCancelled {
        fn kind(&self) -> TaskKind {
            TaskKind::Process
        }

        fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(TaskError::Cancelled)
        }
    }

    fn test_scheduler(dir: &std::path::Path) -> Scheduler {
        std::env::set_var("REELWORK_TRACE_ENABLED", "0");
        Scheduler::new(SchedulerConfig::new(dir)).expect("scheduler")
    }

    #[test]
    fn exit_code_follows_terminal_event() {
        let td = tempfile::tempdir().expect("tempdir");
        let s = test_scheduler(td.path());
        let owner = OwnerId::new("cli");

        let ok = Outcome(Ok(TaskOutput::Text("done".to_string())));
        assert_eq!(run_task(&s, Box::new(ok), &owner, |_, _, _| {}).expect("run"), 0);

        let failed = Outcome(Err(TaskError::ProcessFailed {
            exit_code: 3,
            tail: vec!["bad".to_string()],
        }));
        assert_eq!(run_task(&s, Box::new(failed), &owner, |_, _, _| {}).expect("run"), 1);

        let code = run_task(&s, Box::new(UntilCancelled), &owner, |s, h, t0| {
            if t0.elapsed() >= Duration::from_millis(100) {
                let _ = s.cancel(h);
            }
        })
        .expect("run");
        assert_eq!(code, 130);
    }

    #[cfg(unix)]
    #[test]
    fn watch_shutdown_waits_for_the_recording_to_be_written() {
        use std::os::unix::fs::PermissionsExt;

        use reelwork_engine::{tasks::Region, ConditionSource};

        struct Always;

        impl ConditionSource for Always {
            fn observe(&mut self) -> Result<bool> {
                Ok(true)
            }
        }

        let td = tempfile::tempdir().expect("tempdir");
        let s = test_scheduler(td.path());
        // Stand-in ffmpeg: writes its output only after a slow flush on "q".
        let ffmpeg = td.path().join("fake-ffmpeg");
        std::fs::write(
            &ffmpeg,
            "#!/bin/sh\nfor a in \"$@\"; do last=\"$a\"; done\n\
             while read line; do [ \"$line\" = q ] && break; done\n\
             sleep 1\necho rec > \"$last\"\nexit 0\n",
        )
        .expect("write script");
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let out_dir = td.path().join("recs");
        let mut base = CaptureConfig::new(0, out_dir.join("capture.mkv"));
        base.ffmpeg = Some(ffmpeg);
        base.grace = Duration::from_secs(3);
        base.geometry = Some(Region { x: 0, y: 0, width: 1280, height: 720 });
        let owner = OwnerId::new("watch");
        let capture_owner =
            CaptureOwner::new(s.clone(), base, &out_dir).owner_id(owner.clone());
        let cfg = SupervisorConfig::new(td.path()).interval(Duration::from_millis(20));
        let handle = ConditionSupervisor::new(Always, capture_owner, cfg)
            .spawn()
            .expect("spawn");

        let t0 = Instant::now();
        while s.active_count() == 0 {
            assert!(t0.elapsed() < Duration::from_secs(5), "recording never started");
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(stop_and_drain(&s, handle, &owner, Duration::from_secs(3)), 0);
        let files: Vec<_> = std::fs::read_dir(&out_dir)
            .expect("read dir")
            .map(|e| e.expect("entry").path())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read_to_string(&files[0]).expect("read"), "rec\n");
    }
}
