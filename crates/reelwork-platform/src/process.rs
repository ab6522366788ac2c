//! Supervision of one spawned external process.
//!
//! A `ProcessHandle` owns the child. Its stderr (and optionally stdout) is
//! drained by dedicated reader threads into a bounded tail and, when
//! requested, a line channel. Termination never touches those pipes, so it
//! cannot block on a reader that is in the middle of a read.

use std::{
    collections::VecDeque,
    ffi::OsString,
    io::{BufRead, BufReader, Read, Write},
    path::PathBuf,
    process::{Child, ChildStdin, Command, Stdio},
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use reelwork_core::TaskError;
use serde::Serialize;

use crate::kill;

pub const DEFAULT_TAIL_LINES: usize = 40;
const WAIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    /// Treat stdout as diagnostics too instead of discarding it.
    pub capture_stdout: bool,
    /// Expose diagnostic lines through [`ProcessHandle::stream_diagnostics`].
    pub stream_diagnostics: bool,
    /// Bytes written to stdin to ask the process to quit (ffmpeg: `q`).
    /// When unset, graceful termination uses an OS signal.
    pub quit_input: Option<Vec<u8>>,
    pub tail_lines: usize,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            capture_stdout: false,
            stream_diagnostics: false,
            quit_input: None,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn arg(mut self, a: impl Into<OsString>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn capture_stdout(mut self, on: bool) -> Self {
        self.capture_stdout = on;
        self
    }

    pub fn stream_diagnostics(mut self, on: bool) -> Self {
        self.stream_diagnostics = on;
        self
    }

    pub fn quit_input(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.quit_input = Some(bytes.into());
        self
    }

    pub fn tail_lines(mut self, n: usize) -> Self {
        self.tail_lines = n;
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "exit_code", rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminating,
    Exited(i32),
}

impl ProcessState {
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ProcessState::Exited(c) => Some(c),
            _ => None,
        }
    }
}

/// Outcome of waiting for the next diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextLine {
    Line(String),
    Timeout,
    Closed,
}

/// Lazy sequence of diagnostic lines. Iteration blocks the consuming thread
/// between lines and ends once every captured pipe has closed.
pub struct DiagnosticLines {
    rx: Receiver<String>,
}

impl DiagnosticLines {
    pub fn next_timeout(&self, timeout: Duration) -> NextLine {
        match self.rx.recv_timeout(timeout) {
            Ok(l) => NextLine::Line(l),
            Err(RecvTimeoutError::Timeout) => NextLine::Timeout,
            Err(RecvTimeoutError::Disconnected) => NextLine::Closed,
        }
    }
}

impl Iterator for DiagnosticLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.rx.recv().ok()
    }
}

type Tail = Arc<Mutex<VecDeque<String>>>;

pub struct ProcessHandle {
    pid: u32,
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    quit_input: Option<Vec<u8>>,
    state: ProcessState,
    tail: Tail,
    lines: Option<Receiver<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("state", &self.state)
            .finish()
    }
}

fn push_tail(tail: &Tail, cap: usize, line: String) {
    if cap == 0 {
        return;
    }
    let mut g = tail.lock().unwrap_or_else(|p| p.into_inner());
    while g.len() >= cap {
        g.pop_front();
    }
    g.push_back(line);
}

fn spawn_reader<R: Read + Send + 'static>(
    name: String,
    pipe: R,
    tail: Tail,
    cap: usize,
    tx: Option<Sender<String>>,
) -> Option<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let raw = String::from_utf8_lossy(&buf);
                // Progress meters redraw with '\r'; treat each redraw as a line.
                for piece in raw.split(['\r', '\n']) {
                    if piece.is_empty() {
                        continue;
                    }
                    push_tail(&tail, cap, piece.to_string());
                    if let Some(tx) = &tx {
                        // Receiver gone means nobody is streaming anymore.
                        let _ = tx.send(piece.to_string());
                    }
                }
            }
        })
        .ok()
}

impl ProcessHandle {
    pub fn spawn(spec: &CommandSpec) -> Result<Self, TaskError> {
        let program = spec.program_name();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.quit_input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if spec.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| TaskError::Spawn {
            program: program.clone(),
            not_found: e.kind() == std::io::ErrorKind::NotFound,
            message: e.to_string(),
        })?;
        let pid = child.id();

        let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(spec.tail_lines)));
        let (tx, rx) = if spec.stream_diagnostics {
            let (tx, rx) = crossbeam_channel::unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut readers = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            readers.extend(spawn_reader(
                format!("proc-{pid}-stderr"),
                stderr,
                tail.clone(),
                spec.tail_lines,
                tx.clone(),
            ));
        }
        if let Some(stdout) = child.stdout.take() {
            readers.extend(spawn_reader(
                format!("proc-{pid}-stdout"),
                stdout,
                tail.clone(),
                spec.tail_lines,
                tx.clone(),
            ));
        }
        // Only the reader threads hold senders now; the stream closes with them.
        drop(tx);

        Ok(Self {
            pid,
            program,
            stdin: child.stdin.take(),
            child,
            quit_input: spec.quit_input.clone(),
            state: ProcessState::Running,
            tail,
            lines: rx,
            readers,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Hands out the diagnostic stream. Available once per spawn and only
    /// when the command asked for it.
    pub fn stream_diagnostics(&mut self) -> Option<DiagnosticLines> {
        self.lines.take().map(|rx| DiagnosticLines { rx })
    }

    /// The last lines the process printed, oldest first.
    pub fn diagnostic_tail(&self) -> Vec<String> {
        let g = self.tail.lock().unwrap_or_else(|p| p.into_inner());
        g.iter().cloned().collect()
    }

    /// Non-blocking. `Some(exit_code)` once the process has exited.
    pub fn poll(&mut self) -> Option<i32> {
        if let ProcessState::Exited(code) = self.state {
            return Some(code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                self.mark_exited(code);
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                reelwork_observability::safe_eprintln!(
                    "process: try_wait failed pid={} program={}: {e}",
                    self.pid,
                    self.program
                );
                None
            }
        }
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll() {
                return Some(code);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(WAIT_POLL.min(deadline - now));
        }
    }

    /// Ask the process to stop, wait up to `grace`, then kill it. Calling
    /// this again, or after a natural exit, changes nothing.
    pub fn terminate(&mut self, grace: Duration) -> ProcessState {
        if self.poll().is_some() {
            return self.state;
        }
        if self.state == ProcessState::Running {
            self.state = ProcessState::Terminating;
            self.request_graceful_stop();
        }
        if self.wait_timeout(grace).is_some() {
            return self.state;
        }
        self.force_kill();
        self.state
    }

    fn request_graceful_stop(&mut self) {
        if let (Some(quit), Some(mut stdin)) = (self.quit_input.clone(), self.stdin.take()) {
            let wrote = stdin.write_all(&quit).and_then(|_| stdin.flush());
            // Closing stdin also signals EOF to tools reading commands from it.
            drop(stdin);
            if wrote.is_ok() {
                return;
            }
        }
        if let Err(e) = kill::request_terminate(self.pid) {
            reelwork_observability::safe_eprintln!(
                "process: graceful stop request failed pid={}: {e:#}",
                self.pid
            );
        }
    }

    fn force_kill(&mut self) {
        #[cfg(windows)]
        {
            let _ = kill::kill_tree(self.pid);
        }
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => self.mark_exited(status.code().unwrap_or(-1)),
            Err(_) => self.mark_exited(-1),
        }
    }

    fn mark_exited(&mut self, code: i32) {
        self.state = ProcessState::Exited(code);
        self.stdin = None;
    }

    /// Wait for the reader threads to drain after exit. Bounded: a grandchild
    /// that inherited the pipe may keep it open indefinitely.
    pub fn drain_readers(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.readers.iter().all(|h| h.is_finished()) {
                break;
            }
            std::thread::sleep(WAIT_POLL);
        }
        let (done, pending): (Vec<_>, Vec<_>) =
            self.readers.drain(..).partition(|h| h.is_finished());
        for h in done {
            let _ = h.join();
        }
        self.readers = pending;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.poll().is_none() {
            self.force_kill();
        }
    }
}
