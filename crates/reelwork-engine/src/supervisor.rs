//! Polls an external condition and toggles an owner on its edges.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Result;
use crossbeam_channel::{RecvTimeoutError, Sender};
use reelwork_core::TaskError;
use reelwork_observability::{data_dir, env, trace, trace::Span};
use reelwork_platform::{window::any_title_contains, WindowTitleSource};
use serde_json::json;

const DEFAULT_INTERVAL_MS: u64 = 5_000;

/// The watched condition. `Err` means "could not tell" and changes nothing.
pub trait ConditionSource: Send {
    fn observe(&mut self) -> Result<bool>;
}

/// Whatever gets started while the condition holds.
pub trait SupervisedOwner: Send {
    fn start(&mut self) -> Result<()>;
    /// Must tolerate being called when nothing is running.
    fn stop(&mut self);
    /// Whether what `start` launched is still running. Owners whose work
    /// can end on its own report that here.
    fn is_live(&mut self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No observation yet.
    Idle,
    /// Armed, condition last seen false.
    Watching,
    /// Owner started, condition last seen true.
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub interval: Duration,
    pub data_dir: PathBuf,
}

impl SupervisorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            data_dir: data_dir.into(),
        }
    }

    /// `REELWORK_SUPERVISOR_INTERVAL_MS`, default 5 s.
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_millis(
                env::u64_or("REELWORK_SUPERVISOR_INTERVAL_MS", DEFAULT_INTERVAL_MS).max(1),
            ),
            data_dir: data_dir::data_dir(),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

pub struct ConditionSupervisor<P, O> {
    condition: P,
    owner: O,
    cfg: SupervisorConfig,
    state: Arc<Mutex<SupervisorState>>,
}

impl<P: ConditionSource + 'static, O: SupervisedOwner + 'static> ConditionSupervisor<P, O> {
    pub fn new(condition: P, owner: O, cfg: SupervisorConfig) -> Self {
        Self {
            condition,
            owner,
            cfg,
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, s: SupervisorState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = s;
    }

    /// Decide what one observation means. Moves to `Active` on `Start`
    /// before the owner has actually started; [`Self::poll_once`] reverts
    /// that when the start fails.
    pub fn step(&mut self, observation: &Result<bool>) -> Option<SupervisorCommand> {
        let present = match observation {
            Ok(p) => *p,
            Err(_) => return None,
        };
        let cur = self.state();
        match (present, cur) {
            (true, SupervisorState::Active) => None,
            (true, _) => {
                self.set_state(SupervisorState::Active);
                Some(SupervisorCommand::Start)
            }
            (false, SupervisorState::Active) => {
                self.set_state(SupervisorState::Watching);
                Some(SupervisorCommand::Stop)
            }
            (false, _) => {
                self.set_state(SupervisorState::Watching);
                None
            }
        }
    }

    /// Observe once and act on the result.
    pub fn poll_once(&mut self) -> Option<SupervisorCommand> {
        if self.state() == SupervisorState::Active && !self.owner.is_live() {
            // Re-arm so a still-true condition starts a fresh run.
            self.owner.stop();
            self.set_state(SupervisorState::Watching);
            trace::event(&self.cfg.data_dir, None, "Supervisor", "SUP.owner_ended", "ok", None);
        }
        let observation = self.condition.observe();
        if let Err(e) = &observation {
            trace::event(
                &self.cfg.data_dir,
                None,
                "Supervisor",
                "SUP.observe_err",
                "err",
                Some(json!({"error": format!("{e:#}"), "state": format!("{:?}", self.state())})),
            );
        }
        let cmd = self.step(&observation)?;
        match cmd {
            SupervisorCommand::Start => {
                let span = Span::start(&self.cfg.data_dir, None, "Supervisor", "SUP.start", None);
                match self.owner.start() {
                    Ok(()) => span.ok(None),
                    Err(e) => {
                        self.set_state(SupervisorState::Watching);
                        span.err_anyhow("owner", "E_OWNER_START", &e, None);
                    }
                }
            }
            SupervisorCommand::Stop => {
                self.owner.stop();
                trace::event(&self.cfg.data_dir, None, "Supervisor", "SUP.stop", "ok", None);
            }
        }
        Some(cmd)
    }

    fn shutdown_owner(&mut self) {
        if self.state() == SupervisorState::Active {
            self.owner.stop();
            trace::event(
                &self.cfg.data_dir,
                None,
                "Supervisor",
                "SUP.stop",
                "ok",
                Some(json!({"reason": "shutdown"})),
            );
        }
        self.set_state(SupervisorState::Idle);
    }

    /// Poll on a dedicated thread every `interval` until the handle is shut
    /// down or dropped.
    pub fn spawn(mut self) -> Result<SupervisorHandle, TaskError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let state = self.state.clone();
        let interval = self.cfg.interval;
        let join = std::thread::Builder::new()
            .name("supervisor".to_string())
            .spawn(move || {
                loop {
                    self.poll_once();
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                self.shutdown_owner();
            })
            .map_err(|e| TaskError::internal(format!("spawn supervisor thread: {e}")))?;
        Ok(SupervisorHandle {
            stop: Some(stop_tx),
            join: Some(join),
            state,
        })
    }
}

pub struct SupervisorHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    state: Arc<Mutex<SupervisorState>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stops polling and, if the owner is running, stops it. Blocks until
    /// the supervisor thread has exited.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                reelwork_observability::safe_eprintln!("supervisor: thread panicked");
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// True while any visible top-level window title contains one of the
/// needles.
pub struct WindowTitleCondition<S> {
    needles: Vec<String>,
    source: S,
}

impl<S: WindowTitleSource> WindowTitleCondition<S> {
    pub fn new(source: S, needles: Vec<String>) -> Self {
        Self { needles, source }
    }
}

impl<S: WindowTitleSource> ConditionSource for WindowTitleCondition<S> {
    fn observe(&mut self) -> Result<bool> {
        let titles = self.source.window_titles()?;
        Ok(any_title_contains(&titles, &self.needles))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::anyhow;

    use super::*;

    #[derive(Default)]
    struct Log {
        starts: usize,
        stops: usize,
        fail_next_start: bool,
        ended: bool,
    }

    #[derive(Clone, Default)]
    struct FakeOwner(Arc<Mutex<Log>>);

    impl SupervisedOwner for FakeOwner {
        fn start(&mut self) -> Result<()> {
            let mut l = self.0.lock().expect("lock");
            if l.fail_next_start {
                l.fail_next_start = false;
                return Err(anyhow!("device busy"));
            }
            l.starts += 1;
            l.ended = false;
            Ok(())
        }

        fn stop(&mut self) {
            self.0.lock().expect("lock").stops += 1;
        }

        fn is_live(&mut self) -> bool {
            !self.0.lock().expect("lock").ended
        }
    }

    /// Replays a script, then keeps repeating the last entry.
    struct Script(VecDeque<Option<bool>>, Option<bool>);

    impl Script {
        fn new(seq: &[Option<bool>]) -> Self {
            Self(seq.iter().copied().collect(), None)
        }
    }

    impl ConditionSource for Script {
        fn observe(&mut self) -> Result<bool> {
            if let Some(v) = self.0.pop_front() {
                self.1 = v;
            }
            self.1.ok_or_else(|| anyhow!("enumeration failed"))
        }
    }

    fn sup(seq: &[Option<bool>], owner: FakeOwner) -> ConditionSupervisor<Script, FakeOwner> {
        std::env::set_var("REELWORK_TRACE_ENABLED", "0");
        let dir = std::env::temp_dir().join("reelwork-supervisor-tests");
        ConditionSupervisor::new(Script::new(seq), owner, SupervisorConfig::new(dir))
    }

    #[test]
    fn one_start_and_one_stop_per_edge() {
        let owner = FakeOwner::default();
        let mut s = sup(&[Some(false), Some(true), Some(true), Some(false)], owner.clone());
        let cmds: Vec<_> = (0..4).map(|_| s.poll_once()).collect();
        assert_eq!(
            cmds,
            vec![None, Some(SupervisorCommand::Start), None, Some(SupervisorCommand::Stop)]
        );
        let l = owner.0.lock().expect("lock");
        assert_eq!((l.starts, l.stops), (1, 1));
        assert_eq!(s.state(), SupervisorState::Watching);
    }

    #[test]
    fn inconclusive_observation_keeps_state() {
        let owner = FakeOwner::default();
        let mut s = sup(&[Some(true), None, None, Some(true)], owner.clone());
        assert_eq!(s.poll_once(), Some(SupervisorCommand::Start));
        assert_eq!(s.poll_once(), None);
        assert_eq!(s.state(), SupervisorState::Active);
        assert_eq!(s.poll_once(), None);
        assert_eq!(s.poll_once(), None);
        let l = owner.0.lock().expect("lock");
        assert_eq!((l.starts, l.stops), (1, 0));
    }

    #[test]
    fn idle_stays_idle_on_error() {
        let mut s = sup(&[None], FakeOwner::default());
        assert_eq!(s.step(&Err(anyhow!("x"))), None);
        assert_eq!(s.state(), SupervisorState::Idle);
    }

    #[test]
    fn failed_start_is_retried_on_next_truthy_poll() {
        let owner = FakeOwner::default();
        owner.0.lock().expect("lock").fail_next_start = true;
        let mut s = sup(&[Some(true), Some(true)], owner.clone());
        assert_eq!(s.poll_once(), Some(SupervisorCommand::Start));
        assert_eq!(s.state(), SupervisorState::Watching);
        assert_eq!(s.poll_once(), Some(SupervisorCommand::Start));
        assert_eq!(s.state(), SupervisorState::Active);
        assert_eq!(owner.0.lock().expect("lock").starts, 1);
    }

    #[test]
    fn owner_that_ends_on_its_own_is_restarted_while_condition_holds() {
        let owner = FakeOwner::default();
        let mut s = sup(&[Some(true)], owner.clone());
        assert_eq!(s.poll_once(), Some(SupervisorCommand::Start));
        assert_eq!(s.poll_once(), None);

        owner.0.lock().expect("lock").ended = true;
        assert_eq!(s.poll_once(), Some(SupervisorCommand::Start));
        assert_eq!(s.state(), SupervisorState::Active);
        assert_eq!(s.poll_once(), None);
        let l = owner.0.lock().expect("lock");
        assert_eq!((l.starts, l.stops), (2, 1));
    }

    #[test]
    fn owner_that_ends_returns_to_watching_when_condition_clears() {
        let owner = FakeOwner::default();
        let mut s = sup(&[Some(true), Some(false)], owner.clone());
        assert_eq!(s.poll_once(), Some(SupervisorCommand::Start));
        owner.0.lock().expect("lock").ended = true;
        assert_eq!(s.poll_once(), None);
        assert_eq!(s.state(), SupervisorState::Watching);
        let l = owner.0.lock().expect("lock");
        assert_eq!((l.starts, l.stops), (1, 1));
    }

    #[test]
    fn shutdown_stops_an_active_owner() {
        let owner = FakeOwner::default();
        let mut s = sup(&[Some(true)], owner.clone());
        s.cfg = s.cfg.clone().interval(Duration::from_millis(20));
        let h = s.spawn().expect("spawn");
        let t0 = std::time::Instant::now();
        while h.state() != SupervisorState::Active {
            assert!(t0.elapsed() < Duration::from_secs(5), "never became active");
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(100));
        h.shutdown();
        let l = owner.0.lock().expect("lock");
        assert_eq!((l.starts, l.stops), (1, 1));
    }

    struct Titles(Result<Vec<String>, String>);

    impl WindowTitleSource for Titles {
        fn window_titles(&mut self) -> Result<Vec<String>> {
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    #[test]
    fn window_condition_matches_needles() {
        let mut p = WindowTitleCondition::new(
            Titles(Ok(vec!["Editor".into(), "Meeting - Zoom".into()])),
            vec!["zoom".into()],
        );
        assert!(p.observe().expect("observe"));
        let mut p = WindowTitleCondition::new(Titles(Ok(vec!["Editor".into()])), vec!["zoom".into()]);
        assert!(!p.observe().expect("observe"));
        let mut p = WindowTitleCondition::new(Titles(Err("no display".into())), vec!["zoom".into()]);
        assert!(p.observe().is_err());
    }
}
