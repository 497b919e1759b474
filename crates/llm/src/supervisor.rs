//! Lifecycle of the local inference daemon.
//!
//! The daemon may be shared with other processes, so readiness is always a
//! live health probe and never cached state.  `start` and `stop` are safe to
//! call redundantly: a second `start` finds the daemon ready (or the launch
//! already in flight), a second `stop` finds no handle.
//!
//! Stopping escalates: terminate signal, then a force kill, then an
//! unconditional kill, each step bounded by the grace window and logged.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::ModelDescriptor;
use crate::LlmError;

/// What the supervisor needs from the daemon's HTTP surface.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    /// `true` when the health endpoint answers with a success status
    /// within `timeout`.
    async fn probe(&self, timeout: Duration) -> bool;

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("inference daemon did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("inference daemon exited during startup ({0})")]
    DaemonExited(String),

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

/// A daemon process launched by this supervisor.  A stopped handle is
/// discarded; the next launch creates a new one.
#[derive(Debug)]
pub struct DaemonHandle {
    pub pid: u32,
    pub command: LaunchCommand,
    pub base_url: String,
    pub state: DaemonState,
    child: Child,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Wait applied after each stop escalation step.
    pub stop_grace: Duration,
    /// Pause between signalling the daemon and re-probing it.
    pub settle: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
            settle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStep {
    Terminate,
    ForceKill,
    UnconditionalKill,
}

/// Outcome of [`DaemonSupervisor::stop`].  `pid` is `None` when there was
/// nothing to stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub pid: Option<u32>,
    pub steps: Vec<StopStep>,
    pub exited: bool,
    pub still_responding: bool,
}

impl StopReport {
    pub fn was_noop(&self) -> bool {
        self.pid.is_none()
    }
}

enum PollOutcome {
    Ready,
    Exited(String),
    TimedOut,
}

struct Inner {
    handle: Option<DaemonHandle>,
    last_state: DaemonState,
}

pub struct DaemonSupervisor {
    api: Arc<dyn DaemonApi>,
    /// `None` for a daemon owned by someone else: never launched, never
    /// signalled.
    launch: Option<LaunchCommand>,
    base_url: String,
    timings: SupervisorTimings,
    inner: Mutex<Inner>,
}

impl DaemonSupervisor {
    pub fn new(
        api: Arc<dyn DaemonApi>,
        launch: LaunchCommand,
        base_url: impl Into<String>,
        timings: SupervisorTimings,
    ) -> Self {
        Self::build(api, Some(launch), base_url.into(), timings)
    }

    /// Supervisor for a daemon run elsewhere; only readiness is checked.
    pub fn external(
        api: Arc<dyn DaemonApi>,
        base_url: impl Into<String>,
        timings: SupervisorTimings,
    ) -> Self {
        Self::build(api, None, base_url.into(), timings)
    }

    fn build(
        api: Arc<dyn DaemonApi>,
        launch: Option<LaunchCommand>,
        base_url: String,
        timings: SupervisorTimings,
    ) -> Self {
        Self {
            api,
            launch,
            base_url,
            timings,
            inner: Mutex::new(Inner {
                handle: None,
                last_state: DaemonState::NotStarted,
            }),
        }
    }

    pub fn api(&self) -> &Arc<dyn DaemonApi> {
        &self.api
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Live health probe; the single source of truth for readiness.
    pub async fn is_ready(&self) -> bool {
        self.api.probe(self.timings.probe_timeout).await
    }

    /// State of the handle owned by this supervisor.
    pub async fn status(&self) -> DaemonState {
        let inner = self.inner.lock().await;
        inner
            .handle
            .as_ref()
            .map(|handle| handle.state)
            .unwrap_or(inner.last_state)
    }

    /// Pid of the daemon this supervisor launched, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.handle.as_ref().map(|handle| handle.pid)
    }

    /// Poll the health probe until it succeeds or `deadline` passes.
    pub async fn wait_ready(&self, deadline: Instant) -> bool {
        loop {
            if self.is_ready().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn start(&self, wait_for_ready: bool, timeout: Duration) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;

        if self.is_ready().await {
            if let Some(handle) = inner.handle.as_mut() {
                handle.state = DaemonState::Ready;
            }
            info!(base_url = %self.base_url, "inference daemon is already running");
            return Ok(());
        }

        let Some(launch) = self.launch.clone() else {
            if !wait_for_ready {
                return Ok(());
            }
            info!(base_url = %self.base_url, ?timeout, "waiting for externally managed inference daemon");
            if self.wait_ready(Instant::now() + timeout).await {
                return Ok(());
            }
            return Err(SupervisorError::StartupTimeout(timeout));
        };

        let in_flight = match inner.handle.as_mut() {
            Some(handle) => matches!(handle.child.try_wait(), Ok(None)),
            None => false,
        };

        if in_flight {
            debug!("inference daemon launch already in flight");
        } else {
            if inner.handle.take().is_some() {
                debug!("discarding handle of a daemon that exited on its own");
            }
            let handle = self.spawn_daemon(&launch)?;
            info!(pid = handle.pid, command = %handle.command, "inference daemon started");
            inner.handle = Some(handle);
        }

        if !wait_for_ready {
            return Ok(());
        }

        info!(?timeout, "waiting for inference daemon to become ready");
        match self.poll_until_ready(&mut inner, Instant::now() + timeout).await {
            PollOutcome::Ready => {
                if let Some(handle) = inner.handle.as_mut() {
                    handle.state = DaemonState::Ready;
                }
                info!(base_url = %self.base_url, "inference daemon is ready");
                Ok(())
            }
            PollOutcome::Exited(status) => {
                inner.handle = None;
                inner.last_state = DaemonState::Stopped;
                Err(SupervisorError::DaemonExited(status))
            }
            PollOutcome::TimedOut => {
                warn!(?timeout, "timed out waiting for inference daemon, stopping it");
                self.stop_locked(&mut inner).await;
                Err(SupervisorError::StartupTimeout(timeout))
            }
        }
    }

    /// Idempotent: returns a no-op report when no daemon was launched here.
    pub async fn stop(&self) -> StopReport {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await
    }

    fn spawn_daemon(&self, launch: &LaunchCommand) -> Result<DaemonHandle, SupervisorError> {
        let spawn_err = |source| SupervisorError::Spawn {
            program: launch.program.clone(),
            source,
        };

        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::DaemonExited(
                "exited before a pid was assigned".to_string(),
            ));
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "wayfinder::daemon", pid, "{line}");
                }
            });
        }

        Ok(DaemonHandle {
            pid,
            command: launch.clone(),
            base_url: self.base_url.clone(),
            state: DaemonState::Starting,
            child,
        })
    }

    async fn poll_until_ready(&self, inner: &mut Inner, deadline: Instant) -> PollOutcome {
        loop {
            if self.is_ready().await {
                return PollOutcome::Ready;
            }

            if let Some(handle) = inner.handle.as_mut() {
                if let Ok(Some(status)) = handle.child.try_wait() {
                    warn!(pid = handle.pid, %status, "inference daemon exited during startup");
                    return PollOutcome::Exited(status.to_string());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return PollOutcome::TimedOut;
            }
            tokio::time::sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn stop_locked(&self, inner: &mut Inner) -> StopReport {
        let Some(mut handle) = inner.handle.take() else {
            debug!("no daemon handle; stop is a no-op");
            return StopReport::default();
        };

        handle.state = DaemonState::Stopping;
        info!(pid = handle.pid, "stopping inference daemon");

        let mut report = StopReport {
            pid: Some(handle.pid),
            ..StopReport::default()
        };
        report.exited = terminate_escalating(
            &mut handle.child,
            handle.pid,
            self.timings.stop_grace,
            &mut report.steps,
        )
        .await;
        if !report.exited {
            warn!(pid = handle.pid, "inference daemon still appears to be running after stop attempt");
        }

        handle.state = DaemonState::Stopped;
        inner.last_state = DaemonState::Stopped;
        drop(handle);

        tokio::time::sleep(self.timings.settle).await;
        report.still_responding = self.is_ready().await;
        if report.still_responding {
            warn!(
                base_url = %self.base_url,
                "inference endpoint still responding after stop; another process may own it"
            );
        } else {
            info!("inference daemon stopped");
        }

        report
    }
}

impl Drop for DaemonSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.get_mut().handle.as_mut() {
            warn!(pid = handle.pid, "supervisor dropped without stop; killing inference daemon");
            let _ = handle.child.start_kill();
        }
    }
}

async fn terminate_escalating(
    child: &mut Child,
    pid: u32,
    grace: Duration,
    steps: &mut Vec<StopStep>,
) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        debug!(pid, "inference daemon had already exited");
        return true;
    }

    if send_signal(pid, Signal::Terminate) {
        steps.push(StopStep::Terminate);
        info!(pid, "sent terminate signal to inference daemon");
        if wait_exit(child, grace).await {
            return true;
        }
        warn!(pid, "inference daemon did not terminate gracefully, forcing");
    }

    steps.push(StopStep::ForceKill);
    if let Err(err) = child.start_kill() {
        warn!(pid, %err, "force kill failed");
    }
    if wait_exit(child, grace).await {
        return true;
    }

    warn!(pid, "inference daemon survived force kill, sending unconditional kill");
    steps.push(StopStep::UnconditionalKill);
    send_signal(pid, Signal::Kill);
    wait_exit(child, grace).await
}

async fn wait_exit(child: &mut Child, grace: Duration) -> bool {
    matches!(tokio::time::timeout(grace, child.wait()).await, Ok(Ok(_)))
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> bool {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid as libc::pid_t, signo) == 0 }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) -> bool {
    let _ = (pid, signal);
    false
}

// ── Tests ────────────────────────────────────────────────────────────────────
