use crate::bus::LogBus;
use crate::config::ServiceSpec;
use crate::error::WardenError;
use crate::supervise::backoff::RestartPolicy;
use crate::supervise::probe;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Grace window between the terminate signal and the forced kill
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a signalled child to die
const DEATH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll slice for the cancellable restart-delay wait
const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Idle,
    Starting,
    Running,
    Failed,
    Stopped,
    Exited,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Idle => write!(f, "idle"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Failed => write!(f, "failed"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Point-in-time view of one supervisor, cheap to hand to a display loop.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub name: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub restarts: u32,
}

/// Mutable lifecycle fields, guarded by the supervisor's mutex.
///
/// The lock is taken by the command path, the health-wait path and the
/// output-drain path; it is never held across an await point.
struct Lifecycle {
    status: ServiceStatus,
    child: Option<Child>,
    pid: Option<u32>,
    restarts: u32,
    /// Bumped on every launch; ties each output-drain task to the child
    /// it was spawned for, so a stale drainer can never reap a newer one.
    generation: u64,
}

impl Lifecycle {
    fn child_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Owns the full lifecycle of one external service: launch, output
/// capture, health wait, restart-on-exit, stop.
///
/// A supervisor is never destroyed by failures; it stays queryable and,
/// unless stopped explicitly or out of restart budget, keeps trying to
/// bring its service back.
pub struct ServiceSupervisor {
    spec: ServiceSpec,
    policy: RestartPolicy,
    bus: LogBus,
    lifecycle: Mutex<Lifecycle>,
    /// Set by an explicit stop; suppresses automatic restart until the
    /// next explicit start.
    stop_requested: AtomicBool,
    /// Collapses duplicate restart scheduling when the failed-start path
    /// and the output-drain path observe the same failure.
    restart_pending: AtomicBool,
    /// Group-wide shutdown flag, shared across all supervisors.
    shutdown: Arc<AtomicBool>,
}

impl ServiceSupervisor {
    pub fn new(spec: ServiceSpec, bus: LogBus, shutdown: Arc<AtomicBool>) -> Self {
        let policy = RestartPolicy::new(spec.backoff_base_secs, spec.backoff_multiplier);
        Self {
            spec,
            policy,
            bus,
            lifecycle: Mutex::new(Lifecycle {
                status: ServiceStatus::Idle,
                child: None,
                pid: None,
                restarts: 0,
                generation: 0,
            }),
            stop_requested: AtomicBool::new(false),
            restart_pending: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn status(&self) -> ServiceStatus {
        self.lifecycle.lock().unwrap().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let lifecycle = self.lifecycle.lock().unwrap();
        StatusSnapshot {
            name: self.spec.name.clone(),
            status: lifecycle.status,
            pid: lifecycle.pid,
            restarts: lifecycle.restarts,
        }
    }

    /// Whether this supervisor currently owns a live child process.
    pub fn has_live_child(&self) -> bool {
        self.lifecycle.lock().unwrap().child_alive()
    }

    /// Launch the service and block until the health outcome is known.
    ///
    /// Idempotent: a second call while the child is alive is a no-op.
    /// Every failure mode (missing files, launch error, failed health
    /// check) is converted into a log event, a Failed status and a pass
    /// through restart scheduling; nothing propagates to the caller.
    pub async fn start(self: Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if lifecycle.child_alive() {
                drop(lifecycle);
                self.bus
                    .emit(&self.spec.name, "start requested but already running");
                return;
            }
            self.stop_requested.store(false, Ordering::SeqCst);
            lifecycle.status = ServiceStatus::Starting;
        }
        self.bus.emit(&self.spec.name, "starting");

        let missing = self.missing_required_files();
        if !missing.is_empty() {
            let listed = missing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let err = WardenError::MissingRequiredFiles(self.spec.name.clone(), listed);
            self.fail(&err.to_string());
            self.clone().maybe_schedule_restart();
            return;
        }

        let mut child = match self.launch() {
            Ok(child) => child,
            Err(err) => {
                self.fail(&err.to_string());
                self.clone().maybe_schedule_restart();
                return;
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let generation = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            lifecycle.child = Some(child);
            lifecycle.pid = pid;
            lifecycle.generation += 1;
            lifecycle.generation
        };
        if let Some(pid) = pid {
            self.bus
                .emit(&self.spec.name, &format!("launched (pid {})", pid));
        }

        let drainer = Arc::clone(&self);
        tokio::spawn(async move { drainer.drain_output(generation, stdout, stderr).await });

        let alive = {
            let me = Arc::clone(&self);
            move || me.has_live_child()
        };
        let abort = {
            let me = Arc::clone(&self);
            move || {
                me.stop_requested.load(Ordering::SeqCst) || me.shutdown.load(Ordering::SeqCst)
            }
        };
        let healthy = probe::wait(&self.spec.health, alive, abort).await;

        if healthy {
            let became_running = {
                let mut lifecycle = self.lifecycle.lock().unwrap();
                if lifecycle.status == ServiceStatus::Starting {
                    lifecycle.status = ServiceStatus::Running;
                    true
                } else {
                    false
                }
            };
            if became_running {
                self.bus.emit(&self.spec.name, "running");
            }
        } else {
            let was_starting = {
                let mut lifecycle = self.lifecycle.lock().unwrap();
                if lifecycle.status == ServiceStatus::Starting {
                    lifecycle.status = ServiceStatus::Failed;
                    true
                } else {
                    false
                }
            };
            self.terminate().await;
            if was_starting {
                let err = WardenError::HealthCheckFailed(self.spec.name.clone());
                self.bus.emit(&self.spec.name, &err.to_string());
                warn!(service = %self.spec.name, "health check failed");
            }
            self.clone().maybe_schedule_restart();
        }
    }

    /// Stop the service.
    ///
    /// `force` sends SIGKILL immediately; otherwise the child gets the
    /// terminate signal and the 5s grace window before the kill. Safe to
    /// call on an idle supervisor, and never followed by an automatic
    /// restart.
    pub async fn stop(&self, force: bool) {
        self.stop_requested.store(true, Ordering::SeqCst);

        let signalled = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            let alive_pid = if lifecycle.child_alive() {
                lifecycle.pid
            } else {
                None
            };
            if let Some(pid) = alive_pid {
                let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
                    let err = WardenError::SignalError(self.spec.name.clone(), e.to_string());
                    warn!(service = %self.spec.name, "{}", err);
                }
            }
            if !matches!(
                lifecycle.status,
                ServiceStatus::Failed | ServiceStatus::Exited
            ) {
                lifecycle.status = ServiceStatus::Stopped;
            }
            alive_pid
        };

        if let Some(pid) = signalled {
            if !self.wait_for_death(STOP_GRACE).await {
                warn!(
                    service = %self.spec.name,
                    "did not exit within {:?}, sending SIGKILL", STOP_GRACE
                );
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    let err = WardenError::SignalError(self.spec.name.clone(), e.to_string());
                    warn!(service = %self.spec.name, "{}", err);
                }
                self.wait_for_death(STOP_GRACE).await;
            }
        }

        self.bus.emit(&self.spec.name, "stopped");
    }

    /// Prevent any pending or future automatic restart. Used when the
    /// supervisor is discarded on reload, so an in-flight restart timer
    /// cannot fire a start on a retired supervisor.
    pub(crate) fn retire(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn launch(&self) -> crate::error::Result<Child> {
        let mut command = Command::new(&self.spec.command[0]);
        command.args(&self.spec.command[1..]);
        command.current_dir(&self.spec.cwd);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        command
            .spawn()
            .map_err(|e| WardenError::SpawnError(self.spec.name.clone(), e.to_string()))
    }

    fn missing_required_files(&self) -> Vec<PathBuf> {
        self.spec
            .required_files
            .iter()
            .filter(|rel| !self.spec.cwd.join(rel).exists())
            .cloned()
            .collect()
    }

    fn fail(&self, message: &str) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            lifecycle.status = ServiceStatus::Failed;
        }
        warn!(service = %self.spec.name, "{}", message);
        self.bus.emit(&self.spec.name, message);
    }

    /// Forward the child's output to the bus line by line; once both
    /// pipes reach EOF, reap the exit status, record the transition and
    /// run restart scheduling.
    async fn drain_output(
        self: Arc<Self>,
        generation: u64,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) {
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            let bus = self.bus.clone();
            let name = self.spec.name.clone();
            readers.push(tokio::spawn(forward_lines(out, bus, name)));
        }
        if let Some(err) = stderr {
            let bus = self.bus.clone();
            let name = self.spec.name.clone();
            readers.push(tokio::spawn(forward_lines(err, bus, name)));
        }
        for reader in readers {
            let _ = reader.await;
        }

        let Some(exit) = self.reap_child(generation).await else {
            // Someone else already reaped and reported; restart policy
            // still gets its say (it no-ops after an explicit stop).
            self.clone().maybe_schedule_restart();
            return;
        };

        self.bus.emit(&self.spec.name, &describe_exit(&exit));

        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if !matches!(
                lifecycle.status,
                ServiceStatus::Stopped | ServiceStatus::Failed
            ) {
                lifecycle.status = ServiceStatus::Exited;
            }
        }

        self.clone().maybe_schedule_restart();
    }

    /// Wait for the child of the given generation to exit and take it out
    /// of the lifecycle. Returns None when the child was already removed
    /// elsewhere or a newer launch has superseded this generation.
    async fn reap_child(&self, generation: u64) -> Option<ExitStatus> {
        loop {
            {
                let mut lifecycle = self.lifecycle.lock().unwrap();
                if lifecycle.generation != generation {
                    return None;
                }
                let child = lifecycle.child.as_mut()?;
                match child.try_wait() {
                    Ok(Some(status)) => {
                        lifecycle.child = None;
                        lifecycle.pid = None;
                        return Some(status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(service = %self.spec.name, "wait failed: {}", e);
                        lifecycle.child = None;
                        lifecycle.pid = None;
                        return None;
                    }
                }
            }
            tokio::time::sleep(DEATH_POLL_INTERVAL).await;
        }
    }

    /// Terminate the live child with the usual escalation: terminate
    /// signal, grace window, forced kill.
    async fn terminate(&self) {
        let pid = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if lifecycle.child_alive() {
                lifecycle.pid
            } else {
                None
            }
        };
        let Some(pid) = pid else { return };

        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            let err = WardenError::SignalError(self.spec.name.clone(), e.to_string());
            warn!(service = %self.spec.name, "{}", err);
        }
        if !self.wait_for_death(STOP_GRACE).await {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                let err = WardenError::SignalError(self.spec.name.clone(), e.to_string());
                warn!(service = %self.spec.name, "{}", err);
            }
            self.wait_for_death(STOP_GRACE).await;
        }
    }

    async fn wait_for_death(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.has_live_child() {
                return true;
            }
            tokio::time::sleep(DEATH_POLL_INTERVAL).await;
        }
        !self.has_live_child()
    }

    /// Evaluate the restart policy after a failure or unexpected exit
    /// and, when allowed, schedule a delayed start.
    ///
    /// The delay wait is cooperative: it is abandoned as soon as a stop
    /// is requested or the group shuts down.
    fn maybe_schedule_restart(self: Arc<Self>) {
        if !self.spec.auto_restart {
            return;
        }
        if self.stop_requested.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if self.restart_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let attempt = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if self.spec.max_restarts >= 0 && lifecycle.restarts >= self.spec.max_restarts as u32 {
                drop(lifecycle);
                self.restart_pending.store(false, Ordering::SeqCst);
                let err = WardenError::RestartLimitExceeded(self.spec.name.clone());
                self.bus.emit(
                    &self.spec.name,
                    &format!("{} ({} attempts), giving up", err, self.spec.max_restarts),
                );
                return;
            }
            lifecycle.restarts += 1;
            lifecycle.restarts
        };

        let delay = self.policy.delay_for(attempt);
        self.bus.emit(
            &self.spec.name,
            &format!(
                "restart {} scheduled in {:.1}s",
                attempt,
                delay.as_secs_f64()
            ),
        );

        let sup = self;
        tokio::spawn(async move {
            let deadline = Instant::now() + delay;
            loop {
                if sup.stop_requested.load(Ordering::SeqCst)
                    || sup.shutdown.load(Ordering::SeqCst)
                {
                    sup.restart_pending.store(false, Ordering::SeqCst);
                    debug!(service = %sup.spec.name, "scheduled restart abandoned");
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep((deadline - now).min(RESTART_POLL_INTERVAL)).await;
            }
            sup.restart_pending.store(false, Ordering::SeqCst);
            sup.start().await;
        });
    }
}

async fn forward_lines<R>(reader: R, bus: LogBus, name: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        bus.emit(&name, &line);
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {}", code),
        None => match status.signal() {
            Some(sig) => format!("terminated by signal {}", sig),
            None => "exited".to_string(),
        },
    }
}
