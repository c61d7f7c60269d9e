use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time as tokio_time;

use crate::am::asyncutil::TaskTracker;
use crate::am::events::sv_event;

// ---------------- Status machine ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Starting,
    StartFailed,
    Started,
    Stopping,
    Restarting,
    Stopped,
    Terminated,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::NotStarted => "NOTSTARTED",
            ProcessStatus::Starting => "STARTING",
            ProcessStatus::StartFailed => "STARTFAILED",
            ProcessStatus::Started => "STARTED",
            ProcessStatus::Stopping => "STOPPING",
            ProcessStatus::Restarting => "RESTARTING",
            ProcessStatus::Stopped => "STOPPED",
            ProcessStatus::Terminated => "TERMINATED",
        }
    }

    /// A status from which nothing is running any more: clean stop, crash, or
    /// a launch that never got off the ground.
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Stopped | ProcessStatus::Terminated | ProcessStatus::StartFailed
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The state machine forbids the requested operation. Always surfaced to
    /// the caller: it indicates an ordering bug, never swallowed here.
    #[error("process {name} is in {status}; operation requires {expected}")]
    InvalidState {
        name: String,
        status: ProcessStatus,
        expected: &'static str,
    },
    /// `is_running` cannot answer yet: the process was never started.
    #[error("{name} not started yet")]
    NotStartedYet { name: String },
    /// `is_running` cannot answer yet: a restart is in flight.
    #[error("{name} is restarting")]
    NotRestartedYet { name: String },
    /// The OS-level launch call itself failed (executable missing, bad cwd).
    /// Distinct from a successful launch that exits immediately.
    #[error("process {name} failed to launch: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("group {group} already has a member named {name}")]
    DuplicateMember { group: String, name: String },
    #[error("group {group} has no member named {name}")]
    UnknownMember { group: String, name: String },
}

// ---------------- Launch spec ----------------

#[derive(Debug, Clone, Default)]
pub enum OutputTarget {
    #[default]
    Inherit,
    Null,
    Append(PathBuf),
}

impl OutputTarget {
    fn to_stdio(&self) -> std::io::Result<Stdio> {
        match self {
            OutputTarget::Inherit => Ok(Stdio::inherit()),
            OutputTarget::Null => Ok(Stdio::null()),
            OutputTarget::Append(path) => {
                let f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(f))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub stdout: OutputTarget,
    pub stderr: OutputTarget,
}

impl LaunchSpec {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            working_directory: None,
            stdout: OutputTarget::Inherit,
            stderr: OutputTarget::Inherit,
        }
    }
}

// ---------------- Live process registry ----------------

/// Inventory of currently live managed processes (name -> pid), for debugging
/// and shutdown reports. Owned by the orchestrator and injected into every
/// ManagedProcess; each process appends itself on start and removes itself on
/// final exit.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<BTreeMap<String, Option<i32>>>>,
}

impl ProcessRegistry {
    fn register(&self, name: &str) {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.insert(name.to_string(), None);
    }

    fn set_pid(&self, name: &str, pid: i32) {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = g.get_mut(name) {
            *slot = Some(pid);
        }
    }

    fn deregister(&self, name: &str) {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.remove(name);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, Option<i32>)> {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

// ---------------- Listeners ----------------

pub type StatusListener = Arc<dyn Fn(ProcessStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn from_raw(v: u64) -> Self {
        ListenerId(v)
    }
}

/// Invoke listeners in registration order. A panicking listener is caught and
/// logged; it never interrupts the transition or the remaining listeners.
pub(crate) fn invoke_listeners(
    component: &str,
    name: &str,
    status: ProcessStatus,
    listeners: &[StatusListener],
) {
    for cb in listeners {
        if let Err(e) = catch_unwind(AssertUnwindSafe(|| cb(status))) {
            sv_event(
                component,
                Some(name),
                format!("ERROR listener_panic status={status} err={}", panic_message(&*e)),
            );
        }
    }
}

fn panic_message(e: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------- Managed process ----------------

struct ProcState {
    status: ProcessStatus,
    pid: Option<i32>,
    generation: u64,
    listeners: Vec<(ListenerId, StatusListener)>,
    next_listener: u64,
}

/// One supervised external OS process. Owns its child handle exclusively;
/// everything else talks to it through status transitions, the completion
/// signal, and plain OS signals.
pub struct ManagedProcess {
    name: String,
    spec: LaunchSpec,
    registry: ProcessRegistry,
    tracker: TaskTracker,
    state: Mutex<ProcState>,
    // Completion signal for the current generation: false while an invocation
    // is in flight, flipped to true exactly once when it has fully returned.
    exited: watch::Sender<bool>,
    weak: Weak<ManagedProcess>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("pid", &self.pid())
            .finish()
    }
}

impl ManagedProcess {
    pub fn new(
        name: impl Into<String>,
        spec: LaunchSpec,
        registry: ProcessRegistry,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        let name = name.into();
        let (exited, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            name,
            spec,
            registry,
            tracker,
            state: Mutex::new(ProcState {
                status: ProcessStatus::NotStarted,
                pid: None,
                generation: 0,
                listeners: Vec::new(),
                next_listener: 0,
            }),
            exited,
            weak: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).status
    }

    pub fn pid(&self) -> Option<i32> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).pid
    }

    /// True once the current generation's invocation has fully returned.
    pub fn completed(&self) -> bool {
        *self.exited.borrow()
    }

    pub fn add_status_listener<F>(&self, cb: F) -> ListenerId
    where
        F: Fn(ProcessStatus) + Send + Sync + 'static,
    {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let id = ListenerId(st.next_listener);
        st.next_listener += 1;
        st.listeners.push((id, Arc::new(cb)));
        id
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let before = st.listeners.len();
        st.listeners.retain(|(lid, _)| *lid != id);
        st.listeners.len() != before
    }

    /// Set the status, log it, then fire listeners in registration order.
    /// Listeners run synchronously with respect to the mutation: none of them
    /// observes a stale status, and the lock is not held while they run.
    fn set_status(&self, status: ProcessStatus) {
        let listeners: Vec<StatusListener> = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.status = status;
            st.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        sv_event("process", Some(&self.name), format!("status={status}"));
        invoke_listeners("process", &self.name, status, &listeners);
    }

    /// Launch the OS process. Suspends only until the spawn call returns; the
    /// exit is then awaited by a tracked background waiter. Valid from
    /// NotStarted/Stopped/Terminated/StartFailed, and from Restarting as the
    /// second phase of a restart.
    pub async fn start(&self) -> Result<(), ProcessError> {
        let generation = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match st.status {
                ProcessStatus::NotStarted
                | ProcessStatus::Stopped
                | ProcessStatus::Terminated
                | ProcessStatus::StartFailed
                | ProcessStatus::Restarting => {}
                other => {
                    return Err(ProcessError::InvalidState {
                        name: self.name.clone(),
                        status: other,
                        expected: "NOTSTARTED|STOPPED|TERMINATED|STARTFAILED|RESTARTING",
                    })
                }
            }
            st.generation += 1;
            st.generation
        };

        self.set_status(ProcessStatus::Starting);
        self.registry.register(&self.name);
        let _ = self.exited.send_replace(false);

        let spawned = self.spawn_child();
        let child = match spawned {
            Ok(c) => c,
            Err(e) => {
                sv_event("process", Some(&self.name), format!("ERROR spawn_failed err={e}"));
                self.set_status(ProcessStatus::StartFailed);
                self.finish_generation(generation);
                return Err(ProcessError::SpawnFailed {
                    name: self.name.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().map(|p| p as i32);
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.pid = pid;
        }
        if let Some(p) = pid {
            self.registry.set_pid(&self.name, p);
            sv_event("process", Some(&self.name), format!("spawned pid={p}"));
        }
        self.set_status(ProcessStatus::Started);

        if let Some(me) = self.weak.upgrade() {
            self.tracker.spawn(async move { me.supervise_exit(generation, child).await });
        }
        Ok(())
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        if self.spec.command.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ));
        }
        let mut cmd = Command::new(&self.spec.command[0]);
        cmd.args(&self.spec.command[1..]);
        cmd.envs(self.spec.env.iter());
        if let Some(wd) = &self.spec.working_directory {
            cmd.current_dir(wd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(self.spec.stdout.to_stdio()?);
        cmd.stderr(self.spec.stderr.to_stdio()?);
        cmd.spawn()
    }

    /// Await the process exit and map it onto the status machine. Completion
    /// signal + registry removal are guaranteed cleanup, run on every path.
    async fn supervise_exit(self: Arc<Self>, generation: u64, mut child: Child) {
        match child.wait().await {
            Ok(es) => {
                if es.success() {
                    sv_event("process", Some(&self.name), "exit code=0");
                    if self.current_generation() == generation
                        && self.status() != ProcessStatus::Restarting
                    {
                        self.set_status(ProcessStatus::Stopped);
                    }
                } else {
                    sv_event(
                        "process",
                        Some(&self.name),
                        format!("ERROR exit code={:?} signal={:?}", es.code(), es.signal()),
                    );
                    if self.current_generation() == generation
                        && self.status() != ProcessStatus::Restarting
                    {
                        self.set_status(ProcessStatus::Terminated);
                    }
                }
            }
            Err(e) => {
                sv_event("process", Some(&self.name), format!("ERROR wait_failed err={e}"));
                if self.current_generation() == generation
                    && self.status() != ProcessStatus::Restarting
                {
                    self.set_status(ProcessStatus::Terminated);
                }
            }
        }
        self.finish_generation(generation);
    }

    fn current_generation(&self) -> u64 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).generation
    }

    /// Terminal cleanup for one generation: clear the pid, set the completion
    /// signal, drop the registry entry. The generation check keeps a stale
    /// waiter from clobbering a newer invocation.
    fn finish_generation(&self, generation: u64) {
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if st.generation != generation {
                return;
            }
            st.pid = None;
        }
        let _ = self.exited.send_replace(true);
        self.registry.deregister(&self.name);
    }

    fn os_alive(&self) -> bool {
        match self.pid() {
            Some(p) => kill(Pid::from_raw(p), None).is_ok(),
            None => false,
        }
    }

    /// Liveness with two distinguished "ask again later" answers: a process
    /// mid-restart and a process never started are not a plain yes/no.
    pub fn is_running(&self) -> Result<bool, ProcessError> {
        match self.status() {
            // Still alive, just asked to stop.
            ProcessStatus::Stopping => Ok(true),
            ProcessStatus::Restarting => Err(ProcessError::NotRestartedYet {
                name: self.name.clone(),
            }),
            ProcessStatus::NotStarted => Err(ProcessError::NotStartedYet {
                name: self.name.clone(),
            }),
            _ => Ok(self.os_alive()),
        }
    }

    async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut rx = self.exited.subscribe();
        let result = matches!(
            tokio_time::timeout(timeout, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        result
    }

    /// Graceful stop: interrupt signal, wait up to `timeout` for the
    /// completion signal, then escalate to a hard kill. Returns whether a stop
    /// action was actually taken; a process that is already down is a no-op,
    /// not an error.
    pub async fn stop(&self, timeout: Duration) -> Result<bool, ProcessError> {
        self.shutdown_with(Signal::SIGINT, "SIGINT", timeout, true)
            .await
    }

    /// Same shape as `stop` but with a terminate signal, only valid from
    /// Started.
    pub async fn terminate(&self, timeout: Duration) -> Result<bool, ProcessError> {
        self.shutdown_with(Signal::SIGTERM, "SIGTERM", timeout, false)
            .await
    }

    async fn shutdown_with(
        &self,
        sig: Signal,
        sig_name: &str,
        timeout: Duration,
        allow_restarting: bool,
    ) -> Result<bool, ProcessError> {
        let status = self.status();
        match status {
            ProcessStatus::Started => self.set_status(ProcessStatus::Stopping),
            // Keep Restarting visible instead of masking the restart in progress.
            ProcessStatus::Restarting if allow_restarting => {}
            ProcessStatus::Stopped | ProcessStatus::Terminated | ProcessStatus::StartFailed => {
                sv_event(
                    "process",
                    Some(&self.name),
                    format!("stop_noop status={status}"),
                );
                return Ok(false);
            }
            other => {
                return Err(ProcessError::InvalidState {
                    name: self.name.clone(),
                    status: other,
                    expected: if allow_restarting { "STARTED|RESTARTING" } else { "STARTED" },
                })
            }
        }

        if !self.os_alive() {
            sv_event("process", Some(&self.name), "stop_noop reason=not_running");
            return Ok(false);
        }

        sv_event(
            "process",
            Some(&self.name),
            format!("stop signal={sig_name} timeout_ms={}", timeout.as_millis()),
        );
        self.raw_signal(sig);
        self.wait_exited(timeout).await;

        if self.os_alive() {
            sv_event(
                "process",
                Some(&self.name),
                format!("ERROR not stopped by {sig_name}; killing"),
            );
            self.kill();
            // Let the waiter observe the kill so status and pid converge.
            self.wait_exited(Duration::from_secs(5)).await;
        }
        Ok(true)
    }

    /// Two-phase restart on the same logical slot: mark Restarting, stop, then
    /// start again. An InvalidState from the stop phase aborts the restart and
    /// is logged, never propagated as a crash.
    pub async fn restart(&self, stop_timeout: Duration) -> Result<(), ProcessError> {
        self.set_status(ProcessStatus::Restarting);
        match self.stop(stop_timeout).await {
            Ok(_) => {}
            Err(e @ ProcessError::InvalidState { .. }) => {
                sv_event("process", Some(&self.name), format!("ERROR restart_aborted err={e}"));
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.start().await
    }

    /// Unconditional hard kill if a live process exists; no-op otherwise.
    pub fn kill(&self) -> bool {
        if !self.os_alive() {
            sv_event("process", Some(&self.name), "kill_noop reason=not_running");
            return false;
        }
        self.raw_signal(Signal::SIGKILL)
    }

    /// Raw signal delivery if alive; no-op otherwise.
    pub fn send_signal(&self, sig: Signal) -> bool {
        if !self.os_alive() {
            sv_event(
                "process",
                Some(&self.name),
                format!("signal_noop sig={sig} reason=not_running"),
            );
            return false;
        }
        self.raw_signal(sig)
    }

    fn raw_signal(&self, sig: Signal) -> bool {
        let Some(p) = self.pid() else { return false };
        match kill(Pid::from_raw(p), sig) {
            Ok(()) => true,
            Err(e) => {
                sv_event(
                    "process",
                    Some(&self.name),
                    format!("ERROR signal_failed sig={sig} pid={p} err={e}"),
                );
                false
            }
        }
    }

    /// Suspend until the current invocation has fully returned and a terminal
    /// status has landed. Restart generations keep the wait alive.
    pub async fn wait_for_completion(&self) {
        loop {
            match self.status() {
                ProcessStatus::NotStarted
                | ProcessStatus::Stopped
                | ProcessStatus::Terminated
                | ProcessStatus::StartFailed => return,
                _ => {}
            }
            let mut rx = self.exited.subscribe();
            let _ = rx.wait_for(|done| *done).await;
            // Re-check: a Restarting slot is about to run another generation.
            tokio_time::sleep(Duration::from_millis(20)).await;
        }
    }
}
