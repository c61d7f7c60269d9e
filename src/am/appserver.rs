use anyhow::Context as _;
use std::collections::BTreeSet;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time as tokio_time;

use crate::am::asyncutil::TaskTracker;
use crate::am::build_info;
use crate::am::config::ServerConfig;
use crate::am::discovery::{self, AppDescriptor, AppScanner, Discovery};
use crate::am::events::{start_log_file, sv_event};
use crate::am::prechecks;
use crate::am::process::{ProcessError, ProcessRegistry, ProcessStatus};
use crate::am::proxy::ProxyService;
use crate::am::watch;
use crate::am::workers::WorkerPool;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// A second reload was requested while one is still in flight. Surfaced
    /// to direct callers; the file-watch path just skips scheduling another.
    #[error("a code reload is already in progress")]
    CodeReloadInProgress,
}

/// Top-level orchestrator: one proxy process and one worker group that live
/// and die together, cross-monitored through status listeners, with hot code
/// reload driven by the file watcher.
pub struct AppServer {
    cfg: ServerConfig,
    registry: ProcessRegistry,
    tracker: TaskTracker,
    proxy: ProxyService,
    workers: WorkerPool,
    discovery: Arc<dyn Discovery>,
    status: Mutex<ProcessStatus>,
    reloading_code: AtomicBool,
    modified_files: Mutex<Vec<PathBuf>>,
    shutting_down: Arc<AtomicBool>,
    weak: Weak<AppServer>,
}

impl AppServer {
    /// Discover the deployment, generate all configs, and wire the
    /// cross-monitoring listeners. Nothing is spawned yet; an empty discovery
    /// is a hard startup failure (no partial deployment is ever left behind).
    pub async fn bootstrap(
        cfg: ServerConfig,
        discovery_impl: Arc<dyn Discovery>,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = ProcessRegistry::default();
        let tracker = TaskTracker::new();

        let apps = discovery_impl.discover(&cfg.webapp_directories).await;
        anyhow::ensure!(
            !apps.is_empty(),
            "no applications deployed under {:?}",
            cfg.webapp_directories
        );
        let apps = assign_sockets(&cfg, apps);
        discovery::write_deployed_manifest(&cfg.state_dir(), &apps)?;

        let proxy = ProxyService::new(&cfg, registry.clone(), tracker.clone());
        let workers = WorkerPool::new(&cfg, registry.clone(), tracker.clone());
        workers.install_apps(&apps)?;
        proxy.generate_conf_file(&apps)?;

        let server = Arc::new_cyclic(|weak| Self {
            cfg,
            registry,
            tracker,
            proxy,
            workers,
            discovery: discovery_impl,
            status: Mutex::new(ProcessStatus::NotStarted),
            reloading_code: AtomicBool::new(false),
            modified_files: Mutex::new(Vec::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            weak: weak.clone(),
        });
        server.wire_monitors();
        Ok(server)
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    fn set_status(&self, status: ProcessStatus) {
        {
            let mut st = self.status.lock().unwrap_or_else(|p| p.into_inner());
            *st = status;
        }
        sv_event("server", None, format!("status={status}"));
        if status.is_down() {
            // Releases the run loop, the signal listener and the watcher.
            self.shutting_down.store(true, Ordering::SeqCst);
        }
    }

    fn wire_monitors(&self) {
        let weak = self.weak.clone();
        self.proxy.process().add_status_listener(move |status| {
            if let Some(server) = weak.upgrade() {
                server.on_service_status(ServiceSide::Proxy, status);
            }
        });
        let weak = self.weak.clone();
        self.workers.group().add_status_listener(move |status| {
            if let Some(server) = weak.upgrade() {
                server.on_service_status(ServiceSide::Workers, status);
            }
        });
    }

    /// The heart of the failure semantics: invoked on every proxy or
    /// worker-group transition. The two components are defined to live and
    /// die together; once both are down the prior top-level status decides
    /// whether this was a clean stop, a failed start, a failed restart, or an
    /// unexpected double loss.
    fn on_service_status(&self, side: ServiceSide, status: ProcessStatus) {
        let other_status = match side {
            ServiceSide::Proxy => self.workers.group().status(),
            ServiceSide::Workers => self.proxy.process().status(),
        };

        if status.is_down() {
            if !other_status.is_down() {
                if self.status() != ProcessStatus::Stopping {
                    sv_event(
                        "server",
                        None,
                        format!("SEVERE {side} stopped unexpectedly; stopping {} as well", side.other()),
                    );
                    if let Some(server) = self.weak.upgrade() {
                        self.tracker.spawn(async move {
                            server.stop_side(side.other()).await;
                        });
                    }
                }
                return;
            }
            // Both components are down: map the prior top-level status.
            match self.status() {
                ProcessStatus::NotStarted | ProcessStatus::Starting => {
                    self.set_status(ProcessStatus::Terminated);
                    sv_event("server", None, "ERROR failed to start up");
                }
                ProcessStatus::Restarting => {
                    self.set_status(ProcessStatus::Terminated);
                    sv_event("server", None, "ERROR service restart failed");
                }
                ProcessStatus::Stopping => {
                    self.set_status(ProcessStatus::Stopped);
                    sv_event("server", None, "services stopped");
                }
                ProcessStatus::Started => {
                    self.set_status(ProcessStatus::Terminated);
                    sv_event("server", None, "SEVERE services terminated unexpectedly");
                }
                ProcessStatus::Stopped | ProcessStatus::Terminated | ProcessStatus::StartFailed => {}
            }
        } else if status == ProcessStatus::Restarting {
            sv_event("server", None, format!("{side} is restarting"));
        } else if status == ProcessStatus::Started && other_status == ProcessStatus::Started {
            match self.status() {
                ProcessStatus::Restarting => {
                    self.set_status(ProcessStatus::Started);
                    sv_event("server", None, "services restarted");
                }
                ProcessStatus::Started => {}
                _ => {
                    self.set_status(ProcessStatus::Started);
                    sv_event("server", None, "services started up");
                }
            }
        } else if status == ProcessStatus::Started {
            sv_event("server", None, format!("{side} started up"));
        }
    }

    async fn stop_side(&self, side: ServiceSide) {
        match side {
            ServiceSide::Workers => self.workers.group().stop().await,
            ServiceSide::Proxy => {
                let proxy = self.proxy.process();
                let mut result = proxy.stop(self.cfg.stop_timeout()).await;
                if matches!(result, Err(ProcessError::InvalidState { .. }))
                    && proxy.status() == ProcessStatus::Starting
                {
                    // Raced an in-flight launch: wait for it to land, then
                    // stop the fresh process.
                    for _ in 0..250 {
                        if proxy.status() != ProcessStatus::Starting {
                            break;
                        }
                        tokio_time::sleep(Duration::from_millis(20)).await;
                    }
                    result = proxy.stop(self.cfg.stop_timeout()).await;
                }
                if let Err(e) = result {
                    sv_event("server", None, format!("ERROR proxy stop failed err={e}"));
                }
            }
        }
    }

    /// Start the watcher, the signal handlers, and then proxy + workers
    /// concurrently. A component start failure is logged, not raised: the
    /// cross-monitor converges the rest of the system in response.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.set_status(ProcessStatus::Starting);

        let (tx, rx) = mpsc::unbounded_channel();
        watch::start_code_watch(
            &self.tracker,
            self.cfg.webapp_directories.clone(),
            Duration::from_millis(self.cfg.watch_poll_ms),
            Arc::clone(&self.shutting_down),
            tx,
        );
        self.start_change_pump(rx);
        self.start_signal_listener();

        let Some(server) = self.weak.upgrade() else { return Ok(()) };
        let s = Arc::clone(&server);
        let workers_task = self.tracker.spawn(async move {
            if let Err(e) = s.workers.group().start().await {
                sv_event("server", None, format!("SEVERE workers failed to start err={e}"));
            }
        });
        let s = Arc::clone(&server);
        let proxy_task = self.tracker.spawn(async move {
            if let Err(e) = s.proxy.process().start().await {
                sv_event("server", None, format!("SEVERE proxy failed to start err={e}"));
            }
        });
        let _ = workers_task.await;
        let _ = proxy_task.await;
        Ok(())
    }

    /// Graceful stop of both components; each side's failure is swallowed so
    /// the other still gets its stop.
    pub async fn stop(&self) {
        self.set_status(ProcessStatus::Stopping);
        let Some(server) = self.weak.upgrade() else { return };
        let s = Arc::clone(&server);
        let workers_task = self.tracker.spawn(async move {
            s.workers.group().stop().await;
        });
        let s = Arc::clone(&server);
        let proxy_task = self.tracker.spawn(async move {
            if let Err(e) = s.proxy.process().stop(s.cfg.stop_timeout()).await {
                sv_event("server", None, format!("ERROR proxy stop failed err={e}"));
            }
        });
        let _ = workers_task.await;
        let _ = proxy_task.await;
    }

    /// Restart both components in place, chaining stop and start.
    pub async fn restart(&self) {
        self.set_status(ProcessStatus::Restarting);
        let Some(server) = self.weak.upgrade() else { return };
        let s = Arc::clone(&server);
        let workers_task = self.tracker.spawn(async move {
            if let Err(e) = s.workers.group().restart().await {
                sv_event("server", None, format!("SEVERE workers failed to restart err={e}"));
            }
        });
        let s = Arc::clone(&server);
        let proxy_task = self.tracker.spawn(async move {
            if let Err(e) = s.proxy.process().restart(s.cfg.stop_timeout()).await {
                sv_event("server", None, format!("SEVERE proxy failed to restart err={e}"));
            }
        });
        let _ = workers_task.await;
        let _ = proxy_task.await;
    }

    /// HUP both components: re-read configuration without restarting.
    pub fn reload_conf(&self) {
        sv_event("server", None, "reload_conf");
        self.workers.reload_conf();
        self.proxy.reload_conf();
    }

    /// Re-run discovery and converge the live deployment onto the result.
    /// Guarded by a single in-flight flag; everything after the guard keeps
    /// the last known-good deployment on failure rather than tearing it down.
    pub async fn reload_code(&self) -> Result<(), ReloadError> {
        if self
            .reloading_code
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReloadError::CodeReloadInProgress);
        }
        let _guard = ReloadGuard(&self.reloading_code);

        // Debounce: a multi-file save lands as one reload.
        tokio_time::sleep(Duration::from_millis(self.cfg.reload_debounce_ms)).await;

        if self.status() != ProcessStatus::Started {
            sv_event(
                "server",
                None,
                format!("reload_code skipped status={}", self.status()),
            );
            return Ok(());
        }

        let apps = self.discovery.discover(&self.cfg.webapp_directories).await;
        if apps.is_empty() {
            sv_event(
                "server",
                None,
                "WARNING scan found no applications; old code retained, nothing redeployed",
            );
            return Ok(());
        }
        let apps = assign_sockets(&self.cfg, apps);

        let modified: Vec<PathBuf> = {
            let mut g = self.modified_files.lock().unwrap_or_else(|p| p.into_inner());
            g.drain(..).collect()
        };
        let live_ids: BTreeSet<String> = self.workers.apps().iter().map(|a| a.id.clone()).collect();
        // Units present both before and after whose sources were touched get
        // an in-place reload via their marker file.
        let modified_units: Vec<AppDescriptor> = apps
            .iter()
            .filter(|a| live_ids.contains(&a.id))
            .filter(|a| modified.iter().any(|p| p.starts_with(&a.location)))
            .cloned()
            .collect();

        if let Err(e) = discovery::write_deployed_manifest(&self.cfg.state_dir(), &apps) {
            sv_event("server", None, format!("ERROR manifest_write_failed err={e}"));
        }
        if let Err(e) = self.proxy.generate_conf_file(&apps) {
            sv_event(
                "server",
                None,
                format!("ERROR proxy conf regeneration failed; keeping old deployment err={e}"),
            );
            return Ok(());
        }
        for app in &modified_units {
            sv_event("server", Some(&app.name), "reloading in place");
            if let Err(e) = self.workers.touch_reload_marker(app) {
                sv_event("server", Some(&app.name), format!("ERROR marker_touch_failed err={e}"));
            }
        }
        if let Err(e) = self.workers.add_apps(apps).await {
            sv_event("server", None, format!("ERROR worker convergence failed err={e}"));
        }
        self.proxy.reload_conf();
        sv_event("server", None, "code updated");
        Ok(())
    }

    /// Accumulate the changed path and schedule one reload if none is in
    /// flight; bursts of filesystem events coalesce into a single reload.
    fn on_code_change(&self, path: PathBuf) {
        sv_event("watch", None, format!("modified path={}", path.display()));
        self.modified_files
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(path);
        if !self.reloading_code.load(Ordering::SeqCst) {
            if let Some(server) = self.weak.upgrade() {
                self.tracker.spawn(async move {
                    match server.reload_code().await {
                        Ok(()) => {}
                        // Lost the race to another reload; ours is coalesced
                        // into it via the accumulated file list.
                        Err(ReloadError::CodeReloadInProgress) => {}
                    }
                });
            }
        }
    }

    fn start_change_pump(&self, mut rx: mpsc::UnboundedReceiver<PathBuf>) {
        let Some(server) = self.weak.upgrade() else { return };
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    p = rx.recv() => match p {
                        Some(path) => server.on_code_change(path),
                        None => break,
                    },
                    _ = tokio_time::sleep(Duration::from_millis(200)) => {
                        if server.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// INT/TERM/ABRT stop the services gracefully; HUP reloads configuration
    /// (not code). The listener exits once shutdown is flagged so the
    /// convergence barrier can release.
    fn start_signal_listener(&self) {
        let Some(server) = self.weak.upgrade() else { return };
        self.tracker.spawn(async move {
            let mut sigint = match unix_signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    sv_event("signal", None, format!("ERROR install_failed sig=INT err={e}"));
                    return;
                }
            };
            let mut sigterm = match unix_signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    sv_event("signal", None, format!("ERROR install_failed sig=TERM err={e}"));
                    return;
                }
            };
            let mut sigabrt = match unix_signal(SignalKind::from_raw(libc::SIGABRT)) {
                Ok(s) => s,
                Err(e) => {
                    sv_event("signal", None, format!("ERROR install_failed sig=ABRT err={e}"));
                    return;
                }
            };
            let mut sighup = match unix_signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    sv_event("signal", None, format!("ERROR install_failed sig=HUP err={e}"));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = sigint.recv() => server.on_stop_signal("SIGINT"),
                    _ = sigterm.recv() => server.on_stop_signal("SIGTERM"),
                    _ = sigabrt.recv() => server.on_stop_signal("SIGABRT"),
                    _ = sighup.recv() => {
                        sv_event("signal", None, "received=SIGHUP action=reload_conf");
                        server.reload_conf();
                    }
                    _ = tokio_time::sleep(Duration::from_millis(200)) => {
                        if server.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
            sv_event("signal", None, "listener=exit reason=shutting_down");
        });
    }

    fn on_stop_signal(&self, name: &str) {
        sv_event("signal", None, format!("received={name} action=stop"));
        sv_event(
            "registry",
            None,
            format!("live_processes={:?}", self.registry.snapshot()),
        );
        if let Some(server) = self.weak.upgrade() {
            self.tracker.spawn(async move {
                server.stop().await;
            });
        }
    }

    /// The run-forever barrier: suspends until every tracked task (exit
    /// waiters, stop fans, reloads, the service loops) has drained, which
    /// happens once both components reached a terminal status.
    pub async fn wait_for_completion(&self) {
        self.tracker.wait_idle().await;
        sv_event("server", None, "service was shutdown");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceSide {
    Proxy,
    Workers,
}

impl ServiceSide {
    fn other(self) -> ServiceSide {
        match self {
            ServiceSide::Proxy => ServiceSide::Workers,
            ServiceSide::Workers => ServiceSide::Proxy,
        }
    }
}

impl std::fmt::Display for ServiceSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServiceSide::Proxy => "proxy",
            ServiceSide::Workers => "workers",
        })
    }
}

struct ReloadGuard<'a>(&'a AtomicBool);

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn assign_sockets(cfg: &ServerConfig, mut apps: Vec<AppDescriptor>) -> Vec<AppDescriptor> {
    for app in &mut apps {
        app.socket = Some(cfg.worker_socket(&app.id));
    }
    apps
}

// ---------------- Top-level run path ----------------

/// Full startup: prechecks, optional daemonize (before the runtime exists),
/// then the supervised run until shutdown.
pub fn run(cfg: ServerConfig, daemon: bool) -> anyhow::Result<()> {
    prechecks::check_all(&cfg)?;
    if daemon {
        daemonize(&cfg.server_log_file())?;
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_async(cfg))
}

async fn run_async(cfg: ServerConfig) -> anyhow::Result<()> {
    prechecks::write_pid_file(&cfg.pid_file())?;
    start_log_file(&cfg.server_log_file());
    sv_event("boot", None, build_info::banner());

    let scanner = Arc::new(AppScanner::new(cfg.scanner_command.clone(), cfg.state_dir()));
    let pid_file = cfg.pid_file();
    let result = async {
        let server = AppServer::bootstrap(cfg, scanner).await?;
        server.start().await?;
        sv_event("server", None, "supervising");
        server.wait_for_completion().await;
        anyhow::Ok(())
    }
    .await;
    let _ = std::fs::remove_file(&pid_file);
    result
}

/// Double fork with setsid; stdin comes from /dev/null and stdout/stderr are
/// appended to the server log. Must run before the tokio runtime is built.
fn daemonize(log_file: &std::path::Path) -> anyhow::Result<()> {
    use nix::unistd::{dup2, fork, setsid, ForkResult};

    match unsafe { fork() }.context("first fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    std::env::set_current_dir("/").context("chdir /")?;
    setsid().context("setsid")?;
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    match unsafe { fork() }.context("second fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    let devnull = std::fs::File::open("/dev/null").context("open /dev/null")?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("open {}", log_file.display()))?;
    dup2(devnull.as_raw_fd(), 0).context("dup2 stdin")?;
    dup2(log.as_raw_fd(), 1).context("dup2 stdout")?;
    dup2(log.as_raw_fd(), 2).context("dup2 stderr")?;
    sv_event("boot", None, "started as daemon");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::config::load_server_config;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const SERVICE_SCRIPT: &str = "#!/bin/sh\ntrap 'exit 0' INT TERM\nwhile :; do sleep 0.05; done\n";

    /// Discovery stub: returns queued results in order, then the fallback.
    struct StubDiscovery {
        queued: Mutex<VecDeque<Vec<AppDescriptor>>>,
        fallback: Vec<AppDescriptor>,
        delay: Duration,
    }

    impl StubDiscovery {
        fn new(fallback: Vec<AppDescriptor>) -> Arc<Self> {
            Arc::new(Self {
                queued: Mutex::new(VecDeque::new()),
                fallback,
                delay: Duration::from_millis(0),
            })
        }

        fn push(&self, apps: Vec<AppDescriptor>) {
            self.queued.lock().unwrap().push_back(apps);
        }
    }

    #[async_trait]
    impl Discovery for StubDiscovery {
        async fn discover(&self, _dirs: &[PathBuf]) -> Vec<AppDescriptor> {
            if !self.delay.is_zero() {
                tokio_time::sleep(self.delay).await;
            }
            let next = self.queued.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn write_exec(path: &Path, body: &str) {
        std::fs::write(path, body).unwrap();
        let mut perm = std::fs::metadata(path).unwrap().permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(path, perm).unwrap();
    }

    /// Test fixture: tempdir layout, fake proxy/worker binaries that behave
    /// like well-mannered daemons, tiny debounce.
    fn test_cfg(dir: &Path) -> ServerConfig {
        let proxy_bin = dir.join("fake-proxy");
        let worker_bin = dir.join("fake-worker");
        write_exec(&proxy_bin, SERVICE_SCRIPT);
        write_exec(&worker_bin, SERVICE_SCRIPT);
        std::fs::create_dir_all(dir.join("webapps")).unwrap();

        let conf = dir.join("appmaster.yaml");
        std::fs::write(
            &conf,
            format!(
                concat!(
                    "paths:\n  run: {run}\n  webapps: [webapps]\n",
                    "server:\n  proxy: {proxy}\n  worker: {worker}\n",
                    "scanner:\n  command: [/bin/true]\n",
                    "security:\n  key: test\n",
                    "supervisor:\n  stop_timeout_ms: 3000\n",
                    "reload:\n  debounce_ms: 10\n  watch_poll_ms: 100\n",
                ),
                run = dir.join("run").display(),
                proxy = proxy_bin.display(),
                worker = worker_bin.display(),
            ),
        )
        .unwrap();
        let cfg = load_server_config(&conf).unwrap();
        prechecks::check_all(&cfg).unwrap();
        cfg
    }

    fn unit(cfg: &ServerConfig, id: &str) -> AppDescriptor {
        let location = cfg.webapp_directories[0].join(id);
        std::fs::create_dir_all(&location).unwrap();
        AppDescriptor {
            id: id.into(),
            name: id.into(),
            location,
            url_prefix: format!("/{id}"),
            state_file: cfg.state_dir().join(format!("{id}.state")),
            socket: None,
        }
    }

    async fn wait_top_status(server: &Arc<AppServer>, want: ProcessStatus, ms: u64) -> bool {
        for _ in 0..(ms / 10).max(1) {
            if server.status() == want {
                return true;
            }
            tokio_time::sleep(Duration::from_millis(10)).await;
        }
        server.status() == want
    }

    #[tokio::test]
    async fn bootstrap_fails_hard_when_nothing_is_deployed() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let stub = StubDiscovery::new(vec![]);
        assert!(AppServer::bootstrap(cfg, stub).await.is_err());
    }

    #[tokio::test]
    async fn starts_proxy_and_workers_and_reports_started() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let apps = vec![unit(&cfg, "alpha"), unit(&cfg, "beta")];
        let stub = StubDiscovery::new(apps);

        let server = AppServer::bootstrap(cfg.clone(), stub).await.unwrap();
        assert!(cfg.proxy_conf_file().is_file());
        assert!(cfg.worker_conf_file("alpha").is_file());
        assert_eq!(server.status(), ProcessStatus::NotStarted);

        server.start().await.unwrap();
        assert!(wait_top_status(&server, ProcessStatus::Started, 3000).await);
        assert_eq!(server.workers.group().len(), 2);
        assert_eq!(server.registry().len(), 3);

        server.stop().await;
        assert!(wait_top_status(&server, ProcessStatus::Stopped, 5000).await);
        // The barrier releases only once every exit waiter has finished its
        // cleanup, so the registry is fully drained after it.
        server.wait_for_completion().await;
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn worker_crash_takes_the_proxy_down_and_terminates() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let apps = vec![unit(&cfg, "alpha"), unit(&cfg, "beta")];
        let stub = StubDiscovery::new(apps);

        let server = AppServer::bootstrap(cfg, stub).await.unwrap();
        server.start().await.unwrap();
        assert!(wait_top_status(&server, ProcessStatus::Started, 3000).await);

        // Kill one worker's OS process externally with a nonzero exit.
        let w = server.workers.group().member("worker-alpha").unwrap();
        assert!(w.kill());

        // Crash cascade stops the group; the cross-monitor then stops the
        // still-live proxy; unexpected dual loss maps to Terminated.
        assert!(wait_top_status(&server, ProcessStatus::Terminated, 8000).await);
        assert!(server.workers.group().status().is_down());
        assert!(server.proxy.process().status().is_down());
        server.wait_for_completion().await;
    }

    #[tokio::test]
    async fn empty_rescan_keeps_the_old_deployment() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let apps = vec![unit(&cfg, "alpha")];
        let stub = StubDiscovery::new(apps);

        let server = AppServer::bootstrap(cfg.clone(), Arc::clone(&stub) as Arc<dyn Discovery>)
            .await
            .unwrap();
        server.start().await.unwrap();
        assert!(wait_top_status(&server, ProcessStatus::Started, 3000).await);

        let conf_before = std::fs::read_to_string(cfg.proxy_conf_file()).unwrap();
        stub.push(vec![]); // simulated scan failure
        server.reload_code().await.unwrap();

        assert_eq!(server.status(), ProcessStatus::Started);
        assert_eq!(server.workers.group().member_names(), vec!["worker-alpha".to_string()]);
        let conf_after = std::fs::read_to_string(cfg.proxy_conf_file()).unwrap();
        assert_eq!(conf_before, conf_after);

        server.stop().await;
        server.wait_for_completion().await;
    }

    #[tokio::test]
    async fn reload_converges_members_and_touches_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let alpha = unit(&cfg, "alpha");
        let stub = StubDiscovery::new(vec![alpha.clone()]);

        let server = AppServer::bootstrap(cfg.clone(), Arc::clone(&stub) as Arc<dyn Discovery>)
            .await
            .unwrap();
        server.start().await.unwrap();
        assert!(wait_top_status(&server, ProcessStatus::Started, 3000).await);

        // alpha sources changed; discovery now also finds gamma. The path is
        // seeded straight into the accumulator so exactly one reload runs.
        server
            .modified_files
            .lock()
            .unwrap()
            .push(alpha.location.join("handlers.py"));
        let gamma = unit(&cfg, "gamma");
        stub.push(vec![alpha.clone(), gamma.clone()]);
        server.reload_code().await.unwrap();

        let mut names = server.workers.group().member_names();
        names.sort();
        assert_eq!(names, vec!["worker-alpha".to_string(), "worker-gamma".to_string()]);
        assert!(cfg.reload_marker("alpha").is_file());
        assert!(!cfg.reload_marker("gamma").exists());
        let conf = std::fs::read_to_string(cfg.proxy_conf_file()).unwrap();
        assert!(conf.contains("location /gamma {"));

        // Next generation drops alpha entirely.
        stub.push(vec![gamma.clone()]);
        server.reload_code().await.unwrap();
        assert_eq!(server.workers.group().member_names(), vec!["worker-gamma".to_string()]);

        server.stop().await;
        server.wait_for_completion().await;
    }

    #[tokio::test]
    async fn second_reload_while_one_is_in_flight_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let apps = vec![unit(&cfg, "alpha")];
        let stub = Arc::new(StubDiscovery {
            queued: Mutex::new(VecDeque::new()),
            fallback: apps,
            delay: Duration::from_millis(300),
        });

        let server = AppServer::bootstrap(cfg, Arc::clone(&stub) as Arc<dyn Discovery>)
            .await
            .unwrap();
        server.start().await.unwrap();
        assert!(wait_top_status(&server, ProcessStatus::Started, 3000).await);

        let s2 = Arc::clone(&server);
        let first = tokio::spawn(async move { s2.reload_code().await });
        tokio_time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            server.reload_code().await,
            Err(ReloadError::CodeReloadInProgress)
        ));
        first.await.unwrap().unwrap();

        // The guard clears once the first reload finishes.
        server.reload_code().await.unwrap();

        server.stop().await;
        server.wait_for_completion().await;
    }

    #[tokio::test]
    async fn reload_is_skipped_unless_started() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let apps = vec![unit(&cfg, "alpha")];
        let stub = StubDiscovery::new(apps);

        let server = AppServer::bootstrap(cfg, stub).await.unwrap();
        // Not started yet: the reload is an informational no-op.
        server.reload_code().await.unwrap();
        assert_eq!(server.status(), ProcessStatus::NotStarted);
        assert_eq!(server.workers.group().member_names(), vec!["worker-alpha".to_string()]);
    }
}
