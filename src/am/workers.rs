use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;

use crate::am::asyncutil::TaskTracker;
use crate::am::config::ServerConfig;
use crate::am::discovery::AppDescriptor;
use crate::am::events::sv_event;
use crate::am::group::{GroupOptions, ProcessGroup};
use crate::am::process::{LaunchSpec, ProcessError, ProcessRegistry};

/// Worker config keys the orchestrator owns; operator overrides for these are
/// ignored with a warning.
const IMMUTABLE_OPTIONS: &[&str] = &[
    "socket",
    "wsgi-file",
    "logto",
    "pidfile",
    "touch-workers-reload",
    "lazy-apps",
];

/// The backend worker pool: one managed process per deployable unit, wrapped
/// in a ProcessGroup, plus the per-unit generated configs, environment
/// contract and reload markers.
pub struct WorkerPool {
    cfg: ServerConfig,
    group: Arc<ProcessGroup>,
    apps: Mutex<Vec<AppDescriptor>>,
}

impl WorkerPool {
    pub fn new(cfg: &ServerConfig, registry: ProcessRegistry, tracker: TaskTracker) -> Self {
        let group = ProcessGroup::new(
            "workers",
            registry,
            tracker,
            GroupOptions {
                stop_all_on_one_crashed: cfg.stop_all_on_one_crashed,
                stop_timeout: cfg.stop_timeout(),
            },
        );
        Self {
            cfg: cfg.clone(),
            group,
            apps: Mutex::new(Vec::new()),
        }
    }

    pub fn group(&self) -> &Arc<ProcessGroup> {
        &self.group
    }

    pub fn apps(&self) -> Vec<AppDescriptor> {
        self.apps.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn member_name(id: &str) -> String {
        format!("worker-{id}")
    }

    /// Initial membership, called once before the group is started.
    pub fn install_apps(&self, apps: &[AppDescriptor]) -> anyhow::Result<()> {
        self.generate_conf_files(apps)?;
        for app in apps {
            self.add_member(app)?;
        }
        *self.apps.lock().unwrap_or_else(|p| p.into_inner()) = apps.to_vec();
        Ok(())
    }

    fn add_member(&self, app: &AppDescriptor) -> Result<(), ProcessError> {
        let command = vec![
            self.cfg.worker_command.clone(),
            "--ini".to_string(),
            self.cfg.worker_conf_file(&app.id).display().to_string(),
        ];
        let mut spec = LaunchSpec::new(command);
        spec.env = self.worker_env(app);
        self.group.add_process(&Self::member_name(&app.id), spec)?;
        Ok(())
    }

    /// Environment contract for a spawned worker: where its serialized
    /// definition lives, the shared session-encryption material, the proxy
    /// bind address, and a computed module search path.
    fn worker_env(&self, app: &AppDescriptor) -> BTreeMap<String, String> {
        let lib_path = [
            self.cfg.lib_directory.clone(),
            app.location.join("src"),
            app.location.join("lib"),
            app.location.join("test"),
        ]
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");

        let mut env = BTreeMap::new();
        env.insert(
            "APPMASTER_STATE_FILE".to_string(),
            app.state_file.display().to_string(),
        );
        env.insert(
            "APPMASTER_DEPLOYED_APPS".to_string(),
            self.cfg.state_dir().join("deployed_apps.json").display().to_string(),
        );
        env.insert("APPMASTER_ENCRYPT_KEY".to_string(), self.cfg.security_key.clone());
        env.insert(
            "APPMASTER_ENCRYPT_BLOCK_SIZE".to_string(),
            self.cfg.security_block_size.to_string(),
        );
        env.insert("APPMASTER_LISTEN".to_string(), self.cfg.listen.clone());
        env.insert("APPMASTER_LIB_PATH".to_string(), lib_path);
        env
    }

    /// Write one config file per unit. Operator-supplied worker_options are
    /// overlaid except for the keys the orchestrator owns.
    pub fn generate_conf_files(&self, apps: &[AppDescriptor]) -> anyhow::Result<()> {
        let mut extra: BTreeMap<&str, &str> = BTreeMap::new();
        for (key, value) in &self.cfg.worker_options {
            if IMMUTABLE_OPTIONS.contains(&key.as_str()) {
                sv_event(
                    "workers",
                    None,
                    format!("WARNING worker option {key:?} cannot be overridden; ignoring"),
                );
                continue;
            }
            extra.insert(key, value);
        }

        for app in apps {
            let socket = app
                .socket
                .as_ref()
                .map(|s| s.display().to_string())
                .unwrap_or_default();

            let mut options: BTreeMap<&str, String> = BTreeMap::new();
            options.insert("socket", socket);
            options.insert("wsgi-file", self.cfg.worker_entry.display().to_string());
            options.insert("logto", self.cfg.worker_log_file(&app.id).display().to_string());
            options.insert("pidfile", self.cfg.worker_pid_file(&app.id).display().to_string());
            options.insert(
                "touch-workers-reload",
                self.cfg.reload_marker(&app.id).display().to_string(),
            );
            options.insert("workers", self.cfg.effective_worker_processes().to_string());
            options.insert("buffer-size", "32768".to_string());
            options.insert("lazy-apps", "true".to_string());
            for (key, value) in &extra {
                options.insert(key, value.to_string());
            }

            let mut text = String::from("[uwsgi]\n");
            for (key, value) in &options {
                let _ = writeln!(text, "{key} = {value}");
            }

            let path = self.cfg.worker_conf_file(&app.id);
            std::fs::write(&path, text)
                .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
        }
        sv_event("workers", None, format!("conf_generated units={}", apps.len()));
        Ok(())
    }

    /// Converge the pool onto a new discovery generation: stop members whose
    /// unit disappeared, regenerate configs, start members for new units. A
    /// running group starts new members automatically on add.
    pub async fn add_apps(&self, new_apps: Vec<AppDescriptor>) -> anyhow::Result<()> {
        let current = self.apps();
        let current_ids: BTreeSet<String> = current.iter().map(|a| a.id.clone()).collect();
        let new_ids: BTreeSet<String> = new_apps.iter().map(|a| a.id.clone()).collect();
        sv_event(
            "workers",
            None,
            format!("converge deployed={current_ids:?} discovered={new_ids:?}"),
        );

        for app in current.iter().filter(|a| !new_ids.contains(&a.id)) {
            sv_event(
                "workers",
                Some(&app.name),
                "stopping; unit removed or broken after code change",
            );
            if let Err(e) = self.group.remove_process(&Self::member_name(&app.id)).await {
                sv_event(
                    "workers",
                    Some(&app.name),
                    format!("ERROR member_remove_failed err={e}"),
                );
            }
        }

        let to_start: Vec<AppDescriptor> = new_apps
            .iter()
            .filter(|a| !current_ids.contains(&a.id))
            .cloned()
            .collect();
        *self.apps.lock().unwrap_or_else(|p| p.into_inner()) = new_apps.clone();

        if !to_start.is_empty() {
            self.generate_conf_files(&new_apps)?;
            for app in &to_start {
                sv_event("workers", Some(&app.name), "starting new unit");
                self.add_member(app)
                    .map_err(|e| anyhow::anyhow!("failed to add worker for {}: {e}", app.id))?;
            }
        }
        Ok(())
    }

    /// Touch a unit's reload marker so its already-running worker picks up new
    /// code on the next request, without a process restart.
    pub fn touch_reload_marker(&self, app: &AppDescriptor) -> anyhow::Result<()> {
        let path = self.cfg.reload_marker(&app.id);
        std::fs::write(&path, "reload workers\n")
            .map_err(|e| anyhow::anyhow!("failed to touch {}: {e}", path.display()))?;
        Ok(())
    }

    /// HUP every worker so they re-read configuration without restarting.
    pub fn reload_conf(&self) {
        sv_event("workers", None, "reload signal=SIGHUP");
        self.group.send_signal(Signal::SIGHUP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::config::load_server_config;
    use std::path::{Path, PathBuf};

    fn test_cfg(dir: &Path, extra_options: &str) -> ServerConfig {
        let conf = dir.join("appmaster.yaml");
        std::fs::write(
            &conf,
            format!(
                concat!(
                    "paths:\n  run: {run}\n  webapps: [webapps]\n",
                    "server:\n  worker_processes: 2\n  worker_options:\n{opts}",
                    "scanner:\n  command: [scan]\n",
                    "security:\n  key: k\n",
                ),
                run = dir.join("run").display(),
                opts = extra_options,
            ),
        )
        .unwrap();
        let cfg = load_server_config(&conf).unwrap();
        std::fs::create_dir_all(cfg.workers_run_dir()).unwrap();
        std::fs::create_dir_all(cfg.state_dir()).unwrap();
        cfg
    }

    fn unit(cfg: &ServerConfig, id: &str) -> AppDescriptor {
        AppDescriptor {
            id: id.into(),
            name: id.into(),
            location: PathBuf::from(format!("/srv/apps/{id}")),
            url_prefix: format!("/{id}"),
            state_file: cfg.state_dir().join(format!("{id}.state")),
            socket: Some(cfg.worker_socket(id)),
        }
    }

    #[test]
    fn worker_conf_carries_socket_and_reload_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path(), "    buffer-size: \"65536\"\n    socket: \"/evil\"\n");
        let pool = WorkerPool::new(&cfg, ProcessRegistry::default(), TaskTracker::new());

        let apps = vec![unit(&cfg, "shop")];
        pool.generate_conf_files(&apps).unwrap();

        let text = std::fs::read_to_string(cfg.worker_conf_file("shop")).unwrap();
        assert!(text.starts_with("[uwsgi]\n"));
        assert!(text.contains(&format!("socket = {}", cfg.worker_socket("shop").display())));
        assert!(text.contains(&format!(
            "touch-workers-reload = {}",
            cfg.reload_marker("shop").display()
        )));
        assert!(text.contains("workers = 2"));
        assert!(text.contains("lazy-apps = true"));
        // Operator override applies to mutable keys only.
        assert!(text.contains("buffer-size = 65536"));
        assert!(!text.contains("/evil"));
    }

    #[test]
    fn worker_env_contract_is_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path(), "    {}\n");
        let pool = WorkerPool::new(&cfg, ProcessRegistry::default(), TaskTracker::new());

        let app = unit(&cfg, "shop");
        let env = pool.worker_env(&app);
        assert_eq!(env["APPMASTER_STATE_FILE"], app.state_file.display().to_string());
        assert_eq!(env["APPMASTER_ENCRYPT_KEY"], "k");
        assert_eq!(env["APPMASTER_ENCRYPT_BLOCK_SIZE"], "16");
        assert_eq!(env["APPMASTER_LISTEN"], "127.0.0.1:8080");
        assert!(env["APPMASTER_LIB_PATH"].contains("/srv/apps/shop/src"));
        assert!(env["APPMASTER_DEPLOYED_APPS"].ends_with("deployed_apps.json"));
    }

    #[tokio::test]
    async fn install_creates_one_member_per_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path(), "    {}\n");
        let pool = WorkerPool::new(&cfg, ProcessRegistry::default(), TaskTracker::new());

        pool.install_apps(&[unit(&cfg, "a"), unit(&cfg, "b")]).unwrap();
        assert_eq!(
            pool.group().member_names(),
            vec!["worker-a".to_string(), "worker-b".to_string()]
        );
        assert!(cfg.worker_conf_file("a").is_file());
        assert!(cfg.worker_conf_file("b").is_file());
    }

    #[tokio::test]
    async fn add_apps_diffs_against_the_live_set() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path(), "    {}\n");
        let pool = WorkerPool::new(&cfg, ProcessRegistry::default(), TaskTracker::new());

        pool.install_apps(&[unit(&cfg, "a"), unit(&cfg, "b")]).unwrap();
        // Not started: removal deletes the entry directly, addition does not
        // spawn anything yet.
        pool.add_apps(vec![unit(&cfg, "b"), unit(&cfg, "c")]).await.unwrap();

        assert_eq!(
            pool.group().member_names(),
            vec!["worker-b".to_string(), "worker-c".to_string()]
        );
        let ids: Vec<String> = pool.apps().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
        assert!(cfg.worker_conf_file("c").is_file());
    }

    #[test]
    fn reload_marker_touch_writes_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path(), "    {}\n");
        let pool = WorkerPool::new(&cfg, ProcessRegistry::default(), TaskTracker::new());

        let app = unit(&cfg, "shop");
        pool.touch_reload_marker(&app).unwrap();
        assert!(cfg.reload_marker("shop").is_file());
    }
}
