use base64::Engine as _;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::am::events::sv_event;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub hostname: String,
    /// Address the proxy binds; workers receive it in their environment.
    pub listen: String,

    /// Run directory: sockets, generated configs, pid files, reload markers.
    pub run_directory: PathBuf,
    pub log_directory: PathBuf,
    /// Shared static material for generated configs (mime.types, params).
    pub share_directory: PathBuf,
    /// Library root prepended to every worker's module search path.
    pub lib_directory: PathBuf,
    /// Deployment directories scanned for applications; also watched for
    /// code changes.
    pub webapp_directories: Vec<PathBuf>,

    pub proxy_command: String,
    pub worker_command: String,
    /// Entry file handed to every worker via its generated config.
    pub worker_entry: PathBuf,
    /// OS worker processes per unit; 0 means "one per CPU".
    pub worker_processes: usize,
    /// Extra worker config options; keys on the immutable list are ignored.
    pub worker_options: BTreeMap<String, String>,

    /// Out-of-process scanner argv; invoked per app folder.
    pub scanner_command: Vec<String>,

    pub security_key: String,
    pub security_block_size: usize,

    pub stop_timeout_ms: u64,
    pub stop_all_on_one_crashed: bool,

    pub reload_debounce_ms: u64,
    pub watch_poll_ms: u64,
}

impl ServerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn effective_worker_processes(&self) -> usize {
        if self.worker_processes > 0 {
            self.worker_processes
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }

    // -------- Generated filesystem layout --------

    pub fn pid_file(&self) -> PathBuf {
        self.run_directory.join("appmaster.pid")
    }

    pub fn server_log_file(&self) -> PathBuf {
        self.log_directory.join("appmaster.log")
    }

    pub fn proxy_run_dir(&self) -> PathBuf {
        self.run_directory.join("proxy")
    }

    pub fn proxy_conf_file(&self) -> PathBuf {
        self.proxy_run_dir().join("proxy.conf")
    }

    pub fn proxy_pid_file(&self) -> PathBuf {
        self.proxy_run_dir().join("proxy.pid")
    }

    pub fn workers_run_dir(&self) -> PathBuf {
        self.run_directory.join("workers")
    }

    /// Serialized definitions + deployed-apps manifest live here.
    pub fn state_dir(&self) -> PathBuf {
        self.workers_run_dir().join("state")
    }

    pub fn worker_conf_file(&self, id: &str) -> PathBuf {
        self.workers_run_dir().join(format!("{id}.conf"))
    }

    pub fn worker_socket(&self, id: &str) -> PathBuf {
        self.workers_run_dir().join(format!("{id}.socket"))
    }

    pub fn worker_pid_file(&self, id: &str) -> PathBuf {
        self.workers_run_dir().join(format!("{id}.pid"))
    }

    pub fn worker_log_file(&self, id: &str) -> PathBuf {
        self.log_directory.join("workers").join(format!("{id}.log"))
    }

    /// Touch-file that tells a running worker to reload its code in place.
    pub fn reload_marker(&self, id: &str) -> PathBuf {
        self.workers_run_dir().join(format!("{id}.reload"))
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalSection {
    #[serde(default = "default_hostname")]
    hostname: String,
    #[serde(default = "default_listen")]
    listen: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsSection {
    #[serde(default)]
    run: Option<PathBuf>,
    #[serde(default)]
    logs: Option<PathBuf>,
    #[serde(default)]
    share: Option<PathBuf>,
    #[serde(default)]
    lib: Option<PathBuf>,
    webapps: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    #[serde(default = "default_proxy_command")]
    proxy: String,
    #[serde(default = "default_worker_command")]
    worker: String,
    #[serde(default)]
    worker_entry: Option<PathBuf>,
    #[serde(default)]
    worker_processes: Option<usize>,
    #[serde(default)]
    worker_options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScannerSection {
    command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SecuritySection {
    #[serde(default)]
    key: Option<String>,
    #[serde(default = "default_block_size")]
    block_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorSection {
    #[serde(default = "default_stop_timeout_ms")]
    stop_timeout_ms: u64,
    #[serde(default = "default_stop_all_on_one_crashed")]
    stop_all_on_one_crashed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReloadSection {
    #[serde(default = "default_reload_debounce_ms")]
    debounce_ms: u64,
    #[serde(default = "default_watch_poll_ms")]
    watch_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerConfigFile {
    #[serde(default)]
    global: Option<GlobalSection>,
    paths: PathsSection,
    #[serde(default)]
    server: Option<ServerSection>,
    scanner: ScannerSection,
    #[serde(default)]
    security: Option<SecuritySection>,
    #[serde(default)]
    supervisor: Option<SupervisorSection>,
    #[serde(default)]
    reload: Option<ReloadSection>,
}

fn default_hostname() -> String {
    "localhost".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_proxy_command() -> String {
    "nginx".to_string()
}
fn default_worker_command() -> String {
    "uwsgi".to_string()
}
fn default_block_size() -> usize {
    16
}
fn default_stop_timeout_ms() -> u64 {
    15_000
}
fn default_stop_all_on_one_crashed() -> bool {
    true
}
fn default_reload_debounce_ms() -> u64 {
    2_000
}
fn default_watch_poll_ms() -> u64 {
    1_000
}

fn default_run_directory() -> PathBuf {
    let user = users::get_current_username()
        .map(|u| u.to_string_lossy().to_string())
        .unwrap_or_else(|| "nobody".to_string());
    PathBuf::from(format!("/tmp/appmaster-{user}"))
}

/// Fresh random session-encryption key for configs that do not pin one.
fn generate_security_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn load_server_config(config_path: &Path) -> anyhow::Result<ServerConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: ServerConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let resolve = |p: PathBuf| -> PathBuf {
        if p.is_relative() {
            base.join(p)
        } else {
            p
        }
    };

    let global = file_cfg.global.unwrap_or(GlobalSection {
        hostname: default_hostname(),
        listen: default_listen(),
    });
    let server = file_cfg.server.unwrap_or(ServerSection {
        proxy: default_proxy_command(),
        worker: default_worker_command(),
        worker_entry: None,
        worker_processes: None,
        worker_options: BTreeMap::new(),
    });
    let security = file_cfg.security.unwrap_or(SecuritySection {
        key: None,
        block_size: default_block_size(),
    });
    let supervisor = file_cfg.supervisor.unwrap_or(SupervisorSection {
        stop_timeout_ms: default_stop_timeout_ms(),
        stop_all_on_one_crashed: default_stop_all_on_one_crashed(),
    });
    let reload = file_cfg.reload.unwrap_or(ReloadSection {
        debounce_ms: default_reload_debounce_ms(),
        watch_poll_ms: default_watch_poll_ms(),
    });

    anyhow::ensure!(
        !file_cfg.paths.webapps.is_empty(),
        "paths.webapps must list at least one deployment directory"
    );
    anyhow::ensure!(
        !file_cfg.scanner.command.is_empty(),
        "scanner.command must not be empty"
    );
    anyhow::ensure!(
        security.block_size > 0,
        "security.block_size must be positive"
    );

    let run_directory = file_cfg
        .paths
        .run
        .map(&resolve)
        .unwrap_or_else(default_run_directory);
    let log_directory = file_cfg
        .paths
        .logs
        .map(&resolve)
        .unwrap_or_else(|| run_directory.join("logs"));
    let share_directory = file_cfg
        .paths
        .share
        .map(&resolve)
        .unwrap_or_else(|| base.join("share"));
    let lib_directory = file_cfg
        .paths
        .lib
        .map(&resolve)
        .unwrap_or_else(|| base.join("lib"));
    let webapp_directories: Vec<PathBuf> =
        file_cfg.paths.webapps.into_iter().map(&resolve).collect();

    let security_key = match security.key {
        Some(k) if !k.trim().is_empty() => k,
        _ => {
            sv_event("config", None, "security.key not set; generated a random key");
            generate_security_key()
        }
    };

    let worker_entry = server
        .worker_entry
        .map(&resolve)
        .unwrap_or_else(|| lib_directory.join("wsgi.py"));

    Ok(ServerConfig {
        hostname: global.hostname,
        listen: global.listen,
        run_directory,
        log_directory,
        share_directory,
        lib_directory,
        webapp_directories,
        proxy_command: server.proxy,
        worker_command: server.worker,
        worker_entry,
        worker_processes: server.worker_processes.unwrap_or(0),
        worker_options: server.worker_options,
        scanner_command: file_cfg.scanner.command,
        security_key,
        security_block_size: security.block_size,
        stop_timeout_ms: supervisor.stop_timeout_ms,
        stop_all_on_one_crashed: supervisor.stop_all_on_one_crashed,
        reload_debounce_ms: reload.debounce_ms,
        watch_poll_ms: reload.watch_poll_ms,
    })
}
