use std::fmt::Write as _;
use std::sync::Arc;

use nix::sys::signal::Signal;

use crate::am::asyncutil::TaskTracker;
use crate::am::config::ServerConfig;
use crate::am::discovery::AppDescriptor;
use crate::am::events::sv_event;
use crate::am::process::{LaunchSpec, ManagedProcess, ProcessRegistry};

/// The front-end reverse proxy: one managed process plus its generated
/// config. The config file is regenerated fresh before every start and on
/// every add/remove of units; the proxy re-reads it on SIGHUP without
/// dropping connections.
pub struct ProxyService {
    cfg: ServerConfig,
    process: Arc<ManagedProcess>,
}

impl ProxyService {
    pub fn new(cfg: &ServerConfig, registry: ProcessRegistry, tracker: TaskTracker) -> Self {
        let conf = cfg.proxy_conf_file();
        let command = vec![
            cfg.proxy_command.clone(),
            "-c".to_string(),
            conf.display().to_string(),
        ];
        let process = ManagedProcess::new("proxy", LaunchSpec::new(command), registry, tracker);
        Self {
            cfg: cfg.clone(),
            process,
        }
    }

    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    /// Signal the proxy to re-read its config without restarting.
    pub fn reload_conf(&self) {
        sv_event("proxy", None, "reload signal=SIGHUP");
        self.process.send_signal(Signal::SIGHUP);
    }

    /// Regenerate the proxy config from the full unit list: one upstream per
    /// unit routed by URL prefix, plus static-asset alias locations.
    pub fn generate_conf_file(&self, apps: &[AppDescriptor]) -> anyhow::Result<()> {
        let text = self.render_conf(apps);
        let path = self.cfg.proxy_conf_file();
        std::fs::write(&path, text)
            .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
        sv_event(
            "proxy",
            None,
            format!("conf_generated path={} units={}", path.display(), apps.len()),
        );
        Ok(())
    }

    fn render_conf(&self, apps: &[AppDescriptor]) -> String {
        let cfg = &self.cfg;
        let run = cfg.proxy_run_dir();
        let mut c = String::new();

        let _ = writeln!(c, "pid {};", cfg.proxy_pid_file().display());
        let _ = writeln!(c, "daemon off;");
        let _ = writeln!(c, "error_log {}/proxy.error.log warn;", cfg.log_directory.display());
        let _ = writeln!(c, "worker_processes {};", cfg.effective_worker_processes());
        let _ = writeln!(c);
        let _ = writeln!(c, "events {{");
        let _ = writeln!(c, "    worker_connections 1024;");
        let _ = writeln!(c, "}}");
        let _ = writeln!(c);
        let _ = writeln!(c, "http {{");
        let _ = writeln!(c, "    include '{}/mime.types';", cfg.share_directory.display());
        let _ = writeln!(c, "    default_type application/octet-stream;");
        let _ = writeln!(c, "    sendfile on;");
        let _ = writeln!(c, "    keepalive_timeout 65;");
        let _ = writeln!(c, "    client_body_temp_path {}/cache 1 2;", run.display());
        let _ = writeln!(c, "    proxy_temp_path {}/proxy_temp;", run.display());
        let _ = writeln!(c, "    uwsgi_temp_path {}/uwsgi_temp;", run.display());
        let _ = writeln!(c);
        let _ = writeln!(c, "    server {{");
        let _ = writeln!(c, "        listen {};", cfg.listen);
        let _ = writeln!(c, "        server_name {};", cfg.hostname);
        let _ = writeln!(
            c,
            "        access_log {}/proxy.access.log;",
            cfg.log_directory.display()
        );

        // Static assets are served straight from each unit's static/ tree.
        for app in apps {
            if app.url_prefix.len() > 1 {
                let _ = writeln!(c);
                let _ = writeln!(c, "        location ~ {}/(.+\\..+)$ {{", app.url_prefix);
                let _ = writeln!(c, "            alias '{}/static/$1';", app.location.display());
                let _ = writeln!(c, "        }}");
            } else {
                let _ = writeln!(c);
                let _ = writeln!(c, "        location ~ /(.+\\..+)$ {{");
                let _ = writeln!(c, "            alias '{}/static/$1';", app.location.display());
                let _ = writeln!(c, "        }}");
            }
        }

        // One upstream entry per unit, path-routed by its URL prefix.
        for app in apps {
            let socket = app
                .socket
                .as_ref()
                .map(|s| s.display().to_string())
                .unwrap_or_default();
            let _ = writeln!(c);
            let _ = writeln!(c, "        location {} {{", app.url_prefix);
            let _ = writeln!(c, "            uwsgi_pass 'unix://{socket}';");
            let _ = writeln!(c, "            include '{}/uwsgi_params';", cfg.share_directory.display());
            let _ = writeln!(c, "        }}");
        }

        let _ = writeln!(c, "    }}");
        let _ = writeln!(c, "}}");
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::config::load_server_config;
    use std::path::{Path, PathBuf};

    fn test_cfg(dir: &Path) -> ServerConfig {
        let conf = dir.join("appmaster.yaml");
        std::fs::write(
            &conf,
            format!(
                "paths:\n  run: {run}\n  webapps: [webapps]\nscanner:\n  command: [scan]\n",
                run = dir.join("run").display()
            ),
        )
        .unwrap();
        let cfg = load_server_config(&conf).unwrap();
        std::fs::create_dir_all(cfg.proxy_run_dir()).unwrap();
        cfg
    }

    fn unit(id: &str, prefix: &str, socket: PathBuf) -> AppDescriptor {
        AppDescriptor {
            id: id.into(),
            name: id.into(),
            location: PathBuf::from(format!("/srv/apps/{id}")),
            url_prefix: prefix.into(),
            state_file: PathBuf::from(format!("/tmp/{id}.state")),
            socket: Some(socket),
        }
    }

    #[test]
    fn conf_has_one_upstream_location_per_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let proxy = ProxyService::new(&cfg, ProcessRegistry::default(), TaskTracker::new());

        let apps = vec![
            unit("shop", "/shop", cfg.worker_socket("shop")),
            unit("root", "/", cfg.worker_socket("root")),
        ];
        proxy.generate_conf_file(&apps).unwrap();

        let text = std::fs::read_to_string(cfg.proxy_conf_file()).unwrap();
        assert!(text.contains("location /shop {"));
        assert!(text.contains(&format!("unix://{}", cfg.worker_socket("shop").display())));
        assert!(text.contains("location / {"));
        assert!(text.contains("daemon off;"));
        assert!(text.contains("alias '/srv/apps/shop/static/$1';"));
    }

    #[test]
    fn regeneration_replaces_the_old_unit_set() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let proxy = ProxyService::new(&cfg, ProcessRegistry::default(), TaskTracker::new());

        proxy
            .generate_conf_file(&[unit("old", "/old", cfg.worker_socket("old"))])
            .unwrap();
        proxy
            .generate_conf_file(&[unit("new", "/new", cfg.worker_socket("new"))])
            .unwrap();

        let text = std::fs::read_to_string(cfg.proxy_conf_file()).unwrap();
        assert!(!text.contains("location /old {"));
        assert!(text.contains("location /new {"));
    }
}
