use anyhow::Context as _;
use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::am::appserver;
use crate::am::config::{load_server_config, ServerConfig};
use crate::am::events::sv_event;

#[derive(Debug, Parser)]
#[command(name = "appmaster", version, about = "application server supervisor")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start the proxy and worker services and supervise them
    Startup {
        /// Detach and run in the background (logs go to the server log file)
        #[arg(long = "daemon")]
        daemon: bool,
        /// Path to the server config YAML
        #[arg(short = 'c', long = "config", default_value = "appmaster.yaml")]
        config: PathBuf,
    },
    /// Stop a running appmaster instance
    Shutdown {
        /// Path to the server config YAML
        #[arg(short = 'c', long = "config", default_value = "appmaster.yaml")]
        config: PathBuf,
    },
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.cmd {
        Cmd::Startup { daemon, config } => {
            let cfg = load_server_config(&config)?;
            appserver::run(cfg, daemon)
        }
        Cmd::Shutdown { config } => {
            let cfg = load_server_config(&config)?;
            shutdown(&cfg)
        }
    }
}

/// Signal the running instance (via its pid file) to stop and wait for it to
/// exit.
fn shutdown(cfg: &ServerConfig) -> anyhow::Result<()> {
    let pid_file = cfg.pid_file();
    let raw = std::fs::read_to_string(&pid_file).with_context(|| {
        format!(
            "no pid file at {}; is appmaster running?",
            pid_file.display()
        )
    })?;
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid pid file {}", pid_file.display()))?;
    let pid = Pid::from_raw(pid);

    anyhow::ensure!(
        kill(pid, None).is_ok(),
        "appmaster (pid {pid}) is not running; remove the stale pid file {}",
        pid_file.display()
    );

    sv_event("shutdown", None, format!("signalling pid={pid} sig=SIGTERM"));
    kill(pid, Signal::SIGTERM).with_context(|| format!("failed to signal pid {pid}"))?;

    let deadline = Instant::now() + Duration::from_secs(60);
    while kill(pid, None).is_ok() {
        anyhow::ensure!(
            Instant::now() < deadline,
            "appmaster (pid {pid}) did not exit within 60s"
        );
        std::thread::sleep(Duration::from_millis(200));
    }
    println!("appmaster (pid {pid}) stopped");
    Ok(())
}
