use anyhow::Context as _;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::am::config::ServerConfig;
use crate::am::events::sv_event;

/// Validate the environment and prepare the generated filesystem layout
/// before any side effect that could leave a partial deployment behind
/// (nothing is spawned until every check passes).
pub fn check_all(cfg: &ServerConfig) -> anyhow::Result<()> {
    resolve_binary(&cfg.proxy_command)
        .with_context(|| format!("proxy binary {:?} not usable", cfg.proxy_command))?;
    resolve_binary(&cfg.worker_command)
        .with_context(|| format!("worker binary {:?} not usable", cfg.worker_command))?;
    anyhow::ensure!(!cfg.scanner_command.is_empty(), "scanner.command is empty");
    resolve_binary(&cfg.scanner_command[0])
        .with_context(|| format!("scanner binary {:?} not usable", cfg.scanner_command[0]))?;

    for dir in &cfg.webapp_directories {
        anyhow::ensure!(
            dir.is_dir(),
            "webapp directory {} does not exist",
            dir.display()
        );
    }

    create_layout(cfg)?;
    check_stale_instance(&cfg.pid_file())?;
    sv_event("prechecks", None, "ok");
    Ok(())
}

/// Run/log directory layout, created idempotently.
fn create_layout(cfg: &ServerConfig) -> anyhow::Result<()> {
    let dirs = [
        cfg.run_directory.clone(),
        cfg.proxy_run_dir(),
        cfg.proxy_run_dir().join("cache"),
        cfg.workers_run_dir(),
        cfg.state_dir(),
        cfg.log_directory.clone(),
        cfg.log_directory.join("workers"),
    ];
    for dir in dirs {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

/// Refuse to run next to a live orchestrator: the pid file is read and its
/// pid probed with signal 0. A stale file (dead pid) is not an error.
pub fn check_stale_instance(pid_file: &Path) -> anyhow::Result<()> {
    let Ok(raw) = std::fs::read_to_string(pid_file) else {
        return Ok(());
    };
    if let Ok(pid) = raw.trim().parse::<i32>() {
        if kill(Pid::from_raw(pid), None).is_ok() {
            anyhow::bail!(
                "another appmaster instance is already running (pid {pid}, pid file {})",
                pid_file.display()
            );
        }
        sv_event(
            "prechecks",
            None,
            format!("stale pid file {} (pid {pid} is gone); taking over", pid_file.display()),
        );
    }
    Ok(())
}

pub fn write_pid_file(pid_file: &Path) -> anyhow::Result<()> {
    check_stale_instance(pid_file)?;
    std::fs::write(pid_file, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write pid file {}", pid_file.display()))
}

/// Resolve a command to an executable file: explicit paths are checked as
/// given, bare names are searched on PATH.
pub fn resolve_binary(command: &str) -> anyhow::Result<PathBuf> {
    let direct = Path::new(command);
    if direct.components().count() > 1 {
        anyhow::ensure!(is_executable(direct), "{} is not an executable file", direct.display());
        return Ok(direct.to_path_buf());
    }
    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(command);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    anyhow::bail!("{command} not found on PATH")
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_binaries_from_path_and_explicit_locations() {
        assert!(resolve_binary("sh").is_ok());
        assert!(resolve_binary("/bin/sh").is_ok());
        assert!(resolve_binary("no-such-binary-appmaster").is_err());
        assert!(resolve_binary("/etc/hostname").is_err());
    }

    #[test]
    fn live_pid_file_blocks_a_second_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("appmaster.pid");

        // Our own pid is definitely alive.
        std::fs::write(&pid_file, format!("{}", std::process::id())).unwrap();
        assert!(check_stale_instance(&pid_file).is_err());

        // A dead pid is stale, not fatal; the file can be taken over.
        std::fs::write(&pid_file, "999999").unwrap();
        assert!(check_stale_instance(&pid_file).is_ok());
        write_pid_file(&pid_file).unwrap();
        let raw = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(raw.trim(), std::process::id().to_string());

        // Missing file is fine.
        std::fs::remove_file(&pid_file).unwrap();
        assert!(check_stale_instance(&pid_file).is_ok());
    }
}
