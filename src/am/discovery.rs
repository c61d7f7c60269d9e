use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::am::events::sv_event;

/// Minimal descriptor of one deployable application, produced by discovery
/// and consumed by the orchestrator. The socket path is assigned by the
/// orchestrator, never by discovery; the descriptor list is owned by the
/// orchestrator for one discovery generation and superseded wholesale on each
/// re-discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub id: String,
    pub name: String,
    pub location: PathBuf,
    pub url_prefix: String,
    /// Serialized application definition, written by the scanner and read by
    /// the spawned worker at its own startup.
    pub state_file: PathBuf,
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

/// One JSON object printed by the scanner subprocess (last non-empty stdout
/// line, so the scanner is free to log above it).
#[derive(Debug, Clone, Deserialize)]
struct ScanOutput {
    name: String,
    url_prefix: String,
    state_file: PathBuf,
}

/// Stable, filesystem-safe unit id derived from the URL prefix:
/// `/shop/admin` -> `shop_admin`, `/` -> `root`.
pub fn unit_id(url_prefix: &str) -> String {
    let id: String = url_prefix
        .trim()
        .trim_start_matches('/')
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    if id.is_empty() {
        "root".to_string()
    } else {
        id
    }
}

fn normalize_prefix(p: &str) -> String {
    let t = p.trim();
    if t.is_empty() {
        "/".to_string()
    } else if t.starts_with('/') {
        t.to_string()
    } else {
        format!("/{t}")
    }
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Scan the deployment directories for deployable applications. Failures
    /// surface as a smaller (possibly empty) result, never as an error: the
    /// orchestrator's policy is to keep the last known-good deployment.
    async fn discover(&self, directories: &[PathBuf]) -> Vec<AppDescriptor>;
}

/// Production discovery: runs one scanner subprocess per candidate app folder
/// so application code is analyzed in isolation and never contaminates the
/// orchestrator's own process. Invocation: `<command...> <app_dir> <state_dir>`.
pub struct AppScanner {
    command: Vec<String>,
    state_dir: PathBuf,
}

impl AppScanner {
    pub fn new(command: Vec<String>, state_dir: PathBuf) -> Self {
        Self { command, state_dir }
    }

    async fn scan_one(&self, location: &Path) -> anyhow::Result<Option<AppDescriptor>> {
        anyhow::ensure!(!self.command.is_empty(), "scanner command is empty");
        let out = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(location)
            .arg(&self.state_dir)
            .output()
            .await?;
        if !out.status.success() {
            anyhow::bail!("scanner exited with {:?}", out.status.code());
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let Some(line) = text.lines().rev().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        let raw: ScanOutput = serde_json::from_str(line.trim())?;
        let url_prefix = normalize_prefix(&raw.url_prefix);
        Ok(Some(AppDescriptor {
            id: unit_id(&url_prefix),
            name: raw.name,
            location: location.to_path_buf(),
            url_prefix,
            state_file: raw.state_file,
            socket: None,
        }))
    }
}

#[async_trait]
impl Discovery for AppScanner {
    async fn discover(&self, directories: &[PathBuf]) -> Vec<AppDescriptor> {
        let mut found: Vec<AppDescriptor> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for dir in directories {
            sv_event("discovery", None, format!("scanning dir={}", dir.display()));
            let folders = match app_folders(dir) {
                Ok(f) => f,
                Err(e) => {
                    sv_event(
                        "discovery",
                        None,
                        format!("ERROR scan_dir_failed dir={} err={e}", dir.display()),
                    );
                    continue;
                }
            };
            for folder in folders {
                match self.scan_one(&folder).await {
                    Ok(Some(desc)) => {
                        if !seen.insert(desc.id.clone()) {
                            sv_event(
                                "discovery",
                                Some(&desc.name),
                                format!("WARNING duplicate_unit_id id={}; keeping the first", desc.id),
                            );
                            continue;
                        }
                        sv_event(
                            "discovery",
                            Some(&desc.name),
                            format!("unit id={} url_prefix={}", desc.id, desc.url_prefix),
                        );
                        found.push(desc);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        sv_event(
                            "discovery",
                            None,
                            format!("ERROR scan_failed app={} err={e}", folder.display()),
                        );
                    }
                }
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        sv_event("discovery", None, format!("scan_complete units={}", found.len()));
        found
    }
}

/// Direct child directories of a deployment dir, sorted, dotfiles skipped.
fn app_folders(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    name: &'a str,
    url_prefix: &'a str,
}

/// Write the deployed-apps manifest for this discovery generation; workers
/// read it at startup to know their neighbors.
pub fn write_deployed_manifest(state_dir: &Path, apps: &[AppDescriptor]) -> anyhow::Result<PathBuf> {
    let entries: Vec<ManifestEntry> = apps
        .iter()
        .map(|a| ManifestEntry {
            name: &a.name,
            url_prefix: &a.url_prefix,
        })
        .collect();
    let path = state_dir.join("deployed_apps.json");
    let data = serde_json::to_string_pretty(&entries)?;
    std::fs::write(&path, data)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
    Ok(path)
}
