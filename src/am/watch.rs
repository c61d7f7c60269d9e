use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time as tokio_time;

use crate::am::asyncutil::TaskTracker;
use crate::am::events::sv_event;

/// Subtrees excluded from the watch: static assets are served by the proxy
/// directly and never require a code reload.
const EXCLUDED_DIR: &str = "static";

/// Watch the deployment directories for created/deleted/modified files by
/// polling a recursive mtime snapshot. Every changed path is sent on `tx`;
/// the loop exits once `shutdown` is flagged.
pub fn start_code_watch(
    tracker: &TaskTracker,
    paths: Vec<PathBuf>,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<PathBuf>,
) {
    let tracker2 = tracker.clone();
    tracker.spawn(async move {
        sv_event(
            "watch",
            None,
            format!("watching paths={:?} poll_ms={}", paths, poll.as_millis()),
        );
        let mut snapshot = {
            let paths = paths.clone();
            tracker2
                .spawn_blocking(move || scan_tree(&paths))
                .await
                .unwrap_or_default()
        };

        while !shutdown.load(Ordering::Relaxed) {
            tokio_time::sleep(poll).await;
            let current = {
                let paths = paths.clone();
                match tracker2.spawn_blocking(move || scan_tree(&paths)).await {
                    Ok(c) => c,
                    Err(e) => {
                        sv_event("watch", None, format!("ERROR scan_join_failed err={e}"));
                        continue;
                    }
                }
            };

            for (path, mtime) in &current {
                match snapshot.get(path) {
                    None => {
                        let _ = tx.send(path.clone());
                    }
                    Some(old) if old != mtime => {
                        let _ = tx.send(path.clone());
                    }
                    Some(_) => {}
                }
            }
            for path in snapshot.keys() {
                if !current.contains_key(path) {
                    let _ = tx.send(path.clone());
                }
            }
            snapshot = current;
        }
        sv_event("watch", None, "watcher=exit reason=shutting_down");
    });
}

/// Recursive file -> mtime map, skipping dotfiles and static-asset subtrees.
fn scan_tree(paths: &[PathBuf]) -> BTreeMap<PathBuf, SystemTime> {
    let mut out = BTreeMap::new();
    for path in paths {
        scan_into(path, &mut out);
    }
    out
}

fn scan_into(dir: &Path, out: &mut BTreeMap<PathBuf, SystemTime>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            if name == EXCLUDED_DIR {
                continue;
            }
            scan_into(&path, out);
        } else if let Ok(mtime) = meta.modified() {
            out.insert(path, mtime);
        }
    }
}
