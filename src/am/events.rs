use chrono::Local;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

static SERVER_LOG_TX: OnceLock<mpsc::UnboundedSender<String>> = OnceLock::new();
static EARLY_SERVER_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();
const EARLY_SERVER_LOG_MAX_LINES: usize = 5000;

/// Emit one timestamped event line: `ts [component] app=<name> key=value ...`.
///
/// Lines always go to stderr (so journald/console operators see them live).
/// Once the server log file is up they are also appended there; lines emitted
/// before that (config parse warnings, prechecks) are buffered and flushed
/// into the file when it opens.
pub fn sv_event(component: &str, app: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match app {
        Some(a) => format!("{ts} [{component}] app={a} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = SERVER_LOG_TX.get() {
        let _ = tx.send(line);
    } else {
        let q = EARLY_SERVER_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
        let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(line);
        while g.len() > EARLY_SERVER_LOG_MAX_LINES {
            g.pop_front();
        }
    }
}

/// Route `sv_event` lines into an append-only server log file.
///
/// The pump runs as a plain tokio task, not a tracked one: it lives for the
/// whole process and must not hold the shutdown barrier open.
pub fn start_log_file(path: &Path) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if SERVER_LOG_TX.set(tx).is_err() {
        // Already routing to a file (second AppServer in one process, tests).
        return;
    }
    let path = path.to_path_buf();
    sv_event("log", None, format!("server_log_file path={}", path.display()));

    tokio::spawn(async move {
        let mut f = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "{} [log] failed to open server log file {} err={e}",
                    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
                    path.display()
                );
                return;
            }
        };

        // Flush early boot lines first so the file starts at the beginning.
        if let Some(q) = EARLY_SERVER_LOG.get() {
            let drained: Vec<String> = {
                let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for line in drained {
                let mut s = line;
                if !s.ends_with('\n') {
                    s.push('\n');
                }
                let _ = f.write_all(s.as_bytes()).await;
            }
            let _ = f.flush().await;
        }

        while let Some(line) = rx.recv().await {
            let mut s = line;
            if !s.ends_with('\n') {
                s.push('\n');
            }
            let _ = f.write_all(s.as_bytes()).await;
        }
    });
}
