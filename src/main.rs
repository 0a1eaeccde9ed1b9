mod backup;
mod config;
mod db;
mod error;
mod ipc;
mod model;
mod replica;
mod status;
mod store;
mod workflow;

use std::io::{self, BufRead, Write};

use tracing_subscriber::EnvFilter;

fn init_logging(cfg: &config::DaemonConfig) {
    // stdout carries the IPC stream; logs go to stderr.
    let filter = EnvFilter::try_new(cfg.log_filter())
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cfg = config::DaemonConfig::from_env();
    init_logging(&cfg);

    let mut state = ipc::AppState::new(cfg.clone());
    if let Some(path) = cfg.workspace.clone() {
        if let Err(e) = state.open_workspace(path) {
            tracing::error!(error = %format!("{e:#}"), "could not open configured workspace");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "examcontrold ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, shutting down");
}
