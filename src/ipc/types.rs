use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::DaemonConfig;
use crate::db;
use crate::replica::Replica;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Rebuilt lazily after a workspace switch or a restore.
    pub replica: Option<Replica>,
    pub config: DaemonConfig,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        AppState {
            workspace: None,
            db: None,
            replica: None,
            config,
        }
    }

    /// Opens (creating and migrating if needed) the workspace database. The
    /// replica is dropped and reloaded on the next read.
    pub fn open_workspace(&mut self, path: PathBuf) -> anyhow::Result<()> {
        let conn = db::open_db(&path)?;
        tracing::info!(workspace = %path.to_string_lossy(), "workspace opened");
        self.db = Some(conn);
        self.workspace = Some(path);
        self.replica = None;
        Ok(())
    }

    pub fn close_workspace(&mut self) {
        self.db = None;
        self.replica = None;
    }
}
