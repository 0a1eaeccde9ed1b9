use std::path::PathBuf;

pub const ENV_WORKSPACE: &str = "EXAMCTL_WORKSPACE";
pub const ENV_LOG: &str = "EXAMCTL_LOG";
pub const DEFAULT_LOG_FILTER: &str = "examcontrold=info";

/// Process-level settings. Exam settings live in the workspace (`system_config`).
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub workspace: Option<PathBuf>,
    pub log_filter: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        DaemonConfig {
            workspace: non_empty(ENV_WORKSPACE).map(PathBuf::from),
            log_filter: non_empty(ENV_LOG),
        }
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}
