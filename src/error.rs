use serde_json::json;

use crate::db;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0}")]
    BadParams(String),
    #[error("{0}")]
    NotFound(String),
    /// A business rule refused the action; `code` is stable for callers.
    #[error("{message}")]
    Rejected { code: &'static str, message: String },
    #[error("select a workspace first")]
    NoWorkspace,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error("stored {table} row could not be decoded: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ControlError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        ControlError::BadParams(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ControlError::NotFound(message.into())
    }

    pub fn rejected(code: &'static str, message: impl Into<String>) -> Self {
        ControlError::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ControlError::BadParams(_) => "bad_params",
            ControlError::NotFound(_) => "not_found",
            ControlError::Rejected { code, .. } => *code,
            ControlError::NoWorkspace => "no_workspace",
            ControlError::Db(e) if db::is_busy(e) => "db_busy",
            ControlError::Db(e) if db::is_constraint(e) => "db_constraint",
            ControlError::Db(_) => "db_query_failed",
            ControlError::Decode { .. } => "db_decode_failed",
        }
    }

    /// Busy/locked database failures may succeed if repeated; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlError::Db(e) if db::is_busy(e))
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ControlError::Db(e) if db::is_constraint(e) => Some(json!({
                "retryable": false,
                "hint": "the write conflicts with an existing row or an allowed value list; reload and check the record",
            })),
            ControlError::Db(_) => Some(json!({ "retryable": self.is_retryable() })),
            ControlError::Decode { table, .. } => Some(json!({ "table": table })),
            _ => None,
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
