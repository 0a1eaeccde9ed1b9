use std::collections::{BTreeMap, HashMap};

use rusqlite::Connection;
use serde::de::DeserializeOwned;

use crate::db::JOURNALED;
use crate::error::{ControlError, ControlResult};
use crate::model::{Snapshot, SystemConfig, MAIN_CONFIG_ID};
use crate::store::{self, Change, ChangeOp};

const CATCH_UP_BATCH: i64 = 5000;

/// In-memory copy of every journaled table, keyed by primary key and kept
/// current by applying change-log deltas instead of reloading collections.
#[derive(Debug, Default)]
pub struct Replica {
    version: i64,
    tables: HashMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Replica {
    pub fn load(conn: &Connection) -> ControlResult<Replica> {
        let tx = conn.unchecked_transaction()?;
        let mut replica = Replica {
            version: store::current_version(&tx)?,
            tables: HashMap::new(),
        };
        for spec in JOURNALED {
            let mut rows = BTreeMap::new();
            for raw in store::select_json(&tx, spec.table, None, &[])? {
                let value: serde_json::Value = store::decode(spec.table, &raw)?;
                let Some(id) = value.get("id").and_then(|v| v.as_str()).map(str::to_string)
                else {
                    continue;
                };
                rows.insert(id, value);
            }
            replica.tables.insert(spec.table.to_string(), rows);
        }
        tx.commit()?;
        tracing::debug!(version = replica.version, "replica loaded");
        Ok(replica)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Applies deltas in order; anything at or below the current version is skipped.
    pub fn apply(&mut self, changes: &[Change]) -> usize {
        let mut applied = 0;
        for c in changes {
            if c.seq <= self.version {
                continue;
            }
            let rows = self.tables.entry(c.table.clone()).or_default();
            match (c.op, &c.row) {
                (ChangeOp::Insert | ChangeOp::Update, Some(row)) => {
                    rows.insert(c.row_id.clone(), row.clone());
                }
                (ChangeOp::Insert | ChangeOp::Update, None) => {}
                (ChangeOp::Delete, _) => {
                    rows.remove(&c.row_id);
                }
            }
            self.version = c.seq;
            applied += 1;
        }
        applied
    }

    /// Applies everything journaled since the last call. If the journal was
    /// pruned past this replica's version the deltas are gone, so it reloads.
    pub fn catch_up(&mut self, conn: &Connection) -> ControlResult<usize> {
        let floor = store::pruned_through(conn)?;
        if self.version < floor {
            let stale = self.version;
            *self = Replica::load(conn)?;
            tracing::info!(from = stale, floor, version = self.version, "replica reloaded after journal prune");
            return Ok(0);
        }
        let mut total = 0;
        loop {
            let batch = store::changes_since(conn, self.version, CATCH_UP_BATCH)?;
            if batch.is_empty() {
                break;
            }
            total += self.apply(&batch);
            if (batch.len() as i64) < CATCH_UP_BATCH {
                break;
            }
        }
        if total > 0 {
            tracing::debug!(applied = total, version = self.version, "replica caught up");
        }
        Ok(total)
    }

    #[cfg(test)]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    pub fn rows<T: DeserializeOwned>(&self, table: &str) -> ControlResult<Vec<T>> {
        let Some(rows) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        rows.values()
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|source| ControlError::Decode {
                    table: table.to_string(),
                    source,
                })
            })
            .collect()
    }

    pub fn snapshot(&self) -> ControlResult<Snapshot> {
        let config = self
            .rows::<SystemConfig>("system_config")?
            .into_iter()
            .find(|c| c.id == MAIN_CONFIG_ID)
            .unwrap_or_default();
        Ok(Snapshot {
            version: self.version,
            users: self.rows("users")?,
            students: self.rows("students")?,
            supervisions: self.rows("supervision")?,
            absences: self.rows("absences")?,
            control_requests: self.rows("control_requests")?,
            delivery_logs: self.rows("delivery_logs")?,
            config,
        })
    }
}
