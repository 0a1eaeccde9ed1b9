use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{decode_params, get_opt_i64, require_db, run_command, snapshot};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, ChangeOp};
use crate::workflow::Command;
use serde_json::json;

const DEFAULT_CHANGE_LIMIT: i64 = 1000;
const MAX_CHANGE_LIMIT: i64 = 10_000;

fn sync_snapshot(state: &mut AppState) -> ControlResult<serde_json::Value> {
    let snap = snapshot(state)?;
    Ok(json!(snap))
}

fn string_filter(params: &serde_json::Value, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// Deltas after `since`. `version` is the cursor for the next call even when
/// the table/op filters drop every delta in this page. A cursor older than the
/// pruned part of the journal gets `resync_required`.
fn sync_changes(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let since = get_opt_i64(params, "since")?.unwrap_or(0);
    let floor = store::pruned_through(conn)?;
    if since < floor {
        return Err(ControlError::rejected(
            "resync_required",
            format!("changes up to {} were pruned; load sync.snapshot", floor),
        ));
    }
    let limit = get_opt_i64(params, "limit")?
        .unwrap_or(DEFAULT_CHANGE_LIMIT)
        .clamp(1, MAX_CHANGE_LIMIT);
    let tables = string_filter(params, "tables");
    let ops = match string_filter(params, "ops") {
        Some(raw) => {
            let mut ops = Vec::new();
            for o in &raw {
                let picked = ChangeOp::parse_filter(o)
                    .ok_or_else(|| ControlError::bad_params(format!("unknown op: {}", o)))?;
                ops.extend_from_slice(picked);
            }
            Some(ops)
        }
        None => None,
    };

    let page = store::changes_since(conn, since, limit)?;
    let version = page.last().map(|c| c.seq).unwrap_or(since);
    let has_more = page.len() as i64 == limit;
    let changes: Vec<_> = page
        .into_iter()
        .filter(|c| tables.as_ref().map(|t| t.contains(&c.table)).unwrap_or(true))
        .filter(|c| ops.as_ref().map(|o| o.contains(&c.op)).unwrap_or(true))
        .collect();
    Ok(json!({ "version": version, "hasMore": has_more, "changes": changes }))
}

fn commands_dispatch(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let raw = params
        .get("command")
        .ok_or_else(|| ControlError::bad_params("missing command"))?;
    let cmd: Command = decode_params(raw)?;
    run_command(state, cmd, params)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "sync.snapshot" => sync_snapshot(state),
        "sync.changes" => sync_changes(state, &req.params),
        "commands.dispatch" => commands_dispatch(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
