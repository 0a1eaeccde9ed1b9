use crate::backup;
use crate::error::ControlResult;
use crate::ipc::error::{err, ok, respond};
use crate::ipc::helpers::{require_confirm, require_db};
use crate::ipc::types::{AppState, Request};
use crate::model::{Absence, ControlRequest, DeliveryLog, Student};
use crate::store;
use serde_json::json;
use std::path::PathBuf;

/// Clears the day's activity; students, staff and config stay.
fn reset_operations(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    require_confirm(params)?;
    let conn = require_db(state)?;
    let tx = conn.unchecked_transaction()?;
    let floor = store::current_version(&tx)?;
    let absences = store::clear::<Absence>(&tx)?;
    let logs = store::clear::<DeliveryLog>(&tx)?;
    let requests = store::clear::<ControlRequest>(&tx)?;
    let pruned = store::prune_changes(&tx, floor)?;
    tx.commit()?;
    tracing::warn!(pruned, absences, logs, requests, "operations reset");
    Ok(json!({ "absences": absences, "deliveryLogs": logs, "controlRequests": requests, "prunedThrough": floor }))
}

fn reset_students(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    require_confirm(params)?;
    let conn = require_db(state)?;
    let tx = conn.unchecked_transaction()?;
    let floor = store::current_version(&tx)?;
    let absences = store::clear::<Absence>(&tx)?;
    let students = store::clear::<Student>(&tx)?;
    let pruned = store::prune_changes(&tx, floor)?;
    tx.commit()?;
    tracing::warn!(pruned, students, absences, "students reset");
    Ok(json!({ "students": students, "absences": absences, "prunedThrough": floor }))
}

/// Removes every non-admin account so the console stays reachable.
fn reset_staff(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    require_confirm(params)?;
    let conn = require_db(state)?;
    let tx = conn.unchecked_transaction()?;
    let floor = store::current_version(&tx)?;
    let users = store::delete_staff_except_admins(&tx)?;
    let supervisions = store::delete_orphan_supervisions(&tx)?;
    let pruned = store::prune_changes(&tx, floor)?;
    tx.commit()?;
    tracing::warn!(pruned, users, supervisions, "staff reset");
    Ok(json!({ "users": users, "supervisions": supervisions, "prunedThrough": floor }))
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut version = 0;
    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
        version = store::current_version(conn).unwrap_or(0);
    }

    let out = PathBuf::from(&out_path);
    match backup::export_workspace_bundle(&workspace_path, &out, version) {
        Ok(export) => ok(
            &req.id,
            json!({
                "path": out_path,
                "bundleFormat": export.bundle_format,
                "entryCount": export.entry_count,
                "dbSha256": export.db_sha256,
                "changeVersion": version
            }),
        ),
        Err(e) => err(
            &req.id,
            "io_failed",
            format!("{e:#}"),
            Some(json!({ "path": out_path })),
        ),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    if let Err(e) = require_confirm(&req.params) {
        return respond(&req.id, Err(e));
    }
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing file.
    let previous = state.workspace.clone();
    state.close_workspace();

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            // The database file was not replaced; go back to it.
            if let Some(prev) = previous {
                if let Err(reopen) = state.open_workspace(prev) {
                    tracing::error!(error = %format!("{reopen:#}"), "could not reopen workspace after failed import");
                }
            }
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match state.open_workspace(workspace_path.clone()) {
        Ok(()) => ok(
            &req.id,
            json!({
                "workspacePath": workspace_path.to_string_lossy(),
                "bundleFormatDetected": import.bundle_format_detected,
                "dbSha256": import.db_sha256
            }),
        ),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "admin.resetOperations" => reset_operations(state, &req.params),
        "admin.resetStudents" => reset_students(state, &req.params),
        "admin.resetStaff" => reset_staff(state, &req.params),
        "backup.export" => return Some(handle_backup_export(state, req)),
        "backup.import" => return Some(handle_backup_import(state, req)),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
