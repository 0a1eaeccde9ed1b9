use crate::error::{ControlError, ControlResult};
use crate::ipc::error::{err, ok, respond};
use crate::ipc::helpers::{day_snapshot, get_opt_i64, get_required_str, require_db};
use crate::ipc::types::{AppState, Request};
use crate::status;
use crate::store;
use chrono::NaiveDate;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "changeVersion": state.replica.as_ref().map(|r| r.version()),
            "logFilter": state.config.log_filter()
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match state.open_workspace(path.clone()) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

fn config_get(state: &mut AppState) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    Ok(json!({ "config": store::load_config(conn)? }))
}

/// Partial update: only the keys present in params change.
fn config_set(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let mut cfg = store::load_config(conn)?;

    if let Some(v) = params.get("examStartTime") {
        cfg.exam_start_time = match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            None => None,
            Some(s) => {
                let t = status::parse_time_of_day(s).ok_or_else(|| {
                    ControlError::bad_params("examStartTime must be HH:MM")
                })?;
                Some(t.format("%H:%M").to_string())
            }
        };
    }
    if let Some(v) = params.get("examDate") {
        cfg.exam_date = match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            None => None,
            Some(s) => {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|_| ControlError::bad_params("examDate must be YYYY-MM-DD"))?;
                Some(s.to_string())
            }
        };
    }
    if let Some(grace) = get_opt_i64(params, "graceMinutes")? {
        if !(0..=240).contains(&grace) {
            return Err(ControlError::bad_params(
                "graceMinutes must be between 0 and 240",
            ));
        }
        cfg.grace_minutes = grace;
    }

    store::save_config(conn, &cfg)?;
    tracing::info!(
        start = cfg.exam_start_time.as_deref().unwrap_or("-"),
        date = cfg.exam_date.as_deref().unwrap_or("-"),
        grace = cfg.grace_minutes,
        "exam configuration saved"
    );
    Ok(json!({ "config": cfg }))
}

/// Identification only: a national id maps to a user record.
fn auth_login(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let national_id = get_required_str(params, "nationalId")?;
    let (snap, _) = day_snapshot(state, params)?;
    let user = snap
        .user_by_national_id(&national_id)
        .ok_or_else(|| ControlError::not_found("no user with this national id"))?;
    let supervision = snap.supervision_for_teacher(&user.id);
    Ok(json!({ "user": user, "supervision": supervision }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "config.get" => Some(respond(&req.id, config_get(state))),
        "config.set" => Some(respond(&req.id, config_set(state, &req.params))),
        "auth.login" => Some(respond(&req.id, auth_login(state, &req.params))),
        _ => None,
    }
}
