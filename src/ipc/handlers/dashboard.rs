use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{day_snapshot, get_opt_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::status;
use serde_json::json;

fn committees_status(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let (snap, now) = day_snapshot(state, params)?;
    let now = now.time();
    Ok(json!({
        "version": snap.version,
        "committees": status::committee_statuses(&snap, now),
    }))
}

fn committees_detail(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let committee = get_required_str(params, "committee")?;
    let (snap, _) = day_snapshot(state, params)?;
    let detail = status::committee_detail(&snap, &committee).ok_or_else(|| {
        ControlError::not_found(format!("committee {} has no students", committee))
    })?;
    Ok(json!({ "detail": detail }))
}

fn dashboard_overview(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let search = get_opt_str(params, "search").unwrap_or_default();
    let (snap, now) = day_snapshot(state, params)?;
    let now = now.time();
    Ok(json!(status::dashboard_overview(&snap, &search, now)))
}

fn control_room_stats(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let (snap, _) = day_snapshot(state, params)?;
    Ok(json!(status::control_room_stats(&snap)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "committees.status" => committees_status(state, &req.params),
        "committees.detail" => committees_detail(state, &req.params),
        "dashboard.overview" => dashboard_overview(state, &req.params),
        "controlRoom.stats" => control_room_stats(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
