use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{get_opt_str, get_required_str, require_db, run_command};
use crate::ipc::types::{AppState, Request};
use crate::model::{EnvelopeLog, EnvelopeState, Role};
use crate::store;
use crate::workflow::Command;
use serde_json::json;

fn notifications_broadcast(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let cmd = Command::Broadcast {
        text: get_required_str(params, "text")?,
        target_role: get_opt_str(params, "targetRole").unwrap_or_else(|| "ALL".to_string()),
        sender: get_required_str(params, "sender")?,
    };
    run_command(state, cmd, params)
}

/// Messages addressed to `role` (or everyone), newest last.
fn notifications_list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let role = match get_opt_str(params, "role") {
        Some(r) => Some(
            Role::parse(&r)
                .ok_or_else(|| ControlError::bad_params(format!("unknown role: {}", r)))?
                .as_str(),
        ),
        None => None,
    };
    let after = get_opt_str(params, "after");
    let mut items = store::notifications_for(conn, role, after.as_deref())?;
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(json!({ "notifications": items }))
}

fn envelopes_open(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let raw = get_opt_str(params, "status").unwrap_or_else(|| "INTACT".to_string());
    let status = EnvelopeState::parse(&raw)
        .ok_or_else(|| ControlError::bad_params(format!("status must be INTACT or DAMAGED, got {}", raw)))?;
    let period = match params.get("period") {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => get_opt_str(params, "period").unwrap_or_default(),
    };
    let cmd = Command::OpenEnvelope {
        user_id: get_required_str(params, "userId")?,
        grade: get_required_str(params, "grade")?,
        subject: get_required_str(params, "subject")?,
        period,
        status,
    };
    run_command(state, cmd, params)
}

fn envelopes_list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let mut logs = match get_opt_str(params, "grade") {
        Some(g) => store::find_by::<EnvelopeLog>(conn, "grade", &g)?,
        None => store::get_all::<EnvelopeLog>(conn)?,
    };
    logs.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(json!({ "envelopes": logs }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.broadcast" => notifications_broadcast(state, &req.params),
        "notifications.list" => notifications_list(state, &req.params),
        "envelopes.open" => envelopes_open(state, &req.params),
        "envelopes.list" => envelopes_list(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
