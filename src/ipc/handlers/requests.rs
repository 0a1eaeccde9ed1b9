use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{get_opt_i64, get_opt_str, get_required_str, run_command, snapshot};
use crate::ipc::types::{AppState, Request};
use crate::model::{RequestStatus, Role};
use crate::status;
use crate::workflow::{self, Command};
use serde_json::json;

fn requests_raise(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let cmd = Command::RaiseRequest {
        from: get_required_str(params, "from")?,
        committee: get_required_str(params, "committee")?,
        text: get_required_str(params, "text")?,
    };
    run_command(state, cmd, params)
}

fn requests_quick_report(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let template = get_required_str(params, "template")?;
    let text = workflow::quick_report_text(
        &template,
        get_opt_i64(params, "count")?,
        get_opt_str(params, "studentName").as_deref(),
        get_opt_str(params, "text").as_deref(),
    )?;
    let cmd = Command::RaiseRequest {
        from: get_required_str(params, "from")?,
        committee: get_required_str(params, "committee")?,
        text,
    };
    run_command(state, cmd, params)
}

fn requests_advance(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let raw = get_required_str(params, "status")?;
    let status = RequestStatus::parse(&raw)
        .ok_or_else(|| ControlError::bad_params(format!("unknown status: {}", raw)))?;
    let cmd = Command::AdvanceRequest {
        id: get_required_str(params, "id")?,
        status,
    };
    run_command(state, cmd, params)
}

/// The request board. With `userId` of an assistant-control operator the
/// board only shows their assigned committees.
fn requests_list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let committee = get_opt_str(params, "committee");
    let user_id = get_opt_str(params, "userId");
    let snap = snapshot(state)?;

    let assigned: Option<Vec<String>> = match user_id {
        Some(id) => {
            let user = snap
                .user_by_id(&id)
                .ok_or_else(|| ControlError::not_found(format!("user not found: {}", id)))?;
            (user.role == Role::AssistantControl).then(|| user.assigned_committees.clone())
        }
        None => None,
    };
    let visible: Vec<_> = snap
        .control_requests
        .iter()
        .filter(|r| committee.as_deref().map(|c| r.committee_number == c).unwrap_or(true))
        .filter(|r| {
            assigned
                .as_ref()
                .map(|list| list.contains(&r.committee_number))
                .unwrap_or(true)
        })
        .cloned()
        .collect();
    Ok(json!(status::request_board(&visible)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "requests.raise" => requests_raise(state, &req.params),
        "requests.quickReport" => requests_quick_report(state, &req.params),
        "requests.advance" => requests_advance(state, &req.params),
        "requests.list" => requests_list(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
