use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    day_snapshot, decode_params, get_opt_str, get_required_str, run_command, snapshot, user_param,
};
use crate::ipc::types::{AppState, Request};
use crate::model::DeliveryStatus;
use crate::status::{self, Scope};
use crate::workflow::{self, Command};
use serde_json::json;
use std::collections::BTreeMap;

fn closing_defaults(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let committee = get_required_str(params, "committee")?;
    let snap = snapshot(state)?;
    let counts = status::closing_defaults(&snap, &committee);
    if counts.is_empty() {
        return Err(ControlError::not_found(format!(
            "committee {} has no students",
            committee
        )));
    }
    Ok(json!({ "committee": committee, "counts": counts }))
}

fn submit_closing(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let counts: BTreeMap<String, i64> = decode_params(
        params
            .get("counts")
            .ok_or_else(|| ControlError::bad_params("missing counts"))?,
    )?;
    let cmd = Command::SubmitClosing {
        proctor_id: get_required_str(params, "proctorId")?,
        committee: get_required_str(params, "committee")?,
        counts,
    };
    run_command(state, cmd, params)
}

fn resolve(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let input = get_required_str(params, "input")?;
    let (snap, _) = day_snapshot(state, params)?;
    let operator = user_param(&snap, params, "operatorId")?;
    let resolution = workflow::resolve_receipt(&snap, operator, &input)?;
    Ok(json!({ "resolution": resolution }))
}

fn confirm(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let cmd = Command::ConfirmReceipt {
        operator_id: get_required_str(params, "operatorId")?,
        committee: get_required_str(params, "committee")?,
        grade: get_required_str(params, "grade")?,
    };
    run_command(state, cmd, params)
}

fn list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let committee = get_opt_str(params, "committee");
    let wanted = match get_opt_str(params, "status").map(|s| s.to_ascii_uppercase()) {
        None => None,
        Some(s) if s == DeliveryStatus::Pending.as_str() => Some(DeliveryStatus::Pending),
        Some(s) if s == DeliveryStatus::Confirmed.as_str() => Some(DeliveryStatus::Confirmed),
        Some(other) => {
            return Err(ControlError::bad_params(format!("unknown status: {}", other)));
        }
    };
    let snap = snapshot(state)?;
    let mut logs: Vec<_> = snap
        .delivery_logs
        .iter()
        .filter(|l| committee.as_deref().map(|c| l.committee_number == c).unwrap_or(true))
        .filter(|l| wanted.map(|w| l.status == w).unwrap_or(true))
        .collect();
    logs.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(json!({ "logs": logs }))
}

/// Received vs remaining envelopes for one operator's scope.
fn scope(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let (snap, _) = day_snapshot(state, params)?;
    let operator = user_param(&snap, params, "operatorId")?;
    let scope = Scope::for_user(operator);
    if scope == Scope::Nothing {
        return Err(ControlError::rejected(
            "out_of_scope",
            format!("role {} cannot receive envelopes", operator.role.as_str()),
        ));
    }
    Ok(json!(status::receipt_scope(&snap, &scope)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "delivery.closingDefaults" => closing_defaults(state, &req.params),
        "delivery.submitClosing" => submit_closing(state, &req.params),
        "delivery.resolve" => resolve(state, &req.params),
        "delivery.confirm" => confirm(state, &req.params),
        "delivery.list" => list(state, &req.params),
        "delivery.scope" => scope(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
