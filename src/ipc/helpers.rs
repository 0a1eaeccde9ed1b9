use chrono::{DateTime, Local, NaiveDateTime};
use rusqlite::Connection;
use serde::de::DeserializeOwned;

use crate::error::{ControlError, ControlResult};
use crate::ipc::types::AppState;
use crate::model::{Snapshot, User};
use crate::replica::Replica;
use crate::status;
use crate::workflow::{self, Command};

pub fn get_required_str(params: &serde_json::Value, key: &str) -> ControlResult<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ControlError::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> ControlResult<Option<i64>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ControlError::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_bool(params: &serde_json::Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Spreadsheet cell from an imported row: strings are trimmed, numbers
/// are rendered without a fractional part when whole.
pub fn cell(row: &serde_json::Value, key: &str) -> Option<String> {
    let text = match row.get(key)? {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

pub fn rows_param(params: &serde_json::Value) -> ControlResult<&Vec<serde_json::Value>> {
    params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ControlError::bad_params("missing rows"))
}

/// Decodes params (or a sub-object) into a typed value; serde's message becomes the error text.
pub fn decode_params<T: DeserializeOwned>(value: &serde_json::Value) -> ControlResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| ControlError::bad_params(e.to_string()))
}

/// Destructive admin calls must carry `confirm: true`.
pub fn require_confirm(params: &serde_json::Value) -> ControlResult<()> {
    if get_bool(params, "confirm") {
        Ok(())
    } else {
        Err(ControlError::rejected(
            "confirmation_required",
            "this action deletes data; resend with confirm: true",
        ))
    }
}

/// `now` pin: `HH:MM`, `HH:MM:SS` (today), `YYYY-MM-DDTHH:MM:SS` or RFC 3339.
pub fn parse_now(params: &serde_json::Value) -> ControlResult<NaiveDateTime> {
    let local_now = Local::now().naive_local();
    let Some(raw) = get_opt_str(params, "now") else {
        return Ok(local_now);
    };
    if let Some(t) = status::parse_time_of_day(&raw) {
        return Ok(local_now.date().and_time(t));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Local).naive_local());
    }
    Err(ControlError::bad_params(format!(
        "now must be HH:MM, HH:MM:SS or RFC 3339, got {}",
        raw
    )))
}

pub fn require_db(state: &AppState) -> ControlResult<&Connection> {
    state.db.as_ref().ok_or(ControlError::NoWorkspace)
}

/// Current view of every collection, served from the replica after catching
/// it up with the change journal.
pub fn snapshot(state: &mut AppState) -> ControlResult<Snapshot> {
    let conn = state.db.as_ref().ok_or(ControlError::NoWorkspace)?;
    let replica = match state.replica.take() {
        Some(r) => r,
        None => Replica::load(conn)?,
    };
    let replica = state.replica.insert(replica);
    replica.catch_up(conn)?;
    replica.snapshot()
}

/// The snapshot narrowed to the exam day of the request's `now`, with that `now`.
pub fn day_snapshot(
    state: &mut AppState,
    params: &serde_json::Value,
) -> ControlResult<(Snapshot, NaiveDateTime)> {
    let now = parse_now(params)?;
    let snap = snapshot(state)?;
    let day = snap.exam_day(now);
    Ok((snap.for_day(&day), now))
}

pub fn user_param<'a>(snap: &'a Snapshot, params: &serde_json::Value, key: &str) -> ControlResult<&'a User> {
    let id = get_required_str(params, key)?;
    snap.user_by_id(&id)
        .ok_or_else(|| ControlError::not_found(format!("user not found: {}", id)))
}

pub fn run_command(
    state: &mut AppState,
    cmd: Command,
    params: &serde_json::Value,
) -> ControlResult<serde_json::Value> {
    let (snap, now) = day_snapshot(state, params)?;
    let conn = require_db(state)?;
    workflow::execute(conn, &snap, cmd, now)
}
