use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{cell, get_opt_str, get_required_str, require_db, rows_param};
use crate::ipc::types::{AppState, Request};
use crate::model::{Role, Supervision, User};
use crate::store;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const MIN_NATIONAL_ID_LEN: usize = 6;

fn load_user(conn: &Connection, user_id: &str) -> ControlResult<User> {
    store::find_one::<User>(conn, "id", user_id)?
        .ok_or_else(|| ControlError::not_found(format!("user not found: {}", user_id)))
}

fn string_list(row: &serde_json::Value, key: &str) -> Option<Vec<String>> {
    match row.get(key)? {
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s.trim().to_string()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        // spreadsheets carry lists as "1, 2, 3"
        serde_json::Value::String(s) => Some(
            s.split([',', '،'])
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        ),
        _ => None,
    }
}

fn users_list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let role = match get_opt_str(params, "role") {
        Some(r) => Some(
            Role::parse(&r).ok_or_else(|| ControlError::bad_params(format!("unknown role: {}", r)))?,
        ),
        None => None,
    };
    let mut users: Vec<User> = store::get_all::<User>(conn)?
        .into_iter()
        .filter(|u| role.map(|r| u.role == r).unwrap_or(true))
        .collect();
    users.sort_by(|a, b| a.full_name.cmp(&b.full_name));
    Ok(json!({ "users": users }))
}

/// Staff upload keyed by national id. Existing staff keep their id, and keep
/// role and assignments unless the row states new ones.
fn users_import(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let rows = rows_param(params)?;

    let existing: HashMap<String, User> = store::get_all::<User>(conn)?
        .into_iter()
        .map(|u| (u.national_id.clone(), u))
        .collect();

    let mut skipped = Vec::new();
    let mut created = 0usize;
    let mut updated = 0usize;
    let tx = conn.unchecked_transaction()?;
    for (idx, row) in rows.iter().enumerate() {
        let national_id = cell(row, "nationalId").unwrap_or_default();
        if national_id.chars().count() < MIN_NATIONAL_ID_LEN {
            skipped.push(json!({ "row": idx, "reason": "national id too short" }));
            continue;
        }
        let Some(full_name) = cell(row, "fullName") else {
            skipped.push(json!({ "row": idx, "reason": "missing full name" }));
            continue;
        };
        let role = match cell(row, "role") {
            Some(r) => match Role::parse(&r) {
                Some(role) => Some(role),
                None => {
                    skipped.push(json!({ "row": idx, "reason": format!("unknown role {}", r) }));
                    continue;
                }
            },
            None => None,
        };

        let prior = existing.get(&national_id);
        let user = User {
            id: prior
                .map(|u| u.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            national_id,
            full_name,
            role: role.or(prior.map(|u| u.role)).unwrap_or(Role::Proctor),
            phone: cell(row, "phone")
                .or_else(|| prior.map(|u| u.phone.clone()))
                .unwrap_or_default(),
            assigned_committees: string_list(row, "assignedCommittees")
                .or_else(|| prior.map(|u| u.assigned_committees.clone()))
                .unwrap_or_default(),
            assigned_grades: string_list(row, "assignedGrades")
                .or_else(|| prior.map(|u| u.assigned_grades.clone()))
                .unwrap_or_default(),
        };
        store::upsert_user(&tx, &user)?;
        if prior.is_some() {
            updated += 1;
        } else {
            created += 1;
        }
    }
    tx.commit()?;

    tracing::info!(created, updated, skipped = skipped.len(), "staff imported");
    Ok(json!({ "created": created, "updated": updated, "skipped": skipped }))
}

fn users_set_role(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let user_id = get_required_str(params, "userId")?;
    let raw = get_required_str(params, "role")?;
    let role = Role::parse(&raw).ok_or_else(|| ControlError::bad_params(format!("unknown role: {}", raw)))?;
    let mut user = load_user(conn, &user_id)?;
    user.role = role;
    store::upsert_user(conn, &user)?;
    Ok(json!({ "user": user }))
}

fn toggle(list: &mut Vec<String>, value: String) -> bool {
    if let Some(pos) = list.iter().position(|v| *v == value) {
        list.remove(pos);
        false
    } else {
        list.push(value);
        true
    }
}

fn users_toggle_grade(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let user_id = get_required_str(params, "userId")?;
    let grade = get_required_str(params, "grade")?;
    let mut user = load_user(conn, &user_id)?;
    let assigned = toggle(&mut user.assigned_grades, grade);
    store::upsert_user(conn, &user)?;
    Ok(json!({ "user": user, "assigned": assigned }))
}

fn users_toggle_committee(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let user_id = get_required_str(params, "userId")?;
    let committee = get_required_str(params, "committee")?;
    let mut user = load_user(conn, &user_id)?;
    let assigned = toggle(&mut user.assigned_committees, committee);
    store::upsert_user(conn, &user)?;
    Ok(json!({ "user": user, "assigned": assigned }))
}

fn users_delete(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let user_id = get_required_str(params, "userId")?;
    load_user(conn, &user_id)?;
    let tx = conn.unchecked_transaction()?;
    let released = store::delete_by::<Supervision>(&tx, "teacher_id", &user_id)?;
    store::delete_by::<User>(&tx, "id", &user_id)?;
    tx.commit()?;
    Ok(json!({ "deleted": true, "supervisionsReleased": released }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.list" => users_list(state, &req.params),
        "users.import" => users_import(state, &req.params),
        "users.setRole" => users_set_role(state, &req.params),
        "users.toggleGrade" => users_toggle_grade(state, &req.params),
        "users.toggleCommittee" => users_toggle_committee(state, &req.params),
        "users.delete" => users_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_cells_split_on_latin_and_arabic_commas() {
        let row = json!({ "assignedCommittees": "1, 2،3", "assignedGrades": ["G1", " ", 7] });
        assert_eq!(
            string_list(&row, "assignedCommittees"),
            Some(vec!["1".to_string(), "2".to_string(), "3".to_string()])
        );
        assert_eq!(
            string_list(&row, "assignedGrades"),
            Some(vec!["G1".to_string(), "7".to_string()])
        );
        assert_eq!(string_list(&row, "missing"), None);
    }

    #[test]
    fn toggle_adds_then_removes() {
        let mut list = vec!["a".to_string()];
        assert!(toggle(&mut list, "b".to_string()));
        assert!(!toggle(&mut list, "a".to_string()));
        assert_eq!(list, vec!["b".to_string()]);
    }
}
