use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{cell, get_opt_str, get_required_str, require_db, rows_param};
use crate::ipc::types::{AppState, Request};
use crate::model::{Absence, Student};
use crate::status;
use crate::store;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

fn students_list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let committee = get_opt_str(params, "committee");
    let grade = get_opt_str(params, "grade");
    let search = get_opt_str(params, "search").map(|s| normalize_name(&s));
    let mut students: Vec<Student> = store::get_all::<Student>(conn)?
        .into_iter()
        .filter(|s| committee.as_deref().map(|c| s.committee_number == c).unwrap_or(true))
        .filter(|s| grade.as_deref().map(|g| s.grade == g).unwrap_or(true))
        .filter(|s| {
            search
                .as_deref()
                .map(|q| normalize_name(&s.name).contains(q) || s.national_id.contains(q))
                .unwrap_or(true)
        })
        .collect();
    students.sort_by(|a, b| {
        status::compare_committees(&a.committee_number, &b.committee_number)
            .then_with(|| a.seating_number.cmp(&b.seating_number))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(json!({ "students": students }))
}

/// Replaces the student list with the upload. Rows are matched to existing
/// students by national id (their id survives); anyone not in the upload is
/// removed along with their absence mark. A row without a parent phone clears
/// the stored one, and the count of such clears is reported.
fn students_import(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let rows = rows_param(params)?;

    let mut incoming: BTreeMap<String, Student> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut skipped = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let (Some(national_id), Some(name)) = (cell(row, "nationalId"), cell(row, "name")) else {
            skipped.push(json!({ "row": idx, "reason": "missing national id or name" }));
            continue;
        };
        let student = Student {
            id: String::new(),
            national_id: national_id.clone(),
            name,
            grade: cell(row, "grade").unwrap_or_default(),
            section: cell(row, "section").unwrap_or_default(),
            committee_number: cell(row, "committeeNumber").unwrap_or_default(),
            seating_number: cell(row, "seatingNumber").unwrap_or_default(),
            parent_phone: cell(row, "parentPhone").unwrap_or_default(),
        };
        // later duplicates win
        if incoming.insert(national_id.clone(), student).is_none() {
            order.push(national_id);
        }
    }

    let existing: HashMap<String, Student> = store::get_all::<Student>(conn)?
        .into_iter()
        .map(|s| (s.national_id.clone(), s))
        .collect();

    let mut created = 0usize;
    let mut updated = 0usize;
    let mut phones_cleared = 0usize;
    let tx = conn.unchecked_transaction()?;
    for national_id in &order {
        let Some(mut student) = incoming.remove(national_id) else {
            continue;
        };
        match existing.get(national_id) {
            Some(prior) => {
                student.id = prior.id.clone();
                if !prior.parent_phone.is_empty() && student.parent_phone.is_empty() {
                    phones_cleared += 1;
                }
                updated += 1;
            }
            None => {
                student.id = Uuid::new_v4().to_string();
                created += 1;
            }
        }
        store::upsert_student(&tx, &student)?;
    }
    let kept: HashSet<&String> = order.iter().collect();
    let mut removed = 0usize;
    for (national_id, prior) in &existing {
        if kept.contains(national_id) {
            continue;
        }
        store::delete_by::<Absence>(&tx, "student_id", &prior.id)?;
        removed += store::delete_by::<Student>(&tx, "id", &prior.id)?;
    }
    tx.commit()?;

    if phones_cleared > 0 {
        tracing::warn!(phones_cleared, "student import cleared stored parent phones");
    }
    tracing::info!(created, updated, removed, "students imported");
    Ok(json!({
        "created": created,
        "updated": updated,
        "removed": removed,
        "phonesCleared": phones_cleared,
        "skipped": skipped
    }))
}

/// Folds the Arabic letter variants a typist may use interchangeably and
/// collapses whitespace.
pub fn normalize_name(s: &str) -> String {
    let folded: String = s
        .chars()
        .map(|c| match c {
            'أ' | 'إ' | 'آ' => 'ا',
            'ة' => 'ه',
            'ى' => 'ي',
            other => other,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Attaches parent phones from a contact sheet. A row matches by national id
/// (digits only) or, failing that, by full name of at least two words.
fn students_merge_phones(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let rows = rows_param(params)?;
    let students = store::get_all::<Student>(conn)?;
    if students.is_empty() {
        return Err(ControlError::rejected(
            "no_students",
            "import the student list before merging phones",
        ));
    }

    let by_id: HashMap<String, &Student> = students
        .iter()
        .map(|s| (digits(&s.national_id), s))
        .filter(|(k, _)| !k.is_empty())
        .collect();
    let by_name: HashMap<String, &Student> = students
        .iter()
        .map(|s| (normalize_name(&s.name), s))
        .collect();

    let mut matched = 0usize;
    let mut unmatched = Vec::new();
    let tx = conn.unchecked_transaction()?;
    for (idx, row) in rows.iter().enumerate() {
        let Some(phone) = cell(row, "phone") else {
            unmatched.push(idx);
            continue;
        };
        let by_national = cell(row, "nationalId")
            .map(|v| digits(&v))
            .filter(|v| !v.is_empty())
            .and_then(|v| by_id.get(&v).copied());
        let by_full_name = || {
            cell(row, "name")
                .map(|n| normalize_name(&n))
                .filter(|n| n.split(' ').count() >= 2)
                .and_then(|n| by_name.get(&n).copied())
        };
        match by_national.or_else(by_full_name) {
            Some(student) => {
                store::set_parent_phone(&tx, &student.id, &phone)?;
                matched += 1;
            }
            None => unmatched.push(idx),
        }
    }
    tx.commit()?;

    tracing::info!(matched, unmatched = unmatched.len(), "parent phones merged");
    Ok(json!({ "matched": matched, "unmatchedRows": unmatched }))
}

fn students_delete(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    if !store::row_exists(conn, "students", &student_id)? {
        return Err(ControlError::not_found("student not found"));
    }
    let tx = conn.unchecked_transaction()?;
    store::delete_by::<Absence>(&tx, "student_id", &student_id)?;
    store::delete_by::<Student>(&tx, "id", &student_id)?;
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.import" => students_import(state, &req.params),
        "students.mergePhones" => students_merge_phones(state, &req.params),
        "students.delete" => students_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_folding_matches_common_spelling_variants() {
        assert_eq!(normalize_name("  أحمد   إبراهيم "), normalize_name("احمد ابراهيم"));
        assert_eq!(normalize_name("فاطمة"), "فاطمه");
        assert_eq!(normalize_name("مصطفى"), "مصطفي");
        assert_eq!(normalize_name("آمال"), "امال");
    }

    #[test]
    fn digits_strip_separators() {
        assert_eq!(digits("298-0101 1234"), "29801011234");
        assert_eq!(digits("n/a"), "");
    }
}
