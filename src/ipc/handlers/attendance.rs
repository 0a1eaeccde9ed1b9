use crate::error::{ControlError, ControlResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    day_snapshot, get_opt_i64, get_opt_str, get_required_str, run_command, snapshot,
};
use crate::ipc::types::{AppState, Request};
use crate::model::AbsenceKind;
use crate::status;
use crate::workflow::Command;
use serde_json::json;

fn supervision_join(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let cmd = Command::JoinCommittee {
        teacher_id: get_required_str(params, "teacherId")?,
        committee: get_required_str(params, "committee")?,
        date: get_opt_str(params, "date"),
        period: get_opt_i64(params, "period")?.unwrap_or(1),
        subject: get_opt_str(params, "subject").unwrap_or_default(),
    };
    run_command(state, cmd, params)
}

fn supervision_leave(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let cmd = Command::LeaveCommittee {
        teacher_id: get_required_str(params, "teacherId")?,
        date: get_opt_str(params, "date"),
    };
    run_command(state, cmd, params)
}

fn supervision_list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let date = get_opt_str(params, "date");
    let snap = snapshot(state)?;
    let mut rows: Vec<_> = snap
        .supervisions
        .iter()
        .filter(|sv| date.as_deref().map(|d| sv.date == d).unwrap_or(true))
        .collect();
    rows.sort_by(|a, b| status::compare_committees(&a.committee_number, &b.committee_number));
    let rows: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|sv| {
            json!({
                "supervision": sv,
                "teacherName": snap.user_by_id(&sv.teacher_id).map(|u| u.full_name.clone()),
            })
        })
        .collect();
    Ok(json!({ "supervisions": rows }))
}

fn supervision_report(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let (snap, _) = day_snapshot(state, params)?;
    Ok(json!({ "rows": status::supervision_report(&snap) }))
}

fn absences_toggle(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let raw = get_required_str(params, "type")?;
    let mark = AbsenceKind::parse(&raw)
        .ok_or_else(|| ControlError::bad_params(format!("type must be ABSENT or LATE, got {}", raw)))?;
    let cmd = Command::ToggleAbsence {
        student_id: get_required_str(params, "studentId")?,
        mark,
        proctor_id: get_required_str(params, "proctorId")?,
    };
    run_command(state, cmd, params)
}

fn absences_list(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let committee = get_opt_str(params, "committee");
    let snap = snapshot(state)?;
    let absences: Vec<_> = snap
        .absences
        .iter()
        .filter(|a| committee.as_deref().map(|c| a.committee_number == c).unwrap_or(true))
        .collect();
    Ok(json!({ "absences": absences }))
}

/// Daily absence forms: one row per mark on `date`, with the form number the
/// school files it under.
fn forms_daily(state: &mut AppState, params: &serde_json::Value) -> ControlResult<serde_json::Value> {
    let kind = match get_opt_str(params, "type") {
        Some(raw) => Some(
            AbsenceKind::parse(&raw)
                .ok_or_else(|| ControlError::bad_params(format!("unknown type: {}", raw)))?,
        ),
        None => None,
    };
    let snap = snapshot(state)?;
    let date = get_opt_str(params, "date")
        .or_else(|| snap.config.exam_date.clone())
        .unwrap_or_default();

    let mut rows: Vec<serde_json::Value> = Vec::new();
    let mut marks: Vec<_> = snap
        .absences
        .iter()
        .filter(|a| date.is_empty() || a.date.starts_with(&date))
        .filter(|a| kind.map(|k| a.kind == k).unwrap_or(true))
        .collect();
    marks.sort_by(|a, b| {
        status::compare_committees(&a.committee_number, &b.committee_number)
            .then_with(|| a.student_name.cmp(&b.student_name))
    });
    for a in marks {
        let student = snap.students.iter().find(|s| s.id == a.student_id);
        rows.push(json!({
            "formNumber": a.kind.form_number(),
            "type": a.kind,
            "studentName": a.student_name,
            "nationalId": student.map(|s| s.national_id.clone()),
            "grade": student.map(|s| s.grade.clone()),
            "section": student.map(|s| s.section.clone()),
            "seatingNumber": student.map(|s| s.seating_number.clone()),
            "parentPhone": student.map(|s| s.parent_phone.clone()),
            "committeeNumber": a.committee_number,
            "period": a.period,
            "proctorName": snap.user_by_id(&a.proctor_id).map(|u| u.full_name.clone()),
            "recordedAt": a.date,
        }));
    }
    Ok(json!({ "date": date, "rows": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "supervision.join" => supervision_join(state, &req.params),
        "supervision.leave" => supervision_leave(state, &req.params),
        "supervision.list" => supervision_list(state, &req.params),
        "supervision.report" => supervision_report(state, &req.params),
        "absences.toggle" => absences_toggle(state, &req.params),
        "absences.list" => absences_list(state, &req.params),
        "forms.daily" => forms_daily(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
