//! Exam-day mutations as explicit commands, plus the read-side lookup the
//! control desk runs before confirming an envelope.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::error::{ControlError, ControlResult};
use crate::model::{
    Absence, AbsenceKind, ControlRequest, DeliveryLog, DeliveryStatus, EnvelopeLog,
    EnvelopeState, Notification, RequestStatus, Role, Snapshot, Supervision, User,
    AWAITING_CONTROL, DELIVERY_TYPE_RECEIVE,
};
use crate::status::{self, EnvelopeKey, Scope};
use crate::store;

fn default_period() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum Command {
    JoinCommittee {
        teacher_id: String,
        committee: String,
        #[serde(default)]
        date: Option<String>,
        #[serde(default = "default_period")]
        period: i64,
        #[serde(default)]
        subject: String,
    },
    LeaveCommittee {
        teacher_id: String,
        #[serde(default)]
        date: Option<String>,
    },
    ToggleAbsence {
        student_id: String,
        #[serde(rename = "type")]
        mark: AbsenceKind,
        proctor_id: String,
    },
    RaiseRequest {
        from: String,
        committee: String,
        text: String,
    },
    AdvanceRequest {
        id: String,
        status: RequestStatus,
    },
    SubmitClosing {
        proctor_id: String,
        committee: String,
        counts: BTreeMap<String, i64>,
    },
    ConfirmReceipt {
        operator_id: String,
        committee: String,
        grade: String,
    },
    OpenEnvelope {
        user_id: String,
        grade: String,
        subject: String,
        period: String,
        status: EnvelopeState,
    },
    Broadcast {
        text: String,
        target_role: String,
        sender: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::JoinCommittee { .. } => "JoinCommittee",
            Command::LeaveCommittee { .. } => "LeaveCommittee",
            Command::ToggleAbsence { .. } => "ToggleAbsence",
            Command::RaiseRequest { .. } => "RaiseRequest",
            Command::AdvanceRequest { .. } => "AdvanceRequest",
            Command::SubmitClosing { .. } => "SubmitClosing",
            Command::ConfirmReceipt { .. } => "ConfirmReceipt",
            Command::OpenEnvelope { .. } => "OpenEnvelope",
            Command::Broadcast { .. } => "Broadcast",
        }
    }
}

pub fn stamp(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn required(value: &str, what: &str) -> ControlResult<String> {
    let t = value.trim();
    if t.is_empty() {
        return Err(ControlError::bad_params(format!("missing {}", what)));
    }
    Ok(t.to_string())
}

fn user<'a>(snap: &'a Snapshot, id: &str) -> ControlResult<&'a User> {
    snap.user_by_id(id)
        .ok_or_else(|| ControlError::not_found(format!("user not found: {}", id)))
}

fn exam_date(snap: &Snapshot, explicit: Option<&str>, now: NaiveDateTime) -> String {
    explicit
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| snap.exam_day(now))
}

/// Applies one command. `snap` must be current and narrowed to the exam day;
/// writes go straight to `conn` and show up in the change journal.
pub fn execute(
    conn: &Connection,
    snap: &Snapshot,
    cmd: Command,
    now: NaiveDateTime,
) -> ControlResult<serde_json::Value> {
    let name = cmd.name();
    let result = match cmd {
        Command::JoinCommittee {
            teacher_id,
            committee,
            date,
            period,
            subject,
        } => join_committee(conn, snap, &teacher_id, &committee, date.as_deref(), period, subject, now),
        Command::LeaveCommittee { teacher_id, date } => {
            let date = exam_date(snap, date.as_deref(), now);
            store::delete_supervision(conn, &teacher_id, &date)
                .map(|removed| json!({ "removed": removed > 0, "date": date }))
        }
        Command::ToggleAbsence {
            student_id,
            mark,
            proctor_id,
        } => toggle_absence(conn, snap, &student_id, mark, &proctor_id, now),
        Command::RaiseRequest {
            from,
            committee,
            text,
        } => raise_request(conn, &from, &committee, &text, now).map(|req| json!({ "request": req })),
        Command::AdvanceRequest { id, status } => advance_request(conn, &id, status),
        Command::SubmitClosing {
            proctor_id,
            committee,
            counts,
        } => submit_closing(conn, snap, &proctor_id, &committee, &counts, now),
        Command::ConfirmReceipt {
            operator_id,
            committee,
            grade,
        } => confirm_receipt(conn, snap, &operator_id, &committee, &grade, now),
        Command::OpenEnvelope {
            user_id,
            grade,
            subject,
            period,
            status,
        } => open_envelope(conn, snap, &user_id, &grade, &subject, &period, status, now),
        Command::Broadcast {
            text,
            target_role,
            sender,
        } => broadcast(conn, &text, &target_role, &sender, now),
    };
    match &result {
        Ok(_) => tracing::info!(command = name, "command applied"),
        Err(e) => tracing::warn!(command = name, code = e.code(), error = %e, "command rejected"),
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn open_envelope(
    conn: &Connection,
    snap: &Snapshot,
    user_id: &str,
    grade: &str,
    subject: &str,
    period: &str,
    status: EnvelopeState,
    now: NaiveDateTime,
) -> ControlResult<serde_json::Value> {
    let opener = user(snap, user_id)?;
    let log = EnvelopeLog {
        id: new_id(),
        grade: required(grade, "grade")?,
        subject: required(subject, "subject")?,
        period: period.trim().to_string(),
        opened_by_id: opener.id.clone(),
        opened_by_name: opener.full_name.clone(),
        time: stamp(now),
        status,
    };
    store::insert_envelope_log(conn, &log)?;
    if status == EnvelopeState::Damaged {
        tracing::warn!(grade = %log.grade, subject = %log.subject, "envelope opened damaged");
    }
    Ok(json!({ "envelope": log }))
}

fn broadcast(
    conn: &Connection,
    text: &str,
    target_role: &str,
    sender: &str,
    now: NaiveDateTime,
) -> ControlResult<serde_json::Value> {
    let target = target_role.trim().to_ascii_uppercase();
    if target != "ALL" && Role::parse(&target).is_none() {
        return Err(ControlError::bad_params(format!(
            "unknown target role: {}",
            target_role
        )));
    }
    let n = Notification {
        id: new_id(),
        text: required(text, "text")?,
        target_role: target,
        sender_name: required(sender, "sender")?,
        created_at: stamp(now),
    };
    store::insert_notification(conn, &n)?;
    Ok(json!({ "notification": n }))
}

#[allow(clippy::too_many_arguments)]
fn join_committee(
    conn: &Connection,
    snap: &Snapshot,
    teacher_id: &str,
    committee: &str,
    date: Option<&str>,
    period: i64,
    subject: String,
    now: NaiveDateTime,
) -> ControlResult<serde_json::Value> {
    let committee = required(committee, "committee")?;
    let teacher = user(snap, teacher_id)?;
    let sv = Supervision {
        id: new_id(),
        teacher_id: teacher.id.clone(),
        committee_number: committee,
        date: exam_date(snap, date, now),
        period,
        subject,
    };
    let stored = store::upsert_supervision(conn, &sv)?;
    Ok(json!({ "supervision": stored }))
}

fn toggle_absence(
    conn: &Connection,
    snap: &Snapshot,
    student_id: &str,
    mark: AbsenceKind,
    proctor_id: &str,
    now: NaiveDateTime,
) -> ControlResult<serde_json::Value> {
    let student = snap
        .students
        .iter()
        .find(|s| s.id == student_id)
        .ok_or_else(|| ControlError::not_found(format!("student not found: {}", student_id)))?;
    let proctor = user(snap, proctor_id)?;

    let existing = store::find_one::<Absence>(conn, "student_id", &student.id)?;
    if existing.as_ref().map(|a| a.kind) == Some(mark) {
        store::delete_by::<Absence>(conn, "student_id", &student.id)?;
        return Ok(json!({ "state": "NONE", "absence": null }));
    }

    let period = snap
        .supervision_for_teacher(&proctor.id)
        .map(|sv| sv.period)
        .unwrap_or(1);
    let absence = Absence {
        id: existing.map(|a| a.id).unwrap_or_else(new_id),
        student_id: student.id.clone(),
        student_name: student.name.clone(),
        committee_number: student.committee_number.clone(),
        period,
        kind: mark,
        proctor_id: proctor.id.clone(),
        date: stamp(now),
    };
    store::upsert_absence(conn, &absence)?;
    Ok(json!({ "state": mark, "absence": absence }))
}

fn raise_request(
    conn: &Connection,
    from: &str,
    committee: &str,
    text: &str,
    now: NaiveDateTime,
) -> ControlResult<ControlRequest> {
    let req = ControlRequest {
        id: new_id(),
        from_user_name: required(from, "from")?,
        committee_number: required(committee, "committee")?,
        text: required(text, "text")?,
        time: stamp(now),
        status: RequestStatus::Pending,
        created_at: stamp(now),
    };
    store::insert_control_request(conn, &req)?;
    Ok(req)
}

fn advance_request(
    conn: &Connection,
    id: &str,
    next: RequestStatus,
) -> ControlResult<serde_json::Value> {
    let current = store::find_one::<ControlRequest>(conn, "id", id)?
        .ok_or_else(|| ControlError::not_found(format!("request not found: {}", id)))?;
    if !current.status.can_advance_to(next) {
        return Err(ControlError::rejected(
            "invalid_transition",
            format!(
                "request cannot move from {} to {}",
                current.status.as_str(),
                next.as_str()
            ),
        ));
    }
    store::set_request_status(conn, id, next)?;
    Ok(json!({ "id": id, "status": next }))
}

/// Quick-report message templates offered to proctors.
pub fn quick_report_text(
    template: &str,
    count: Option<i64>,
    student_name: Option<&str>,
    custom: Option<&str>,
) -> ControlResult<String> {
    let need_count = |prefix: &str| -> ControlResult<String> {
        match count {
            Some(n) if n > 0 => Ok(format!("{}{}", prefix, n)),
            _ => Err(ControlError::bad_params("count must be a positive number")),
        }
    };
    match template {
        "pencil" => need_count("need pencils, count: "),
        "pen" => need_count("need ballpoint pens, count: "),
        "questions" => need_count("question papers missing from envelope, count: "),
        "answer_sheet" => {
            let name = student_name.map(str::trim).filter(|s| !s.is_empty());
            match name {
                Some(n) => Ok(format!("missing answer sheet for student: {}", n)),
                None => Err(ControlError::bad_params("missing studentName")),
            }
        }
        "custom" => required(custom.unwrap_or(""), "text"),
        other => Err(ControlError::bad_params(format!(
            "unknown report template: {}",
            other
        ))),
    }
}

fn submit_closing(
    conn: &Connection,
    snap: &Snapshot,
    proctor_id: &str,
    committee: &str,
    counts: &BTreeMap<String, i64>,
    now: NaiveDateTime,
) -> ControlResult<serde_json::Value> {
    let committee = required(committee, "committee")?;
    let proctor = user(snap, proctor_id)?;
    let sv = snap
        .supervisions
        .iter()
        .find(|s| s.teacher_id == proctor.id && s.committee_number == committee)
        .ok_or_else(|| {
            ControlError::rejected(
                "no_supervision",
                format!("{} is not supervising committee {}", proctor.full_name, committee),
            )
        })?;

    let grades = status::grades_in_committee(snap, &committee);
    if grades.is_empty() {
        return Err(ControlError::not_found(format!(
            "committee {} has no students",
            committee
        )));
    }
    for g in &grades {
        match counts.get(g) {
            None => {
                return Err(ControlError::bad_params(format!(
                    "missing final count for grade {}",
                    g
                )))
            }
            Some(n) if *n < 0 => {
                return Err(ControlError::bad_params(format!(
                    "count for grade {} cannot be negative",
                    g
                )))
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = counts.keys().find(|k| !grades.contains(k)) {
        return Err(ControlError::bad_params(format!(
            "grade {} is not seated in committee {}",
            extra, committee
        )));
    }

    let tx = conn.unchecked_transaction()?;
    for g in &grades {
        let pending = store::delivery_log_for(&tx, &committee, g, DeliveryStatus::Pending)?;
        let confirmed = store::delivery_log_for(&tx, &committee, g, DeliveryStatus::Confirmed)?;
        if pending.is_some() || confirmed.is_some() {
            return Err(ControlError::rejected(
                "already_submitted",
                format!("committee {} grade {} was already handed in", committee, g),
            ));
        }
    }

    let time = stamp(now);
    let mut logs = Vec::with_capacity(grades.len());
    for g in &grades {
        let log = DeliveryLog {
            id: new_id(),
            teacher_name: AWAITING_CONTROL.to_string(),
            proctor_name: proctor.full_name.clone(),
            committee_number: committee.clone(),
            grade: g.clone(),
            kind: DELIVERY_TYPE_RECEIVE.to_string(),
            time: time.clone(),
            period: sv.period,
            status: DeliveryStatus::Pending,
            submitted_count: counts.get(g).copied(),
        };
        store::insert_delivery_log(&tx, &log)?;
        logs.push(log);
    }
    let summary = grades
        .iter()
        .map(|g| format!("{}: {}", g, counts.get(g).copied().unwrap_or(0)))
        .collect::<Vec<_>>()
        .join(" | ");
    let req = raise_request(
        &tx,
        &proctor.full_name,
        &committee,
        &format!("closing request. counts: {}", summary),
        now,
    )?;
    tx.commit()?;

    tracing::info!(committee = %committee, grades = logs.len(), "committee submitted for closing");
    Ok(json!({ "logs": logs, "request": req }))
}

fn confirm_receipt(
    conn: &Connection,
    snap: &Snapshot,
    operator_id: &str,
    committee: &str,
    grade: &str,
    now: NaiveDateTime,
) -> ControlResult<serde_json::Value> {
    let committee = required(committee, "committee")?;
    let grade = required(grade, "grade")?;
    let operator = user(snap, operator_id)?;
    let scope = Scope::for_user(operator);
    if scope == Scope::Nothing {
        return Err(ControlError::rejected(
            "out_of_scope",
            format!("role {} cannot receive envelopes", operator.role.as_str()),
        ));
    }
    let seated = snap
        .students
        .iter()
        .any(|s| s.committee_number == committee && s.grade == grade);
    if !seated {
        return Err(ControlError::not_found(format!(
            "committee {} has no {} students",
            committee, grade
        )));
    }
    if !scope.covers(&committee, &grade) {
        return Err(ControlError::rejected(
            "out_of_scope",
            format!(
                "committee {} grade {} is outside your assigned scope",
                committee, grade
            ),
        ));
    }
    let sv = snap.supervision_for_committee(&committee).ok_or_else(|| {
        ControlError::rejected(
            "no_supervision",
            format!("no proctor has checked in to committee {}", committee),
        )
    })?;
    let proctor_name = snap
        .user_by_id(&sv.teacher_id)
        .map(|u| u.full_name.clone())
        .unwrap_or_else(|| "---".to_string());

    let already = || {
        ControlError::rejected(
            "already_confirmed",
            format!("committee {} grade {} was already received", committee, grade),
        )
    };

    let tx = conn.unchecked_transaction()?;
    if store::delivery_log_for(&tx, &committee, &grade, DeliveryStatus::Confirmed)?.is_some() {
        return Err(already());
    }
    let time = stamp(now);
    let written = match store::delivery_log_for(&tx, &committee, &grade, DeliveryStatus::Pending)? {
        Some(pending) => store::confirm_delivery_log(&tx, &pending.id, &operator.full_name, &time)
            .map(|_| pending.id),
        None => {
            let log = DeliveryLog {
                id: new_id(),
                teacher_name: operator.full_name.clone(),
                proctor_name,
                committee_number: committee.clone(),
                grade: grade.clone(),
                kind: DELIVERY_TYPE_RECEIVE.to_string(),
                time: time.clone(),
                period: sv.period,
                status: DeliveryStatus::Confirmed,
                submitted_count: None,
            };
            store::insert_delivery_log(&tx, &log).map(|_| log.id)
        }
    };
    let log_id = match written {
        Ok(id) => id,
        Err(ControlError::Db(e)) if db::is_constraint(&e) => return Err(already()),
        Err(e) => return Err(e),
    };
    let log = store::find_one::<DeliveryLog>(&tx, "id", &log_id)?
        .ok_or_else(|| ControlError::not_found("delivery log vanished after write"))?;
    tx.commit()?;

    tracing::info!(committee = %committee, grade = %grade, operator = %operator.full_name, "envelope received");
    Ok(json!({ "log": log }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeDetail {
    pub grade: String,
    pub student_count: usize,
    pub present: usize,
    pub absentees: Vec<Absence>,
    pub submitted_count: Option<i64>,
    pub pending: bool,
    pub received: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub matched_by: &'static str,
    pub committee_number: String,
    pub proctor_name: Option<String>,
    pub envelopes: Vec<EnvelopeDetail>,
}

/// Resolves a scanned badge (teacher national id) or a typed committee number
/// to the envelopes this operator may receive.
pub fn resolve_receipt(snap: &Snapshot, operator: &User, input: &str) -> ControlResult<Resolution> {
    let input = required(input, "input")?;
    let scope = Scope::for_user(operator);
    if scope == Scope::Nothing {
        return Err(ControlError::rejected(
            "out_of_scope",
            format!("role {} cannot receive envelopes", operator.role.as_str()),
        ));
    }
    let keys = status::envelope_keys(snap, &scope);
    let in_committee = |c: &str| -> Vec<EnvelopeKey> {
        keys.iter()
            .filter(|k| k.committee_number == c)
            .cloned()
            .collect()
    };

    let (matched_by, committee, matched) = if let Some(teacher) = snap.user_by_national_id(&input) {
        let sv = snap.supervision_for_teacher(&teacher.id).ok_or_else(|| {
            ControlError::rejected(
                "no_supervision",
                format!("{} has no committee assigned today", teacher.full_name),
            )
        })?;
        let matched = in_committee(&sv.committee_number);
        if matched.is_empty() {
            return Err(ControlError::rejected(
                "out_of_scope",
                format!(
                    "committee {} of this proctor belongs to a grade outside your scope",
                    sv.committee_number
                ),
            ));
        }
        ("teacher", sv.committee_number.clone(), matched)
    } else {
        let matched = in_committee(&input);
        if matched.is_empty() {
            if status::committee_numbers(snap).contains(&input) {
                return Err(ControlError::rejected(
                    "out_of_scope",
                    format!("committee {} is not within your assigned scope", input),
                ));
            }
            return Err(ControlError::not_found(format!(
                "no teacher or committee matches {}",
                input
            )));
        }
        ("committee", input.clone(), matched)
    };

    let envelopes = matched
        .into_iter()
        .map(|k| {
            let ids: Vec<&str> = snap
                .students
                .iter()
                .filter(|s| s.committee_number == committee && s.grade == k.grade)
                .map(|s| s.id.as_str())
                .collect();
            let absentees: Vec<Absence> = snap
                .absences
                .iter()
                .filter(|a| a.kind == AbsenceKind::Absent && ids.contains(&a.student_id.as_str()))
                .cloned()
                .collect();
            let pending = snap.delivery_logs.iter().find(|l| {
                l.committee_number == committee
                    && l.grade == k.grade
                    && l.status == DeliveryStatus::Pending
            });
            EnvelopeDetail {
                present: k.student_count.saturating_sub(absentees.len()),
                submitted_count: pending.and_then(|l| l.submitted_count),
                pending: pending.is_some(),
                received: k.received,
                grade: k.grade,
                student_count: k.student_count,
                absentees,
            }
        })
        .collect();

    Ok(Resolution {
        matched_by,
        proctor_name: snap.proctor_for_committee(&committee).map(|u| u.full_name.clone()),
        committee_number: committee,
        envelopes,
    })
}
