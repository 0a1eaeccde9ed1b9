//! Committee status derivation.
//!
//! Everything here is a pure function of a [`Snapshot`] (and, for the anomaly
//! flag, the time of day), so every view recomputes from the same inputs.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveTime};
use serde::Serialize;

use crate::model::{
    AbsenceKind, ControlRequest, DeliveryLog, DeliveryStatus, RequestStatus, Role, Snapshot,
    User,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitteeState {
    Idle,
    Active,
    Problem,
    Submitted,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctorRef {
    pub id: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitteeStatus {
    pub num: String,
    pub proctor: Option<ProctorRef>,
    pub total_students: usize,
    pub absent_count: usize,
    pub late_count: usize,
    pub present_count: usize,
    pub open_requests: usize,
    pub status: CommitteeState,
    pub is_anomaly: bool,
}

/// Parses `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let t = s.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .ok()
}

/// Numeric when both sides parse, lexical otherwise.
pub fn compare_committees(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Committees exist only through their students.
pub fn committee_numbers(snap: &Snapshot) -> Vec<String> {
    let set: BTreeSet<&str> = snap
        .students
        .iter()
        .map(|s| s.committee_number.trim())
        .filter(|c| !c.is_empty())
        .collect();
    let mut nums: Vec<String> = set.into_iter().map(str::to_string).collect();
    nums.sort_by(|a, b| compare_committees(a, b));
    nums
}

pub fn grades_in_committee(snap: &Snapshot, committee: &str) -> Vec<String> {
    let set: BTreeSet<&str> = snap
        .students
        .iter()
        .filter(|s| s.committee_number == committee)
        .map(|s| s.grade.as_str())
        .filter(|g| !g.is_empty())
        .collect();
    set.into_iter().map(str::to_string).collect()
}

fn logs_for<'a>(snap: &'a Snapshot, committee: &'a str) -> impl Iterator<Item = &'a DeliveryLog> + 'a {
    snap.delivery_logs
        .iter()
        .filter(move |l| l.committee_number == committee)
}

pub fn is_grade_confirmed(snap: &Snapshot, committee: &str, grade: &str) -> bool {
    logs_for(snap, committee).any(|l| l.grade == grade && l.status == DeliveryStatus::Confirmed)
}

pub fn derive_state(snap: &Snapshot, committee: &str) -> CommitteeState {
    let grades = grades_in_committee(snap, committee);
    if !grades.is_empty() && grades.iter().all(|g| is_grade_confirmed(snap, committee, g)) {
        return CommitteeState::Done;
    }
    if logs_for(snap, committee).any(|l| l.status == DeliveryStatus::Pending) {
        return CommitteeState::Submitted;
    }
    if snap.absences.iter().any(|a| a.committee_number == committee) {
        return CommitteeState::Problem;
    }
    if snap.supervision_for_committee(committee).is_some() {
        return CommitteeState::Active;
    }
    CommitteeState::Idle
}

/// No proctor checked in, well past the start time, and nothing handed in yet.
/// The boundary itself (start + grace) is not anomalous.
pub fn is_anomalous(
    start: Option<NaiveTime>,
    grace_minutes: i64,
    now: NaiveTime,
    has_supervision: bool,
    state: CommitteeState,
) -> bool {
    let Some(start) = start else {
        return false;
    };
    let deadline = start + Duration::minutes(grace_minutes);
    let late = if deadline >= start {
        now > deadline
    } else {
        // grace window crosses midnight
        now > deadline && now < start
    };
    late && !has_supervision && !matches!(state, CommitteeState::Done | CommitteeState::Submitted)
}

fn is_open(r: &ControlRequest) -> bool {
    r.status != RequestStatus::Done
}

pub fn committee_status(snap: &Snapshot, committee: &str, now: NaiveTime) -> CommitteeStatus {
    let total = snap
        .students
        .iter()
        .filter(|s| s.committee_number == committee)
        .count();
    let absent = snap
        .absences
        .iter()
        .filter(|a| a.committee_number == committee && a.kind == AbsenceKind::Absent)
        .count();
    let late = snap
        .absences
        .iter()
        .filter(|a| a.committee_number == committee && a.kind == AbsenceKind::Late)
        .count();
    let sv = snap.supervision_for_committee(committee);
    let proctor = snap.proctor_for_committee(committee).map(|u| ProctorRef {
        id: u.id.clone(),
        full_name: u.full_name.clone(),
    });
    let state = derive_state(snap, committee);
    let start = snap
        .config
        .exam_start_time
        .as_deref()
        .and_then(parse_time_of_day);

    CommitteeStatus {
        num: committee.to_string(),
        proctor,
        total_students: total,
        absent_count: absent,
        late_count: late,
        present_count: total.saturating_sub(absent),
        open_requests: snap
            .control_requests
            .iter()
            .filter(|r| r.committee_number == committee && is_open(r))
            .count(),
        status: state,
        is_anomaly: is_anomalous(start, snap.config.grace_minutes, now, sv.is_some(), state),
    }
}

pub fn committee_statuses(snap: &Snapshot, now: NaiveTime) -> Vec<CommitteeStatus> {
    committee_numbers(snap)
        .iter()
        .map(|c| committee_status(snap, c, now))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBoard {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub requests: Vec<ControlRequest>,
}

/// Open requests first, newest first within each group.
pub fn request_board(requests: &[ControlRequest]) -> RequestBoard {
    let mut sorted = requests.to_vec();
    sorted.sort_by(|a, b| match (is_open(a), is_open(b)) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => b
            .created_at
            .cmp(&a.created_at)
            .then_with(|| b.time.cmp(&a.time)),
    });
    let count = |s: RequestStatus| requests.iter().filter(|r| r.status == s).count();
    RequestBoard {
        pending: count(RequestStatus::Pending),
        in_progress: count(RequestStatus::InProgress),
        done: count(RequestStatus::Done),
        requests: sorted,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRoomStats {
    pub total_committees: usize,
    pub completed: usize,
    pub remaining: usize,
    pub absents: usize,
    pub lates: usize,
    pub active_requests: usize,
    pub progress: u32,
}

pub fn control_room_stats(snap: &Snapshot) -> ControlRoomStats {
    let nums = committee_numbers(snap);
    let confirmed: BTreeSet<&str> = snap
        .delivery_logs
        .iter()
        .filter(|l| l.status == DeliveryStatus::Confirmed)
        .map(|l| l.committee_number.as_str())
        .collect();
    let completed = nums.iter().filter(|n| confirmed.contains(n.as_str())).count();
    let total = nums.len();
    ControlRoomStats {
        total_committees: total,
        completed,
        remaining: total - completed,
        absents: snap
            .absences
            .iter()
            .filter(|a| a.kind == AbsenceKind::Absent)
            .count(),
        lates: snap
            .absences
            .iter()
            .filter(|a| a.kind == AbsenceKind::Late)
            .count(),
        active_requests: snap.control_requests.iter().filter(|r| is_open(r)).count(),
        progress: percent(completed, total),
    }
}

fn percent(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        return 0;
    }
    ((part as f64) * 100.0 / (whole as f64)).round() as u32
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitteeDetail {
    pub num: String,
    pub proctor_name: Option<String>,
    pub is_assigned: bool,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub progress: u32,
    pub status: CommitteeState,
    pub confirmed_logs: Vec<DeliveryLog>,
}

pub fn committee_detail(snap: &Snapshot, committee: &str) -> Option<CommitteeDetail> {
    let target = committee.trim();
    let total = snap
        .students
        .iter()
        .filter(|s| s.committee_number.trim() == target)
        .count();
    if total == 0 {
        return None;
    }
    let absent = snap
        .absences
        .iter()
        .filter(|a| a.committee_number.trim() == target && a.kind == AbsenceKind::Absent)
        .count();
    let late = snap
        .absences
        .iter()
        .filter(|a| a.committee_number.trim() == target && a.kind == AbsenceKind::Late)
        .count();
    let proctor = snap.proctor_for_committee(target);
    let mut confirmed_logs: Vec<DeliveryLog> = logs_for(snap, target)
        .filter(|l| l.status == DeliveryStatus::Confirmed)
        .cloned()
        .collect();
    confirmed_logs.sort_by(|a, b| b.time.cmp(&a.time));
    let present = total.saturating_sub(absent);
    Some(CommitteeDetail {
        num: target.to_string(),
        proctor_name: proctor.map(|u| u.full_name.clone()),
        is_assigned: proctor.is_some(),
        total,
        present,
        absent,
        late,
        progress: percent(present, total),
        status: derive_state(snap, target),
        confirmed_logs,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisionRow {
    pub committee_number: String,
    pub proctor_name: Option<String>,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub delivery_time: Option<String>,
}

/// One row per assignment, in committee order.
pub fn supervision_report(snap: &Snapshot) -> Vec<SupervisionRow> {
    let mut svs: Vec<_> = snap.supervisions.iter().collect();
    svs.sort_by(|a, b| compare_committees(&a.committee_number, &b.committee_number));
    svs.into_iter()
        .map(|sv| {
            let c = sv.committee_number.as_str();
            let total = snap
                .students
                .iter()
                .filter(|s| s.committee_number == c)
                .count();
            let absent = snap
                .absences
                .iter()
                .filter(|a| a.committee_number == c && a.kind == AbsenceKind::Absent)
                .count();
            let late = snap
                .absences
                .iter()
                .filter(|a| a.committee_number == c && a.kind == AbsenceKind::Late)
                .count();
            SupervisionRow {
                committee_number: c.to_string(),
                proctor_name: snap.user_by_id(&sv.teacher_id).map(|u| u.full_name.clone()),
                total,
                present: total.saturating_sub(absent),
                absent,
                late,
                delivery_time: logs_for(snap, c)
                    .find(|l| l.status == DeliveryStatus::Confirmed)
                    .map(|l| l.time.clone()),
            }
        })
        .collect()
}

/// What a control-desk operator may receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Everything,
    Grades(BTreeSet<String>),
    Committees(BTreeSet<String>),
    Nothing,
}

impl Scope {
    pub fn for_user(user: &User) -> Scope {
        match user.role {
            Role::Admin | Role::ControlManager => Scope::Everything,
            Role::Control => Scope::Grades(user.assigned_grades.iter().cloned().collect()),
            Role::AssistantControl => {
                Scope::Committees(user.assigned_committees.iter().cloned().collect())
            }
            Role::Proctor | Role::Counselor => Scope::Nothing,
        }
    }

    pub fn covers(&self, committee: &str, grade: &str) -> bool {
        match self {
            Scope::Everything => true,
            Scope::Grades(g) => g.contains(grade),
            Scope::Committees(c) => c.contains(committee),
            Scope::Nothing => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeKey {
    pub committee_number: String,
    pub grade: String,
    pub student_count: usize,
    pub received: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptScope {
    pub received_count: usize,
    pub remaining_count: usize,
    pub students_received: usize,
    pub students_remaining: usize,
    pub remaining: Vec<EnvelopeKey>,
    pub received: Vec<EnvelopeKey>,
}

/// Every (committee, grade) envelope the scope covers, in committee order.
pub fn envelope_keys(snap: &Snapshot, scope: &Scope) -> Vec<EnvelopeKey> {
    let mut counts: BTreeMap<(String, String), usize> = BTreeMap::new();
    for s in &snap.students {
        if s.committee_number.is_empty() || s.grade.is_empty() {
            continue;
        }
        if !scope.covers(&s.committee_number, &s.grade) {
            continue;
        }
        *counts
            .entry((s.committee_number.clone(), s.grade.clone()))
            .or_insert(0) += 1;
    }
    let mut keys: Vec<EnvelopeKey> = counts
        .into_iter()
        .map(|((committee, grade), n)| EnvelopeKey {
            received: is_grade_confirmed(snap, &committee, &grade),
            committee_number: committee,
            grade,
            student_count: n,
        })
        .collect();
    keys.sort_by(|a, b| {
        compare_committees(&a.committee_number, &b.committee_number)
            .then_with(|| a.grade.cmp(&b.grade))
    });
    keys
}

pub fn receipt_scope(snap: &Snapshot, scope: &Scope) -> ReceiptScope {
    let (received, remaining): (Vec<_>, Vec<_>) =
        envelope_keys(snap, scope).into_iter().partition(|k| k.received);
    ReceiptScope {
        received_count: received.len(),
        remaining_count: remaining.len(),
        students_received: received.iter().map(|k| k.student_count).sum(),
        students_remaining: remaining.iter().map(|k| k.student_count).sum(),
        remaining,
        received,
    }
}

/// Starting numbers for the closing confirmation: students per grade minus ABSENT ones.
pub fn closing_defaults(snap: &Snapshot, committee: &str) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    for grade in grades_in_committee(snap, committee) {
        let ids: BTreeSet<&str> = snap
            .students
            .iter()
            .filter(|s| s.committee_number == committee && s.grade == grade)
            .map(|s| s.id.as_str())
            .collect();
        let absent = snap
            .absences
            .iter()
            .filter(|a| {
                a.committee_number == committee
                    && a.kind == AbsenceKind::Absent
                    && ids.contains(a.student_id.as_str())
            })
            .count();
        out.insert(grade, ids.len().saturating_sub(absent) as i64);
    }
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardOverview {
    pub students: usize,
    pub users: usize,
    pub active_supervisions: usize,
    pub committees: Vec<CommitteeStatus>,
}

/// Counts plus the live wall, filtered by committee number or proctor name.
pub fn dashboard_overview(snap: &Snapshot, search: &str, now: NaiveTime) -> DashboardOverview {
    let needle = search.trim();
    let committees = committee_statuses(snap, now)
        .into_iter()
        .filter(|c| {
            needle.is_empty()
                || c.num.contains(needle)
                || c
                    .proctor
                    .as_ref()
                    .map(|p| p.full_name.contains(needle))
                    .unwrap_or(false)
        })
        .collect();
    DashboardOverview {
        students: snap.students.len(),
        users: snap.users.len(),
        active_supervisions: snap.supervisions.len(),
        committees,
    }
}
