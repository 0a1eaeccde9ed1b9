#[path = "../src/model.rs"]
#[allow(dead_code)]
mod model;
#[path = "../src/status.rs"]
#[allow(dead_code)]
mod status;

use chrono::NaiveTime;
use model::{
    Absence, AbsenceKind, ControlRequest, DeliveryLog, DeliveryStatus, RequestStatus, Role,
    Snapshot, Student, Supervision, SystemConfig, User,
};
use status::{CommitteeState, Scope};

fn t(s: &str) -> NaiveTime {
    status::parse_time_of_day(s).expect("time")
}

fn student(id: &str, committee: &str, grade: &str) -> Student {
    Student {
        id: id.to_string(),
        national_id: format!("n-{}", id),
        name: format!("student {}", id),
        grade: grade.to_string(),
        section: String::new(),
        committee_number: committee.to_string(),
        seating_number: String::new(),
        parent_phone: String::new(),
    }
}

fn user(id: &str, role: Role) -> User {
    User {
        id: id.to_string(),
        national_id: format!("n-{}", id),
        full_name: format!("{} name", id),
        role,
        phone: String::new(),
        assigned_committees: Vec::new(),
        assigned_grades: Vec::new(),
    }
}

fn supervision(teacher: &str, committee: &str) -> Supervision {
    Supervision {
        id: format!("sv-{}", teacher),
        teacher_id: teacher.to_string(),
        committee_number: committee.to_string(),
        date: "2024-06-02".to_string(),
        period: 1,
        subject: String::new(),
    }
}

fn mark(student_id: &str, committee: &str, kind: AbsenceKind) -> Absence {
    Absence {
        id: format!("a-{}", student_id),
        student_id: student_id.to_string(),
        student_name: String::new(),
        committee_number: committee.to_string(),
        period: 1,
        kind,
        proctor_id: "p1".to_string(),
        date: "2024-06-02T08:20:00".to_string(),
    }
}

fn log(committee: &str, grade: &str, status: DeliveryStatus) -> DeliveryLog {
    DeliveryLog {
        id: format!("l-{}-{}-{}", committee, grade, status.as_str()),
        teacher_name: "operator".to_string(),
        proctor_name: "p1 name".to_string(),
        committee_number: committee.to_string(),
        grade: grade.to_string(),
        kind: model::DELIVERY_TYPE_RECEIVE.to_string(),
        time: "2024-06-02T10:00:00".to_string(),
        period: 1,
        status,
        submitted_count: None,
    }
}

fn request(id: &str, committee: &str, status: RequestStatus, created_at: &str) -> ControlRequest {
    ControlRequest {
        id: id.to_string(),
        from_user_name: "p1 name".to_string(),
        committee_number: committee.to_string(),
        text: "need pens".to_string(),
        time: created_at.to_string(),
        status,
        created_at: created_at.to_string(),
    }
}

fn with_start(start: &str) -> Snapshot {
    Snapshot {
        config: SystemConfig {
            exam_start_time: Some(start.to_string()),
            ..SystemConfig::default()
        },
        ..Snapshot::default()
    }
}

#[test]
fn headcount_counts_only_absent_against_presence() {
    let mut snap = with_start("08:00");
    for i in 0..30 {
        snap.students.push(student(&format!("s{}", i), "5", "G1"));
    }
    snap.absences.push(mark("s0", "5", AbsenceKind::Absent));
    snap.absences.push(mark("s1", "5", AbsenceKind::Absent));
    snap.absences.push(mark("s2", "5", AbsenceKind::Late));

    let st = status::committee_status(&snap, "5", t("08:05"));
    assert_eq!(st.total_students, 30);
    assert_eq!(st.absent_count, 2);
    assert_eq!(st.late_count, 1);
    assert_eq!(st.present_count, 28);
    assert_eq!(st.status, CommitteeState::Problem);
}

#[test]
fn anomaly_starts_strictly_after_grace_window() {
    let mut snap = with_start("08:00");
    snap.students.push(student("s1", "3", "G1"));

    assert!(!status::committee_status(&snap, "3", t("08:09")).is_anomaly);
    assert!(!status::committee_status(&snap, "3", t("08:10")).is_anomaly);
    assert!(status::committee_status(&snap, "3", t("08:11")).is_anomaly);

    // a proctor checking in clears it
    snap.users.push(user("p1", Role::Proctor));
    snap.supervisions.push(supervision("p1", "3"));
    let st = status::committee_status(&snap, "3", t("08:11"));
    assert!(!st.is_anomaly);
    assert_eq!(st.status, CommitteeState::Active);
    assert_eq!(st.proctor.map(|p| p.full_name), Some("p1 name".to_string()));
}

#[test]
fn submitted_committees_are_not_anomalous_without_proctor() {
    let mut snap = with_start("08:00");
    snap.students.push(student("s1", "3", "G1"));
    snap.delivery_logs.push(log("3", "G1", DeliveryStatus::Pending));
    let st = status::committee_status(&snap, "3", t("09:00"));
    assert_eq!(st.status, CommitteeState::Submitted);
    assert!(!st.is_anomaly);
}

#[test]
fn no_configured_start_means_no_anomaly() {
    let mut snap = Snapshot::default();
    snap.students.push(student("s1", "3", "G1"));
    assert!(!status::committee_status(&snap, "3", t("23:00")).is_anomaly);
}

#[test]
fn done_requires_every_grade_confirmed() {
    let mut snap = with_start("08:00");
    snap.students.push(student("s1", "9", "G1"));
    snap.students.push(student("s2", "9", "G2"));
    snap.users.push(user("p1", Role::Proctor));
    snap.supervisions.push(supervision("p1", "9"));
    snap.absences.push(mark("s1", "9", AbsenceKind::Late));

    snap.delivery_logs.push(log("9", "G1", DeliveryStatus::Confirmed));
    // one grade still out: not done, and the absence mark keeps it in PROBLEM
    assert_eq!(status::derive_state(&snap, "9"), CommitteeState::Problem);

    snap.delivery_logs.push(log("9", "G2", DeliveryStatus::Pending));
    assert_eq!(status::derive_state(&snap, "9"), CommitteeState::Submitted);

    snap.delivery_logs.pop();
    snap.delivery_logs.push(log("9", "G2", DeliveryStatus::Confirmed));
    assert_eq!(status::derive_state(&snap, "9"), CommitteeState::Done);
}

#[test]
fn committees_sort_numerically_and_skip_blank_numbers() {
    let mut snap = Snapshot::default();
    for (i, c) in ["10", "2", "", "1", "B"].iter().enumerate() {
        snap.students.push(student(&format!("s{}", i), c, "G1"));
    }
    assert_eq!(status::committee_numbers(&snap), vec!["1", "2", "10", "B"]);
}

#[test]
fn request_board_lists_open_requests_first_newest_first() {
    let requests = vec![
        request("r1", "1", RequestStatus::Done, "2024-06-02T09:30:00"),
        request("r2", "1", RequestStatus::Pending, "2024-06-02T08:15:00"),
        request("r3", "2", RequestStatus::InProgress, "2024-06-02T08:45:00"),
    ];
    let board = status::request_board(&requests);
    let order: Vec<&str> = board.requests.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(order, vec!["r3", "r2", "r1"]);
    assert_eq!((board.pending, board.in_progress, board.done), (1, 1, 1));
}

#[test]
fn control_room_stats_count_committees_with_a_confirmed_log() {
    let mut snap = Snapshot::default();
    snap.students.push(student("s1", "1", "G1"));
    snap.students.push(student("s2", "2", "G1"));
    snap.students.push(student("s3", "3", "G1"));
    snap.delivery_logs.push(log("1", "G1", DeliveryStatus::Confirmed));
    snap.absences.push(mark("s2", "2", AbsenceKind::Absent));
    snap.control_requests
        .push(request("r1", "2", RequestStatus::Pending, "2024-06-02T08:15:00"));

    let stats = status::control_room_stats(&snap);
    assert_eq!(stats.total_committees, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.remaining, 2);
    assert_eq!(stats.absents, 1);
    assert_eq!(stats.active_requests, 1);
    assert_eq!(stats.progress, 33);

    assert_eq!(status::control_room_stats(&Snapshot::default()).progress, 0);
}

#[test]
fn receipt_scope_follows_role_assignments() {
    let mut snap = Snapshot::default();
    snap.students.push(student("s1", "1", "G1"));
    snap.students.push(student("s2", "1", "G2"));
    snap.students.push(student("s3", "2", "G1"));
    snap.delivery_logs.push(log("1", "G1", DeliveryStatus::Confirmed));

    let mut control = user("c1", Role::Control);
    control.assigned_grades = vec!["G1".to_string()];
    let scope = Scope::for_user(&control);
    let summary = status::receipt_scope(&snap, &scope);
    assert_eq!(summary.received_count, 1);
    assert_eq!(summary.remaining_count, 1);
    assert_eq!(summary.remaining[0].committee_number, "2");

    let mut assistant = user("a1", Role::AssistantControl);
    assistant.assigned_committees = vec!["1".to_string()];
    let keys = status::envelope_keys(&snap, &Scope::for_user(&assistant));
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.committee_number == "1"));

    assert_eq!(Scope::for_user(&user("p1", Role::Proctor)), Scope::Nothing);
    assert_eq!(Scope::for_user(&user("m1", Role::ControlManager)), Scope::Everything);
}

#[test]
fn closing_defaults_subtract_absent_marks_per_grade() {
    let mut snap = Snapshot::default();
    snap.students.push(student("s1", "4", "G1"));
    snap.students.push(student("s2", "4", "G1"));
    snap.students.push(student("s3", "4", "G2"));
    snap.absences.push(mark("s1", "4", AbsenceKind::Absent));
    snap.absences.push(mark("s3", "4", AbsenceKind::Late));
    let counts = status::closing_defaults(&snap, "4");
    assert_eq!(counts.get("G1"), Some(&1));
    assert_eq!(counts.get("G2"), Some(&1));
}

#[test]
fn only_the_exam_days_supervision_puts_a_proctor_in_the_room() {
    let mut snap = with_start("08:00");
    snap.config.exam_date = Some("2024-06-02".to_string());
    snap.students.push(student("s1", "5", "G1"));
    snap.students.push(student("s2", "7", "G1"));
    snap.users.push(user("t1", Role::Proctor));
    let mut yesterday = supervision("t1", "5");
    yesterday.id = "sv-old".to_string();
    yesterday.date = "2024-06-01".to_string();
    snap.supervisions.push(yesterday);
    snap.supervisions.push(supervision("t1", "7"));

    let now = chrono::NaiveDate::from_ymd_opt(2024, 6, 2)
        .and_then(|d| d.and_hms_opt(8, 30, 0))
        .expect("now");
    let day = snap.exam_day(now);
    assert_eq!(day, "2024-06-02");
    let today = snap.for_day(&day);

    let old_room = status::committee_status(&today, "5", t("08:30"));
    assert_eq!(old_room.status, CommitteeState::Idle);
    assert!(old_room.is_anomaly);
    assert_eq!(status::derive_state(&today, "7"), CommitteeState::Active);
    assert_eq!(
        today.supervision_for_teacher("t1").map(|sv| sv.committee_number.as_str()),
        Some("7")
    );
}

#[test]
fn exam_day_falls_back_to_the_clock_date() {
    let snap = Snapshot::default();
    let now = chrono::NaiveDate::from_ymd_opt(2024, 6, 3)
        .and_then(|d| d.and_hms_opt(7, 0, 0))
        .expect("now");
    assert_eq!(snap.exam_day(now), "2024-06-03");
}
