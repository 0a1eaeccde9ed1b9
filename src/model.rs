use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    ControlManager,
    Proctor,
    Control,
    AssistantControl,
    Counselor,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Admin,
        Role::ControlManager,
        Role::Proctor,
        Role::Control,
        Role::AssistantControl,
        Role::Counselor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::ControlManager => "CONTROL_MANAGER",
            Role::Proctor => "PROCTOR",
            Role::Control => "CONTROL",
            Role::AssistantControl => "ASSISTANT_CONTROL",
            Role::Counselor => "COUNSELOR",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        let t = s.trim();
        Role::ALL.into_iter().find(|r| r.as_str().eq_ignore_ascii_case(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbsenceKind {
    Absent,
    Late,
}

impl AbsenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AbsenceKind::Absent => "ABSENT",
            AbsenceKind::Late => "LATE",
        }
    }

    pub fn parse(s: &str) -> Option<AbsenceKind> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABSENT" => Some(AbsenceKind::Absent),
            "LATE" => Some(AbsenceKind::Late),
            _ => None,
        }
    }

    /// Official form number printed for this kind of record.
    pub fn form_number(self) -> u32 {
        match self {
            AbsenceKind::Absent => 36,
            AbsenceKind::Late => 31,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Done,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Done => "DONE",
        }
    }

    pub fn parse(s: &str) -> Option<RequestStatus> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(RequestStatus::Pending),
            "IN_PROGRESS" => Some(RequestStatus::InProgress),
            "DONE" => Some(RequestStatus::Done),
            _ => None,
        }
    }

    /// Requests only move forward; skipping IN_PROGRESS is allowed.
    pub fn can_advance_to(self, next: RequestStatus) -> bool {
        next > self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Confirmed => "CONFIRMED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeState {
    Intact,
    Damaged,
}

impl EnvelopeState {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeState::Intact => "INTACT",
            EnvelopeState::Damaged => "DAMAGED",
        }
    }

    pub fn parse(s: &str) -> Option<EnvelopeState> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTACT" => Some(EnvelopeState::Intact),
            "DAMAGED" => Some(EnvelopeState::Damaged),
            _ => None,
        }
    }
}

pub const DELIVERY_TYPE_RECEIVE: &str = "RECEIVE";
pub const AWAITING_CONTROL: &str = "awaiting control";
pub const MAIN_CONFIG_ID: &str = "main_config";
pub const DEFAULT_GRACE_MINUTES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub national_id: String,
    pub full_name: String,
    pub role: Role,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub assigned_committees: Vec<String>,
    #[serde(default)]
    pub assigned_grades: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub national_id: String,
    pub name: String,
    pub grade: String,
    #[serde(default)]
    pub section: String,
    pub committee_number: String,
    #[serde(default)]
    pub seating_number: String,
    #[serde(default)]
    pub parent_phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supervision {
    pub id: String,
    pub teacher_id: String,
    pub committee_number: String,
    pub date: String,
    pub period: i64,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Absence {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub committee_number: String,
    pub period: i64,
    #[serde(rename = "type")]
    pub kind: AbsenceKind,
    pub proctor_id: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub id: String,
    #[serde(rename = "from")]
    pub from_user_name: String,
    #[serde(rename = "committee")]
    pub committee_number: String,
    pub text: String,
    pub time: String,
    pub status: RequestStatus,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLog {
    pub id: String,
    pub teacher_name: String,
    pub proctor_name: String,
    pub committee_number: String,
    pub grade: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub time: String,
    pub period: i64,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub submitted_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub id: String,
    #[serde(default)]
    pub exam_start_time: Option<String>,
    #[serde(default)]
    pub exam_date: Option<String>,
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: i64,
}

fn default_grace_minutes() -> i64 {
    DEFAULT_GRACE_MINUTES
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            id: MAIN_CONFIG_ID.to_string(),
            exam_start_time: None,
            exam_date: None,
            grace_minutes: DEFAULT_GRACE_MINUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub text: String,
    pub target_role: String,
    pub sender_name: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeLog {
    pub id: String,
    pub grade: String,
    pub subject: String,
    pub period: String,
    pub opened_by_id: String,
    pub opened_by_name: String,
    pub time: String,
    pub status: EnvelopeState,
}

/// Everything the derivation engine reads, as of one change-log version.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: i64,
    pub users: Vec<User>,
    pub students: Vec<Student>,
    pub supervisions: Vec<Supervision>,
    pub absences: Vec<Absence>,
    pub control_requests: Vec<ControlRequest>,
    pub delivery_logs: Vec<DeliveryLog>,
    pub config: SystemConfig,
}

impl Snapshot {
    /// The exam day in effect: the configured date, else the calendar date of `now`.
    pub fn exam_day(&self, now: NaiveDateTime) -> String {
        self.config
            .exam_date
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| now.format("%Y-%m-%d").to_string())
    }

    /// Keeps only the supervisions of `date`. Assignments from other days stay
    /// in the store but no longer count as a proctor in the room.
    pub fn for_day(mut self, date: &str) -> Snapshot {
        self.supervisions.retain(|s| s.date == date);
        self
    }

    pub fn user_by_id(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn user_by_national_id(&self, national_id: &str) -> Option<&User> {
        let t = national_id.trim();
        self.users.iter().find(|u| u.national_id == t)
    }

    /// Room lookups assume a snapshot narrowed with [`Snapshot::for_day`];
    /// otherwise any day's assignment matches.
    pub fn supervision_for_committee(&self, committee: &str) -> Option<&Supervision> {
        self.supervisions
            .iter()
            .find(|s| s.committee_number == committee)
    }

    pub fn supervision_for_teacher(&self, teacher_id: &str) -> Option<&Supervision> {
        self.supervisions.iter().find(|s| s.teacher_id == teacher_id)
    }

    pub fn proctor_for_committee(&self, committee: &str) -> Option<&User> {
        self.supervision_for_committee(committee)
            .and_then(|sv| self.user_by_id(&sv.teacher_id))
    }
}
