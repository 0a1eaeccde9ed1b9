//! Typed access to the workspace collections.
//!
//! Rows are read through the same camelCase JSON projection the change journal
//! uses, so a record decoded here and one rebuilt from journal deltas are
//! identical.

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::db::{self, journal_spec, row_json_expr};
use crate::error::{ControlError, ControlResult};
use crate::model::{
    Absence, ControlRequest, DeliveryLog, DeliveryStatus, EnvelopeLog, Notification,
    RequestStatus, Student, Supervision, SystemConfig, User, MAIN_CONFIG_ID,
};

pub trait Record: DeserializeOwned {
    const TABLE: &'static str;
}

impl Record for User {
    const TABLE: &'static str = "users";
}
impl Record for Student {
    const TABLE: &'static str = "students";
}
impl Record for Supervision {
    const TABLE: &'static str = "supervision";
}
impl Record for Absence {
    const TABLE: &'static str = "absences";
}
impl Record for ControlRequest {
    const TABLE: &'static str = "control_requests";
}
impl Record for DeliveryLog {
    const TABLE: &'static str = "delivery_logs";
}
impl Record for SystemConfig {
    const TABLE: &'static str = "system_config";
}
impl Record for Notification {
    const TABLE: &'static str = "notifications";
}
impl Record for EnvelopeLog {
    const TABLE: &'static str = "envelope_logs";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    /// Decodes a journal op. Journals written before inserts and updates were
    /// told apart hold "upsert", read back as an update.
    pub fn parse(s: &str) -> Option<ChangeOp> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Some(ChangeOp::Insert),
            "update" | "upsert" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }

    /// The ops a `sync.changes` filter name selects; "upsert" takes both row writes.
    pub fn parse_filter(s: &str) -> Option<&'static [ChangeOp]> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Some(&[ChangeOp::Insert]),
            "update" => Some(&[ChangeOp::Update]),
            "upsert" => Some(&[ChangeOp::Insert, ChangeOp::Update]),
            "delete" => Some(&[ChangeOp::Delete]),
            _ => None,
        }
    }
}

/// One row-level delta from the change journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub seq: i64,
    pub table: String,
    pub op: ChangeOp,
    pub row_id: String,
    pub row: Option<serde_json::Value>,
    pub at: String,
}

pub fn decode<T: DeserializeOwned>(table: &str, raw: &str) -> ControlResult<T> {
    serde_json::from_str(raw).map_err(|source| ControlError::Decode {
        table: table.to_string(),
        source,
    })
}

/// Raw JSON rows of a journaled table, optionally filtered by `filter` (SQL after WHERE).
pub fn select_json(
    conn: &Connection,
    table: &str,
    filter: Option<&str>,
    args: &[&dyn ToSql],
) -> ControlResult<Vec<String>> {
    let spec = journal_spec(table)
        .ok_or_else(|| ControlError::bad_params(format!("unknown table: {}", table)))?;
    let mut sql = format!("SELECT {} FROM {} t", row_json_expr(spec, "t"), table);
    if let Some(f) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(f);
    }
    sql.push_str(" ORDER BY t.rowid");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_all<R: Record>(conn: &Connection) -> ControlResult<Vec<R>> {
    select_json(conn, R::TABLE, None, &[])?
        .iter()
        .map(|raw| decode(R::TABLE, raw))
        .collect()
}

pub fn find_by<R: Record>(conn: &Connection, column: &str, value: &str) -> ControlResult<Vec<R>> {
    let filter = format!("t.{} = ?", column);
    select_json(conn, R::TABLE, Some(&filter), &[&value])?
        .iter()
        .map(|raw| decode(R::TABLE, raw))
        .collect()
}

pub fn find_one<R: Record>(conn: &Connection, column: &str, value: &str) -> ControlResult<Option<R>> {
    Ok(find_by(conn, column, value)?.into_iter().next())
}

pub fn delete_by<R: Record>(conn: &Connection, column: &str, value: &str) -> ControlResult<usize> {
    let sql = format!("DELETE FROM {} WHERE {} = ?", R::TABLE, column);
    Ok(db::with_retry(|| conn.execute(&sql, [value]))?)
}

pub fn clear<R: Record>(conn: &Connection) -> ControlResult<usize> {
    let sql = format!("DELETE FROM {}", R::TABLE);
    Ok(db::with_retry(|| conn.execute(&sql, []))?)
}

/// Highest seq handed out, including pruned ones.
pub fn current_version(conn: &Connection) -> ControlResult<i64> {
    Ok(conn.query_row(
        "SELECT MAX(COALESCE((SELECT MAX(seq) FROM change_log), 0),
                    COALESCE((SELECT pruned_through FROM journal_floor WHERE id = 1), 0))",
        [],
        |r| r.get(0),
    )?)
}

/// Cursors below this value have missed deltas and need a fresh snapshot.
pub fn pruned_through(conn: &Connection) -> ControlResult<i64> {
    Ok(conn
        .query_row(
            "SELECT pruned_through FROM journal_floor WHERE id = 1",
            [],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

/// Drops journal entries up to and including `through` and raises the floor.
pub fn prune_changes(conn: &Connection, through: i64) -> ControlResult<usize> {
    let removed = db::with_retry(|| {
        conn.execute("DELETE FROM change_log WHERE seq <= ?", [through])
    })?;
    db::with_retry(|| {
        conn.execute(
            "UPDATE journal_floor SET pruned_through = MAX(pruned_through, ?) WHERE id = 1",
            [through],
        )
    })?;
    Ok(removed)
}

pub fn changes_since(conn: &Connection, since: i64, limit: i64) -> ControlResult<Vec<Change>> {
    let mut stmt = conn.prepare(
        "SELECT seq, table_name, op, row_id, row_json, at
         FROM change_log
         WHERE seq > ?
         ORDER BY seq
         LIMIT ?",
    )?;
    let raw = stmt
        .query_map(params![since, limit], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(raw.len());
    for (seq, table, op, row_id, row_json, at) in raw {
        let op = ChangeOp::parse(&op).unwrap_or(ChangeOp::Update);
        let row = match row_json {
            Some(j) => Some(decode::<serde_json::Value>(&table, &j)?),
            None => None,
        };
        out.push(Change {
            seq,
            table,
            op,
            row_id,
            row,
            at,
        });
    }
    Ok(out)
}

pub fn load_config(conn: &Connection) -> ControlResult<SystemConfig> {
    Ok(find_one::<SystemConfig>(conn, "id", MAIN_CONFIG_ID)?.unwrap_or_default())
}

pub fn save_config(conn: &Connection, cfg: &SystemConfig) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO system_config(id, exam_start_time, exam_date, grace_minutes)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               exam_start_time = excluded.exam_start_time,
               exam_date = excluded.exam_date,
               grace_minutes = excluded.grace_minutes",
            params![
                MAIN_CONFIG_ID,
                cfg.exam_start_time,
                cfg.exam_date,
                cfg.grace_minutes
            ],
        )
    })?;
    Ok(())
}

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Insert-or-update keyed by national_id; the stored id wins over the incoming one.
pub fn upsert_user(conn: &Connection, u: &User) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO users(id, national_id, full_name, role, phone, assigned_committees, assigned_grades)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(national_id) DO UPDATE SET
               full_name = excluded.full_name,
               role = excluded.role,
               phone = excluded.phone,
               assigned_committees = excluded.assigned_committees,
               assigned_grades = excluded.assigned_grades",
            params![
                u.id,
                u.national_id,
                u.full_name,
                u.role.as_str(),
                u.phone,
                json_list(&u.assigned_committees),
                json_list(&u.assigned_grades)
            ],
        )
    })?;
    Ok(())
}

pub fn upsert_student(conn: &Connection, s: &Student) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO students(id, national_id, name, grade, section, committee_number, seating_number, parent_phone)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(national_id) DO UPDATE SET
               name = excluded.name,
               grade = excluded.grade,
               section = excluded.section,
               committee_number = excluded.committee_number,
               seating_number = excluded.seating_number,
               parent_phone = excluded.parent_phone",
            params![
                s.id,
                s.national_id,
                s.name,
                s.grade,
                s.section,
                s.committee_number,
                s.seating_number,
                s.parent_phone
            ],
        )
    })?;
    Ok(())
}

pub fn set_parent_phone(conn: &Connection, student_id: &str, phone: &str) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "UPDATE students SET parent_phone = ? WHERE id = ?",
            params![phone, student_id],
        )
    })?;
    Ok(())
}

/// Single write keyed by (teacher_id, date): a teacher switching committees never
/// passes through a state with no assignment.
pub fn upsert_supervision(conn: &Connection, sv: &Supervision) -> ControlResult<Supervision> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO supervision(id, teacher_id, committee_number, date, period, subject)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(teacher_id, date) DO UPDATE SET
               committee_number = excluded.committee_number,
               period = excluded.period,
               subject = excluded.subject",
            params![
                sv.id,
                sv.teacher_id,
                sv.committee_number,
                sv.date,
                sv.period,
                sv.subject
            ],
        )
    })?;
    let filter = "t.teacher_id = ? AND t.date = ?";
    let stored = select_json(conn, "supervision", Some(filter), &[&sv.teacher_id, &sv.date])?;
    match stored.first() {
        Some(raw) => decode("supervision", raw),
        None => Err(ControlError::not_found("supervision vanished after upsert")),
    }
}

pub fn delete_supervision(conn: &Connection, teacher_id: &str, date: &str) -> ControlResult<usize> {
    Ok(db::with_retry(|| {
        conn.execute(
            "DELETE FROM supervision WHERE teacher_id = ? AND date = ?",
            params![teacher_id, date],
        )
    })?)
}

/// One absence row per student: a new kind replaces the old one.
pub fn upsert_absence(conn: &Connection, a: &Absence) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO absences(id, student_id, student_name, committee_number, period, type, proctor_id, date)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id) DO UPDATE SET
               student_name = excluded.student_name,
               committee_number = excluded.committee_number,
               period = excluded.period,
               type = excluded.type,
               proctor_id = excluded.proctor_id,
               date = excluded.date",
            params![
                a.id,
                a.student_id,
                a.student_name,
                a.committee_number,
                a.period,
                a.kind.as_str(),
                a.proctor_id,
                a.date
            ],
        )
    })?;
    Ok(())
}

pub fn insert_control_request(conn: &Connection, r: &ControlRequest) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO control_requests(id, from_user_name, committee_number, text, time, status, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            params![
                r.id,
                r.from_user_name,
                r.committee_number,
                r.text,
                r.time,
                r.status.as_str(),
                r.created_at
            ],
        )
    })?;
    Ok(())
}

pub fn set_request_status(conn: &Connection, id: &str, status: RequestStatus) -> ControlResult<usize> {
    Ok(db::with_retry(|| {
        conn.execute(
            "UPDATE control_requests SET status = ? WHERE id = ?",
            params![status.as_str(), id],
        )
    })?)
}

pub fn insert_delivery_log(conn: &Connection, l: &DeliveryLog) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO delivery_logs(id, teacher_name, proctor_name, committee_number, grade, type, time, period, status, submitted_count)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                l.id,
                l.teacher_name,
                l.proctor_name,
                l.committee_number,
                l.grade,
                l.kind,
                l.time,
                l.period,
                l.status.as_str(),
                l.submitted_count
            ],
        )
    })?;
    Ok(())
}

pub fn confirm_delivery_log(
    conn: &Connection,
    id: &str,
    teacher_name: &str,
    time: &str,
) -> ControlResult<usize> {
    Ok(db::with_retry(|| {
        conn.execute(
            "UPDATE delivery_logs SET status = ?, teacher_name = ?, time = ?
             WHERE id = ? AND status = ?",
            params![
                DeliveryStatus::Confirmed.as_str(),
                teacher_name,
                time,
                id,
                DeliveryStatus::Pending.as_str()
            ],
        )
    })?)
}

pub fn delivery_log_for(
    conn: &Connection,
    committee: &str,
    grade: &str,
    status: DeliveryStatus,
) -> ControlResult<Option<DeliveryLog>> {
    let filter = "t.committee_number = ? AND t.grade = ? AND t.status = ?";
    let rows = select_json(
        conn,
        "delivery_logs",
        Some(filter),
        &[&committee, &grade, &status.as_str()],
    )?;
    rows.first().map(|raw| decode("delivery_logs", raw)).transpose()
}

pub fn insert_notification(conn: &Connection, n: &Notification) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO notifications(id, text, target_role, sender_name, created_at)
             VALUES(?, ?, ?, ?, ?)",
            params![n.id, n.text, n.target_role, n.sender_name, n.created_at],
        )
    })?;
    Ok(())
}

pub fn notifications_for(
    conn: &Connection,
    role: Option<&str>,
    after: Option<&str>,
) -> ControlResult<Vec<Notification>> {
    let after = after.unwrap_or("");
    let rows = match role {
        Some(r) => select_json(
            conn,
            "notifications",
            Some("(t.target_role = 'ALL' OR t.target_role = ?) AND t.created_at > ?"),
            &[&r, &after],
        )?,
        None => select_json(conn, "notifications", Some("t.created_at > ?"), &[&after])?,
    };
    rows.iter().map(|raw| decode("notifications", raw)).collect()
}

pub fn insert_envelope_log(conn: &Connection, e: &EnvelopeLog) -> ControlResult<()> {
    db::with_retry(|| {
        conn.execute(
            "INSERT INTO envelope_logs(id, grade, subject, period, opened_by_id, opened_by_name, time, status)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                e.id,
                e.grade,
                e.subject,
                e.period,
                e.opened_by_id,
                e.opened_by_name,
                e.time,
                e.status.as_str()
            ],
        )
    })?;
    Ok(())
}

pub fn delete_staff_except_admins(conn: &Connection) -> ControlResult<usize> {
    Ok(db::with_retry(|| {
        conn.execute("DELETE FROM users WHERE role <> 'ADMIN'", [])
    })?)
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> ControlResult<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

/// Drops assignments whose teacher no longer exists.
pub fn delete_orphan_supervisions(conn: &Connection) -> ControlResult<usize> {
    Ok(db::with_retry(|| {
        conn.execute(
            "DELETE FROM supervision WHERE teacher_id NOT IN (SELECT id FROM users)",
            [],
        )
    })?)
}
