use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE: &str = "examcontrol.sqlite3";

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 50;

/// One journaled table: the JSON key, the column, and whether the column
/// already holds JSON text.
pub struct JournalSpec {
    pub table: &'static str,
    pub fields: &'static [(&'static str, &'static str, bool)],
}

pub const JOURNALED: &[JournalSpec] = &[
    JournalSpec {
        table: "users",
        fields: &[
            ("id", "id", false),
            ("nationalId", "national_id", false),
            ("fullName", "full_name", false),
            ("role", "role", false),
            ("phone", "phone", false),
            ("assignedCommittees", "assigned_committees", true),
            ("assignedGrades", "assigned_grades", true),
        ],
    },
    JournalSpec {
        table: "students",
        fields: &[
            ("id", "id", false),
            ("nationalId", "national_id", false),
            ("name", "name", false),
            ("grade", "grade", false),
            ("section", "section", false),
            ("committeeNumber", "committee_number", false),
            ("seatingNumber", "seating_number", false),
            ("parentPhone", "parent_phone", false),
        ],
    },
    JournalSpec {
        table: "supervision",
        fields: &[
            ("id", "id", false),
            ("teacherId", "teacher_id", false),
            ("committeeNumber", "committee_number", false),
            ("date", "date", false),
            ("period", "period", false),
            ("subject", "subject", false),
        ],
    },
    JournalSpec {
        table: "absences",
        fields: &[
            ("id", "id", false),
            ("studentId", "student_id", false),
            ("studentName", "student_name", false),
            ("committeeNumber", "committee_number", false),
            ("period", "period", false),
            ("type", "type", false),
            ("proctorId", "proctor_id", false),
            ("date", "date", false),
        ],
    },
    JournalSpec {
        table: "control_requests",
        fields: &[
            ("id", "id", false),
            ("from", "from_user_name", false),
            ("committee", "committee_number", false),
            ("text", "text", false),
            ("time", "time", false),
            ("status", "status", false),
            ("createdAt", "created_at", false),
        ],
    },
    JournalSpec {
        table: "delivery_logs",
        fields: &[
            ("id", "id", false),
            ("teacherName", "teacher_name", false),
            ("proctorName", "proctor_name", false),
            ("committeeNumber", "committee_number", false),
            ("grade", "grade", false),
            ("type", "type", false),
            ("time", "time", false),
            ("period", "period", false),
            ("status", "status", false),
            ("submittedCount", "submitted_count", false),
        ],
    },
    JournalSpec {
        table: "system_config",
        fields: &[
            ("id", "id", false),
            ("examStartTime", "exam_start_time", false),
            ("examDate", "exam_date", false),
            ("graceMinutes", "grace_minutes", false),
        ],
    },
    JournalSpec {
        table: "notifications",
        fields: &[
            ("id", "id", false),
            ("text", "text", false),
            ("targetRole", "target_role", false),
            ("senderName", "sender_name", false),
            ("createdAt", "created_at", false),
        ],
    },
    JournalSpec {
        table: "envelope_logs",
        fields: &[
            ("id", "id", false),
            ("grade", "grade", false),
            ("subject", "subject", false),
            ("period", "period", false),
            ("openedById", "opened_by_id", false),
            ("openedByName", "opened_by_name", false),
            ("time", "time", false),
            ("status", "status", false),
        ],
    },
];

pub fn journal_spec(table: &str) -> Option<&'static JournalSpec> {
    JOURNALED.iter().find(|s| s.table == table)
}

/// SQL expression building the camelCase JSON object of a row.
/// `prefix` is `NEW`, `OLD` or a table alias.
pub fn row_json_expr(spec: &JournalSpec, prefix: &str) -> String {
    let args: Vec<String> = spec
        .fields
        .iter()
        .map(|(key, col, is_json)| {
            if *is_json {
                format!("'{}', json({}.{})", key, prefix, col)
            } else {
                format!("'{}', {}.{}", key, prefix, col)
            }
        })
        .collect();
    format!("json_object({})", args.join(", "))
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_millis(2000))?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            national_id TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN
              ('ADMIN','CONTROL_MANAGER','PROCTOR','CONTROL','ASSISTANT_CONTROL','COUNSELOR')),
            phone TEXT NOT NULL DEFAULT '',
            assigned_committees TEXT NOT NULL DEFAULT '[]',
            assigned_grades TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            national_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            committee_number TEXT NOT NULL,
            seating_number TEXT NOT NULL DEFAULT '',
            parent_phone TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_committee ON students(committee_number)",
        [],
    )?;

    // One assignment per teacher per date; reassignment is an upsert on this key.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS supervision(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            committee_number TEXT NOT NULL,
            date TEXT NOT NULL,
            period INTEGER NOT NULL DEFAULT 1,
            subject TEXT NOT NULL DEFAULT '',
            UNIQUE(teacher_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_supervision_committee ON supervision(committee_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS absences(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL UNIQUE,
            student_name TEXT NOT NULL,
            committee_number TEXT NOT NULL,
            period INTEGER NOT NULL DEFAULT 1,
            type TEXT NOT NULL CHECK (type IN ('ABSENT','LATE')),
            proctor_id TEXT NOT NULL,
            date TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_absences_committee ON absences(committee_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS control_requests(
            id TEXT PRIMARY KEY,
            from_user_name TEXT NOT NULL,
            committee_number TEXT NOT NULL,
            text TEXT NOT NULL,
            time TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('PENDING','IN_PROGRESS','DONE')),
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS delivery_logs(
            id TEXT PRIMARY KEY,
            teacher_name TEXT NOT NULL,
            proctor_name TEXT NOT NULL,
            committee_number TEXT NOT NULL,
            grade TEXT NOT NULL,
            type TEXT NOT NULL DEFAULT 'RECEIVE',
            time TEXT NOT NULL,
            period INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL CHECK (status IN ('PENDING','CONFIRMED')),
            submitted_count INTEGER
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_delivery_logs_committee ON delivery_logs(committee_number, grade)",
        [],
    )?;
    // Two operators racing on the same envelope must not both confirm it.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_delivery_logs_confirmed
         ON delivery_logs(committee_number, grade) WHERE status = 'CONFIRMED'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS system_config(
            id TEXT PRIMARY KEY,
            exam_start_time TEXT,
            exam_date TEXT,
            grace_minutes INTEGER NOT NULL DEFAULT 10
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO system_config(id) VALUES('main_config')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            target_role TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS envelope_logs(
            id TEXT PRIMARY KEY,
            grade TEXT NOT NULL,
            subject TEXT NOT NULL,
            period TEXT NOT NULL,
            opened_by_id TEXT NOT NULL,
            opened_by_name TEXT NOT NULL,
            time TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('INTACT','DAMAGED'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_log(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            op TEXT NOT NULL,
            row_id TEXT NOT NULL,
            row_json TEXT,
            at TEXT NOT NULL
        )",
        [],
    )?;
    // Highest seq already dropped from change_log; cursors below it must resync.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS journal_floor(
            id INTEGER PRIMARY KEY CHECK (id = 1),
            pruned_through INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute("INSERT OR IGNORE INTO journal_floor(id) VALUES(1)", [])?;
    for spec in JOURNALED {
        ensure_journal_triggers(conn, spec)?;
    }

    Ok(())
}

fn ensure_journal_triggers(conn: &Connection, spec: &JournalSpec) -> anyhow::Result<()> {
    let now = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";
    let new_json = row_json_expr(spec, "NEW");
    // Dropped and recreated so workspaces from older builds get current bodies.
    for (event, suffix, op) in [("INSERT", "ins", "insert"), ("UPDATE", "upd", "update")] {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS trg_{t}_{suffix};
             CREATE TRIGGER trg_{t}_{suffix} AFTER {event} ON {t}
             BEGIN
               INSERT INTO change_log(table_name, op, row_id, row_json, at)
               VALUES('{t}', '{op}', NEW.id, {new_json}, {now});
             END;",
            t = spec.table,
        ))?;
    }
    conn.execute_batch(&format!(
        "CREATE TRIGGER IF NOT EXISTS trg_{t}_del AFTER DELETE ON {t}
         BEGIN
           INSERT INTO change_log(table_name, op, row_id, row_json, at)
           VALUES('{t}', 'delete', OLD.id, NULL, {now});
         END;",
        t = spec.table,
    ))?;
    Ok(())
}

pub fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

pub fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
    )
}

/// Runs `op`, retrying busy/locked failures with doubling backoff.
pub fn with_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if is_busy(&e) && attempt + 1 < RETRY_ATTEMPTS => {
                let delay = RETRY_BASE_DELAY_MS << attempt;
                tracing::warn!(attempt, delay_ms = delay, "database busy, retrying");
                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            other => return other,
        }
    }
}
