use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_examcontrold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examcontrold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value["error"]["code"].as_str().unwrap_or("").to_string()
}

fn user_id_by_national_id(users: &serde_json::Value, national_id: &str) -> String {
    users["users"]
        .as_array()
        .expect("users array")
        .iter()
        .find(|u| u["nationalId"] == national_id)
        .and_then(|u| u["id"].as_str())
        .expect("user present")
        .to_string()
}

fn changes(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) -> (i64, Vec<serde_json::Value>, bool) {
    let page = request_ok(stdin, reader, id, "sync.changes", params);
    (
        page["version"].as_i64().expect("version"),
        page["changes"].as_array().cloned().unwrap_or_default(),
        page["hasMore"].as_bool().expect("hasMore"),
    )
}

#[test]
fn change_feed_pages_by_version_and_filters_tables_and_ops() {
    let workspace = temp_dir("examcontrol-change-feed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);
    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));

    let (v0, _, more) = changes(i, r, "2", json!({ "since": 0, "limit": 10000 }));
    assert!(!more);

    request_ok(
        i,
        r,
        "3",
        "students.import",
        json!({ "rows": [
            { "nationalId": "7000001", "name": "Student A", "grade": "G1", "committeeNumber": "1" },
            { "nationalId": "7000002", "name": "Student B", "grade": "G1", "committeeNumber": "1" }
        ]}),
    );
    let (v1, students, _) = changes(i, r, "4", json!({ "since": v0, "tables": ["students"] }));
    assert!(v1 > v0);
    assert_eq!(students.len(), 2);
    assert!(students.iter().all(|c| c["op"] == "insert" && c["table"] == "students"));

    let (first_page_version, page, more) = changes(i, r, "5", json!({ "since": v0, "limit": 1 }));
    assert_eq!(page.len(), 1);
    assert!(more);
    assert_eq!(first_page_version, page[0]["seq"].as_i64().expect("seq"));

    let raised = request_ok(
        i,
        r,
        "6",
        "commands.dispatch",
        json!({ "command": { "kind": "RaiseRequest", "from": "Proctor One", "committee": "1", "text": "need pens" } }),
    );
    assert_eq!(raised["request"]["status"], "PENDING");
    let request_id = raised["request"]["id"].as_str().expect("request id").to_string();

    let (v2, requests, _) = changes(i, r, "7", json!({ "since": v1, "tables": ["control_requests"] }));
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["rowId"], request_id);
    assert_eq!(requests[0]["row"]["text"], "need pens");

    let students_now = request_ok(i, r, "8", "students.list", json!({}));
    let sid = students_now["students"][0]["id"].as_str().expect("id").to_string();
    request_ok(i, r, "9", "students.delete", json!({ "studentId": sid }));
    let (v3, deletes, _) = changes(i, r, "10", json!({ "since": v2, "ops": ["delete"] }));
    assert!(v3 > v2);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0]["rowId"], sid);
    assert!(deletes[0]["row"].is_null());

    // a filter that drops everything still advances the cursor
    let (v4, none, _) = changes(i, r, "11", json!({ "since": v2, "tables": ["notifications"] }));
    assert_eq!(v4, v3);
    assert!(none.is_empty());

    assert_eq!(
        request_err(i, r, "12", "sync.changes", json!({ "ops": ["truncate"] })),
        "bad_params"
    );
    assert_eq!(
        request_err(i, r, "13", "commands.dispatch", json!({ "command": { "kind": "Teleport" } })),
        "bad_params"
    );

    request_ok(
        i,
        r,
        "14",
        "commands.dispatch",
        json!({ "command": { "kind": "AdvanceRequest", "id": request_id, "status": "IN_PROGRESS" } }),
    );
    assert_eq!(
        request_err(
            i,
            r,
            "15",
            "commands.dispatch",
            json!({ "command": { "kind": "AdvanceRequest", "id": request_id, "status": "PENDING" } }),
        ),
        "invalid_transition"
    );

    let snap = request_ok(i, r, "16", "sync.snapshot", json!({}));
    assert_eq!(snap["students"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(snap["controlRequests"][0]["status"], "IN_PROGRESS");

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn destructive_admin_calls_need_confirmation_and_backup_restores() {
    let workspace = temp_dir("examcontrol-admin");
    let bundle = temp_dir("examcontrol-admin-out").join("day.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);
    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    request_ok(
        i,
        r,
        "2",
        "students.import",
        json!({ "rows": [{ "nationalId": "8000001", "name": "Student A", "grade": "G1", "committeeNumber": "1" }] }),
    );
    request_ok(
        i,
        r,
        "3",
        "users.import",
        json!({ "rows": [
            { "nationalId": "8100001", "fullName": "Admin", "role": "ADMIN" },
            { "nationalId": "8100002", "fullName": "Proctor", "role": "PROCTOR" }
        ]}),
    );
    request_ok(
        i,
        r,
        "4",
        "requests.raise",
        json!({ "from": "Proctor", "committee": "1", "text": "water" }),
    );

    for (n, method) in ["admin.resetOperations", "admin.resetStudents", "admin.resetStaff"]
        .iter()
        .enumerate()
    {
        let code = request_err(i, r, &format!("c{}", n), method, json!({}));
        assert_eq!(code, "confirmation_required", "{}", method);
    }

    let exported = request_ok(
        i,
        r,
        "5",
        "backup.export",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"], "examcontrol-workspace-v1");
    assert_eq!(exported["dbSha256"].as_str().map(|s| s.len()), Some(64));

    let ops = request_ok(i, r, "6", "admin.resetOperations", json!({ "confirm": true }));
    assert_eq!(ops["controlRequests"], 1);
    let wiped = request_ok(i, r, "7", "admin.resetStudents", json!({ "confirm": true }));
    assert_eq!(wiped["students"], 1);
    let staff = request_ok(i, r, "8", "admin.resetStaff", json!({ "confirm": true }));
    assert_eq!(staff["users"], 1);
    let users = request_ok(i, r, "9", "users.list", json!({}));
    assert_eq!(users["users"][0]["role"], "ADMIN");

    let code = request_err(
        i,
        r,
        "10",
        "backup.import",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(code, "confirmation_required");
    let restored = request_ok(
        i,
        r,
        "11",
        "backup.import",
        json!({ "inPath": bundle.to_string_lossy(), "confirm": true }),
    );
    assert_eq!(restored["bundleFormatDetected"], "examcontrol-workspace-v1");
    assert_eq!(restored["dbSha256"], exported["dbSha256"]);

    let students = request_ok(i, r, "12", "students.list", json!({}));
    assert_eq!(students["students"].as_array().map(|a| a.len()), Some(1));
    let users = request_ok(i, r, "13", "users.list", json!({}));
    assert_eq!(users["users"].as_array().map(|a| a.len()), Some(2));
    let board = request_ok(i, r, "14", "requests.list", json!({}));
    assert_eq!(board["pending"], 1);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
    if let Some(dir) = bundle.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
fn failed_restore_keeps_the_current_workspace_open() {
    let workspace = temp_dir("examcontrol-bad-restore");
    let broken = temp_dir("examcontrol-bad-restore-in").join("broken.zip");
    std::fs::write(&broken, b"PK\x03\x04not really a zip archive").expect("write broken bundle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);
    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    request_ok(
        i,
        r,
        "2",
        "students.import",
        json!({ "rows": [{ "nationalId": "8200001", "name": "Student A", "grade": "G1", "committeeNumber": "1" }] }),
    );

    let code = request_err(
        i,
        r,
        "3",
        "backup.import",
        json!({ "inPath": broken.to_string_lossy(), "confirm": true }),
    );
    assert_eq!(code, "io_failed");

    let st = request_ok(i, r, "4", "committees.status", json!({}));
    assert_eq!(st["committees"].as_array().map(|a| a.len()), Some(1));
    let students = request_ok(i, r, "5", "students.list", json!({}));
    assert_eq!(students["students"][0]["nationalId"], "8200001");

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
    if let Some(dir) = broken.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
fn insert_only_subscription_skips_updates() {
    let workspace = temp_dir("examcontrol-op-filter");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);
    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let (v0, _, _) = changes(i, r, "2", json!({ "since": 0, "limit": 10000 }));

    request_ok(
        i,
        r,
        "3",
        "students.import",
        json!({ "rows": [{ "nationalId": "8300001", "name": "Student A", "grade": "G1", "committeeNumber": "1" }] }),
    );
    // same national id again: the row is updated in place
    request_ok(
        i,
        r,
        "4",
        "students.import",
        json!({ "rows": [{ "nationalId": "8300001", "name": "Student A2", "grade": "G1", "committeeNumber": "2" }] }),
    );

    let students = json!(["students"]);
    let (_, inserts, _) = changes(i, r, "5", json!({ "since": v0, "tables": students, "ops": ["insert"] }));
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0]["row"]["name"], "Student A");

    let (_, updates, _) = changes(i, r, "6", json!({ "since": v0, "tables": students, "ops": ["update"] }));
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["op"], "update");
    assert_eq!(updates[0]["row"]["committeeNumber"], "2");
    assert_eq!(updates[0]["rowId"], inserts[0]["rowId"]);

    // "upsert" still selects both kinds of write
    let (_, writes, _) = changes(i, r, "7", json!({ "since": v0, "tables": students, "ops": ["upsert"] }));
    assert_eq!(writes.len(), 2);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reset_prunes_the_journal_and_stale_cursors_must_resync() {
    let workspace = temp_dir("examcontrol-prune");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);
    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    request_ok(
        i,
        r,
        "2",
        "students.import",
        json!({ "rows": [
            { "nationalId": "8400001", "name": "Student A", "grade": "G1", "committeeNumber": "1" },
            { "nationalId": "8400002", "name": "Student B", "grade": "G1", "committeeNumber": "1" }
        ]}),
    );
    let (caught_up, _, _) = changes(i, r, "3", json!({ "since": 0, "limit": 10000 }));

    let wiped = request_ok(i, r, "4", "admin.resetStudents", json!({ "confirm": true }));
    assert_eq!(wiped["students"], 2);
    assert_eq!(wiped["prunedThrough"], caught_up);

    // a client that was current still receives the reset's deletes
    let (after, deletes, _) = changes(i, r, "5", json!({ "since": caught_up }));
    assert_eq!(deletes.len(), 2);
    assert!(deletes.iter().all(|c| c["op"] == "delete"));
    assert!(after > caught_up);

    assert_eq!(
        request_err(i, r, "6", "sync.changes", json!({ "since": 0 })),
        "resync_required"
    );

    // a fresh snapshot's version is a valid cursor again
    let snap = request_ok(i, r, "7", "sync.snapshot", json!({}));
    assert_eq!(snap["students"].as_array().map(|a| a.len()), Some(0));
    let version = snap["version"].as_i64().expect("version");
    assert_eq!(version, after);
    let (_, none, _) = changes(i, r, "8", json!({ "since": version }));
    assert!(none.is_empty());

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
