#[path = "../src/db.rs"]
#[allow(dead_code)]
mod db;
#[path = "../src/backup.rs"]
mod backup;

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;

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

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("examcontrol-backup-src");
    let workspace2 = temp_dir("examcontrol-backup-dst");
    let out_dir = temp_dir("examcontrol-backup-out");

    let bytes = b"sqlite-test-payload";
    std::fs::write(workspace.join(db::DB_FILE), bytes).expect("write source db");

    let bundle_path = out_dir.join("exam-day.zip");
    let export =
        backup::export_workspace_bundle(&workspace, &bundle_path, 42).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256, sha256_hex(bytes));

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], backup::BUNDLE_FORMAT_V1);
    assert_eq!(manifest["changeVersion"], 42);
    assert_eq!(manifest["dbSha256"], export.db_sha256);
    archive
        .by_name("db/examcontrol.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert_eq!(import.db_sha256, export.db_sha256);

    let restored = std::fs::read(workspace2.join(db::DB_FILE)).expect("read restored db");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn tampered_bundle_is_rejected_and_workspace_left_alone() {
    let out_dir = temp_dir("examcontrol-backup-tampered");
    let workspace = temp_dir("examcontrol-backup-tampered-dst");
    let existing = b"current-day-database";
    std::fs::write(workspace.join(db::DB_FILE), existing).expect("write current db");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = FileOptions::default();
        zip.start_file("db/examcontrol.sqlite3", opts).expect("db entry");
        zip.write_all(b"edited-after-export").expect("write db");
        zip.start_file("manifest.json", opts).expect("manifest entry");
        let manifest = serde_json::json!({
            "format": backup::BUNDLE_FORMAT_V1,
            "dbSha256": sha256_hex(b"original-export"),
        });
        zip.write_all(manifest.to_string().as_bytes()).expect("write manifest");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("digest mismatch must fail");
    assert!(format!("{err:#}").contains("digest mismatch"));
    assert_eq!(
        std::fs::read(workspace.join(db::DB_FILE)).expect("read db"),
        existing
    );

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn plain_sqlite_import_is_supported() {
    let out_dir = temp_dir("examcontrol-backup-plain");
    let workspace = temp_dir("examcontrol-backup-plain-dst");

    let plain_file = out_dir.join("copy.sqlite3");
    let bytes = b"plain-sqlite-copy";
    std::fs::write(&plain_file, bytes).expect("write sqlite file");

    let import =
        backup::import_workspace_bundle(&plain_file, &workspace).expect("import plain sqlite");
    assert_eq!(import.bundle_format_detected, backup::PLAIN_SQLITE_FORMAT);
    assert_eq!(import.db_sha256, sha256_hex(bytes));

    let restored = std::fs::read(workspace.join(db::DB_FILE)).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
