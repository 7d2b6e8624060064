//! `fsk audit verify|show`, `fsk dep export` and `fsk config-hash`.
//!
//! GREEN when:
//! - verify exits 0 on an intact chain and non-zero on a tampered one.
//! - dep export writes one archive and leaves the audit log byte-identical.
//! - dep export refuses a data dir without an audit log.
//!
//! No DB or network required.

use std::path::Path;

use assert_cmd::Command;
use fsk_audit::{Actor, AuditAction, AuditLog};
use fsk_schemas::ComplianceSettings;
use predicates::prelude::*;
use serde_json::json;

fn seed_audit(data_dir: &Path) -> std::path::PathBuf {
    let path = data_dir.join("audit.jsonl");
    let log = AuditLog::open(&path).unwrap();
    log.append("A-1", AuditAction::Created, Actor::Orders, json!({"total_cents": 840}))
        .unwrap();
    log.append("A-1", AuditAction::Queued, Actor::Orders, json!({"position": 1}))
        .unwrap();
    log.append("B-2", AuditAction::Created, Actor::Orders, json!({"total_cents": 100}))
        .unwrap();
    path
}

#[allow(deprecated)]
fn fsk() -> Command {
    Command::cargo_bin("fsk").unwrap()
}

#[test]
fn audit_verify_accepts_intact_and_rejects_tampered_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = seed_audit(dir.path());

    fsk()
        .args(["audit", "verify", "--path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("audit_chain=valid lines=3"));

    let raw = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, raw.replacen("\"total_cents\":840", "\"total_cents\":1", 1)).unwrap();

    fsk()
        .args(["audit", "verify", "--path"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("AUDIT_CHAIN_BROKEN"));
}

#[test]
fn audit_show_prints_only_the_requested_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = seed_audit(dir.path());

    fsk()
        .args(["audit", "show", "--order-id", "A-1", "--path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("action=created"))
        .stdout(predicate::str::contains("action=queued"))
        .stdout(predicate::str::contains("total_cents\":100").not());
}

#[test]
fn dep_export_is_offline_and_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let audit = seed_audit(dir.path());
    let settings = ComplianceSettings {
        participant_id: "ATU1".to_string(),
        device_id: "K1".to_string(),
        ..Default::default()
    };
    std::fs::write(
        dir.path().join("settings.json"),
        serde_json::to_vec(&settings).unwrap(),
    )
    .unwrap();
    let before = std::fs::read(&audit).unwrap();
    let out = dir.path().join("out");

    fsk()
        .args(["dep", "export", "--data-dir"])
        .arg(dir.path())
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("dep_export=true"))
        .stdout(predicate::str::contains("entries=3"))
        .stdout(predicate::str::contains("pending=0"));

    assert_eq!(std::fs::read(&audit).unwrap(), before, "export must not append");

    let files: Vec<_> = std::fs::read_dir(&out).unwrap().collect();
    assert_eq!(files.len(), 1);
    let archive = files[0].as_ref().unwrap().path();
    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(archive).unwrap()).unwrap();
    assert_eq!(doc["format"], "fsk-dep/1");
    assert_eq!(doc["participant_id"], "ATU1");
    assert_eq!(doc["entries"].as_array().unwrap().len(), 3);
}

#[test]
fn dep_export_without_audit_log_fails() {
    let dir = tempfile::tempdir().unwrap();
    fsk()
        .args(["dep", "export", "--data-dir"])
        .arg(dir.path())
        .arg("--out")
        .arg(dir.path().join("out"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no audit log"));
}

#[test]
fn config_hash_prints_hash_and_canonical_json() {
    let defaults = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("config")
        .join("defaults.yaml");

    fsk()
        .arg("config-hash")
        .arg(&defaults)
        .assert()
        .success()
        .stdout(predicate::str::contains("config_hash="))
        .stdout(predicate::str::contains("\"business_timezone\":\"Europe/Vienna\""));
}
