use std::fs;

use serde_json::{json, Value};
use tgm_core::{
    archive::{read_archived_session, ArchiveFormat},
    domain::{SessionId, SessionStatus, MEMBER_TRANSFER},
    recovery::{RecoveryOutcome, SessionRecoveryManager, SessionStorage},
    session::{Session, StateMap},
    storage::FileSessionStorage,
};

fn obj(v: Value) -> StateMap {
    serde_json::from_value(v).unwrap()
}

fn transfer(storage: &FileSessionStorage, processed: u64) -> Session {
    let mut s = storage.create_session(Some(MEMBER_TRANSFER), None).unwrap();
    s.update_state(obj(json!({
        "source_group": "@from",
        "destination_group": "@to",
        "processed": processed,
        "total": 100,
        "in_progress": true
    })));
    s.set_status(SessionStatus::Running);
    storage.save_session(&s).unwrap();
    s
}

#[test]
fn crashed_transfers_are_found_recovered_and_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = FileSessionStorage::new(tmp.path());

    let with_checkpoint = {
        let mut s = transfer(&storage, 40);
        s.add_state_checkpoint("batch_4");
        storage.save_session(&s).unwrap();
        s.id().clone()
    };
    let state_only = transfer(&storage, 10).id().clone();

    let mut finished = storage.create_session(Some("scrape"), None).unwrap();
    finished.set_status(SessionStatus::Completed);
    storage.save_session(&finished).unwrap();

    fs::write(tmp.path().join("session_garbage.json"), "{ not json").unwrap();

    let manager = SessionRecoveryManager::new(storage);

    let mut found = manager.find_interrupted_sessions(24, None).unwrap();
    found.sort();
    let mut expected = vec![with_checkpoint.clone(), state_only.clone()];
    expected.sort();
    assert_eq!(found, expected);

    let before = manager.generate_recovery_report(&found);
    assert_eq!(before.total_sessions, 2);
    assert_eq!(before.recoverable_sessions, 2);

    let results = manager.recover_sessions(&found);
    assert!(results.values().all(|ok| *ok));

    let recovered = manager.load(&with_checkpoint).unwrap();
    assert_eq!(recovered.status(), SessionStatus::Recovered);
    assert!(recovered
        .event_log
        .iter()
        .any(|e| e.message == "Session recovered from checkpoint"));

    let recovered = manager.load(&state_only).unwrap();
    assert_eq!(recovered.state["in_progress"], json!(false));
    assert_eq!(recovered.state["processed"], json!(10));

    assert!(manager.find_interrupted_sessions(24, None).unwrap().is_empty());

    // A second pass is a no-op.
    let mut again = manager.load(&state_only).unwrap();
    assert_eq!(
        manager.recover_session(&mut again).unwrap(),
        RecoveryOutcome::AlreadySettled(SessionStatus::Recovered)
    );
}

#[test]
fn unknown_ids_are_reported_not_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = SessionRecoveryManager::new(FileSessionStorage::new(tmp.path()));
    let ids = vec![SessionId::from("nonexistent_id")];

    let results = manager.recover_sessions(&ids);
    assert_eq!(results.get(&ids[0]), Some(&false));

    let report = manager.generate_recovery_report(&ids);
    assert_eq!(report.unrecoverable_sessions, 1);
    assert_eq!(report.sessions[0].status, "error");
}

#[test]
fn finished_sessions_archive_after_recovery() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = FileSessionStorage::new(tmp.path());
    let mut s = transfer(&storage, 100);
    s.set_status(SessionStatus::Completed);
    s.updated_at = "2020-01-01T00:00:00.000000".to_string();
    storage.save_session(&s).unwrap();

    let archived = storage
        .archive_completed_sessions(1, None, ArchiveFormat::TarGz)
        .unwrap();
    assert_eq!(archived, 1);

    let archive = tmp
        .path()
        .join("archives")
        .join(format!("session_{}.json.tar.gz", s.id()));
    let doc = read_archived_session(&archive).unwrap();
    assert_eq!(doc["status"], json!("completed"));
    assert!(storage.load(s.id()).unwrap().is_none());
}
