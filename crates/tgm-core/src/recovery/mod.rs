//! Interrupted-session detection and recovery.
//!
//! [`SessionRecoveryManager`] owns an ordered list of [`RecoveryStrategy`]
//! values and a [`SessionStorage`]. The free functions at the bottom of this
//! module go through a lazily built process-wide manager backed by the
//! session directory.

pub mod manager;
pub mod strategy;

use std::{path::PathBuf, sync::OnceLock};

use crate::{
    config::DEFAULT_SESSIONS_DIR, domain::SessionId, errors::Error, session::Session,
    storage::FileSessionStorage,
};

pub use crate::storage::SessionStorage;
pub use manager::{
    RecoveryOption, RecoveryOutcome, RecoveryReport, SessionAnalysis, SessionRecoveryEntry,
    SessionRecoveryManager,
};
pub use strategy::{
    latest_checkpoint, CheckpointRecoveryStrategy, RecoveryStrategy, StateBasedRecoveryStrategy,
};

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("no recovery point or checkpoint for session {0}")]
    NoRecoveryData(SessionId),

    #[error("no recovery strategy succeeded for session {0}")]
    Unrecoverable(SessionId),

    #[error("storage error: {0}")]
    Storage(#[from] Error),
}

static DEFAULT_MANAGER: OnceLock<SessionRecoveryManager<FileSessionStorage>> = OnceLock::new();

/// Process-wide manager over `$TGM_SESSIONS_DIR` (default `sessions`).
///
/// Built on first use; later changes to the environment are not picked up.
pub fn default_recovery_manager() -> &'static SessionRecoveryManager<FileSessionStorage> {
    DEFAULT_MANAGER.get_or_init(|| {
        let dir = std::env::var_os("TGM_SESSIONS_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSIONS_DIR));
        SessionRecoveryManager::new(FileSessionStorage::new(dir))
    })
}

/// [`SessionRecoveryManager::find_interrupted_sessions`] on the default manager, all types.
pub fn find_interrupted_sessions(max_age_hours: u32) -> Result<Vec<SessionId>, RecoveryError> {
    default_recovery_manager().find_interrupted_sessions(max_age_hours, None)
}

/// [`SessionRecoveryManager::recover_session`] on the default manager.
pub fn recover_session(session: &mut Session) -> Result<RecoveryOutcome, RecoveryError> {
    default_recovery_manager().recover_session(session)
}

/// [`SessionRecoveryManager::create_checkpoint`] on the default manager.
pub fn create_checkpoint(session: &mut Session, name: &str) -> Result<(), RecoveryError> {
    default_recovery_manager().create_checkpoint(session, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SessionStatus, MEMBER_TRANSFER};
    use serde_json::json;

    // The default manager is process-wide, so everything touching it lives in
    // one test.
    #[test]
    fn default_manager_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("TGM_SESSIONS_DIR", tmp.path());

        let manager = default_recovery_manager();
        assert_eq!(manager.storage().dir(), tmp.path());
        assert!(std::ptr::eq(manager, default_recovery_manager()));

        let mut s = Session::new(Some(MEMBER_TRANSFER));
        s.update_state(
            serde_json::from_value(json!({
                "source_group": "g1",
                "destination_group": "g2",
                "processed": 3,
                "total": 9
            }))
            .unwrap(),
        );
        s.set_status(SessionStatus::Running);
        create_checkpoint(&mut s, "batch_1").unwrap();

        let found = find_interrupted_sessions(1).unwrap();
        assert_eq!(found, vec![s.id().clone()]);

        let outcome = recover_session(&mut s).unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered {
                strategy: "CheckpointRecoveryStrategy"
            }
        );
        assert!(find_interrupted_sessions(1).unwrap().is_empty());
    }

    #[test]
    fn errors_render_session_id() {
        let err = RecoveryError::Unrecoverable(SessionId::from("abc"));
        assert_eq!(
            err.to_string(),
            "no recovery strategy succeeded for session abc"
        );
    }
}
