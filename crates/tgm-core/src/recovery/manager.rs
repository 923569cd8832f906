use std::collections::BTreeMap;

use chrono::{Duration, Local};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    domain::{SessionId, SessionStatus},
    session::{Session, StateMap},
    storage::{raw_session_id, SessionStorage},
    utils::{is_within_age, iso_timestamp_local},
};

use super::{
    strategy::{CheckpointRecoveryStrategy, RecoveryStrategy, StateBasedRecoveryStrategy},
    RecoveryError,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Already COMPLETED or RECOVERED; nothing was touched.
    AlreadySettled(SessionStatus),
    Recovered { strategy: &'static str },
}

#[derive(Clone, Debug, Serialize)]
pub struct RecoveryOption {
    pub strategy: &'static str,
    pub can_recover: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionAnalysis {
    pub session_id: SessionId,
    pub session_type: String,
    pub current_status: SessionStatus,
    pub last_updated: String,
    pub progress: f64,
    pub recoverable: bool,
    pub recommended_strategy: Option<&'static str>,
    pub has_recovery_point: bool,
    pub has_checkpoints: bool,
    pub has_state_history: bool,
    pub recovery_options: Vec<RecoveryOption>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionRecoveryEntry {
    pub session_id: SessionId,
    /// Session status, or `"error"` when the session could not be loaded.
    pub status: String,
    pub last_updated: Option<String>,
    pub progress: Option<f64>,
    pub recoverable: bool,
    pub recommended_strategy: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionRecoveryEntry {
    fn failed(session_id: &SessionId, error: String) -> Self {
        Self {
            session_id: session_id.clone(),
            status: "error".to_string(),
            last_updated: None,
            progress: None,
            recoverable: false,
            recommended_strategy: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RecoveryReport {
    pub total_sessions: usize,
    pub recoverable_sessions: usize,
    pub unrecoverable_sessions: usize,
    pub analysis_time: String,
    pub sessions: Vec<SessionRecoveryEntry>,
}

/// Finds interrupted sessions and drives them through the recovery strategies.
///
/// Strategies run in registration order and the first one that succeeds wins;
/// by default checkpoint-based recovery is tried before state analysis.
pub struct SessionRecoveryManager<S> {
    storage: S,
    strategies: Vec<Box<dyn RecoveryStrategy>>,
}

impl<S: SessionStorage> SessionRecoveryManager<S> {
    pub fn new(storage: S) -> Self {
        Self::with_strategies(
            storage,
            vec![
                Box::new(CheckpointRecoveryStrategy),
                Box::new(StateBasedRecoveryStrategy),
            ],
        )
    }

    pub fn with_strategies(storage: S, strategies: Vec<Box<dyn RecoveryStrategy>>) -> Self {
        Self {
            storage,
            strategies,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Ids of running/paused/interrupted sessions updated within `max_age_hours`.
    ///
    /// Works on the raw documents. Unreadable files and missing or malformed
    /// timestamps are skipped; only failing to enumerate storage is an error.
    pub fn find_interrupted_sessions(
        &self,
        max_age_hours: u32,
        session_types: Option<&[String]>,
    ) -> Result<Vec<SessionId>, RecoveryError> {
        let max_age = Duration::hours(i64::from(max_age_hours));
        let now = Local::now();
        let mut interrupted = Vec::new();

        for path in self.storage.list_session_files()? {
            let raw = match self.storage.read_session_file(&path) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Error checking session {}: {e}", path.display());
                    continue;
                }
            };

            let status = raw.get("status").and_then(Value::as_str).unwrap_or("");
            if !SessionStatus::is_incomplete_str(status) {
                continue;
            }

            if let Some(types) = session_types {
                let session_type = raw.get("session_type").and_then(Value::as_str);
                if !session_type.is_some_and(|t| types.iter().any(|want| want == t)) {
                    continue;
                }
            }

            let Some(updated_at) = raw.get("updated_at").and_then(Value::as_str) else {
                continue;
            };
            if !is_within_age(updated_at, max_age, now) {
                continue;
            }

            if let Some(id) = raw_session_id(&raw, &path) {
                interrupted.push(id);
            }
        }

        info!("Found {} interrupted sessions", interrupted.len());
        Ok(interrupted)
    }

    /// Recoverability assessment; never mutates the session.
    pub fn analyze_session(&self, session: &Session) -> SessionAnalysis {
        let mut analysis = SessionAnalysis {
            session_id: session.id().clone(),
            session_type: session.session_type.clone(),
            current_status: session.status(),
            last_updated: session.updated_at.clone(),
            progress: session.progress,
            recoverable: false,
            recommended_strategy: None,
            has_recovery_point: session.recovery_point.is_some(),
            has_checkpoints: session.has_checkpoints(),
            has_state_history: !session.state_history.is_empty(),
            recovery_options: Vec::with_capacity(self.strategies.len()),
        };

        for strategy in &self.strategies {
            let can_recover = strategy.can_recover(session);
            analysis.recovery_options.push(RecoveryOption {
                strategy: strategy.name(),
                can_recover,
            });

            if can_recover && analysis.recommended_strategy.is_none() {
                analysis.recommended_strategy = Some(strategy.name());
                analysis.recoverable = true;
            }
        }

        analysis
    }

    /// Recover one session and persist it on success.
    ///
    /// COMPLETED/RECOVERED sessions are left untouched. Anything else is first
    /// marked INTERRUPTED; if every eligible strategy fails the session keeps
    /// that status in memory but is not saved.
    pub fn recover_session(&self, session: &mut Session) -> Result<RecoveryOutcome, RecoveryError> {
        info!("Attempting to recover session {}", session.id());

        let status = session.status();
        if matches!(status, SessionStatus::Completed | SessionStatus::Recovered) {
            info!(
                "Session {} is already in {status} state, no recovery needed",
                session.id()
            );
            return Ok(RecoveryOutcome::AlreadySettled(status));
        }

        if status != SessionStatus::Interrupted {
            session.set_status(SessionStatus::Interrupted);
        }

        for strategy in &self.strategies {
            if !strategy.can_recover(session) {
                continue;
            }

            info!("Attempting recovery with {}", strategy.name());
            match strategy.recover(session) {
                Ok(()) => {
                    info!(
                        "Successfully recovered session {} with {}",
                        session.id(),
                        strategy.name()
                    );
                    self.storage.save_session(session)?;
                    return Ok(RecoveryOutcome::Recovered {
                        strategy: strategy.name(),
                    });
                }
                Err(e) => warn!(
                    "Recovery with {} failed for session {}: {e}",
                    strategy.name(),
                    session.id()
                ),
            }
        }

        error!("All recovery strategies failed for session {}", session.id());
        Err(RecoveryError::Unrecoverable(session.id().clone()))
    }

    /// Load and recover each id. Missing or broken sessions map to `false`.
    pub fn recover_sessions(&self, session_ids: &[SessionId]) -> BTreeMap<SessionId, bool> {
        let mut results = BTreeMap::new();

        for id in session_ids {
            let ok = match self.load(id) {
                Ok(mut session) => match self.recover_session(&mut session) {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Error during recovery of session {id}: {e}");
                        false
                    }
                },
                Err(RecoveryError::NotFound(_)) => {
                    warn!("Could not load session {id}");
                    false
                }
                Err(e) => {
                    error!("Error during recovery of session {id}: {e}");
                    false
                }
            };
            results.insert(id.clone(), ok);
        }

        let success = results.values().filter(|ok| **ok).count();
        info!("Recovered {success} out of {} sessions", session_ids.len());
        results
    }

    /// Snapshot the current state as a named checkpoint and persist it.
    pub fn create_checkpoint(&self, session: &mut Session, name: &str) -> Result<(), RecoveryError> {
        session.add_state_checkpoint(name);
        self.storage.save_session(session).map_err(|e| {
            error!("Error creating checkpoint for session {}: {e}", session.id());
            RecoveryError::from(e)
        })
    }

    /// Replace the recovery point and persist it.
    pub fn set_recovery_point(
        &self,
        session: &mut Session,
        data: StateMap,
    ) -> Result<(), RecoveryError> {
        session.set_recovery_point(data);
        self.storage.save_session(session).map_err(|e| {
            error!(
                "Error setting recovery point for session {}: {e}",
                session.id()
            );
            RecoveryError::from(e)
        })
    }

    /// Read-only recoverability report over `session_ids`.
    ///
    /// Sessions that cannot be loaded are listed with status `"error"` and
    /// counted as unrecoverable, so the two counters always add up to
    /// `total_sessions`.
    pub fn generate_recovery_report(&self, session_ids: &[SessionId]) -> RecoveryReport {
        let mut report = RecoveryReport {
            total_sessions: session_ids.len(),
            recoverable_sessions: 0,
            unrecoverable_sessions: 0,
            analysis_time: iso_timestamp_local(),
            sessions: Vec::with_capacity(session_ids.len()),
        };

        for id in session_ids {
            let entry = match self.load(id) {
                Ok(session) => {
                    let analysis = self.analyze_session(&session);
                    SessionRecoveryEntry {
                        session_id: id.clone(),
                        status: analysis.current_status.to_string(),
                        last_updated: Some(analysis.last_updated),
                        progress: Some(analysis.progress),
                        recoverable: analysis.recoverable,
                        recommended_strategy: analysis.recommended_strategy,
                        error: None,
                    }
                }
                Err(RecoveryError::NotFound(_)) => {
                    SessionRecoveryEntry::failed(id, "Could not load session".to_string())
                }
                Err(e) => {
                    error!("Error analyzing session {id}: {e}");
                    SessionRecoveryEntry::failed(id, e.to_string())
                }
            };

            if entry.recoverable {
                report.recoverable_sessions += 1;
            } else {
                report.unrecoverable_sessions += 1;
            }
            report.sessions.push(entry);
        }

        report
    }

    /// Load a session document and rebuild the [`Session`].
    pub fn load(&self, id: &SessionId) -> Result<Session, RecoveryError> {
        let raw = self
            .storage
            .load_session(id)?
            .ok_or_else(|| RecoveryError::NotFound(id.clone()))?;
        Ok(Session::from_value(raw)?.with_max_history_size(self.storage.max_history_size()))
    }
}
