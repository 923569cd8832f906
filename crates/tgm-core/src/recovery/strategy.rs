use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    domain::{SessionStatus, MEMBER_TRANSFER},
    session::{Checkpoint, Session},
    utils::{iso_timestamp_local, parse_iso_timestamp},
};

use super::RecoveryError;

/// Pluggable policy for resuming an interrupted session.
///
/// `can_recover` must not mutate anything. When `recover` fails the session
/// must still be valid; implementations pick their data before touching it.
/// Strategies never persist; the manager saves after a successful recovery.
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_recover(&self, session: &Session) -> bool;

    fn recover(&self, session: &mut Session) -> Result<(), RecoveryError>;
}

/// Resume from the recovery point, or else from the most recent checkpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckpointRecoveryStrategy;

impl RecoveryStrategy for CheckpointRecoveryStrategy {
    fn name(&self) -> &'static str {
        "CheckpointRecoveryStrategy"
    }

    fn can_recover(&self, session: &Session) -> bool {
        session.recovery_point.is_some() || session.has_checkpoints()
    }

    fn recover(&self, session: &mut Session) -> Result<(), RecoveryError> {
        if let Some(point) = session.recovery_point.clone() {
            // The recovery point is authoritative; an empty one is not
            // silently replaced by a checkpoint.
            let Some(data) = point.data else {
                warn!("Recovery point of session {} has no data", session.id());
                return Err(RecoveryError::NoRecoveryData(session.id().clone()));
            };
            info!("Recovering session {} using recovery point", session.id());

            session.update_state(data);
            session.set_status(SessionStatus::Recovered);
            session.log_event(
                "Session recovered from recovery point",
                Some(json!({
                    "recovery_time": iso_timestamp_local(),
                    "recovery_point_time": point.timestamp,
                })),
            );
            return Ok(());
        }

        let Some(latest) = latest_checkpoint(session.checkpoints()) else {
            warn!(
                "No checkpoints available for recovery of session {}",
                session.id()
            );
            return Err(RecoveryError::NoRecoveryData(session.id().clone()));
        };

        info!(
            "Recovering session {} using checkpoint: {}",
            session.id(),
            latest.name.as_deref().unwrap_or("<unnamed>")
        );

        session.update_state(latest.state);
        session.set_status(SessionStatus::Recovered);
        session.log_event(
            "Session recovered from checkpoint",
            Some(json!({
                "recovery_time": iso_timestamp_local(),
                "checkpoint_name": latest.name,
                "checkpoint_time": latest.timestamp,
            })),
        );
        Ok(())
    }
}

/// Most recent checkpoint by parsed timestamp.
///
/// Parseable timestamps outrank unparseable ones, unparseable ones compare as
/// strings, and on a tie the later entry in the list wins.
pub fn latest_checkpoint(checkpoints: Vec<Checkpoint>) -> Option<Checkpoint> {
    checkpoints.into_iter().max_by_key(|c| {
        let raw = c.timestamp.clone().unwrap_or_default();
        (parse_iso_timestamp(&raw), raw)
    })
}

/// Infer a resumable state from the last persisted progress counters.
///
/// Used when no checkpoint was ever recorded; sub-step progress is lost.
#[derive(Clone, Copy, Debug, Default)]
pub struct StateBasedRecoveryStrategy;

impl RecoveryStrategy for StateBasedRecoveryStrategy {
    fn name(&self) -> &'static str {
        "StateBasedRecoveryStrategy"
    }

    fn can_recover(&self, session: &Session) -> bool {
        let state = &session.state;
        if state.is_empty() {
            return false;
        }

        let has_counters = state.contains_key("processed") && state.contains_key("total");

        if session.session_type == MEMBER_TRANSFER {
            return state.contains_key("source_group")
                && state.contains_key("destination_group")
                && has_counters;
        }

        state.contains_key("progress") || has_counters
    }

    fn recover(&self, session: &mut Session) -> Result<(), RecoveryError> {
        info!("Recovering session {} based on state analysis", session.id());

        let recovery_info = json!({
            "original_state": Value::Object(session.state.clone()),
            "recovery_time": iso_timestamp_local(),
        });

        if session.session_type == MEMBER_TRANSFER {
            let state = &mut session.state;

            // A resumed run must not look like it is still active.
            if let Some(flag) = state.get_mut("in_progress") {
                *flag = Value::Bool(false);
            }
            state
                .entry("processed".to_string())
                .or_insert_with(|| json!(0));
            if !state.contains_key("total") {
                if let Some(count) = state.get("member_count").cloned() {
                    state.insert("total".to_string(), count);
                }
            }
        }

        session.set_status(SessionStatus::Recovered);
        session.log_event("Session recovered from state analysis", Some(recovery_info));
        Ok(())
    }
}
