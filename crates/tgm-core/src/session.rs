//! Persisted record of a long-running operation (member transfer, scraping, ...).
//!
//! A [`Session`] owns the mutable operation state, its history, an event log,
//! metrics, errors and the data recovery needs (a recovery point and named
//! checkpoints stored under `custom_data.checkpoints`).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    config::DEFAULT_MAX_HISTORY_SIZE,
    domain::{SessionId, SessionStatus},
    utils::{format_hms, iso_timestamp_local},
    Result,
};

pub type StateMap = Map<String, Value>;

const CHECKPOINTS_KEY: &str = "checkpoints";
const DEFAULT_SESSION_TYPE: &str = "generic";
const DEFAULT_METRIC_CATEGORY: &str = "general";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp: String,
    pub state: StateMap,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionErrorEntry {
    pub timestamp: String,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Single authoritative resume state, preferred over checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    #[serde(default)]
    pub timestamp: Option<String>,
    /// `None` when the stored point carries no usable data.
    #[serde(default)]
    pub data: Option<StateMap>,
}

/// Named snapshot of the state, kept in `custom_data.checkpoints`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub state: StateMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SummaryFormat {
    Json,
    Text,
}

pub type Metrics = BTreeMap<String, BTreeMap<String, Vec<MetricSample>>>;

// Hand-edited or older files may carry `null` for any field; those load as
// the field's default instead of rejecting the whole document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "SessionId::generate", deserialize_with = "id_or_generate")]
    session_id: SessionId,
    #[serde(default = "default_session_type", deserialize_with = "session_type_or_default")]
    pub session_type: String,
    #[serde(default = "iso_timestamp_local", deserialize_with = "timestamp_or_now")]
    pub created_at: String,
    #[serde(default = "iso_timestamp_local", deserialize_with = "timestamp_or_now")]
    pub updated_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    status: SessionStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub state: StateMap,
    #[serde(default, deserialize_with = "null_as_default")]
    pub state_history: Vec<StateSnapshot>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_log: Vec<SessionEvent>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics: Metrics,
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<SessionErrorEntry>,
    #[serde(default)]
    pub recovery_point: Option<RecoveryPoint>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub custom_data: StateMap,

    #[serde(skip, default = "default_max_history")]
    max_history_size: usize,
}

fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn id_or_generate<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<SessionId, D::Error> {
    Ok(Option::<SessionId>::deserialize(d)?
        .filter(|id| !id.as_str().is_empty())
        .unwrap_or_else(SessionId::generate))
}

fn session_type_or_default<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_else(default_session_type))
}

fn timestamp_or_now<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_else(iso_timestamp_local))
}

fn default_session_type() -> String {
    DEFAULT_SESSION_TYPE.to_string()
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY_SIZE
}

impl Session {
    pub fn new(session_type: Option<&str>) -> Self {
        Self::with_id(SessionId::generate(), session_type)
    }

    pub fn with_id(session_id: SessionId, session_type: Option<&str>) -> Self {
        let now = iso_timestamp_local();
        Self {
            session_id,
            session_type: session_type.unwrap_or(DEFAULT_SESSION_TYPE).to_string(),
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            status: SessionStatus::Created,
            progress: 0.0,
            state: StateMap::new(),
            state_history: Vec::new(),
            event_log: Vec::new(),
            metrics: Metrics::new(),
            errors: Vec::new(),
            recovery_point: None,
            custom_data: StateMap::new(),
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
        }
    }

    pub fn with_max_history_size(mut self, max: usize) -> Self {
        self.max_history_size = max;
        self
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    pub fn id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Merge `new_state` into the current state, recording the previous state in history.
    pub fn update_state(&mut self, new_state: StateMap) {
        self.apply_state(new_state, true);
    }

    /// Same as [`Session::update_state`] without touching the history.
    pub fn update_state_untracked(&mut self, new_state: StateMap) {
        self.apply_state(new_state, false);
    }

    fn apply_state(&mut self, new_state: StateMap, track_history: bool) {
        self.updated_at = iso_timestamp_local();

        if track_history && !self.state.is_empty() {
            self.state_history.push(StateSnapshot {
                timestamp: self.updated_at.clone(),
                state: self.state.clone(),
            });
            if self.state_history.len() > self.max_history_size {
                let excess = self.state_history.len() - self.max_history_size;
                self.state_history.drain(..excess);
            }
        }

        if let Some(progress) = new_state.get("progress").and_then(Value::as_f64) {
            self.progress = progress;
        } else if let (Some(processed), Some(total)) = (
            new_state.get("processed").and_then(Value::as_f64),
            new_state.get("total").and_then(Value::as_f64),
        ) {
            if total > 0.0 {
                self.progress = processed / total * 100.0;
            }
        }

        self.state.extend(new_state);
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = iso_timestamp_local();

        if status.is_terminal() {
            self.completed_at = Some(self.updated_at.clone());
        }

        self.log_event(&format!("Status changed to {status}"), None);
    }

    pub fn log_event(&mut self, message: &str, data: Option<Value>) {
        self.event_log.push(SessionEvent {
            timestamp: iso_timestamp_local(),
            message: message.to_string(),
            data: data.filter(|d| !is_empty_value(d)),
        });
    }

    pub fn log_error(
        &mut self,
        message: &str,
        error_type: Option<&str>,
        exception: Option<&dyn std::error::Error>,
        context: Option<Value>,
    ) {
        let error_type = error_type.unwrap_or("UnknownError").to_string();
        self.errors.push(SessionErrorEntry {
            timestamp: iso_timestamp_local(),
            message: message.to_string(),
            error_type: error_type.clone(),
            exception: exception.map(|e| e.to_string()),
            context,
        });
        self.log_event(
            &format!("Error: {message}"),
            Some(json!({ "error_type": error_type })),
        );
        tracing::debug!(session = %self.session_id, error_type = %error_type, "recorded session error: {message}");
    }

    pub fn record_metric(&mut self, name: &str, value: Value, category: Option<&str>) {
        let now = iso_timestamp_local();
        self.metrics
            .entry(category.unwrap_or(DEFAULT_METRIC_CATEGORY).to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push(MetricSample {
                timestamp: now.clone(),
                value,
            });
        self.updated_at = now;
    }

    pub fn set_recovery_point(&mut self, data: StateMap) {
        self.recovery_point = Some(RecoveryPoint {
            timestamp: Some(iso_timestamp_local()),
            data: Some(data),
        });
    }

    pub fn clear_recovery_point(&mut self) {
        self.recovery_point = None;
    }

    pub fn set_custom_data(&mut self, key: &str, value: Value) {
        self.custom_data.insert(key.to_string(), value);
        self.updated_at = iso_timestamp_local();
    }

    pub fn custom_data(&self, key: &str) -> Option<&Value> {
        self.custom_data.get(key)
    }

    /// Snapshot the current state under `name` in `custom_data.checkpoints`.
    pub fn add_state_checkpoint(&mut self, name: &str) {
        let checkpoint = json!({
            "name": name,
            "timestamp": iso_timestamp_local(),
            "state": Value::Object(self.state.clone()),
        });

        let slot = self
            .custom_data
            .entry(CHECKPOINTS_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        // A non-list value here is unusable as a checkpoint list; replace it.
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(list) = slot {
            list.push(checkpoint);
        }

        self.log_event(&format!("Created checkpoint: {name}"), None);
    }

    /// Checkpoints recorded in `custom_data`; entries that are not objects are ignored.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.custom_data
            .get(CHECKPOINTS_KEY)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter(|v| v.is_object())
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_checkpoints(&self) -> bool {
        self.custom_data
            .get(CHECKPOINTS_KEY)
            .and_then(Value::as_array)
            .is_some_and(|list| !list.is_empty())
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn export_summary(&self, format: SummaryFormat) -> Value {
        match format {
            SummaryFormat::Json => json!({
                "session_id": self.session_id,
                "session_type": self.session_type,
                "status": self.status,
                "progress": self.progress,
                "created_at": self.created_at,
                "updated_at": self.updated_at,
                "completed_at": self.completed_at,
                "error_count": self.errors.len(),
            }),
            SummaryFormat::Text => Value::String(self.summary_text()),
        }
    }

    fn summary_text(&self) -> String {
        [
            format!("Session ID: {}", self.session_id),
            format!("Type: {}", self.session_type),
            format!("Status: {}", self.status),
            format!("Progress: {:.1}%", self.progress),
            format!("Created: {}", self.created_at),
            format!("Last Updated: {}", self.updated_at),
            format!(
                "Completed: {}",
                self.completed_at.as_deref().unwrap_or("Not completed")
            ),
            format!("Errors: {}", self.errors.len()),
        ]
        .join("\n")
    }

    /// Wall time between creation and completion (or last update).
    pub fn duration_seconds(&self) -> Option<f64> {
        use crate::utils::parse_iso_timestamp;

        let start = parse_iso_timestamp(&self.created_at)?;
        let end = parse_iso_timestamp(self.completed_at.as_deref().unwrap_or(&self.updated_at))?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    pub fn duration_formatted(&self) -> String {
        self.duration_seconds()
            .map(format_hms)
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}
