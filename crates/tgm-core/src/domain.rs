use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Session id (opaque string, uuid v4 for sessions we create).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Session type used by the member transfer service.
pub const MEMBER_TRANSFER: &str = "member_transfer";

/// Lifecycle status of a session.
///
/// Persisted as a lowercase string. Parsing is case-insensitive and falls back
/// to [`SessionStatus::Created`] for anything unknown, so old or hand-edited
/// files still load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    #[default]
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Interrupted,
    Recovered,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Recovered => "recovered",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "running" => SessionStatus::Running,
            "paused" => SessionStatus::Paused,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "interrupted" => SessionStatus::Interrupted,
            "recovered" => SessionStatus::Recovered,
            _ => SessionStatus::Created,
        }
    }

    /// Finished for good; eligible for archiving.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Stopped without reaching a terminal state.
    pub fn is_incomplete(self) -> bool {
        matches!(
            self,
            SessionStatus::Running | SessionStatus::Paused | SessionStatus::Interrupted
        )
    }

    /// Raw-string check used while scanning files, without building a session.
    pub fn is_incomplete_str(raw: &str) -> bool {
        matches!(
            raw.trim().to_lowercase().as_str(),
            "running" | "paused" | "interrupted"
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SessionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SessionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SessionStatus::parse_lenient(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_case_insensitive_with_created_fallback() {
        assert_eq!(SessionStatus::parse_lenient("RUNNING"), SessionStatus::Running);
        assert_eq!(SessionStatus::parse_lenient(" Paused "), SessionStatus::Paused);
        assert_eq!(SessionStatus::parse_lenient("bogus"), SessionStatus::Created);
        assert_eq!(SessionStatus::parse_lenient(""), SessionStatus::Created);
    }

    #[test]
    fn status_serializes_lowercase() {
        let v = serde_json::to_value(SessionStatus::Interrupted).unwrap();
        assert_eq!(v, serde_json::json!("interrupted"));
        let back: SessionStatus = serde_json::from_value(serde_json::json!("Recovered")).unwrap();
        assert_eq!(back, SessionStatus::Recovered);
    }

    #[test]
    fn incomplete_statuses() {
        assert!(SessionStatus::is_incomplete_str("Interrupted"));
        assert!(!SessionStatus::is_incomplete_str("completed"));
        assert!(SessionStatus::Paused.is_incomplete());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Recovered.is_terminal());
    }
}
