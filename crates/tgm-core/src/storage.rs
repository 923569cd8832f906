//! Session persistence.
//!
//! [`SessionStorage`] is the port recovery depends on. [`FileSessionStorage`]
//! implements it over a directory of `session_<id>.json` files and adds the
//! housekeeping the CLI needs (listing, archiving, per-session reports).

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Local;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    archive::{archive_file, ArchiveFormat},
    config::{Config, DEFAULT_MAX_HISTORY_SIZE},
    domain::{SessionId, SessionStatus},
    errors::Error,
    session::{Session, SessionErrorEntry, StateMap},
    utils::{local_midnight_days_ago, parse_iso_timestamp},
    Result,
};

const FILE_PREFIX: &str = "session_";
const FILE_SUFFIX: &str = ".json";
const RECENT_ERRORS: usize = 5;

/// Storage port consumed by recovery.
///
/// Documents are raw JSON so scans can inspect a few fields without building
/// a full [`Session`].
pub trait SessionStorage: Send + Sync {
    /// Paths of every session document, in no particular order.
    fn list_session_files(&self) -> Result<Vec<PathBuf>>;

    /// Read one document returned by [`SessionStorage::list_session_files`].
    fn read_session_file(&self, path: &Path) -> Result<Value>;

    /// `Ok(None)` when no document exists for `id`.
    fn load_session(&self, id: &SessionId) -> Result<Option<Value>>;

    fn save_session(&self, session: &Session) -> Result<()>;

    /// History limit applied to sessions rebuilt from this storage.
    fn max_history_size(&self) -> usize {
        DEFAULT_MAX_HISTORY_SIZE
    }
}

/// Recover a session id from a `session_<id>.json` file name.
pub fn session_id_from_path(path: &Path) -> Option<SessionId> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    if id.is_empty() {
        return None;
    }
    Some(SessionId::from(id))
}

pub fn validate_session_id(id: &SessionId) -> Result<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9_.-]{0,127}$").expect("valid regex")
    });

    if !re.is_match(id.as_str()) {
        return Err(Error::InvalidSessionId {
            id: id.0.clone(),
            reason: "expected 1-128 of [A-Za-z0-9_.-], not starting with '.'".to_string(),
        });
    }
    Ok(())
}

/// Summary row for one session file.
#[derive(Clone, Debug, Serialize)]
pub struct SessionMeta {
    pub session_id: Option<String>,
    pub session_type: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub completed_at: Option<String>,
    pub status: Option<String>,
    pub progress: f64,
}

impl SessionMeta {
    fn from_raw(raw: &Value) -> Self {
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            session_id: text("session_id"),
            session_type: text("session_type"),
            created_at: text("created_at"),
            updated_at: text("updated_at"),
            completed_at: text("completed_at"),
            status: text("status"),
            progress: raw.get("progress").and_then(Value::as_f64).unwrap_or(0.0),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DurationInfo {
    pub seconds: Option<f64>,
    pub formatted: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
    pub last: f64,
}

/// Detailed report for a single session (`tgm show`).
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub session_type: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub status: SessionStatus,
    pub progress: f64,
    pub duration: DurationInfo,
    pub error_count: usize,
    pub event_count: usize,
    pub metrics: BTreeMap<String, BTreeMap<String, MetricSummary>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_errors: Vec<SessionErrorEntry>,
    pub current_state: StateMap,
}

/// Directory-backed session storage.
#[derive(Clone, Debug)]
pub struct FileSessionStorage {
    dir: PathBuf,
    max_history_size: usize,
}

impl FileSessionStorage {
    /// Storage rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        fs::create_dir_all(&cfg.sessions_dir)?;
        Ok(Self::new(&cfg.sessions_dir).with_max_history_size(cfg.max_history_size))
    }

    pub fn with_max_history_size(mut self, max: usize) -> Self {
        self.max_history_size = max;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, id: &SessionId) -> Result<PathBuf> {
        validate_session_id(id)?;
        Ok(self.dir.join(format!("{FILE_PREFIX}{id}{FILE_SUFFIX}")))
    }

    /// Create and persist a new session.
    pub fn create_session(
        &self,
        session_type: Option<&str>,
        session_id: Option<SessionId>,
    ) -> Result<Session> {
        let id = session_id.unwrap_or_else(SessionId::generate);
        validate_session_id(&id)?;

        let session =
            Session::with_id(id, session_type).with_max_history_size(self.max_history_size);
        self.save_session(&session)?;

        info!(
            "Created new {} session with ID: {}",
            session.session_type,
            session.id()
        );
        Ok(session)
    }

    /// Load and deserialize a session.
    pub fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let Some(raw) = self.load_session(id)? else {
            return Ok(None);
        };
        let session = Session::from_value(raw)?.with_max_history_size(self.max_history_size);
        Ok(Some(session))
    }

    pub fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let path = self.session_path(id)?;
        if !path.exists() {
            warn!("Session file not found for deletion: {}", path.display());
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!("Deleted session {id}");
        Ok(true)
    }

    /// Metadata for every readable session, most recently updated first.
    pub fn list_sessions(
        &self,
        session_type: Option<&str>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionMeta>> {
        let mut sessions = Vec::new();

        for path in self.list_session_files()? {
            let raw = match self.read_session_file(&path) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Error reading session file {}: {e}", path.display());
                    continue;
                }
            };

            let meta = SessionMeta::from_raw(&raw);
            if session_type.is_some_and(|t| meta.session_type.as_deref() != Some(t)) {
                continue;
            }
            if status.is_some_and(|s| meta.status.as_deref() != Some(s.as_str())) {
                continue;
            }
            sessions.push(meta);
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        debug!(
            "Listed {} sessions matching criteria (type={:?}, status={:?})",
            sessions.len(),
            session_type,
            status
        );
        Ok(sessions)
    }

    /// Ids of sessions that never reached a terminal state, regardless of age.
    pub fn find_incomplete_sessions(&self) -> Result<Vec<SessionId>> {
        let mut ids = Vec::new();
        for path in self.list_session_files()? {
            let raw = match self.read_session_file(&path) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Error checking session file {}: {e}", path.display());
                    continue;
                }
            };
            let status = raw.get("status").and_then(Value::as_str).unwrap_or("");
            if !SessionStatus::is_incomplete_str(status) {
                continue;
            }
            if let Some(id) = raw_session_id(&raw, &path) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Move completed/failed sessions last updated before local midnight minus
    /// `older_than_days` into `archive_dir` (default `<dir>/archives`).
    pub fn archive_completed_sessions(
        &self,
        older_than_days: u32,
        archive_dir: Option<&Path>,
        format: ArchiveFormat,
    ) -> Result<usize> {
        let archive_dir = archive_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir.join("archives"));
        fs::create_dir_all(&archive_dir)?;

        let Some(cutoff) = local_midnight_days_ago(older_than_days, Local::now()) else {
            warn!("Archive age of {older_than_days} days is out of range, nothing archived");
            return Ok(0);
        };
        let mut archived = 0usize;

        for path in self.list_session_files()? {
            let raw = match self.read_session_file(&path) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Error archiving session file {}: {e}", path.display());
                    continue;
                }
            };

            let status = raw.get("status").and_then(Value::as_str).unwrap_or("");
            if !SessionStatus::parse_lenient(status).is_terminal() {
                continue;
            }
            let Some(updated) = raw
                .get("updated_at")
                .and_then(Value::as_str)
                .and_then(parse_iso_timestamp)
            else {
                continue;
            };
            if updated > cutoff {
                continue; // not old enough
            }

            match archive_file(&path, &archive_dir, format) {
                Ok(dest) => {
                    archived += 1;
                    debug!("Archived session {} to {}", path.display(), dest.display());
                }
                Err(e) => warn!("Error archiving session file {}: {e}", path.display()),
            }
        }

        info!(
            "Archived {archived} sessions to {}",
            archive_dir.display()
        );
        Ok(archived)
    }

    /// Detailed report for one session, `Ok(None)` if it does not exist.
    pub fn session_report(&self, id: &SessionId) -> Result<Option<SessionReport>> {
        let Some(session) = self.load(id)? else {
            return Ok(None);
        };

        let duration = DurationInfo {
            seconds: session.duration_seconds(),
            formatted: session.duration_formatted(),
        };

        let recent_errors = session
            .errors
            .iter()
            .skip(session.errors.len().saturating_sub(RECENT_ERRORS))
            .cloned()
            .collect();

        Ok(Some(SessionReport {
            session_id: session.id().clone(),
            session_type: session.session_type.clone(),
            created_at: session.created_at.clone(),
            updated_at: session.updated_at.clone(),
            completed_at: session.completed_at.clone(),
            status: session.status(),
            progress: session.progress,
            duration,
            error_count: session.errors.len(),
            event_count: session.event_log.len(),
            metrics: summarize_metrics(&session),
            recent_errors,
            current_state: session.state.clone(),
        }))
    }
}

impl SessionStorage for FileSessionStorage {
    fn list_session_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Error reading entry in {}: {e}", self.dir.display());
                    continue;
                }
            };
            if path.is_file() && session_id_from_path(&path).is_some() {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn read_session_file(&self, path: &Path) -> Result<Value> {
        let txt = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&txt)?)
    }

    fn load_session(&self, id: &SessionId) -> Result<Option<Value>> {
        let path = self.session_path(id)?;
        if !path.exists() {
            warn!("Session file not found: {}", path.display());
            return Ok(None);
        }

        let txt = fs::read_to_string(&path)?;
        if txt.trim().is_empty() {
            warn!("Session file empty: {}", path.display());
            return Ok(None);
        }

        let raw: Value = serde_json::from_str(&txt)?;
        if raw.as_object().is_some_and(|m| m.is_empty()) {
            warn!("Session file empty: {}", path.display());
            return Ok(None);
        }
        Ok(Some(raw))
    }

    fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.session_path(session.id())?;
        fs::create_dir_all(&self.dir)?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let tmp = path.with_file_name(format!(
            "{FILE_PREFIX}{}{FILE_SUFFIX}.tmp.{nanos}",
            session.id()
        ));

        let written = write_synced(&tmp, session)
            .and_then(|()| fs::rename(&tmp, &path).map_err(Error::from));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            warn!("Error saving session {}: {e}", session.id());
            return Err(e);
        }

        debug!("Saved session {} to {}", session.id(), path.display());
        Ok(())
    }

    fn max_history_size(&self) -> usize {
        self.max_history_size
    }
}

fn write_synced(path: &Path, session: &Session) -> Result<()> {
    let txt = serde_json::to_string_pretty(session)?;
    let mut f = File::create(path)?;
    f.write_all(txt.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

/// Id stored in the document, falling back to the file name.
pub(crate) fn raw_session_id(raw: &Value, path: &Path) -> Option<SessionId> {
    raw.get("session_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(SessionId::from)
        .or_else(|| session_id_from_path(path))
}

fn summarize_metrics(session: &Session) -> BTreeMap<String, BTreeMap<String, MetricSummary>> {
    let mut out = BTreeMap::new();
    for (category, metrics) in &session.metrics {
        let mut summaries = BTreeMap::new();
        for (name, samples) in metrics {
            let values: Vec<f64> = samples.iter().filter_map(|s| s.value.as_f64()).collect();
            let Some(&last) = values.last() else {
                continue;
            };
            let sum: f64 = values.iter().sum();
            summaries.insert(
                name.clone(),
                MetricSummary {
                    min: values.iter().copied().fold(f64::INFINITY, f64::min),
                    max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    avg: sum / values.len() as f64,
                    count: values.len(),
                    last,
                },
            );
        }
        out.insert(category.clone(), summaries);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::format_local;
    use chrono::Duration;
    use serde_json::json;

    fn storage() -> (tempfile::TempDir, FileSessionStorage) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileSessionStorage::new(tmp.path());
        (tmp, storage)
    }

    fn write_raw(storage: &FileSessionStorage, id: &str, doc: Value) {
        fs::create_dir_all(storage.dir()).unwrap();
        fs::write(
            storage.dir().join(format!("session_{id}.json")),
            doc.to_string(),
        )
        .unwrap();
    }

    #[test]
    fn id_from_path_strips_prefix_and_suffix() {
        assert_eq!(
            session_id_from_path(Path::new("/x/session_abc-1.json")),
            Some(SessionId::from("abc-1"))
        );
        assert_eq!(session_id_from_path(Path::new("/x/abc.json")), None);
        assert_eq!(session_id_from_path(Path::new("/x/session_.json")), None);
        assert_eq!(
            session_id_from_path(Path::new("/x/session_a.json.tmp.1")),
            None
        );
    }

    #[test]
    fn rejects_path_traversal_ids() {
        let (_tmp, s) = storage();
        assert!(s.session_path(&SessionId::from("../etc/passwd")).is_err());
        assert!(s.session_path(&SessionId::from(".hidden")).is_err());
        assert!(s.session_path(&SessionId::from("")).is_err());
        assert!(s.session_path(&SessionId::from("ok_id-1.2")).is_ok());
    }

    #[test]
    fn save_then_load_round_trips_and_leaves_no_temp_files() {
        let (_tmp, s) = storage();
        let mut session = s.create_session(Some("member_transfer"), None).unwrap();
        session.set_status(SessionStatus::Running);
        session.update_state(serde_json::from_value(json!({"processed": 2})).unwrap());
        s.save_session(&session).unwrap();

        let loaded = s.load(session.id()).unwrap().unwrap();
        assert_eq!(loaded.status(), SessionStatus::Running);
        assert_eq!(loaded.state["processed"], json!(2));

        let names: Vec<String> = fs::read_dir(s.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1, "unexpected files: {names:?}");
    }

    #[test]
    fn load_missing_or_empty_is_none() {
        let (_tmp, s) = storage();
        assert!(s.load_session(&SessionId::from("nope")).unwrap().is_none());
        write_raw(&s, "empty", json!({}));
        assert!(s.load_session(&SessionId::from("empty")).unwrap().is_none());
    }

    #[test]
    fn list_filters_and_sorts_and_skips_garbage() {
        let (_tmp, s) = storage();
        write_raw(
            &s,
            "a",
            json!({"session_id": "a", "session_type": "member_transfer", "status": "running", "updated_at": "2024-01-01T00:00:00"}),
        );
        write_raw(
            &s,
            "b",
            json!({"session_id": "b", "session_type": "scrape", "status": "completed", "updated_at": "2024-03-01T00:00:00"}),
        );
        fs::write(s.dir().join("session_bad.json"), "{not json").unwrap();

        let all = s.list_sessions(None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id.as_deref(), Some("b"));

        let running = s.list_sessions(None, Some(SessionStatus::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].session_id.as_deref(), Some("a"));

        let scrape = s.list_sessions(Some("scrape"), None).unwrap();
        assert_eq!(scrape.len(), 1);
    }

    #[test]
    fn incomplete_sessions_ignore_terminal_ones() {
        let (_tmp, s) = storage();
        write_raw(&s, "r", json!({"session_id": "r", "status": "Paused"}));
        write_raw(&s, "c", json!({"session_id": "c", "status": "completed"}));
        // No id field: falls back to the file name.
        write_raw(&s, "noid", json!({"status": "interrupted"}));

        let mut ids = s.find_incomplete_sessions().unwrap();
        ids.sort();
        assert_eq!(ids, vec![SessionId::from("noid"), SessionId::from("r")]);
    }

    #[test]
    fn archives_only_old_terminal_sessions() {
        let (_tmp, s) = storage();
        let old = format_local(Local::now() - Duration::days(40));
        let fresh = format_local(Local::now());
        write_raw(&s, "old_done", json!({"status": "completed", "updated_at": old}));
        write_raw(&s, "old_failed", json!({"status": "failed", "updated_at": old}));
        write_raw(&s, "old_running", json!({"status": "running", "updated_at": old}));
        write_raw(&s, "new_done", json!({"status": "completed", "updated_at": fresh}));
        write_raw(&s, "no_ts", json!({"status": "completed"}));

        let n = s
            .archive_completed_sessions(30, None, ArchiveFormat::Zip)
            .unwrap();
        assert_eq!(n, 2);
        assert!(s.dir().join("archives/session_old_done.json.zip").exists());
        assert!(s.dir().join("archives/session_old_failed.json.zip").exists());
        assert!(s.dir().join("session_old_running.json").exists());
        assert!(s.dir().join("session_new_done.json").exists());
        assert!(s.dir().join("session_no_ts.json").exists());
    }

    #[test]
    fn huge_archive_age_archives_nothing() {
        let (_tmp, s) = storage();
        write_raw(
            &s,
            "ancient",
            json!({"status": "completed", "updated_at": "1970-01-02T00:00:00"}),
        );

        let n = s
            .archive_completed_sessions(u32::MAX, None, ArchiveFormat::Plain)
            .unwrap();
        assert_eq!(n, 0);
        assert!(s.dir().join("session_ancient.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn scan_ignores_directories_and_dangling_links() {
        let (_tmp, s) = storage();
        write_raw(&s, "ok", json!({"status": "running"}));
        fs::create_dir_all(s.dir().join("session_dir.json")).unwrap();
        std::os::unix::fs::symlink(
            s.dir().join("missing.json"),
            s.dir().join("session_dangling.json"),
        )
        .unwrap();

        let files = s.list_session_files().unwrap();
        assert_eq!(files, vec![s.dir().join("session_ok.json")]);
        assert_eq!(s.find_incomplete_sessions().unwrap(), vec![SessionId::from("ok")]);
    }

    #[test]
    fn report_summarizes_metrics_and_errors() {
        let (_tmp, s) = storage();
        let mut session = s.create_session(Some("member_transfer"), Some("rep".into())).unwrap();
        session.record_metric("added", json!(2), None);
        session.record_metric("added", json!(6), None);
        session.record_metric("note", json!("text only"), None);
        for i in 0..7 {
            session.log_error(&format!("e{i}"), None, None, None);
        }
        s.save_session(&session).unwrap();

        let report = s.session_report(&"rep".into()).unwrap().unwrap();
        let added = &report.metrics["general"]["added"];
        assert_eq!(added.count, 2);
        assert_eq!(added.min, 2.0);
        assert_eq!(added.max, 6.0);
        assert_eq!(added.avg, 4.0);
        assert_eq!(added.last, 6.0);
        assert!(!report.metrics["general"].contains_key("note"));
        assert_eq!(report.error_count, 7);
        assert_eq!(report.recent_errors.len(), 5);
        assert_eq!(report.recent_errors[0].message, "e2");
        assert!(report.duration.seconds.is_some());

        assert!(s.session_report(&"missing".into()).unwrap().is_none());
    }

    #[test]
    fn delete_reports_whether_file_existed() {
        let (_tmp, s) = storage();
        let session = s.create_session(None, Some("gone".into())).unwrap();
        assert!(s.delete_session(session.id()).unwrap());
        assert!(!s.delete_session(session.id()).unwrap());
    }
}
