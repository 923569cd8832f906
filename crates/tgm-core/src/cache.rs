//! In-memory cache of live sessions on top of [`FileSessionStorage`].
//!
//! Callers that keep a session open (and auto-save it) share one
//! [`SharedSession`] per id. Once more than `max_active` sessions are cached
//! the least recently used ones are dropped from memory; their files stay.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::Config,
    domain::SessionId,
    errors::Error,
    session::Session,
    storage::{FileSessionStorage, SessionStorage},
    Result,
};

pub type SharedSession = Arc<Mutex<Session>>;

pub struct SessionCache {
    storage: FileSessionStorage,
    max_active: usize,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    sessions: HashMap<SessionId, CachedSession>,
    // Monotonic access counter; higher means more recently used.
    clock: u64,
}

struct CachedSession {
    session: SharedSession,
    last_access: u64,
}

impl CacheState {
    fn touch(&mut self, id: &SessionId) -> Option<SharedSession> {
        self.clock += 1;
        let clock = self.clock;
        self.sessions.get_mut(id).map(|entry| {
            entry.last_access = clock;
            Arc::clone(&entry.session)
        })
    }

    fn insert(&mut self, id: SessionId, session: SharedSession) {
        self.clock += 1;
        self.sessions.insert(
            id,
            CachedSession {
                session,
                last_access: self.clock,
            },
        );
    }

    fn trim(&mut self, max_active: usize) -> usize {
        if self.sessions.len() <= max_active {
            return 0;
        }

        let mut by_age: Vec<(u64, SessionId)> = self
            .sessions
            .iter()
            .map(|(id, entry)| (entry.last_access, id.clone()))
            .collect();
        by_age.sort_unstable();

        let excess = self.sessions.len() - max_active;
        for (_, id) in by_age.into_iter().take(excess) {
            self.sessions.remove(&id);
        }
        excess
    }
}

impl SessionCache {
    pub fn new(storage: FileSessionStorage, max_active: usize) -> Self {
        Self {
            storage,
            max_active,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self::new(
            FileSessionStorage::from_config(cfg)?,
            cfg.max_active_sessions,
        ))
    }

    pub fn storage(&self) -> &FileSessionStorage {
        &self.storage
    }

    /// Cached session, else the one on disk, else (if asked) a new one saved under `id`.
    pub fn get_session(
        &self,
        id: &SessionId,
        create_if_missing: bool,
        session_type: Option<&str>,
    ) -> Result<Option<SharedSession>> {
        if let Some(session) = self.state.lock().touch(id) {
            return Ok(Some(session));
        }

        let session = match self.storage.load(id)? {
            Some(session) => session,
            None if create_if_missing => self.storage.create_session(session_type, Some(id.clone()))?,
            None => return Ok(None),
        };

        let mut state = self.state.lock();
        // Loaded concurrently by another caller: keep the copy already handed out.
        if let Some(existing) = state.touch(id) {
            return Ok(Some(existing));
        }

        let shared = Arc::new(Mutex::new(session));
        state.insert(id.clone(), Arc::clone(&shared));
        let trimmed = state.trim(self.max_active);
        if trimmed > 0 {
            debug!("Trimmed {trimmed} sessions from memory");
        }
        Ok(Some(shared))
    }

    pub fn get_or_create(&self, id: &SessionId, session_type: Option<&str>) -> Result<SharedSession> {
        self.get_session(id, true, session_type)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn save(&self, session: &SharedSession) -> Result<()> {
        self.storage.save_session(&session.lock())
    }

    /// Drop a session from memory. Returns whether it was cached.
    pub fn evict(&self, id: &SessionId) -> bool {
        self.state.lock().sessions.remove(id).is_some()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.state.lock().sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StateMap;
    use serde_json::json;

    fn cache(max_active: usize) -> (tempfile::TempDir, SessionCache) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(FileSessionStorage::new(tmp.path()), max_active);
        (tmp, cache)
    }

    fn id(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[test]
    fn missing_session_is_none_unless_created() {
        let (_tmp, c) = cache(5);
        assert!(c.get_session(&id("nope"), false, None).unwrap().is_none());
        assert!(c.is_empty());

        let s = c.get_or_create(&id("new"), Some("member_transfer")).unwrap();
        assert_eq!(s.lock().session_type, "member_transfer");
        assert!(c.storage().dir().join("session_new.json").exists());
    }

    #[test]
    fn repeated_gets_share_one_session() {
        let (_tmp, c) = cache(5);
        let a = c.get_or_create(&id("a"), None).unwrap();
        let again = c.get_session(&id("a"), false, None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn least_recently_used_sessions_are_trimmed() {
        let (_tmp, c) = cache(2);
        c.get_or_create(&id("a"), None).unwrap();
        c.get_or_create(&id("b"), None).unwrap();
        // Touch `a` so `b` becomes the oldest.
        c.get_session(&id("a"), false, None).unwrap();
        c.get_or_create(&id("c"), None).unwrap();

        assert_eq!(c.len(), 2);
        assert!(c.contains(&id("a")));
        assert!(!c.contains(&id("b")));
        assert!(c.contains(&id("c")));
        // Trimmed sessions are still on disk.
        assert!(c.get_session(&id("b"), false, None).unwrap().is_some());
    }

    #[test]
    fn evicted_session_reloads_saved_changes() {
        let (_tmp, c) = cache(5);
        let s = c.get_or_create(&id("e"), None).unwrap();
        let state: StateMap = serde_json::from_value(json!({"processed": 7})).unwrap();
        s.lock().update_state(state);
        c.save(&s).unwrap();

        assert!(c.evict(&id("e")));
        assert!(!c.evict(&id("e")));

        let reloaded = c.get_session(&id("e"), false, None).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&s, &reloaded));
        assert_eq!(reloaded.lock().state["processed"], json!(7));
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let (_tmp, c) = cache(5);
        assert!(matches!(
            c.get_or_create(&id("../escape"), None),
            Err(Error::InvalidSessionId { .. })
        ));
    }
}
