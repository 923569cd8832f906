//! Periodic persistence of a live session.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{cache::SharedSession, storage::SessionStorage, Result};

pub struct AutoSave;

pub struct AutoSaveHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    saves: Arc<AtomicUsize>,
}

impl AutoSave {
    /// Save `session` every `period` until stopped. The first save happens
    /// one period after spawning; failures are logged and retried next tick.
    pub fn spawn<S>(storage: Arc<S>, session: SharedSession, period: Duration) -> AutoSaveHandle
    where
        S: SessionStorage + 'static,
    {
        let cancel = CancellationToken::new();
        let saves = Arc::new(AtomicUsize::new(0));
        let session_id = session.lock().id().clone();

        let tok = cancel.clone();
        let counter = Arc::clone(&saves);
        let task = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = tick.tick() => {
                    match save_once(&storage, &session).await {
                      Ok(()) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        debug!("Auto-saved session {session_id}");
                      }
                      Err(e) => error!("Error auto-saving session {session_id}: {e}"),
                    }
                  }
                }
            }
        });

        AutoSaveHandle {
            cancel,
            task,
            saves,
        }
    }
}

impl AutoSaveHandle {
    pub fn completed_saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn save_once<S>(storage: &Arc<S>, session: &SharedSession) -> Result<()>
where
    S: SessionStorage + 'static,
{
    let storage = Arc::clone(storage);
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || storage.save_session(&session.lock())).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::SessionCache, domain::SessionId, storage::FileSessionStorage};
    use serde_json::json;
    use tokio::time::sleep;

    #[tokio::test]
    async fn saves_live_changes_until_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(FileSessionStorage::new(tmp.path()), 10);
        let session = cache
            .get_or_create(&SessionId::from("live"), Some("member_transfer"))
            .unwrap();

        let storage = Arc::new(cache.storage().clone());
        let handle = AutoSave::spawn(
            Arc::clone(&storage),
            Arc::clone(&session),
            Duration::from_millis(20),
        );

        session
            .lock()
            .update_state(serde_json::from_value(json!({"processed": 42})).unwrap());

        let id = SessionId::from("live");
        let mut persisted = false;
        for _ in 0..100 {
            let on_disk = storage.load_session(&id).unwrap().unwrap();
            if on_disk["state"]["processed"] == json!(42) {
                persisted = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(persisted);
        assert!(handle.completed_saves() >= 1);

        handle.stop().await;

        session
            .lock()
            .update_state(serde_json::from_value(json!({"processed": 43})).unwrap());
        sleep(Duration::from_millis(60)).await;
        let on_disk = storage.load_session(&id).unwrap().unwrap();
        assert_eq!(on_disk["state"]["processed"], json!(42));
    }
}
