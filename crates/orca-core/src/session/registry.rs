//! Registry of running sessions.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use super::LiveSession;

/// Sessions currently between registration and their final write.
#[derive(Debug)]
pub struct ActiveSessions {
    sessions: Mutex<HashMap<String, Arc<LiveSession>>>,
    count: watch::Sender<usize>,
}

impl Default for ActiveSessions {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            count: watch::Sender::new(0),
        }
    }
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `session` until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, session: Arc<LiveSession>) -> Registration {
        let session_id = session.session_id().to_string();
        let mut sessions = self.sessions.lock();
        sessions.insert(session_id.clone(), session);
        self.count.send_replace(sessions.len());

        Registration {
            registry: self.clone(),
            session_id,
        }
    }

    fn unregister(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        sessions.remove(session_id);
        self.count.send_replace(sessions.len());
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Sessions registered right now.
    pub fn list(&self) -> Vec<Arc<LiveSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Wait until no session is registered. Returns false if `deadline`
    /// passed first.
    pub async fn wait_idle(&self, deadline: Instant) -> bool {
        let mut count = self.count.subscribe();
        tokio::time::timeout_at(deadline, count.wait_for(|n| *n == 0))
            .await
            .is_ok()
    }
}

/// Unregisters its session on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ActiveSessions>,
    session_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.session_id);
    }
}
