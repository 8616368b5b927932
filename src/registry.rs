//! Session Registry (C7) — admission control and session lookup.
//!
//! Grounded on the teacher's implicit `SessionManager` admission pattern
//! (check capacity, allocate an id, insert under a lock) generalized to a
//! plain `RwLock<HashMap>`; the teacher's version additionally persisted a
//! journal of sessions to disk, which this crate has no counterpart for
//! (sessions here are transient connection state, not replayable history).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AdmissionError;
use crate::hooks::HookConfig;
use crate::rpc::Notification;
use crate::session::Session;
use crate::timing::TimingStore;

/// Shared registry of live sessions, handed to every WebSocket connection
/// handler.
pub struct SessionRegistry {
    config: Arc<Config>,
    timing: Arc<TimingStore>,
    hooks: Option<Arc<HookConfig>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, timing: Arc<TimingStore>, hooks: Option<Arc<HookConfig>>) -> Arc<Self> {
        Arc::new(SessionRegistry {
            config,
            timing,
            hooks,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Admit a new session if capacity allows, returning it along with the
    /// receiving end of its outbound notification channel.
    pub async fn admit(&self) -> Result<(Arc<Session>, mpsc::Receiver<Notification>), AdmissionError> {
        let sessions = self.sessions.read().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(AdmissionError::SessionLimitReached {
                max: self.config.max_sessions,
            });
        }
        drop(sessions);

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(256);
        let session = Session::new(id.clone(), self.config.clone(), self.timing.clone(), self.hooks.clone(), tx);

        let mut sessions = self.sessions.write().await;
        // Re-check under the write lock: two admits can race the read-lock
        // check above.
        if sessions.len() >= self.config.max_sessions {
            return Err(AdmissionError::SessionLimitReached {
                max: self.config.max_sessions,
            });
        }
        sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, count = sessions.len(), "session admitted");
        Ok((session, rx))
    }

    pub async fn remove(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            info!(session_id = %id, count = sessions.len(), "session removed");
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every running execution and drop every session. Used at
    /// shutdown.
    pub async fn close_all(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.close().await;
        }
    }

    /// Remove sessions that have had no traffic and no running execution
    /// for `idle_timeout_s`. Run periodically from `main`.
    pub async fn sweep_idle(&self, idle_timeout_s: u64) {
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut ids = Vec::new();
            for (id, session) in sessions.iter() {
                if session.is_idle_past(idle_timeout_s).await {
                    ids.push(id.clone());
                }
            }
            ids
        };
        for id in candidates {
            self.remove(&id).await;
        }
    }
}
