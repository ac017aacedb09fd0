//! Session registry: the only state shared across sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use voxline_core::session::{SessionConfig, SessionState};
use voxline_pipeline::PipelineTask;

use crate::error::RegistryError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rank(state: SessionState) -> u8 {
    match state {
        SessionState::Pending => 0,
        SessionState::Active => 1,
        SessionState::Draining => 2,
        SessionState::Closed => 3,
    }
}

/// One registered voice session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    state: watch::Sender<SessionState>,
    task: Mutex<Option<Arc<PipelineTask>>>,
}

impl Session {
    fn new(id: String, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Pending);
        Self {
            id,
            config,
            created_at: Utc::now(),
            state,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Claim the session for a transport: `Pending -> Active`.
    ///
    /// Fails with the current state if the session was already claimed.
    pub fn activate(&self) -> Result<(), SessionState> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| match current.transition(SessionState::Active) {
            Ok(next) => {
                *current = next;
                true
            }
            Err(_) => {
                result = Err(*current);
                false
            }
        });
        if result.is_ok() {
            info!(session_id = %self.id, "Session active");
        }
        result
    }

    /// Move forward to `target`, passing through every intermediate state.
    /// Never moves backwards. Returns whether the state changed.
    pub fn advance_to(&self, target: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            let mut changed = false;
            while rank(*current) < rank(target) {
                let next = current.successor();
                debug!(session_id = %self.id, from = current.as_str(), to = next.as_str(), "Session transition");
                *current = next;
                changed = true;
            }
            changed
        })
    }

    pub fn attach_task(&self, task: Arc<PipelineTask>) {
        *lock(&self.task) = Some(task);
    }

    pub fn task(&self) -> Option<Arc<PipelineTask>> {
        lock(&self.task).clone()
    }

    fn pending_for(&self) -> Option<chrono::Duration> {
        (self.state() == SessionState::Pending).then(|| Utc::now() - self.created_at)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in `Pending`.
    pub async fn register(
        &self,
        id: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Arc<Session>, RegistryError> {
        let id = id.into();
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(RegistryError::SessionAlreadyExists(id));
        }
        let session = Arc::new(Session::new(id.clone(), config));
        sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, total = sessions.len(), "Session registered");
        Ok(session)
    }

    /// `None` when no such session exists.
    pub async fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            debug!(session_id = %id, "Session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop sessions that stayed `Pending` longer than `ttl`.
    pub async fn reap_pending(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| match session.pending_for() {
            Some(age) if age > ttl => {
                info!(session_id = %id, age_secs = age.num_seconds(), "Reaping session that never connected");
                session.advance_to(SessionState::Closed);
                false
            }
            _ => true,
        });
        before - sessions.len()
    }
}
