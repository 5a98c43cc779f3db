use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::info;

const EVENT_CAPACITY: usize = 16;

/// Identity changes published to subscribers such as the auto-sync trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { user_id: String },
    SignedOut { user_id: String },
}

/// The signed-in principal, shared by the service, the orchestrator and
/// the trigger. Cloning shares the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    user: RwLock<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                user: RwLock::new(None),
                events,
            }),
        }
    }

    /// A session that starts out signed in, without emitting an event.
    #[must_use]
    pub fn signed_in(user_id: &str) -> Self {
        let session = Self::new();
        *session.write() = Some(user_id.to_string());
        session
    }

    #[must_use]
    pub fn current_user(&self) -> Option<String> {
        self.inner
            .user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Switch to `user_id`. Signing in as the current user is a no-op;
    /// switching users signs the previous one out first.
    pub fn sign_in(&self, user_id: &str) {
        let previous = {
            let mut user = self.write();
            if user.as_deref() == Some(user_id) {
                return;
            }
            user.replace(user_id.to_string())
        };
        if let Some(previous) = previous {
            self.emit(SessionEvent::SignedOut { user_id: previous });
        }
        info!(user_id, "signed in");
        self.emit(SessionEvent::SignedIn {
            user_id: user_id.to_string(),
        });
    }

    /// Returns the user that was signed out, if any.
    pub fn sign_out(&self) -> Option<String> {
        let previous = self.write().take()?;
        info!(user_id = %previous, "signed out");
        self.emit(SessionEvent::SignedOut {
            user_id: previous.clone(),
        });
        Some(previous)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<String>> {
        self.inner.user.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
