use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::orchestrator::{FullSyncReport, SyncOrchestrator, SyncRun};
use crate::session::SessionEvent;

pub type ScheduledSync = JoinHandle<SyncResult<SyncRun<FullSyncReport>>>;

/// Starts full syncs without being asked: on sign-in, and when the app
/// comes to the foreground or the settings view opens with a stale last
/// sync. Everything goes through [`SyncOrchestrator::schedule_full_sync`],
/// so overlapping triggers collapse into one sync.
#[derive(Clone)]
pub struct AutoSyncTrigger {
    orchestrator: Arc<SyncOrchestrator>,
    threshold: Duration,
}

impl AutoSyncTrigger {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        let threshold = orchestrator.config().staleness_threshold();
        Self {
            orchestrator,
            threshold,
        }
    }

    /// True when there is no successful full sync on record, or the last
    /// one is at least the staleness threshold old.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.orchestrator.snapshot().last_sync_date {
            None => true,
            // A last sync in the future (clock change) counts as fresh
            Some(last) => (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.threshold),
        }
    }

    pub fn on_app_foreground(&self) -> Option<ScheduledSync> {
        self.sync_if_stale("app foreground")
    }

    pub fn on_settings_opened(&self) -> Option<ScheduledSync> {
        self.sync_if_stale("settings opened")
    }

    pub fn on_session_event(&self, event: &SessionEvent) -> Option<ScheduledSync> {
        match event {
            SessionEvent::SignedIn { user_id } => {
                info!(%user_id, "signed in, scheduling sync");
                Some(self.orchestrator.schedule_full_sync())
            }
            SessionEvent::SignedOut { .. } => None,
        }
    }

    /// Follow session events until the channel closes.
    pub async fn run(self, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.on_session_event(&event);
                }
                Err(RecvError::Lagged(missed)) => {
                    // A missed sign-in still has to sync
                    warn!(missed, "session events lagged");
                    if self.orchestrator.session().current_user().is_some() {
                        self.orchestrator.schedule_full_sync();
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("session event channel closed");
    }

    fn sync_if_stale(&self, reason: &str) -> Option<ScheduledSync> {
        if !self.is_stale(Utc::now()) {
            debug!(reason, "last sync is recent, skipping");
            return None;
        }
        info!(reason, "last sync is stale, scheduling sync");
        Some(self.orchestrator.schedule_full_sync())
    }
}
