//! The sync state machine.
//!
//! `Idle -> Syncing -> Success | Error(reason)`, with the two outcome
//! states falling back to `Idle` after the configured cooldown. Only one
//! sync, push or pull runs at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::db::format_timestamp;
use crate::error::{SyncError, SyncResult};
use crate::pull::{PullOutcome, PullReconciler};
use crate::push::{PushReport, PushUploader};
use crate::session::Session;
use crate::store::{LocalStore, RemoteStore};

/// Setting key holding the RFC 3339 time of the last successful full sync.
pub const LAST_FULL_SYNC_KEY: &str = "last_full_sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    /// Fraction of the current sync done, in `[0, 1]`.
    pub progress: f64,
    pub last_sync_date: Option<DateTime<Utc>>,
}

/// Result of asking for a sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRun<T> {
    Completed(T),
    /// Another sync, push or pull was in flight; nothing was started.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullSyncReport {
    pub pull: PullOutcome,
    pub push: PushReport,
}

/// Clears the in-flight flag when dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    session: Session,
    local: Arc<dyn LocalStore>,
    reconciler: PullReconciler,
    uploader: PushUploader,
    in_flight: AtomicBool,
    /// Bumped on every full sync so a stale cooldown never resets a newer state.
    generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<SyncSnapshot>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        session: Session,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        let reconciler = PullReconciler::new(Arc::clone(&local), Arc::clone(&remote));
        let uploader = PushUploader::new(Arc::clone(&local), remote, config.upload_workers());
        let (state, _) = watch::channel(SyncSnapshot {
            status: SyncStatus::Idle,
            progress: 0.0,
            last_sync_date: None,
        });
        Self {
            config,
            session,
            local,
            reconciler,
            uploader,
            in_flight: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
        }
    }

    /// Construct and restore the persisted last-full-sync time.
    pub async fn load(
        config: SyncConfig,
        session: Session,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> SyncResult<Self> {
        let orchestrator = Self::new(config, session, local, remote);
        let stored = orchestrator
            .local
            .get_setting(LAST_FULL_SYNC_KEY)
            .await
            .map_err(SyncError::local)?;
        let last_sync_date = stored.and_then(|text| match DateTime::parse_from_rfc3339(&text) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(err) => {
                warn!(value = %text, error = %err, "ignoring unreadable last sync time");
                None
            }
        });
        orchestrator
            .state
            .send_modify(|snapshot| snapshot.last_sync_date = last_sync_date);
        Ok(orchestrator)
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Pull then push, publishing status and progress along the way.
    ///
    /// Returns `AlreadyRunning` without touching state when anything else
    /// is in flight. A failed pull ends the sync before any upload.
    pub async fn start_full_sync(&self) -> SyncResult<SyncRun<FullSyncReport>> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            debug!("sync already running");
            return Ok(SyncRun::AlreadyRunning);
        };

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.send_modify(|snapshot| {
            snapshot.status = SyncStatus::Syncing;
            snapshot.progress = 0.0;
        });

        match self.run_full_sync().await {
            Ok((report, finished_at)) => {
                info!(?report, "full sync succeeded");
                self.state.send_modify(|snapshot| {
                    snapshot.status = SyncStatus::Success;
                    snapshot.progress = 1.0;
                    snapshot.last_sync_date = Some(finished_at);
                });
                self.schedule_cooldown();
                Ok(SyncRun::Completed(report))
            }
            Err(err) => {
                error!(error = %err, "full sync failed");
                self.state
                    .send_modify(|snapshot| snapshot.status = SyncStatus::Error(err.to_string()));
                self.schedule_cooldown();
                Err(err)
            }
        }
    }

    async fn run_full_sync(&self) -> SyncResult<(FullSyncReport, DateTime<Utc>)> {
        let user_id = self.current_user()?;

        let pull = self.reconciler.pull(&user_id).await?;
        self.state.send_modify(|snapshot| snapshot.progress = 0.5);

        let push = self.uploader.push(&user_id).await?;

        let finished_at = Utc::now();
        self.local
            .set_setting(LAST_FULL_SYNC_KEY, &format_timestamp(finished_at))
            .await
            .map_err(SyncError::local)?;
        Ok((FullSyncReport { pull, push }, finished_at))
    }

    /// Run [`Self::start_full_sync`] on the runtime without waiting for it.
    pub fn schedule_full_sync(
        self: &Arc<Self>,
    ) -> JoinHandle<SyncResult<SyncRun<FullSyncReport>>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.start_full_sync().await })
    }

    /// Upload only. Not reflected in the published status.
    pub async fn push_only(&self) -> SyncResult<SyncRun<PushReport>> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            return Ok(SyncRun::AlreadyRunning);
        };
        let user_id = self.current_user()?;
        let report = self.uploader.push(&user_id).await.inspect_err(|err| {
            warn!(error = %err, "push failed");
        })?;
        Ok(SyncRun::Completed(report))
    }

    /// Download only. Not reflected in the published status.
    pub async fn pull_only(&self) -> SyncResult<SyncRun<PullOutcome>> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            return Ok(SyncRun::AlreadyRunning);
        };
        let user_id = self.current_user()?;
        let outcome = self.reconciler.pull(&user_id).await.inspect_err(|err| {
            warn!(error = %err, "pull failed");
        })?;
        Ok(SyncRun::Completed(outcome))
    }

    fn current_user(&self) -> SyncResult<String> {
        self.session
            .current_user()
            .ok_or(SyncError::NotAuthenticated)
    }

    fn schedule_cooldown(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        let current = Arc::clone(&self.generation);
        let state = Arc::clone(&self.state);
        let cooldown = self.config.cooldown();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if current.load(Ordering::Acquire) != generation {
                return;
            }
            state.send_if_modified(|snapshot| match snapshot.status {
                SyncStatus::Success | SyncStatus::Error(_) => {
                    snapshot.status = SyncStatus::Idle;
                    true
                }
                SyncStatus::Idle | SyncStatus::Syncing => false,
            });
        });
    }
}
