use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::models::{EntityKind, FactRecord};
use crate::store::{LocalStore, RemoteStore};
use crate::tracker::DirtyTracker;

/// Outcome of uploading the dirty records of one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl KindReport {
    fn into_failure(self, kind: EntityKind) -> Option<SyncError> {
        let last_error = self.last_error?;
        Some(SyncError::PartialUploadFailure {
            kind,
            failed: self.failed,
            attempted: self.attempted,
            last_error,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub profile_uploaded: bool,
    pub meals: KindReport,
    pub weights: KindReport,
}

/// Local to remote: profile first, then meals, then weights.
#[derive(Clone)]
pub struct PushUploader {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    tracker: DirtyTracker,
    workers: usize,
}

impl PushUploader {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>, workers: usize) -> Self {
        Self {
            tracker: DirtyTracker::new(Arc::clone(&local)),
            local,
            remote,
            workers: workers.max(1),
        }
    }

    /// Push everything dirty for `user_id`.
    ///
    /// A failed profile upload stops the push, since children must hang
    /// off a materialized user document. A kind with failed records does
    /// not stop the next kind; the last such failure is returned once
    /// every kind has been attempted.
    pub async fn push(&self, user_id: &str) -> SyncResult<PushReport> {
        let profile_uploaded = self.push_profile(user_id).await?;

        let mut report = PushReport {
            profile_uploaded,
            ..PushReport::default()
        };
        let mut failure = None;
        for kind in EntityKind::ALL {
            let kind_report = self.push_kind(user_id, kind).await?;
            if let Some(err) = kind_report.clone().into_failure(kind) {
                failure = Some(err);
            }
            match kind {
                EntityKind::Meal => report.meals = kind_report,
                EntityKind::Weight => report.weights = kind_report,
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Merge-write the profile. Performed whenever a local profile exists,
    /// dirty or not. Returns false when there is no local profile.
    pub async fn push_profile(&self, user_id: &str) -> SyncResult<bool> {
        let Some(profile) = self
            .local
            .get_profile(user_id)
            .await
            .map_err(SyncError::local)?
        else {
            debug!(user_id, "no local profile to upload");
            return Ok(false);
        };

        let synced_at = Utc::now();
        self.remote
            .set_user_document(user_id, profile.to_document(synced_at), true)
            .await
            .map_err(SyncError::remote)?;

        let confirmed = self
            .local
            .mark_profile_synced(user_id, profile.last_updated, synced_at)
            .await
            .map_err(SyncError::local)?;
        if !confirmed {
            // Edited while the upload was in flight; the newer edit stays dirty.
            debug!(user_id, "profile changed during upload");
        }
        Ok(true)
    }

    /// Upload every dirty record of `kind`, at most `workers` at a time,
    /// and wait for all of them before returning.
    pub async fn push_kind(&self, user_id: &str, kind: EntityKind) -> SyncResult<KindReport> {
        let records = self.tracker.unsynced(user_id, kind).await?;
        let mut report = KindReport {
            attempted: records.len(),
            ..KindReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for record in records {
            let semaphore = Arc::clone(&semaphore);
            let local = Arc::clone(&self.local);
            let remote = Arc::clone(&self.remote);
            let user_id = user_id.to_string();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let local_id = record.local_id().to_string();
                let result = upload_record(local.as_ref(), remote.as_ref(), &user_id, record).await;
                (local_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.uploaded += 1,
                Ok((local_id, Err(err))) => {
                    warn!(user_id, %kind, %local_id, error = %err, "record upload failed");
                    report.failed += 1;
                    report.last_error = Some(err.to_string());
                }
                Err(err) => {
                    warn!(user_id, %kind, error = %err, "upload task did not finish");
                    report.failed += 1;
                    report.last_error = Some(format!("upload task did not finish: {err}"));
                }
            }
        }

        info!(
            user_id,
            %kind,
            uploaded = report.uploaded,
            failed = report.failed,
            "pushed records"
        );
        Ok(report)
    }
}

async fn upload_record(
    local: &dyn LocalStore,
    remote: &dyn RemoteStore,
    user_id: &str,
    record: FactRecord,
) -> SyncResult<()> {
    let kind = record.kind();
    let remote_id = remote
        .create_child_document(user_id, kind.collection(), record.to_document())
        .await
        .map_err(SyncError::remote)?;

    let marked = local
        .mark_synced(kind, record.local_id(), &remote_id)
        .await
        .map_err(SyncError::local)?;
    if !marked {
        debug!(local_id = record.local_id(), "record deleted or already confirmed");
    }
    Ok(())
}
