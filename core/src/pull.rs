use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::models::UserProfile;
use crate::store::{LocalStore, RemoteStore};

/// Merge-writes lost to concurrent local edits before giving up.
const MERGE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PullOutcome {
    /// The account has no remote state yet. Nothing was written locally.
    NoRemoteDocument,
    Merged {
        /// Local fields whose value changed.
        changed_fields: usize,
        /// The local profile did not exist before this pull.
        created: bool,
    },
}

/// Remote to local: merges the user's remote document into the local profile.
///
/// Meal and weight history is never pulled; facts only travel upwards.
#[derive(Clone)]
pub struct PullReconciler {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
}

impl PullReconciler {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { local, remote }
    }

    pub async fn pull(&self, user_id: &str) -> SyncResult<PullOutcome> {
        let Some(doc) = self
            .remote
            .get_user_document(user_id)
            .await
            .map_err(SyncError::remote)?
        else {
            debug!(user_id, "no remote document yet");
            return Ok(PullOutcome::NoRemoteDocument);
        };

        for attempt in 1..=MERGE_ATTEMPTS {
            let existing = self
                .local
                .get_profile(user_id)
                .await
                .map_err(SyncError::local)?;
            let expected = existing.as_ref().map(|p| p.last_updated);
            let created = existing.is_none();
            let mut profile = existing.unwrap_or_else(|| UserProfile::new(user_id));

            let changed_fields = profile.merge_document(&doc);
            profile.last_updated = Utc::now();
            if changed_fields > 0 || created {
                profile.is_synced = false;
            }

            let written = self
                .local
                .replace_profile(&profile, expected)
                .await
                .map_err(SyncError::local)?;
            if written {
                info!(user_id, changed_fields, created, "pulled remote profile");
                return Ok(PullOutcome::Merged {
                    changed_fields,
                    created,
                });
            }
            // A local edit landed between the read and the write; merge into it
            debug!(user_id, attempt, "profile changed during pull, retrying merge");
        }

        warn!(user_id, "profile kept changing during pull");
        Err(SyncError::Local(format!(
            "profile for {user_id} changed {MERGE_ATTEMPTS} times during pull"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, SharedDatabase};
    use crate::documents::DocumentStore;
    use crate::models::{
        Document, EntityKind, FactRecord, MealEntry, NewMealEntry, NewWeightEntry, ProfileUpdate,
        WeightEntry,
    };
    use crate::testing::FlakyRemote;
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Local store that lets the user edit the profile right after the
    /// first `edits` profile reads, the window a pull must not lose.
    struct EditAfterRead {
        inner: SharedDatabase,
        edits: AtomicUsize,
        goal: &'static str,
    }

    #[async_trait]
    impl LocalStore for EditAfterRead {
        async fn get_profile(&self, user_id: &str) -> anyhow::Result<Option<UserProfile>> {
            let read = self.inner.get_profile(user_id).await?;
            let remaining = self.edits.load(Ordering::SeqCst);
            if remaining > 0 {
                self.edits.store(remaining - 1, Ordering::SeqCst);
                let db = self.inner.lock();
                let mut current = db
                    .get_profile(user_id)?
                    .unwrap_or_else(|| UserProfile::new(user_id));
                let bump = current.last_updated + chrono::Duration::seconds(1);
                ProfileUpdate {
                    goal: Some(self.goal.to_string()),
                    ..ProfileUpdate::default()
                }
                .apply(&mut current, bump);
                db.upsert_profile(&current)?;
            }
            Ok(read)
        }

        async fn upsert_profile(&self, profile: &UserProfile) -> anyhow::Result<()> {
            self.inner.upsert_profile(profile).await
        }

        async fn replace_profile(
            &self,
            profile: &UserProfile,
            expected: Option<DateTime<Utc>>,
        ) -> anyhow::Result<bool> {
            self.inner.replace_profile(profile, expected).await
        }

        async fn mark_profile_synced(
            &self,
            user_id: &str,
            uploaded_version: DateTime<Utc>,
            synced_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.inner
                .mark_profile_synced(user_id, uploaded_version, synced_at)
                .await
        }

        async fn list_dirty(
            &self,
            user_id: &str,
            kind: EntityKind,
        ) -> anyhow::Result<Vec<FactRecord>> {
            self.inner.list_dirty(user_id, kind).await
        }

        async fn mark_synced(
            &self,
            kind: EntityKind,
            local_id: &str,
            remote_id: &str,
        ) -> anyhow::Result<bool> {
            self.inner.mark_synced(kind, local_id, remote_id).await
        }

        async fn insert_meal(
            &self,
            user_id: &str,
            entry: &NewMealEntry,
        ) -> anyhow::Result<MealEntry> {
            self.inner.insert_meal(user_id, entry).await
        }

        async fn insert_weight(
            &self,
            user_id: &str,
            entry: &NewWeightEntry,
        ) -> anyhow::Result<WeightEntry> {
            self.inner.insert_weight(user_id, entry).await
        }

        async fn delete(&self, kind: EntityKind, local_id: &str) -> anyhow::Result<bool> {
            self.inner.delete(kind, local_id).await
        }

        async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get_setting(key).await
        }

        async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.inner.set_setting(key, value).await
        }
    }

    fn synced_profile(local: &SharedDatabase) -> UserProfile {
        let mut profile = UserProfile::new("u1");
        profile.goal = "lose".to_string();
        profile.is_synced = true;
        local.lock().upsert_profile(&profile).unwrap();
        local.lock().get_profile("u1").unwrap().unwrap()
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (SharedDatabase, Arc<DocumentStore>, PullReconciler) {
        let local = SharedDatabase::new(Database::open_in_memory().unwrap());
        let remote = Arc::new(DocumentStore::open_in_memory().unwrap());
        let reconciler = PullReconciler::new(Arc::new(local.clone()), remote.clone());
        (local, remote, reconciler)
    }

    #[tokio::test]
    async fn test_missing_remote_document_leaves_local_untouched() {
        let (local, _remote, reconciler) = setup();
        let outcome = reconciler.pull("u1").await.unwrap();

        assert_eq!(outcome, PullOutcome::NoRemoteDocument);
        assert!(local.get_profile("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_scenario_name_and_height() {
        let (local, remote, reconciler) = setup();
        let mut profile = UserProfile::new("u1");
        profile.name = "Ada".to_string();
        profile.height = 0.0;
        local.upsert_profile(&profile).await.unwrap();
        remote
            .set_user_document(
                "u1",
                doc(json!({"name": "Ada Lovelace", "height": 170})),
                false,
            )
            .unwrap();

        let outcome = reconciler.pull("u1").await.unwrap();
        assert_eq!(
            outcome,
            PullOutcome::Merged {
                changed_fields: 2,
                created: false
            }
        );

        let merged = local.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(merged.name, "Ada Lovelace");
        assert!((merged.height - 170.0).abs() < f64::EPSILON);
        assert!(!merged.is_synced);
        assert!(merged.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_remote_field_never_clears_local() {
        let (local, remote, reconciler) = setup();
        let mut profile = UserProfile::new("u1");
        profile.height = 182.0;
        profile.goal = "maintain".to_string();
        local.upsert_profile(&profile).await.unwrap();
        remote
            .set_user_document("u1", doc(json!({"name": "Grace", "goal": ""})), false)
            .unwrap();

        reconciler.pull("u1").await.unwrap();

        let merged = local.get_profile("u1").await.unwrap().unwrap();
        assert!((merged.height - 182.0).abs() < f64::EPSILON);
        assert_eq!(merged.goal, "maintain");
        assert_eq!(merged.name, "Grace");
    }

    #[tokio::test]
    async fn test_pull_never_marks_profile_synced() {
        let (local, remote, reconciler) = setup();
        let mut profile = UserProfile::new("u1");
        profile.name = "Ada".to_string();
        profile.is_synced = true;
        local.upsert_profile(&profile).await.unwrap();
        let before = local.get_profile("u1").await.unwrap().unwrap();
        remote
            .set_user_document("u1", doc(json!({"name": "Ada"})), false)
            .unwrap();

        let outcome = reconciler.pull("u1").await.unwrap();
        assert_eq!(
            outcome,
            PullOutcome::Merged {
                changed_fields: 0,
                created: false
            }
        );
        let after = local.get_profile("u1").await.unwrap().unwrap();
        // Unchanged content keeps its confirmed state, but the stamp moves
        assert!(after.is_synced);
        assert!(after.last_updated >= before.last_updated);
    }

    #[tokio::test]
    async fn test_pull_creates_missing_local_profile() {
        let (local, remote, reconciler) = setup();
        remote
            .set_user_document("u1", doc(json!({"email": "ada@example.com"})), false)
            .unwrap();

        let outcome = reconciler.pull("u1").await.unwrap();
        assert!(matches!(outcome, PullOutcome::Merged { created: true, .. }));

        let profile = local.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.email, "ada@example.com");
        assert!(!profile.is_synced);
    }

    #[tokio::test]
    async fn test_remote_failure_aborts_without_local_write() {
        let local = SharedDatabase::new(Database::open_in_memory().unwrap());
        let remote = Arc::new(FlakyRemote::new());
        remote.fail_reads(true);
        let reconciler = PullReconciler::new(Arc::new(local.clone()), remote.clone());

        let err = reconciler.pull("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
        assert!(local.get_profile("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edit_during_pull_is_kept_and_stays_dirty() {
        let local = SharedDatabase::new(Database::open_in_memory().unwrap());
        synced_profile(&local);
        let store = Arc::new(EditAfterRead {
            inner: local.clone(),
            edits: AtomicUsize::new(1),
            goal: "gain",
        });
        let remote = Arc::new(DocumentStore::open_in_memory().unwrap());
        remote
            .set_user_document("u1", doc(json!({"name": "Ada"})), false)
            .unwrap();
        let reconciler = PullReconciler::new(store, remote);

        let outcome = reconciler.pull("u1").await.unwrap();
        assert!(matches!(outcome, PullOutcome::Merged { created: false, .. }));

        let after = local.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(after.goal, "gain");
        assert_eq!(after.name, "Ada");
        assert!(!after.is_synced);
    }

    #[tokio::test]
    async fn test_pull_gives_up_when_profile_never_settles() {
        let local = SharedDatabase::new(Database::open_in_memory().unwrap());
        let before = synced_profile(&local);
        let store = Arc::new(EditAfterRead {
            inner: local.clone(),
            edits: AtomicUsize::new(usize::MAX),
            goal: "maintain",
        });
        let remote = Arc::new(DocumentStore::open_in_memory().unwrap());
        remote
            .set_user_document("u1", doc(json!({"name": "Ada"})), false)
            .unwrap();
        let reconciler = PullReconciler::new(store, remote);

        let err = reconciler.pull("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::Local(_)));

        // Only the user's edits were written
        let after = local.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(after.name, before.name);
        assert_eq!(after.goal, "maintain");
    }
}
