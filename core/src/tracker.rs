use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::models::{EntityKind, FactRecord, MealEntry, PendingCounts, WeightEntry};
use crate::store::LocalStore;

/// Answers "what still needs uploading". Holds no state of its own: every
/// call is recomputed from the `is_synced` flags in the local store.
#[derive(Clone)]
pub struct DirtyTracker {
    local: Arc<dyn LocalStore>,
}

impl DirtyTracker {
    pub fn new(local: Arc<dyn LocalStore>) -> Self {
        Self { local }
    }

    pub async fn unsynced(&self, user_id: &str, kind: EntityKind) -> SyncResult<Vec<FactRecord>> {
        self.local
            .list_dirty(user_id, kind)
            .await
            .map_err(SyncError::local)
    }

    pub async fn unsynced_meals(&self, user_id: &str) -> SyncResult<Vec<MealEntry>> {
        let records = self.unsynced(user_id, EntityKind::Meal).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| match r {
                FactRecord::Meal(m) => Some(m),
                FactRecord::Weight(_) => None,
            })
            .collect())
    }

    pub async fn unsynced_weights(&self, user_id: &str) -> SyncResult<Vec<WeightEntry>> {
        let records = self.unsynced(user_id, EntityKind::Weight).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| match r {
                FactRecord::Weight(w) => Some(w),
                FactRecord::Meal(_) => None,
            })
            .collect())
    }

    pub async fn pending_counts(&self, user_id: &str) -> SyncResult<PendingCounts> {
        let profile = self
            .local
            .get_profile(user_id)
            .await
            .map_err(SyncError::local)?
            .is_some_and(|p| !p.is_synced);
        Ok(PendingCounts {
            profile,
            meals: self.unsynced(user_id, EntityKind::Meal).await?.len(),
            weights: self.unsynced(user_id, EntityKind::Weight).await?.len(),
        })
    }
}
