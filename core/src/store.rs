//! Adapter seams between the sync engine and the two stores.
//!
//! The engine only ever talks to these traits, so tests and the CLI can
//! plug in SQLite, HTTP or fault-injecting implementations without the
//! pull/push logic knowing which one it has.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Document, EntityKind, FactRecord, MealEntry, NewMealEntry, NewWeightEntry, UserProfile,
    WeightEntry,
};

/// On-device persistent store.
///
/// Implementations must give read-your-writes within the process, and
/// `mark_synced` must be durable before it returns `Ok`.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()>;

    /// Compare-and-swap write. `expected` is the `last_updated` of the copy
    /// `profile` was derived from, `None` if there was none. Returns false,
    /// writing nothing, when the stored profile no longer matches.
    async fn replace_profile(
        &self,
        profile: &UserProfile,
        expected: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Confirm the profile as uploaded, but only if it still carries the
    /// `uploaded_version` timestamp. Returns false when it was edited in
    /// the meantime and must stay dirty.
    async fn mark_profile_synced(
        &self,
        user_id: &str,
        uploaded_version: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Records of `kind` not yet confirmed remote.
    async fn list_dirty(&self, user_id: &str, kind: EntityKind) -> Result<Vec<FactRecord>>;

    /// Set `remote_id` and `is_synced` together. Returns false when the
    /// record no longer exists or was already confirmed.
    async fn mark_synced(&self, kind: EntityKind, local_id: &str, remote_id: &str)
    -> Result<bool>;

    async fn insert_meal(&self, user_id: &str, entry: &NewMealEntry) -> Result<MealEntry>;

    async fn insert_weight(&self, user_id: &str, entry: &NewWeightEntry) -> Result<WeightEntry>;

    async fn delete(&self, kind: EntityKind, local_id: &str) -> Result<bool>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Document-oriented remote store keyed by user id and collection name.
///
/// Each call either fully succeeds or fails; retrying is up to the caller.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_user_document(&self, user_id: &str) -> Result<Option<Document>>;

    /// With `merge`, only the fields present in `doc` are overwritten.
    async fn set_user_document(&self, user_id: &str, doc: Document, merge: bool) -> Result<()>;

    /// Create a document in a collection under the user and return its id.
    async fn create_child_document(
        &self,
        user_id: &str,
        collection: &str,
        doc: Document,
    ) -> Result<String>;
}
