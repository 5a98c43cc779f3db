use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::models::{
    DailySummary, EntityKind, FactRecord, MealEntry, NewMealEntry, NewWeightEntry,
    UserProfile, WeightEntry,
};
use crate::store::LocalStore;

const PROFILE_COLUMNS: &str = "user_id, name, email, gender, birth_date, height, weight,
     target_weight, goal, activity_level, last_updated, is_synced, last_synced_at";

const MEAL_COLUMNS: &str = "id, user_id, food_name, calories, protein, carbs, fat, meal_type,
     quantity, date_added, created_at, is_synced, remote_id";

const WEIGHT_COLUMNS: &str = "id, user_id, weight, date, created_at, is_synced, remote_id";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            // A fact is either (unsynced, no remote id) or (synced, remote id).
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS profiles (
                    user_id TEXT PRIMARY KEY NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    email TEXT NOT NULL DEFAULT '',
                    gender TEXT NOT NULL DEFAULT '',
                    birth_date TEXT,
                    height REAL NOT NULL DEFAULT 0,
                    weight REAL NOT NULL DEFAULT 0,
                    target_weight REAL NOT NULL DEFAULT 0,
                    goal TEXT NOT NULL DEFAULT '',
                    activity_level TEXT NOT NULL DEFAULT '',
                    last_updated TEXT NOT NULL,
                    is_synced INTEGER NOT NULL DEFAULT 0,
                    last_synced_at TEXT
                );

                CREATE TABLE IF NOT EXISTS meal_entries (
                    id TEXT PRIMARY KEY NOT NULL,
                    user_id TEXT NOT NULL,
                    food_name TEXT NOT NULL,
                    calories REAL NOT NULL,
                    protein REAL NOT NULL DEFAULT 0,
                    carbs REAL NOT NULL DEFAULT 0,
                    fat REAL NOT NULL DEFAULT 0,
                    meal_type TEXT NOT NULL,
                    quantity REAL NOT NULL,
                    date_added TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    is_synced INTEGER NOT NULL DEFAULT 0,
                    remote_id TEXT,
                    CHECK ((is_synced = 0 AND remote_id IS NULL)
                        OR (is_synced = 1 AND remote_id IS NOT NULL))
                );

                CREATE TABLE IF NOT EXISTS weight_entries (
                    id TEXT PRIMARY KEY NOT NULL,
                    user_id TEXT NOT NULL,
                    weight REAL NOT NULL,
                    date TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    is_synced INTEGER NOT NULL DEFAULT 0,
                    remote_id TEXT,
                    CHECK ((is_synced = 0 AND remote_id IS NULL)
                        OR (is_synced = 1 AND remote_id IS NOT NULL))
                );

                CREATE INDEX IF NOT EXISTS idx_meal_entries_dirty ON meal_entries(user_id, is_synced);
                CREATE INDEX IF NOT EXISTS idx_meal_entries_date ON meal_entries(user_id, date_added);
                CREATE INDEX IF NOT EXISTS idx_weight_entries_dirty ON weight_entries(user_id, is_synced);
                CREATE INDEX IF NOT EXISTS idx_weight_entries_date ON weight_entries(user_id, date);

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn profile_from_row(row: &rusqlite::Row) -> rusqlite::Result<UserProfile> {
        Ok(UserProfile {
            user_id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            gender: row.get(3)?,
            birth_date: optional_date_column(row, 4)?,
            height: row.get(5)?,
            weight: row.get(6)?,
            target_weight: row.get(7)?,
            goal: row.get(8)?,
            activity_level: row.get(9)?,
            last_updated: timestamp_column(row, 10)?,
            is_synced: row.get(11)?,
            last_synced_at: optional_timestamp_column(row, 12)?,
        })
    }

    fn meal_from_row(row: &rusqlite::Row) -> rusqlite::Result<MealEntry> {
        Ok(MealEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            food_name: row.get(2)?,
            calories: row.get(3)?,
            protein: row.get(4)?,
            carbs: row.get(5)?,
            fat: row.get(6)?,
            meal_type: row.get(7)?,
            quantity: row.get(8)?,
            date_added: date_column(row, 9)?,
            created_at: timestamp_column(row, 10)?,
            is_synced: row.get(11)?,
            remote_id: row.get(12)?,
        })
    }

    fn weight_from_row(row: &rusqlite::Row) -> rusqlite::Result<WeightEntry> {
        Ok(WeightEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            weight: row.get(2)?,
            date: date_column(row, 3)?,
            created_at: timestamp_column(row, 4)?,
            is_synced: row.get(5)?,
            remote_id: row.get(6)?,
        })
    }

    // --- Profile ---

    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let profile = self
            .conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1"),
                params![user_id],
                Self::profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO profiles ({PROFILE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(user_id) DO UPDATE SET
                    name = excluded.name,
                    email = excluded.email,
                    gender = excluded.gender,
                    birth_date = excluded.birth_date,
                    height = excluded.height,
                    weight = excluded.weight,
                    target_weight = excluded.target_weight,
                    goal = excluded.goal,
                    activity_level = excluded.activity_level,
                    last_updated = excluded.last_updated,
                    is_synced = excluded.is_synced,
                    last_synced_at = excluded.last_synced_at"
            ),
            params![
                profile.user_id,
                profile.name,
                profile.email,
                profile.gender,
                profile.birth_date.map(format_date),
                profile.height,
                profile.weight,
                profile.target_weight,
                profile.goal,
                profile.activity_level,
                format_timestamp(profile.last_updated),
                profile.is_synced,
                profile.last_synced_at.map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    /// Write `profile` only if the stored copy is still the one it was
    /// derived from: `expected` is the `last_updated` that was read, or
    /// `None` when no profile existed. Returns false on a lost race.
    pub fn replace_profile(
        &self,
        profile: &UserProfile,
        expected: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let birth_date = profile.birth_date.map(format_date);
        let last_updated = format_timestamp(profile.last_updated);
        let last_synced_at = profile.last_synced_at.map(format_timestamp);
        let rows = match expected {
            None => self.conn.execute(
                &format!(
                    "INSERT INTO profiles ({PROFILE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(user_id) DO NOTHING"
                ),
                params![
                    profile.user_id,
                    profile.name,
                    profile.email,
                    profile.gender,
                    birth_date,
                    profile.height,
                    profile.weight,
                    profile.target_weight,
                    profile.goal,
                    profile.activity_level,
                    last_updated,
                    profile.is_synced,
                    last_synced_at,
                ],
            )?,
            Some(version) => self.conn.execute(
                "UPDATE profiles SET
                    name = ?2, email = ?3, gender = ?4, birth_date = ?5,
                    height = ?6, weight = ?7, target_weight = ?8, goal = ?9,
                    activity_level = ?10, last_updated = ?11, is_synced = ?12,
                    last_synced_at = ?13
                 WHERE user_id = ?1 AND last_updated = ?14",
                params![
                    profile.user_id,
                    profile.name,
                    profile.email,
                    profile.gender,
                    birth_date,
                    profile.height,
                    profile.weight,
                    profile.target_weight,
                    profile.goal,
                    profile.activity_level,
                    last_updated,
                    profile.is_synced,
                    last_synced_at,
                    format_timestamp(version),
                ],
            )?,
        };
        Ok(rows > 0)
    }

    pub fn mark_profile_synced(
        &self,
        user_id: &str,
        uploaded_version: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE profiles SET is_synced = 1, last_synced_at = ?3
             WHERE user_id = ?1 AND last_updated = ?2",
            params![
                user_id,
                format_timestamp(uploaded_version),
                format_timestamp(synced_at)
            ],
        )?;
        Ok(rows > 0)
    }

    // --- Meal entries ---

    pub fn insert_meal(&self, user_id: &str, entry: &NewMealEntry) -> Result<MealEntry> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            &format!(
                "INSERT INTO meal_entries ({MEAL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, NULL)"
            ),
            params![
                id,
                user_id,
                entry.food_name,
                entry.calories,
                entry.protein,
                entry.carbs,
                entry.fat,
                entry.meal_type,
                entry.quantity,
                format_date(entry.date_added),
                format_timestamp(Utc::now()),
            ],
        )?;
        self.get_meal(&id)?
            .context("Meal entry not found after insert")
    }

    pub fn get_meal(&self, id: &str) -> Result<Option<MealEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {MEAL_COLUMNS} FROM meal_entries WHERE id = ?1"),
                params![id],
                Self::meal_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Meals for a user, newest first. With a date, only that day.
    pub fn list_meals(&self, user_id: &str, date: Option<NaiveDate>) -> Result<Vec<MealEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEAL_COLUMNS} FROM meal_entries
             WHERE user_id = ?1 AND (?2 IS NULL OR date_added = ?2)
             ORDER BY date_added DESC, created_at DESC"
        ))?;
        let entries = stmt
            .query_map(
                params![user_id, date.map(format_date)],
                Self::meal_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_meal(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM meal_entries WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn unsynced_meals(&self, user_id: &str) -> Result<Vec<MealEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEAL_COLUMNS} FROM meal_entries
             WHERE user_id = ?1 AND is_synced = 0
             ORDER BY created_at"
        ))?;
        let entries = stmt
            .query_map(params![user_id], Self::meal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn mark_meal_synced(&self, id: &str, remote_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE meal_entries SET remote_id = ?2, is_synced = 1
             WHERE id = ?1 AND is_synced = 0",
            params![id, remote_id],
        )?;
        Ok(rows > 0)
    }

    // --- Weight entries ---

    pub fn insert_weight(&self, user_id: &str, entry: &NewWeightEntry) -> Result<WeightEntry> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            &format!(
                "INSERT INTO weight_entries ({WEIGHT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL)"
            ),
            params![
                id,
                user_id,
                entry.weight,
                format_date(entry.date),
                format_timestamp(Utc::now()),
            ],
        )?;
        self.get_weight(&id)?
            .context("Weight entry not found after insert")
    }

    pub fn get_weight(&self, id: &str) -> Result<Option<WeightEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {WEIGHT_COLUMNS} FROM weight_entries WHERE id = ?1"),
                params![id],
                Self::weight_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn weight_history(&self, user_id: &str, limit: Option<i64>) -> Result<Vec<WeightEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WEIGHT_COLUMNS} FROM weight_entries
             WHERE user_id = ?1
             ORDER BY date DESC, created_at DESC
             LIMIT ?2"
        ))?;
        let entries = stmt
            .query_map(params![user_id, limit.unwrap_or(-1)], Self::weight_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_weight(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM weight_entries WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn unsynced_weights(&self, user_id: &str) -> Result<Vec<WeightEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WEIGHT_COLUMNS} FROM weight_entries
             WHERE user_id = ?1 AND is_synced = 0
             ORDER BY created_at"
        ))?;
        let entries = stmt
            .query_map(params![user_id], Self::weight_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn mark_weight_synced(&self, id: &str, remote_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE weight_entries SET remote_id = ?2, is_synced = 1
             WHERE id = ?1 AND is_synced = 0",
            params![id, remote_id],
        )?;
        Ok(rows > 0)
    }

    // --- Summaries ---

    /// Totals for one day. Macros are per serving, so each entry counts
    /// `quantity` times.
    pub fn build_daily_summary(&self, user_id: &str, date: NaiveDate) -> Result<DailySummary> {
        let meals = self.list_meals(user_id, Some(date))?;
        let total = |f: fn(&MealEntry) -> f64| -> f64 {
            meals.iter().map(|m| f(m) * m.quantity).sum()
        };
        Ok(DailySummary {
            date: format_date(date),
            total_calories: total(|m| m.calories),
            total_protein: total(|m| m.protein),
            total_carbs: total(|m| m.carbs),
            total_fat: total(|m| m.fat),
            meals,
        })
    }

    // --- Settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at)
             VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }
}

// --- Column codecs ---

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_timestamp_column(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => timestamp_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn date_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn optional_date_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => date_column(row, idx).map(Some),
        None => Ok(None),
    }
}

// --- Shared handle ---

/// A [`Database`] shared between the app and the sync engine.
///
/// Every statement runs under one mutex, so a reader never sees a record
/// halfway through `mark_synced`.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Database> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocalStore for SharedDatabase {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.lock().get_profile(user_id)
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        self.lock().upsert_profile(profile)
    }

    async fn replace_profile(
        &self,
        profile: &UserProfile,
        expected: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.lock().replace_profile(profile, expected)
    }

    async fn mark_profile_synced(
        &self,
        user_id: &str,
        uploaded_version: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.lock()
            .mark_profile_synced(user_id, uploaded_version, synced_at)
    }

    async fn list_dirty(&self, user_id: &str, kind: EntityKind) -> Result<Vec<FactRecord>> {
        let db = self.lock();
        let records = match kind {
            EntityKind::Meal => db
                .unsynced_meals(user_id)?
                .into_iter()
                .map(FactRecord::Meal)
                .collect(),
            EntityKind::Weight => db
                .unsynced_weights(user_id)?
                .into_iter()
                .map(FactRecord::Weight)
                .collect(),
        };
        Ok(records)
    }

    async fn mark_synced(
        &self,
        kind: EntityKind,
        local_id: &str,
        remote_id: &str,
    ) -> Result<bool> {
        let db = self.lock();
        match kind {
            EntityKind::Meal => db.mark_meal_synced(local_id, remote_id),
            EntityKind::Weight => db.mark_weight_synced(local_id, remote_id),
        }
    }

    async fn insert_meal(&self, user_id: &str, entry: &NewMealEntry) -> Result<MealEntry> {
        self.lock().insert_meal(user_id, entry)
    }

    async fn insert_weight(&self, user_id: &str, entry: &NewWeightEntry) -> Result<WeightEntry> {
        self.lock().insert_weight(user_id, entry)
    }

    async fn delete(&self, kind: EntityKind, local_id: &str) -> Result<bool> {
        let db = self.lock();
        match kind {
            EntityKind::Meal => db.delete_meal(local_id),
            EntityKind::Weight => db.delete_weight(local_id),
        }
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.lock().get_setting(key)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock().set_setting(key, value)
    }
}
