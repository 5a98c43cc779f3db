use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};

use crate::db::{Database, SharedDatabase};
use crate::models::{
    DailySummary, MealEntry, NewMealEntry, NewWeightEntry, PendingCounts, ProfileUpdate,
    UserProfile, WeightEntry, validate_new_meal, validate_new_weight,
};
use crate::session::Session;
use crate::tracker::DirtyTracker;

/// Application-facing operations on the local store, scoped to the
/// signed-in user. Every write leaves the touched record dirty for the
/// next push.
pub struct StrideService {
    db: SharedDatabase,
    session: Session,
    tracker: DirtyTracker,
}

impl StrideService {
    pub fn new(db_path: &Path, session: Session) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self::from_parts(SharedDatabase::new(db), session))
    }

    pub fn new_in_memory(session: Session) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::from_parts(SharedDatabase::new(db), session))
    }

    #[must_use]
    pub fn from_parts(db: SharedDatabase, session: Session) -> Self {
        let tracker = DirtyTracker::new(Arc::new(db.clone()));
        Self {
            db,
            session,
            tracker,
        }
    }

    /// The shared store handle, for wiring up the sync engine.
    #[must_use]
    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn user_id(&self) -> Result<String> {
        self.session
            .current_user()
            .context("Not signed in. Run `stride login <user-id>` first")
    }

    // --- Profile ---

    pub fn get_profile(&self) -> Result<Option<UserProfile>> {
        let user_id = self.user_id()?;
        self.db.lock().get_profile(&user_id)
    }

    pub fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile> {
        update.validate()?;
        let user_id = self.user_id()?;
        let db = self.db.lock();
        let mut profile = db
            .get_profile(&user_id)?
            .unwrap_or_else(|| UserProfile::new(&user_id));
        update.apply(&mut profile, Utc::now());
        db.upsert_profile(&profile)?;
        db.get_profile(&user_id)?
            .context("Profile not found after update")
    }

    // --- Meals ---

    pub fn log_meal(&self, entry: &NewMealEntry) -> Result<MealEntry> {
        validate_new_meal(entry)?;
        let user_id = self.user_id()?;
        let entry = NewMealEntry {
            food_name: entry.food_name.trim().to_string(),
            meal_type: entry.meal_type.to_lowercase(),
            ..entry.clone()
        };
        self.db.lock().insert_meal(&user_id, &entry)
    }

    pub fn list_meals(&self, date: Option<&str>) -> Result<Vec<MealEntry>> {
        let user_id = self.user_id()?;
        let date = date.map(parse_date).transpose()?;
        self.db.lock().list_meals(&user_id, date)
    }

    pub fn delete_meal(&self, id: &str) -> Result<bool> {
        let user_id = self.user_id()?;
        let db = self.db.lock();
        match db.get_meal(id)? {
            Some(meal) if meal.user_id == user_id => db.delete_meal(id),
            _ => Ok(false),
        }
    }

    pub fn get_daily_summary(&self, date: &str) -> Result<DailySummary> {
        let user_id = self.user_id()?;
        self.db.lock().build_daily_summary(&user_id, parse_date(date)?)
    }

    // --- Weights ---

    pub fn log_weight(&self, entry: &NewWeightEntry) -> Result<WeightEntry> {
        validate_new_weight(entry)?;
        let user_id = self.user_id()?;
        self.db.lock().insert_weight(&user_id, entry)
    }

    pub fn weight_history(&self, limit: Option<i64>) -> Result<Vec<WeightEntry>> {
        let user_id = self.user_id()?;
        self.db.lock().weight_history(&user_id, limit)
    }

    pub fn delete_weight(&self, id: &str) -> Result<bool> {
        let user_id = self.user_id()?;
        let db = self.db.lock();
        match db.get_weight(id)? {
            Some(weight) if weight.user_id == user_id => db.delete_weight(id),
            _ => Ok(false),
        }
    }

    // --- Sync bookkeeping ---

    /// What the next push would upload, as seen by the sync engine.
    pub async fn pending_counts(&self) -> Result<PendingCounts> {
        let user_id = self.user_id()?;
        Ok(self.tracker.pending_counts(&user_id).await?)
    }
}

fn parse_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{date}', expected YYYY-MM-DD"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> StrideService {
        StrideService::new_in_memory(Session::signed_in("u1")).unwrap()
    }

    fn sample_meal() -> NewMealEntry {
        NewMealEntry {
            food_name: "  Greek Yogurt ".to_string(),
            calories: 100.0,
            protein: 10.0,
            carbs: 4.0,
            fat: 5.0,
            meal_type: "Breakfast".to_string(),
            quantity: 1.5,
            date_added: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_requires_sign_in() {
        let svc = StrideService::new_in_memory(Session::new()).unwrap();
        let err = svc.log_meal(&sample_meal()).unwrap_err();
        assert!(err.to_string().contains("Not signed in"));
        assert!(svc.pending_counts().await.is_err());
    }

    #[test]
    fn test_log_meal_normalizes_and_summarizes() {
        let svc = service();
        let meal = svc.log_meal(&sample_meal()).unwrap();
        assert_eq!(meal.food_name, "Greek Yogurt");
        assert_eq!(meal.meal_type, "breakfast");
        assert!(!meal.is_synced);

        let summary = svc.get_daily_summary("2024-06-15").unwrap();
        assert_eq!(summary.meals.len(), 1);
        assert!((summary.total_calories - 150.0).abs() < 0.01);
        assert_eq!(svc.list_meals(Some("2024-06-15")).unwrap().len(), 1);
        assert!(svc.list_meals(Some("2024-06-16")).unwrap().is_empty());
    }

    #[test]
    fn test_log_meal_rejects_bad_input() {
        let svc = service();
        let mut meal = sample_meal();
        meal.meal_type = "brunch".to_string();
        assert!(svc.log_meal(&meal).is_err());

        let mut meal = sample_meal();
        meal.quantity = 0.0;
        assert!(svc.log_meal(&meal).is_err());
        assert!(svc.list_meals(None).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_date_is_reported() {
        let svc = service();
        let err = svc.get_daily_summary("15/06/2024").unwrap_err();
        assert!(err.to_string().contains("expected YYYY-MM-DD"));
    }

    #[tokio::test]
    async fn test_update_profile_creates_and_marks_dirty() {
        let svc = service();
        assert!(svc.get_profile().unwrap().is_none());

        let profile = svc
            .update_profile(&ProfileUpdate {
                name: Some("Ada".to_string()),
                goal: Some("Lose".to_string()),
                height: Some(170.0),
                ..ProfileUpdate::default()
            })
            .unwrap();
        assert_eq!(profile.name, "Ada");
        assert_eq!(profile.goal, "lose");
        assert!(!profile.is_synced);
        assert!(svc.pending_counts().await.unwrap().profile);
    }

    #[tokio::test]
    async fn test_update_profile_resets_synced_flag() {
        let svc = service();
        let profile = svc
            .update_profile(&ProfileUpdate {
                name: Some("Ada".to_string()),
                ..ProfileUpdate::default()
            })
            .unwrap();
        svc.database()
            .lock()
            .mark_profile_synced("u1", profile.last_updated, Utc::now())
            .unwrap();
        assert!(!svc.pending_counts().await.unwrap().profile);

        svc.update_profile(&ProfileUpdate {
            weight: Some(61.0),
            ..ProfileUpdate::default()
        })
        .unwrap();
        assert!(svc.pending_counts().await.unwrap().profile);
    }

    #[test]
    fn test_update_profile_validation() {
        let svc = service();
        let result = svc.update_profile(&ProfileUpdate {
            activity_level: Some("couch".to_string()),
            ..ProfileUpdate::default()
        });
        assert!(result.is_err());
        assert!(svc.get_profile().unwrap().is_none());
    }

    #[test]
    fn test_delete_is_scoped_to_signed_in_user() {
        let svc = service();
        let meal = svc.log_meal(&sample_meal()).unwrap();

        svc.session().sign_in("u2");
        assert!(!svc.delete_meal(&meal.id).unwrap());

        svc.session().sign_in("u1");
        assert!(svc.delete_meal(&meal.id).unwrap());
        assert!(!svc.delete_meal(&meal.id).unwrap());
    }

    #[tokio::test]
    async fn test_weights() {
        let svc = service();
        let entry = svc
            .log_weight(&NewWeightEntry {
                weight: 68.2,
                date: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            })
            .unwrap();
        assert!(
            svc.log_weight(&NewWeightEntry {
                weight: -1.0,
                date: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            })
            .is_err()
        );

        assert_eq!(svc.weight_history(None).unwrap().len(), 1);
        assert_eq!(svc.pending_counts().await.unwrap().weights, 1);
        assert!(svc.delete_weight(&entry.id).unwrap());
        assert!(svc.weight_history(Some(10)).unwrap().is_empty());
    }
}
