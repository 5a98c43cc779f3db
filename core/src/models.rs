use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote document: a flat map of named fields.
pub type Document = serde_json::Map<String, Value>;

// --- Profile ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub gender: String,
    pub birth_date: Option<NaiveDate>,
    /// Centimetres.
    pub height: f64,
    /// Kilograms.
    pub weight: f64,
    pub target_weight: f64,
    pub goal: String,
    pub activity_level: String,
    pub last_updated: DateTime<Utc>,
    pub is_synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// An empty, unsynced profile for a freshly created account.
    #[must_use]
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: String::new(),
            email: String::new(),
            gender: String::new(),
            birth_date: None,
            height: 0.0,
            weight: 0.0,
            target_weight: 0.0,
            goal: String::new(),
            activity_level: String::new(),
            last_updated: Utc::now(),
            is_synced: false,
            last_synced_at: None,
        }
    }

    /// Build the merge-write payload for the remote user document.
    ///
    /// Only non-empty strings and non-zero numbers are included, so a
    /// partially filled local profile never blanks out remote fields.
    /// `uid`, `lastUpdated` and `lastSyncedAt` are always present.
    #[must_use]
    pub fn to_document(&self, synced_at: DateTime<Utc>) -> Document {
        let mut doc = Document::new();
        doc.insert("uid".into(), Value::from(self.user_id.clone()));
        put_text(&mut doc, "name", &self.name);
        put_text(&mut doc, "email", &self.email);
        put_text(&mut doc, "gender", &self.gender);
        if let Some(birth_date) = self.birth_date {
            doc.insert(
                "birthDate".into(),
                Value::from(birth_date.format("%Y-%m-%d").to_string()),
            );
        }
        put_number(&mut doc, "height", self.height);
        put_number(&mut doc, "weight", self.weight);
        put_number(&mut doc, "targetWeight", self.target_weight);
        put_text(&mut doc, "goal", &self.goal);
        put_text(&mut doc, "activityLevel", &self.activity_level);
        doc.insert(
            "lastUpdated".into(),
            Value::from(self.last_updated.to_rfc3339()),
        );
        doc.insert("lastSyncedAt".into(), Value::from(synced_at.to_rfc3339()));
        doc
    }

    /// Overwrite local fields with the present, non-empty fields of a
    /// remote document. Returns the number of fields whose value changed.
    pub fn merge_document(&mut self, doc: &Document) -> usize {
        let mut changed = 0;
        changed += usize::from(merge_text(&mut self.name, doc.get("name")));
        changed += usize::from(merge_text(&mut self.email, doc.get("email")));
        changed += usize::from(merge_text(&mut self.gender, doc.get("gender")));
        if let Some(date) = doc.get("birthDate").and_then(parse_document_date) {
            if self.birth_date != Some(date) {
                self.birth_date = Some(date);
                changed += 1;
            }
        }
        changed += usize::from(merge_number(&mut self.height, doc.get("height")));
        changed += usize::from(merge_number(&mut self.weight, doc.get("weight")));
        changed += usize::from(merge_number(
            &mut self.target_weight,
            doc.get("targetWeight"),
        ));
        changed += usize::from(merge_text(&mut self.goal, doc.get("goal")));
        changed += usize::from(merge_text(
            &mut self.activity_level,
            doc.get("activityLevel"),
        ));
        changed
    }
}

fn put_text(doc: &mut Document, key: &str, value: &str) {
    if !value.trim().is_empty() {
        doc.insert(key.into(), Value::from(value));
    }
}

#[allow(clippy::float_cmp)]
fn put_number(doc: &mut Document, key: &str, value: f64) {
    if value.is_finite() && value != 0.0 {
        doc.insert(key.into(), Value::from(value));
    }
}

fn merge_text(field: &mut String, remote: Option<&Value>) -> bool {
    match remote.and_then(Value::as_str).map(str::trim) {
        Some(text) if !text.is_empty() && field != text => {
            *field = text.to_string();
            true
        }
        _ => false,
    }
}

#[allow(clippy::float_cmp)]
fn merge_number(field: &mut f64, remote: Option<&Value>) -> bool {
    match remote.and_then(Value::as_f64) {
        Some(n) if n.is_finite() && n != 0.0 && *field != n => {
            *field = n;
            true
        }
        _ => false,
    }
}

/// Accepts either a plain `YYYY-MM-DD` date or a full RFC 3339 timestamp.
fn parse_document_date(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().or_else(|| {
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.date_naive())
    })
}

/// Partial edit of a profile. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    pub target_weight: Option<f64>,
    pub goal: Option<String>,
    pub activity_level: Option<String>,
}

impl ProfileUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.gender.is_none()
            && self.birth_date.is_none()
            && self.height.is_none()
            && self.weight.is_none()
            && self.target_weight.is_none()
            && self.goal.is_none()
            && self.activity_level.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref gender) = self.gender {
            validate_choice("gender", gender, GENDERS)?;
        }
        if let Some(ref goal) = self.goal {
            validate_choice("goal", goal, GOALS)?;
        }
        if let Some(ref level) = self.activity_level {
            validate_choice("activity level", level, ACTIVITY_LEVELS)?;
        }
        for (label, value) in [
            ("height", self.height),
            ("weight", self.weight),
            ("target weight", self.target_weight),
        ] {
            if value.is_some_and(|v| !v.is_finite() || v <= 0.0) {
                bail!("{label} must be greater than 0");
            }
        }
        Ok(())
    }

    /// Apply the edit. Any applied edit marks the profile dirty.
    pub fn apply(&self, profile: &mut UserProfile, now: DateTime<Utc>) {
        if let Some(ref v) = self.name {
            profile.name.clone_from(v);
        }
        if let Some(ref v) = self.email {
            profile.email.clone_from(v);
        }
        if let Some(ref v) = self.gender {
            profile.gender = v.to_lowercase();
        }
        if let Some(v) = self.birth_date {
            profile.birth_date = Some(v);
        }
        if let Some(v) = self.height {
            profile.height = v;
        }
        if let Some(v) = self.weight {
            profile.weight = v;
        }
        if let Some(v) = self.target_weight {
            profile.target_weight = v;
        }
        if let Some(ref v) = self.goal {
            profile.goal = v.to_lowercase();
        }
        if let Some(ref v) = self.activity_level {
            profile.activity_level = v.to_lowercase();
        }
        if !self.is_empty() {
            profile.last_updated = now;
            profile.is_synced = false;
        }
    }
}

// --- Facts ---

/// The append-only fact kinds that are pushed as child documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Meal,
    Weight,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Meal, EntityKind::Weight];

    /// Remote collection under the user document.
    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            Self::Meal => "meals",
            Self::Weight => "weights",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meal => f.write_str("meal"),
            Self::Weight => f.write_str("weight"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MealEntry {
    pub id: String,
    pub user_id: String,
    pub food_name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub meal_type: String,
    pub quantity: f64,
    pub date_added: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub is_synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl MealEntry {
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("localId".into(), Value::from(self.id.clone()));
        doc.insert("foodName".into(), Value::from(self.food_name.clone()));
        doc.insert("calories".into(), Value::from(self.calories));
        doc.insert("protein".into(), Value::from(self.protein));
        doc.insert("carbs".into(), Value::from(self.carbs));
        doc.insert("fat".into(), Value::from(self.fat));
        doc.insert("mealType".into(), Value::from(self.meal_type.clone()));
        doc.insert("quantity".into(), Value::from(self.quantity));
        doc.insert(
            "dateAdded".into(),
            Value::from(self.date_added.format("%Y-%m-%d").to_string()),
        );
        doc.insert("createdAt".into(), Value::from(self.created_at.to_rfc3339()));
        doc
    }
}

#[derive(Debug, Clone)]
pub struct NewMealEntry {
    pub food_name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub meal_type: String,
    pub quantity: f64,
    pub date_added: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightEntry {
    pub id: String,
    pub user_id: String,
    pub weight: f64,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub is_synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl WeightEntry {
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("localId".into(), Value::from(self.id.clone()));
        doc.insert("weight".into(), Value::from(self.weight));
        doc.insert(
            "date".into(),
            Value::from(self.date.format("%Y-%m-%d").to_string()),
        );
        doc.insert("createdAt".into(), Value::from(self.created_at.to_rfc3339()));
        doc
    }
}

#[derive(Debug, Clone)]
pub struct NewWeightEntry {
    pub weight: f64,
    pub date: NaiveDate,
}

/// A locally stored fact of either kind, as handed to the uploader.
#[derive(Debug, Clone, PartialEq)]
pub enum FactRecord {
    Meal(MealEntry),
    Weight(WeightEntry),
}

impl FactRecord {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Meal(_) => EntityKind::Meal,
            Self::Weight(_) => EntityKind::Weight,
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &str {
        match self {
            Self::Meal(m) => &m.id,
            Self::Weight(w) => &w.id,
        }
    }

    #[must_use]
    pub fn to_document(&self) -> Document {
        match self {
            Self::Meal(m) => m.to_document(),
            Self::Weight(w) => w.to_document(),
        }
    }
}

// --- Summaries ---

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub meals: Vec<MealEntry>,
    pub total_calories: f64,
    pub total_protein: f64,
    pub total_carbs: f64,
    pub total_fat: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub profile: bool,
    pub meals: usize,
    pub weights: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.profile && self.meals == 0 && self.weights == 0
    }
}

// --- Validation ---

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack"];
pub const GENDERS: &[&str] = &["female", "male", "other"];
pub const GOALS: &[&str] = &["lose", "maintain", "gain"];
pub const ACTIVITY_LEVELS: &[&str] = &["sedentary", "light", "moderate", "active", "very_active"];

fn validate_choice(label: &str, value: &str, allowed: &[&str]) -> Result<String> {
    let lower = value.to_lowercase();
    if allowed.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid {label} '{value}'. Must be one of: {}",
            allowed.join(", ")
        )
    }
}

pub fn validate_meal_type(meal: &str) -> Result<String> {
    validate_choice("meal type", meal, MEAL_TYPES)
}

/// Validate a meal before it is logged: name, meal type, quantity and macros.
pub fn validate_new_meal(entry: &NewMealEntry) -> Result<()> {
    if entry.food_name.trim().is_empty() {
        bail!("Food name must not be empty");
    }
    validate_meal_type(&entry.meal_type)?;
    if !entry.quantity.is_finite() || entry.quantity <= 0.0 {
        bail!("quantity must be greater than 0");
    }
    for (label, value) in [
        ("calories", entry.calories),
        ("protein", entry.protein),
        ("carbs", entry.carbs),
        ("fat", entry.fat),
    ] {
        if !value.is_finite() || value < 0.0 {
            bail!("{label} must not be negative");
        }
    }
    Ok(())
}

pub fn validate_new_weight(entry: &NewWeightEntry) -> Result<()> {
    if !entry.weight.is_finite() || entry.weight <= 0.0 {
        bail!("weight must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> UserProfile {
        let mut p = UserProfile::new("user-1");
        p.name = "Ada".to_string();
        p.email = "ada@example.com".to_string();
        p.height = 0.0;
        p.weight = 60.0;
        p
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_to_document_skips_empty_fields() {
        let profile = sample_profile();
        let d = profile.to_document(Utc::now());

        assert_eq!(d["uid"], "user-1");
        assert_eq!(d["name"], "Ada");
        assert_eq!(d["weight"], 60.0);
        assert!(!d.contains_key("height"));
        assert!(!d.contains_key("gender"));
        assert!(!d.contains_key("birthDate"));
        assert!(d.contains_key("lastUpdated"));
        assert!(d.contains_key("lastSyncedAt"));
    }

    #[test]
    fn test_merge_overwrites_with_present_fields() {
        let mut profile = sample_profile();
        let changed = profile.merge_document(&doc(serde_json::json!({
            "name": "Ada Lovelace",
            "height": 170.0,
        })));

        assert_eq!(changed, 2);
        assert_eq!(profile.name, "Ada Lovelace");
        assert!((profile.height - 170.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_never_clears_local_fields() {
        let mut profile = sample_profile();
        profile.height = 182.0;
        let changed = profile.merge_document(&doc(serde_json::json!({
            "name": "",
            "email": "   ",
            "height": 0,
            "weight": null,
        })));

        assert_eq!(changed, 0);
        assert_eq!(profile.name, "Ada");
        assert_eq!(profile.email, "ada@example.com");
        assert!((profile.height - 182.0).abs() < f64::EPSILON);
        assert!((profile.weight - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_birth_date_formats() {
        let mut profile = sample_profile();
        profile.merge_document(&doc(serde_json::json!({ "birthDate": "1815-12-10" })));
        assert_eq!(profile.birth_date, NaiveDate::from_ymd_opt(1815, 12, 10));

        profile.merge_document(&doc(
            serde_json::json!({ "birthDate": "1990-01-02T00:00:00Z" }),
        ));
        assert_eq!(profile.birth_date, NaiveDate::from_ymd_opt(1990, 1, 2));

        // Garbage is ignored rather than clearing the field
        profile.merge_document(&doc(serde_json::json!({ "birthDate": "soon" })));
        assert_eq!(profile.birth_date, NaiveDate::from_ymd_opt(1990, 1, 2));
    }

    #[test]
    fn test_profile_update_marks_dirty() {
        let mut profile = sample_profile();
        profile.is_synced = true;
        let before = profile.last_updated;

        let update = ProfileUpdate {
            goal: Some("Lose".to_string()),
            ..ProfileUpdate::default()
        };
        let now = before + chrono::Duration::seconds(5);
        update.apply(&mut profile, now);

        assert_eq!(profile.goal, "lose");
        assert!(!profile.is_synced);
        assert_eq!(profile.last_updated, now);
    }

    #[test]
    fn test_empty_profile_update_is_noop() {
        let mut profile = sample_profile();
        profile.is_synced = true;
        ProfileUpdate::default().apply(&mut profile, Utc::now());
        assert!(profile.is_synced);
    }

    #[test]
    fn test_profile_update_validation() {
        let bad_goal = ProfileUpdate {
            goal: Some("bulk".to_string()),
            ..ProfileUpdate::default()
        };
        assert!(bad_goal.validate().is_err());

        let bad_height = ProfileUpdate {
            height: Some(-3.0),
            ..ProfileUpdate::default()
        };
        assert!(bad_height.validate().is_err());

        let ok = ProfileUpdate {
            gender: Some("Female".to_string()),
            activity_level: Some("very_active".to_string()),
            height: Some(170.0),
            ..ProfileUpdate::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_valid_meal_types() {
        assert_eq!(validate_meal_type("Breakfast").unwrap(), "breakfast");
        assert!(validate_meal_type("brunch").is_err());
    }

    #[test]
    fn test_validate_new_meal() {
        let mut meal = NewMealEntry {
            food_name: "Oats".to_string(),
            calories: 380.0,
            protein: 13.0,
            carbs: 67.0,
            fat: 7.0,
            meal_type: "breakfast".to_string(),
            quantity: 1.0,
            date_added: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
        };
        assert!(validate_new_meal(&meal).is_ok());

        meal.quantity = 0.0;
        assert!(validate_new_meal(&meal).is_err());

        meal.quantity = 1.0;
        meal.fat = -1.0;
        assert!(validate_new_meal(&meal).is_err());
    }

    #[test]
    fn test_fact_documents_carry_local_id() {
        let weight = WeightEntry {
            id: "w-1".to_string(),
            user_id: "user-1".to_string(),
            weight: 71.5,
            date: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            created_at: Utc::now(),
            is_synced: false,
            remote_id: None,
        };
        let record = FactRecord::Weight(weight);
        let d = record.to_document();

        assert_eq!(record.kind(), EntityKind::Weight);
        assert_eq!(record.local_id(), "w-1");
        assert_eq!(d["localId"], "w-1");
        assert_eq!(d["date"], "2024-06-15");
    }

    #[test]
    fn test_entity_kind_collections() {
        assert_eq!(EntityKind::Meal.collection(), "meals");
        assert_eq!(EntityKind::Weight.collection(), "weights");
        assert_eq!(EntityKind::Meal.to_string(), "meal");
    }
}
