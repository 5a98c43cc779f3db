use anyhow::{Result, bail};
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use stride_core::StrideService;
use stride_core::models::{MealEntry, NewMealEntry};

use super::helpers::{json_error, parse_date, short_id, sync_mark, truncate};

pub(crate) struct MealArgs {
    pub food: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub meal: String,
    pub quantity: f64,
    pub date: Option<String>,
}

pub(crate) fn cmd_meal_log(service: &StrideService, args: MealArgs, json: bool) -> Result<()> {
    let entry = NewMealEntry {
        food_name: args.food,
        calories: args.calories,
        protein: args.protein,
        carbs: args.carbs,
        fat: args.fat,
        meal_type: args.meal,
        quantity: args.quantity,
        date_added: parse_date(args.date)?,
    };
    let meal = service.log_meal(&entry)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meal)?);
    } else {
        let name = &meal.food_name;
        let qty = meal.quantity;
        let kind = &meal.meal_type;
        let date = meal.date_added.format("%Y-%m-%d");
        let cal = meal.calories * meal.quantity;
        let id = short_id(&meal.id);
        println!("Logged {qty}x {name} for {kind} on {date} — {cal:.0} kcal [{id}]");
    }
    Ok(())
}

pub(crate) fn cmd_meal_list(service: &StrideService, date: Option<String>, json: bool) -> Result<()> {
    let date = date
        .map(|d| parse_date(Some(d)))
        .transpose()?
        .map(|d| d.format("%Y-%m-%d").to_string());
    let meals = service.list_meals(date.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meals)?);
    } else if meals.is_empty() {
        eprintln!("No meals logged. Use `stride meal log` to add one.");
    } else {
        print_meal_table(&meals);
    }
    Ok(())
}

pub(crate) fn cmd_meal_delete(service: &StrideService, id: &str, json: bool) -> Result<()> {
    let meals = service.list_meals(None)?;
    let full_id = resolve_id(meals.iter().map(|m| m.id.as_str()), id)?;

    if let Some(full_id) = full_id {
        if service.delete_meal(&full_id)? {
            if json {
                println!("{}", serde_json::json!({ "deleted": full_id }));
            } else {
                println!("Deleted meal {}", short_id(&full_id));
            }
            return Ok(());
        }
    }

    if json {
        println!("{}", json_error(&format!("Meal {id} not found")));
    } else {
        eprintln!("Meal {id} not found");
    }
    process::exit(2);
}

/// Find the single id starting with `prefix`. Ambiguous prefixes are an error.
pub(crate) fn resolve_id<'a>(
    ids: impl Iterator<Item = &'a str>,
    prefix: &str,
) -> Result<Option<String>> {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        bail!("Id must not be empty");
    }
    let matches: Vec<&str> = ids.filter(|id| id.starts_with(prefix)).collect();
    match matches.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some((*one).to_string())),
        _ => bail!("Id '{prefix}' matches {} entries. Use more characters", matches.len()),
    }
}

pub(crate) fn print_meal_table(meals: &[MealEntry]) {
    #[derive(Tabled)]
    struct MealRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Food")]
        food: String,
        #[tabled(rename = "Qty")]
        quantity: String,
        #[tabled(rename = "kcal")]
        calories: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
        #[tabled(rename = "Synced")]
        synced: String,
    }

    let rows: Vec<MealRow> = meals
        .iter()
        .map(|m| MealRow {
            id: short_id(&m.id).to_string(),
            date: m.date_added.format("%Y-%m-%d").to_string(),
            meal: m.meal_type.clone(),
            food: truncate(&m.food_name, 30),
            quantity: format!("{}", m.quantity),
            calories: format!("{:.0}", m.calories * m.quantity),
            protein: format!("{:.0}g", m.protein * m.quantity),
            carbs: format!("{:.0}g", m.carbs * m.quantity),
            fat: format!("{:.0}g", m.fat * m.quantity),
            synced: sync_mark(m.is_synced).to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..9)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}
