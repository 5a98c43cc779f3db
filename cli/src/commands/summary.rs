use anyhow::Result;
use std::process;

use stride_core::StrideService;

use super::helpers::{no_neg_zero, parse_date, short_id};

pub(crate) fn cmd_summary(service: &StrideService, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let summary = service.get_daily_summary(&date.format("%Y-%m-%d").to_string())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if summary.meals.is_empty() {
        let date = &summary.date;
        eprintln!("No entries for {date}");
        process::exit(2);
    }

    let date = &summary.date;
    println!("=== {date} ===\n");

    for kind in stride_core::models::MEAL_TYPES {
        let entries: Vec<_> = summary.meals.iter().filter(|m| m.meal_type == *kind).collect();
        if entries.is_empty() {
            continue;
        }
        let label = kind.to_uppercase();
        let subtotal: f64 = entries.iter().map(|m| m.calories * m.quantity).sum();
        println!("  {label} ({subtotal:.0} kcal)");
        for m in entries {
            let id = short_id(&m.id);
            let name = &m.food_name;
            let qty = m.quantity;
            let cal = m.calories * qty;
            let protein = m.protein * qty;
            let carbs = m.carbs * qty;
            let fat = m.fat * qty;
            println!(
                "    [{id}] {name} — {qty}x — {cal:.0} kcal | P:{protein:.0}g C:{carbs:.0}g F:{fat:.0}g"
            );
        }
        println!();
    }

    let total_cal = no_neg_zero(summary.total_calories);
    let total_p = no_neg_zero(summary.total_protein);
    let total_c = no_neg_zero(summary.total_carbs);
    let total_f = no_neg_zero(summary.total_fat);
    println!("  TOTAL: {total_cal:.0} kcal | P:{total_p:.0}g C:{total_c:.0}g F:{total_f:.0}g");

    Ok(())
}
