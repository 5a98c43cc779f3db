use anyhow::Result;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use stride_core::StrideService;
use stride_core::models::NewWeightEntry;

use super::helpers::{LBS_PER_KG, json_error, parse_date, short_id, sync_mark, to_kg};
use super::meal::resolve_id;

pub(crate) fn cmd_weight_log(
    service: &StrideService,
    value: f64,
    unit: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let entry = NewWeightEntry {
        weight: to_kg(value, unit)?,
        date: parse_date(date)?,
    };
    let result = service.log_weight(&entry)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let lbs = result.weight * LBS_PER_KG;
        println!(
            "Logged {:.1} kg ({:.1} lbs) for {}",
            result.weight,
            lbs,
            result.date.format("%Y-%m-%d")
        );
    }

    Ok(())
}

pub(crate) fn cmd_weight_history(
    service: &StrideService,
    limit: Option<u32>,
    json: bool,
) -> Result<()> {
    let entries = service.weight_history(limit.map(i64::from))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        eprintln!("No weight entries found. Use `stride weight log` to record your weight.");
    } else {
        #[derive(Tabled)]
        struct WeightRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Date")]
            date: String,
            #[tabled(rename = "Weight (kg)")]
            kg: String,
            #[tabled(rename = "Weight (lbs)")]
            lbs: String,
            #[tabled(rename = "Synced")]
            synced: String,
        }

        let rows: Vec<WeightRow> = entries
            .iter()
            .map(|e| WeightRow {
                id: short_id(&e.id).to_string(),
                date: e.date.format("%Y-%m-%d").to_string(),
                kg: format!("{:.1}", e.weight),
                lbs: format!("{:.1}", e.weight * LBS_PER_KG),
                synced: sync_mark(e.is_synced).to_string(),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }

    Ok(())
}

pub(crate) fn cmd_weight_delete(service: &StrideService, id: &str, json: bool) -> Result<()> {
    let entries = service.weight_history(None)?;
    let full_id = resolve_id(entries.iter().map(|e| e.id.as_str()), id)?;

    if let Some(full_id) = full_id {
        if service.delete_weight(&full_id)? {
            if json {
                println!("{}", serde_json::json!({ "deleted": full_id }));
            } else {
                println!("Deleted weight entry {}", short_id(&full_id));
            }
            return Ok(());
        }
    }

    if json {
        println!("{}", json_error(&format!("Weight entry {id} not found")));
    } else {
        eprintln!("Weight entry {id} not found");
    }
    process::exit(2);
}
