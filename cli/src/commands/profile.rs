use anyhow::{Result, bail};
use std::process;

use stride_core::StrideService;
use stride_core::models::{ProfileUpdate, UserProfile};

use super::helpers::{json_error, parse_date};

pub(crate) fn cmd_profile_show(service: &StrideService, json: bool) -> Result<()> {
    let Some(profile) = service.get_profile()? else {
        if json {
            println!("{}", json_error("No profile yet"));
        } else {
            eprintln!("No profile yet. Use `stride profile set` or `stride sync` to create one.");
        }
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        print_profile(&profile);
    }
    Ok(())
}

pub(crate) fn cmd_profile_set(
    service: &StrideService,
    mut update: ProfileUpdate,
    birth_date: Option<String>,
    json: bool,
) -> Result<()> {
    if let Some(date) = birth_date {
        update.birth_date = Some(parse_date(Some(date))?);
    }
    if update.is_empty() {
        bail!(
            "Nothing to update. Provide at least one of --name, --email, --gender, --birth-date, \
             --height, --weight, --target-weight, --goal, or --activity"
        );
    }

    let profile = service.update_profile(&update)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        println!("Profile updated (will upload on next sync)");
        print_profile(&profile);
    }
    Ok(())
}

fn print_profile(p: &UserProfile) {
    let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
    let num = |v: f64, unit: &str| {
        if v == 0.0 {
            "-".to_string()
        } else {
            format!("{v:.1} {unit}")
        }
    };

    println!("  User:          {}", p.user_id);
    println!("  Name:          {}", or_dash(&p.name));
    println!("  Email:         {}", or_dash(&p.email));
    println!("  Gender:        {}", or_dash(&p.gender));
    println!(
        "  Birth date:    {}",
        p.birth_date
            .map_or("-".to_string(), |d| d.format("%Y-%m-%d").to_string())
    );
    println!("  Height:        {}", num(p.height, "cm"));
    println!("  Weight:        {}", num(p.weight, "kg"));
    println!("  Target weight: {}", num(p.target_weight, "kg"));
    println!("  Goal:          {}", or_dash(&p.goal));
    println!("  Activity:      {}", or_dash(&p.activity_level));
    let synced = match (p.is_synced, p.last_synced_at) {
        (true, Some(at)) => format!("yes ({})", at.format("%Y-%m-%d %H:%M UTC")),
        (true, None) => "yes".to_string(),
        (false, _) => "pending".to_string(),
    };
    println!("  Synced:        {synced}");
}
