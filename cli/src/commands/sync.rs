use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::TryRecvError;

use stride_core::orchestrator::{FullSyncReport, LAST_FULL_SYNC_KEY};
use stride_core::push::{KindReport, PushReport};
use stride_core::pull::PullOutcome;
use stride_core::trigger::ScheduledSync;
use stride_core::{AutoSyncTrigger, StrideService, SyncOrchestrator, SyncRun};

use crate::config::Config;
use crate::remote::HttpRemoteStore;

/// Wire the orchestrator to the local database and the configured server.
pub(crate) async fn build_orchestrator(
    config: &Config,
    service: &StrideService,
) -> Result<Arc<SyncOrchestrator>> {
    let Some(ref url) = config.settings.remote_url else {
        bail!("No sync server configured. Run `stride login <user-id> --remote <url>` first");
    };
    let remote = HttpRemoteStore::new(url, config.settings.api_key.clone())?;
    let orchestrator = SyncOrchestrator::load(
        config.settings.sync.clone(),
        service.session().clone(),
        Arc::new(service.database().clone()),
        Arc::new(remote),
    )
    .await?;
    Ok(Arc::new(orchestrator))
}

pub(crate) struct LoginArgs {
    pub user_id: String,
    pub remote: Option<String>,
    pub api_key: Option<String>,
    pub no_sync: bool,
}

pub(crate) async fn cmd_login(
    config: &mut Config,
    service: &StrideService,
    args: LoginArgs,
    json: bool,
) -> Result<()> {
    let user_id = args.user_id.trim().to_string();
    if user_id.is_empty() {
        bail!("User id must not be empty");
    }

    let mut events = service.session().subscribe();
    service.session().sign_in(&user_id);

    config.settings.user_id = Some(user_id.clone());
    if let Some(url) = args.remote {
        config.settings.remote_url = Some(url);
    }
    if let Some(key) = args.api_key {
        config.settings.api_key = Some(key);
    }
    config.save()?;

    if !json {
        println!("Signed in as {user_id}");
    }

    if args.no_sync || config.settings.remote_url.is_none() {
        if json {
            println!("{}", serde_json::json!({ "user_id": user_id, "synced": false }));
        } else if config.settings.remote_url.is_none() {
            eprintln!("No sync server configured; entries stay local until you add one with --remote.");
        }
        return Ok(());
    }

    let orchestrator = build_orchestrator(config, service).await?;
    let trigger = AutoSyncTrigger::new(Arc::clone(&orchestrator));

    let mut scheduled = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => scheduled.extend(trigger.on_session_event(&event)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    if scheduled.is_empty() {
        // Same user as before: no session change, sync anyway
        scheduled.push(orchestrator.schedule_full_sync());
    }

    let mut report = None;
    for handle in scheduled {
        match wait_for(handle).await {
            Ok(Some(done)) => report = Some(done),
            Ok(None) => {}
            Err(e) => eprintln!("Warning: initial sync failed: {e:#}"),
        }
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "user_id": user_id,
                "synced": report.is_some(),
                "report": report,
            }))?
        );
    } else if let Some(ref report) = report {
        print_full_report(report);
    }
    Ok(())
}

pub(crate) async fn cmd_logout(
    config: &mut Config,
    service: &StrideService,
    json: bool,
) -> Result<()> {
    let Some(user_id) = service.session().current_user() else {
        if json {
            println!("{}", serde_json::json!({ "signed_out": null }));
        } else {
            eprintln!("Not signed in");
        }
        return Ok(());
    };

    let pending = service.pending_counts().await?;
    if !pending.is_clean() && !json {
        eprintln!(
            "Warning: {} unsynced change(s) stay on this device until {user_id} signs in again",
            pending_total(pending.profile, pending.meals, pending.weights)
        );
    }

    service.session().sign_out();
    service.database().lock().delete_setting(LAST_FULL_SYNC_KEY)?;
    config.settings.user_id = None;
    config.save()?;

    if json {
        println!("{}", serde_json::json!({ "signed_out": user_id }));
    } else {
        println!("Signed out {user_id}");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncMode {
    Full,
    PushOnly,
    PullOnly,
}

pub(crate) async fn cmd_sync(
    config: &Config,
    service: &StrideService,
    mode: SyncMode,
    json: bool,
) -> Result<()> {
    let orchestrator = build_orchestrator(config, service).await?;

    match mode {
        SyncMode::Full => {
            let SyncRun::Completed(report) = orchestrator.start_full_sync().await? else {
                return already_running(json);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_full_report(&report);
            }
        }
        SyncMode::PushOnly => {
            let SyncRun::Completed(report) = orchestrator.push_only().await? else {
                return already_running(json);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_push_report(&report);
            }
        }
        SyncMode::PullOnly => {
            let SyncRun::Completed(outcome) = orchestrator.pull_only().await? else {
                return already_running(json);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_pull_outcome(outcome);
            }
        }
    }
    Ok(())
}

pub(crate) async fn cmd_status(
    config: &Config,
    service: &StrideService,
    no_sync: bool,
    json: bool,
) -> Result<()> {
    let user_id = service.session().current_user();

    let mut last_sync = stored_last_sync(service)?;
    let mut sync_error = None;
    if !no_sync && user_id.is_some() && config.settings.remote_url.is_some() {
        let orchestrator = build_orchestrator(config, service).await?;
        let trigger = AutoSyncTrigger::new(Arc::clone(&orchestrator));
        if let Some(handle) = trigger.on_settings_opened() {
            if !json {
                eprintln!("Last sync is stale, syncing...");
            }
            if let Err(e) = wait_for(handle).await {
                sync_error = Some(format!("{e:#}"));
            }
        }
        last_sync = orchestrator.snapshot().last_sync_date;
    }
    let pending = match user_id {
        Some(_) => Some(service.pending_counts().await?),
        None => None,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "user_id": user_id,
                "remote_url": config.settings.remote_url,
                "last_sync_date": last_sync,
                "pending": pending,
                "sync_error": sync_error,
            }))?
        );
        return Ok(());
    }

    println!("  User:       {}", user_id.as_deref().unwrap_or("(not signed in)"));
    println!(
        "  Server:     {}",
        config.settings.remote_url.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Last sync:  {}",
        last_sync.map_or("never".to_string(), |at| at.format("%Y-%m-%d %H:%M UTC").to_string())
    );
    if let Some(p) = pending {
        let profile = if p.profile { "pending" } else { "synced" };
        println!("  Profile:    {profile}");
        println!("  Meals:      {} pending", p.meals);
        println!("  Weights:    {} pending", p.weights);
    }
    if let Some(e) = sync_error {
        eprintln!("Warning: sync failed: {e}");
    }
    Ok(())
}

/// Await a scheduled sync. `Ok(None)` means another sync was already running.
async fn wait_for(handle: ScheduledSync) -> Result<Option<FullSyncReport>> {
    match handle.await.context("Sync task stopped unexpectedly")?? {
        SyncRun::Completed(report) => Ok(Some(report)),
        SyncRun::AlreadyRunning => Ok(None),
    }
}

fn stored_last_sync(service: &StrideService) -> Result<Option<DateTime<Utc>>> {
    let raw = service.database().lock().get_setting(LAST_FULL_SYNC_KEY)?;
    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|at| at.with_timezone(&Utc)))
}

fn already_running(json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::json!({ "status": "already_running" }));
    } else {
        eprintln!("A sync is already running");
    }
    Ok(())
}

fn pending_total(profile: bool, meals: usize, weights: usize) -> usize {
    usize::from(profile) + meals + weights
}

fn print_full_report(report: &FullSyncReport) {
    print_pull_outcome(report.pull);
    print_push_report(&report.push);
    println!("Sync complete");
}

fn print_pull_outcome(outcome: PullOutcome) {
    match outcome {
        PullOutcome::NoRemoteDocument => println!("Pulled: no profile on the server yet"),
        PullOutcome::Merged {
            created: true,
            changed_fields,
        } => println!("Pulled: profile created ({changed_fields} fields)"),
        PullOutcome::Merged { changed_fields, .. } => {
            println!("Pulled: {changed_fields} profile field(s) updated");
        }
    }
}

fn print_push_report(report: &PushReport) {
    if report.profile_uploaded {
        println!("Pushed: profile");
    }
    print_kind("meals", &report.meals);
    print_kind("weights", &report.weights);
}

fn print_kind(label: &str, kind: &KindReport) {
    if kind.attempted == 0 {
        return;
    }
    println!("Pushed: {}/{} {label}", kind.uploaded, kind.attempted);
    if let Some(ref e) = kind.last_error {
        eprintln!("  {} failed, last error: {e}", kind.failed);
    }
}
