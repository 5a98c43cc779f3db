mod commands;
mod config;
mod remote;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    LoginArgs, MealArgs, SyncMode, cmd_login, cmd_logout, cmd_meal_delete, cmd_meal_list,
    cmd_meal_log, cmd_profile_set, cmd_profile_show, cmd_status, cmd_summary, cmd_sync,
    cmd_weight_delete, cmd_weight_history, cmd_weight_log,
};
use crate::config::Config;
use stride_core::documents::DocumentStore;
use stride_core::models::ProfileUpdate;
use stride_core::{Session, StrideService};

#[derive(Parser)]
#[command(
    name = "stride",
    version,
    about = "A local-first fitness tracker that syncs in the background"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and run an initial sync
    Login {
        /// Account id to sign in as
        user_id: String,
        /// Base URL of the sync server (e.g. http://127.0.0.1:8080)
        #[arg(long)]
        remote: Option<String>,
        /// API key for the sync server
        #[arg(long)]
        api_key: Option<String>,
        /// Sign in without syncing
        #[arg(long)]
        no_sync: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign out. Unsynced entries stay on this device
    Logout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or edit the profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Log, list and delete meals
    Meal {
        #[command(subcommand)]
        command: MealCommands,
    },
    /// Track body weight
    Weight {
        #[command(subcommand)]
        command: WeightCommands,
    },
    /// Show the meals and macro totals for a day
    Summary {
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pull the profile then push local changes
    Sync {
        /// Only upload local changes
        #[arg(long, conflicts_with = "pull_only")]
        push_only: bool,
        /// Only download the profile
        #[arg(long)]
        pull_only: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync status. Syncs first when the last sync is stale
    Status {
        /// Never start a sync
        #[arg(long)]
        no_sync: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the document server other devices sync against
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the local profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update profile fields. Unset flags are left alone
    Set {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// male, female or other
        #[arg(long)]
        gender: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        birth_date: Option<String>,
        /// Height in cm
        #[arg(long)]
        height: Option<f64>,
        /// Weight in kg
        #[arg(long)]
        weight: Option<f64>,
        /// Target weight in kg
        #[arg(long)]
        target_weight: Option<f64>,
        /// lose, maintain or gain
        #[arg(long)]
        goal: Option<String>,
        /// sedentary, light, moderate, active or `very_active`
        #[arg(long)]
        activity: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MealCommands {
    /// Log a meal
    Log {
        /// Food name
        food: String,
        /// Calories per serving
        #[arg(long)]
        calories: f64,
        /// Protein per serving (g)
        #[arg(long, default_value = "0")]
        protein: f64,
        /// Carbs per serving (g)
        #[arg(long, default_value = "0")]
        carbs: f64,
        /// Fat per serving (g)
        #[arg(long, default_value = "0")]
        fat: f64,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long, default_value = "snack")]
        meal: String,
        /// Number of servings
        #[arg(short, long, default_value = "1")]
        quantity: f64,
        /// Date to log for (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List meals, optionally for one day
    List {
        /// Date (YYYY-MM-DD, today, yesterday)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a meal by id (a unique prefix is enough)
    Delete {
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WeightCommands {
    /// Log a weight entry
    Log {
        /// Weight value
        value: f64,
        /// Unit: kg or lbs
        #[arg(short, long, default_value = "kg")]
        unit: String,
        /// Date (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show weight history, newest first
    History {
        /// Number of entries to show
        #[arg(short = 'n', long)]
        limit: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a weight entry by id (a unique prefix is enough)
    Delete {
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRIDE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                let (key, created) = config.load_or_create_api_key()?;
                if created {
                    eprintln!(
                        "Generated a new API key. Pass it to `stride login --api-key` on each device."
                    );
                }
                Some(key)
            };
            let store = DocumentStore::open(&config.server_db_path())?;
            server::start_server(store, port, &bind, api_key).await
        }
        command => run_local(config, command).await,
    }
}

/// Commands that work against the local database.
#[allow(clippy::too_many_lines)]
async fn run_local(mut config: Config, command: Commands) -> Result<()> {
    let session = match config.settings.user_id {
        Some(ref user_id) => Session::signed_in(user_id),
        None => Session::new(),
    };
    let service = StrideService::new(&config.db_path, session)?;

    match command {
        Commands::Login {
            user_id,
            remote,
            api_key,
            no_sync,
            json,
        } => {
            let args = LoginArgs {
                user_id,
                remote,
                api_key,
                no_sync,
            };
            cmd_login(&mut config, &service, args, json).await
        }
        Commands::Logout { json } => cmd_logout(&mut config, &service, json).await,
        Commands::Profile { command } => match command {
            ProfileCommands::Show { json } => cmd_profile_show(&service, json),
            ProfileCommands::Set {
                name,
                email,
                gender,
                birth_date,
                height,
                weight,
                target_weight,
                goal,
                activity,
                json,
            } => {
                let update = ProfileUpdate {
                    name,
                    email,
                    gender,
                    birth_date: None,
                    height,
                    weight,
                    target_weight,
                    goal,
                    activity_level: activity,
                };
                cmd_profile_set(&service, update, birth_date, json)
            }
        },
        Commands::Meal { command } => match command {
            MealCommands::Log {
                food,
                calories,
                protein,
                carbs,
                fat,
                meal,
                quantity,
                date,
                json,
            } => {
                let args = MealArgs {
                    food,
                    calories,
                    protein,
                    carbs,
                    fat,
                    meal,
                    quantity,
                    date,
                };
                cmd_meal_log(&service, args, json)
            }
            MealCommands::List { date, json } => cmd_meal_list(&service, date, json),
            MealCommands::Delete { id, json } => cmd_meal_delete(&service, &id, json),
        },
        Commands::Weight { command } => match command {
            WeightCommands::Log {
                value,
                unit,
                date,
                json,
            } => cmd_weight_log(&service, value, &unit, date, json),
            WeightCommands::History { limit, json } => cmd_weight_history(&service, limit, json),
            WeightCommands::Delete { id, json } => cmd_weight_delete(&service, &id, json),
        },
        Commands::Summary { date, json } => cmd_summary(&service, date, json),
        Commands::Sync {
            push_only,
            pull_only,
            json,
        } => {
            let mode = if push_only {
                SyncMode::PushOnly
            } else if pull_only {
                SyncMode::PullOnly
            } else {
                SyncMode::Full
            };
            cmd_sync(&config, &service, mode, json).await
        }
        Commands::Status { no_sync, json } => cmd_status(&config, &service, no_sync, json).await,
        Commands::Serve { .. } => Ok(()),
    }
}
