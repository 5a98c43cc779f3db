pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pull;
pub mod push;
pub mod service;
pub mod session;
pub mod store;
pub mod tracker;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use orchestrator::{SyncOrchestrator, SyncRun, SyncSnapshot, SyncStatus};
pub use service::StrideService;
pub use session::{Session, SessionEvent};
pub use trigger::AutoSyncTrigger;
