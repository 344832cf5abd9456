//! Backup Engine Library
//!
//! Scheduling, snapshot transfer, retention and restore for vector-database
//! collections. External systems are reached only through the traits in
//! [`ports`]; the operator binary supplies the concrete adapters.

pub mod config;
pub mod models;
pub mod orchestrator;
pub mod ports;
pub mod retention;
pub mod schedule;
pub mod store;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{EngineConfig, RetryConfig};
pub use orchestrator::{BackupOrchestrator, Collaborators, RestoreOrchestrator};
pub use schedule::{CronSchedule, ScheduleCoordinator};
pub use utils::errors::{EngineError, ErrorKind, Result};
pub use utils::logger;
