//! Startup cleanup of work a previous process left unfinished.

use crate::state::AppState;
use backup_engine::Result;
use tracing::{info, warn};

const INTERRUPTED_RESTORE: &str = "restore interrupted by an operator restart";

/// Fail backups and restores still recorded as running. Must run before the
/// ticker or the API can start new work.
pub async fn recover_interrupted(state: &AppState) -> Result<()> {
    let backups = state.backups.fail_interrupted().await?;
    if !backups.is_empty() {
        warn!(count = backups.len(), "Failed backups interrupted by the last shutdown");
    }

    let restores = state.records.fail_running_restores(INTERRUPTED_RESTORE).await?;
    if !restores.is_empty() {
        warn!(count = restores.len(), "Failed restores interrupted by the last shutdown");
    }

    info!("Startup recovery finished");
    Ok(())
}
