//! Record and blob store implementations kept inside the engine.

pub mod memory;

use crate::models::BackupRecord;
use crate::utils::errors::{EngineError, Result};

/// Check that replacing `current` with `next` keeps the phase monotonic and
/// leaves terminal records untouched.
pub fn check_update(current: &BackupRecord, next: &BackupRecord) -> Result<()> {
    if current.phase.is_terminal() && current != next {
        return Err(EngineError::Store(format!(
            "backup {} is already {} and cannot change",
            current.id, current.phase
        )));
    }
    if !current.phase.can_transition_to(next.phase) {
        return Err(EngineError::Store(format!(
            "backup {} cannot move from {} to {}",
            current.id, current.phase, next.phase
        )));
    }
    Ok(())
}

/// True if `key` sits under the directory-like `prefix`. An empty prefix matches everything.
pub fn key_in_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    prefix.is_empty()
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
