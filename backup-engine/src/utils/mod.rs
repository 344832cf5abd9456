//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;

pub use errors::{EngineError, ErrorKind, Result};

/// Format a byte count as a human-readable size (`1.5MB`).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", size, UNITS[unit])
}
