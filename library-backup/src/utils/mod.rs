//! Utility modules for the library backup.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
