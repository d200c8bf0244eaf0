//! Shared error types.

use thiserror::Error;

/// Malformed environment or configuration at startup. Fatal: binaries log
/// it and exit with code 2.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },
}

/// Exit code for unrecoverable startup errors.
pub const EXIT_CONFIG: i32 = 2;
