//! Error types for quaver-common
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for quaver-common
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed TOML in a configuration file
    #[error("Configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using quaver-common Error
pub type Result<T> = std::result::Result<T, Error>;
