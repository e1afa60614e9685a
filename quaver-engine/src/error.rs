//! Error types for quaver-engine
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Decoder-session errors live in [`crate::decoder::CodecError`]
//! because their recoverable/fatal split follows the plugin contract rather
//! than this taxonomy.

use thiserror::Error;

/// Main error type for quaver-engine
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input stream transport errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// No decoder accepted the file or stream
    #[error("No decoder for {0}")]
    NoDecoder(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Tag store engine errors
    #[error("Tag store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A persisted tag record failed to deserialize
    #[error("Corrupt tag record: {0}")]
    CorruptRecord(String),

    /// Invalid state for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Convenience Result type using quaver-engine Error
pub type Result<T> = std::result::Result<T, Error>;
