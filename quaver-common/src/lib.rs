//! # Quaver Common (quaver-common)
//!
//! Shared configuration and process plumbing for the Quaver music player.
//!
//! **Purpose:** Configuration loading with the CLI > environment > config
//! file > compiled default priority order, plus the process-wide role flag
//! that steers fatal-error reporting.

pub mod config;
pub mod error;
pub mod role;

pub use config::Config;
pub use error::{Error, Result};
pub use role::ProcessRole;
