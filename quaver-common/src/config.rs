//! Configuration loading and runtime directory resolution
//!
//! Configuration is resolved in priority order:
//! 1. Explicit path passed on the command line (highest priority)
//! 2. `QUAVER_CONFIG` environment variable
//! 3. Platform config directory (`~/.config/quaver/config.toml` on Linux)
//! 4. Compiled defaults (fallback)
//!
//! A missing config file at the default locations is not an error; a file
//! named explicitly that cannot be read or parsed is.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

fn default_use_mmap() -> bool {
    true
}

fn default_output_buffer_kb() -> usize {
    512
}

fn default_tag_sync_interval() -> u32 {
    8
}

/// Built-in preference table, consulted before registration order. Users
/// override it entirely by setting `preferred_decoders`.
fn default_preferred_decoders() -> Vec<String> {
    vec![
        "mp3(symphonia,*)".to_string(),
        "ogg(symphonia,*)".to_string(),
        "flac(symphonia,*)".to_string(),
        "noise(noise,*)".to_string(),
    ]
}

/// Player configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root folder scanned for music files
    pub music_dir: Option<PathBuf>,

    /// Directory holding the persistent tag cache store
    pub cache_dir: Option<PathBuf>,

    /// Allow the memory-mapped read path for local files
    #[serde(default = "default_use_mmap")]
    pub use_mmap: bool,

    /// Output buffer capacity in KiB
    #[serde(default = "default_output_buffer_kb")]
    pub output_buffer_kb: usize,

    /// Force a durability sync after this many tag cache writes
    #[serde(default = "default_tag_sync_interval")]
    pub tag_sync_interval: u32,

    /// Decoder preference entries, e.g. `"ogg(vorbis,*)"` or
    /// `"audio/mpeg(mp3)"`. Consulted before registration order.
    #[serde(default = "default_preferred_decoders")]
    pub preferred_decoders: Vec<String>,

    /// Audio output device name (None = system default)
    pub audio_device: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            music_dir: None,
            cache_dir: None,
            use_mmap: default_use_mmap(),
            output_buffer_kb: default_output_buffer_kb(),
            tag_sync_interval: default_tag_sync_interval(),
            preferred_decoders: default_preferred_decoders(),
            audio_device: None,
        }
    }
}

impl Config {
    /// Load configuration following the priority order documented above.
    ///
    /// `cli_path` is the `--config` argument if the user passed one. An
    /// explicitly named file must exist and parse; default locations fall
    /// through to compiled defaults when absent.
    pub fn load(cli_path: Option<&Path>) -> Result<Config> {
        if let Some(path) = cli_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("QUAVER_CONFIG") {
            return Self::from_file(Path::new(&path));
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        debug!("No config file found, using compiled defaults");
        Ok(Config::default())
    }

    /// Parse a specific config file.
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&text)?;
        debug!("Loaded config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.output_buffer_kb == 0 {
            return Err(Error::Config(
                "output_buffer_kb must be non-zero".to_string(),
            ));
        }
        if self.tag_sync_interval == 0 {
            return Err(Error::Config(
                "tag_sync_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the tag cache directory: explicit setting, then the platform
    /// cache directory, then a dot-directory next to the working directory.
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .map(|d| d.join("quaver"))
            .unwrap_or_else(|| PathBuf::from(".quaver-cache"))
    }
}

/// Default configuration file path for the platform
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("quaver").join("config.toml"))
}
