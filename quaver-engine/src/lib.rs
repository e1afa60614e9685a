//! # Quaver Engine (quaver-engine)
//!
//! Streaming and caching core of the Quaver terminal music player.
//!
//! **Purpose:** Move decoded PCM from codec plugins to the audio device
//! without underruns, and cache per-file tags so large libraries browse
//! instantly.
//!
//! **Architecture:** Synchronous pipeline — the decode thread pulls bytes
//! through an [`io::InputStream`], a plugin selected by the
//! [`decoder::DecoderRegistry`] turns them into PCM, and
//! [`audio::OutputBuffer`]'s consumer thread drains that PCM to the device
//! at real-time pace. Tag lookups go through [`tags::TagCache`] before
//! falling back to a decoder's tag reader.

pub mod audio;
pub mod decoder;
pub mod error;
pub mod io;
pub mod player;
pub mod tags;

pub use error::{Error, Result};
