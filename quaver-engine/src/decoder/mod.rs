//! Codec plugin contract
//!
//! A [`Decoder`] is a stateless factory and matcher for one codec family; a
//! [`Codec`] is the stateful decoding session it produces for a single file
//! or stream. The core consumes plugins only through these traits — no
//! plugin error ever crosses the boundary as a panic.
//!
//! Error discipline for sessions: a [`CodecError`] is either `Stream`
//! (recoverable — the caller drops the bad frame and keeps decoding) or
//! `Fatal` (this Codec must not be asked to decode again). Implementations
//! keep the last error as a sticky value, cleared at the top of every
//! `decode` call, and re-report the fatal one if `decode` is called after a
//! fatal failure.

pub mod noise;
pub mod registry;
pub mod symphonia;

pub use registry::DecoderRegistry;

use crate::audio::SoundParams;
use crate::io::InputStream;
use crate::tags::Tags;
use std::path::Path;
use thiserror::Error;

/// How bad a codec error is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// A bad frame or similar; drop it and continue decoding
    Stream,
    /// The session is dead; it must not decode again
    Fatal,
}

/// Error produced by a decoding session or a plugin open
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CodecError {
    pub severity: ErrorSeverity,
    pub message: String,
}

impl CodecError {
    pub fn stream(message: impl Into<String>) -> Self {
        Self {
            severity: ErrorSeverity::Stream,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            severity: ErrorSeverity::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}

/// Result of one decode call: PCM was produced, or the stream ended.
///
/// The sum type keeps "zero bytes" and "error" unambiguous — there is no
/// byte count that doubles as an error code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeOutcome {
    /// `bytes` of PCM were written to the caller's buffer; `params`
    /// describes them and is filled on every such return
    Pcm { bytes: usize, params: SoundParams },
    /// End of stream; the session stays valid for seeks
    Eof,
}

/// Stateful decoding session for one file or stream.
///
/// Lifetime: one playback or tag-scan session. Dropped when the track ends.
pub trait Codec: Send {
    /// Decode the next chunk of PCM into `buf`.
    ///
    /// Clears the sticky error first. After a `Fatal` error this returns
    /// that same error without touching the native decoder again.
    fn decode(&mut self, buf: &mut [u8]) -> std::result::Result<DecodeOutcome, CodecError>;

    /// Seek to `seconds` from the start; returns the position actually
    /// reached, or None when this session cannot seek (non-fatal).
    fn seek(&mut self, _seconds: f64) -> Option<f64> {
        None
    }

    /// Momentary bitrate in kbps, or -1 when unknown
    fn bit_rate(&self) -> i32 {
        -1
    }

    /// Average bitrate in kbps, or -1 when unknown
    fn avg_bit_rate(&self) -> i32 {
        -1
    }

    /// Total duration in seconds, or -1 when unknown
    fn duration(&self) -> i32 {
        -1
    }

    /// Tags that arrived mid-stream (network radio), if they changed since
    /// the last call. None means unchanged or unsupported.
    fn current_tags(&mut self) -> Option<Tags> {
        None
    }

    /// The sticky error from the most recent failed operation
    fn last_error(&self) -> Option<&CodecError> {
        None
    }
}

/// Stateless plugin that recognizes and opens one codec family
pub trait Decoder: Send + Sync {
    /// Short unique name used in preference entries and diagnostics
    fn name(&self) -> &'static str;

    /// True when this plugin handles files with this extension
    /// (lowercase, without the dot)
    fn matches_ext(&self, ext: &str) -> bool;

    /// True when this plugin handles this normalized MIME type+subtype
    fn matches_mime(&self, _mime: &str) -> bool {
        false
    }

    /// Content probe: peek at the stream's leading bytes and report whether
    /// they look like this family. Must not consume from the stream.
    fn can_decode(&self, _stream: &InputStream) -> bool {
        false
    }

    /// Open a decoding session for a local file
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn Codec>, CodecError>;

    /// Open a decoding session over an already-open stream, taking
    /// ownership of it. Optional; network playback needs it.
    fn open_stream(
        &self,
        _stream: InputStream,
    ) -> std::result::Result<Box<dyn Codec>, CodecError> {
        Err(CodecError::fatal(format!(
            "{} cannot decode from a stream",
            self.name()
        )))
    }

    /// Read tags without starting playback. None when the file has none or
    /// they cannot be read.
    fn read_tags(&self, _path: &Path) -> Option<Tags> {
        None
    }

    /// Duration in seconds without starting playback, or -1 when unknown
    fn duration(&self, _path: &Path) -> i32 {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_split() {
        assert!(!CodecError::stream("bad frame").is_fatal());
        assert!(CodecError::fatal("handle died").is_fatal());
        assert_eq!(CodecError::stream("bad frame").to_string(), "bad frame");
    }
}
