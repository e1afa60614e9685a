//! Playback decode loop
//!
//! Ties the pieces together: the registry picks a decoder for a track, the
//! decoder opens a session, and this loop pumps PCM into the output
//! buffer, watching for format changes between decode calls and applying
//! the error taxonomy — recoverable stream errors are dropped with a
//! diagnostic and decoding continues, fatal errors end the track, and an
//! unreadable or unsupported file is skipped so the rest of the queue
//! plays on.
//!
//! Tag lookups consult the cache under the per-key lock before falling
//! back to the decoder's tag reader; a refreshed record keeps the user's
//! rating from the record it replaces.

use crate::audio::{OutputBuffer, SoundParams};
use crate::decoder::{DecodeOutcome, DecoderRegistry};
use crate::tags::{file_mtime, TagCache, TagRecord, Tags};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of one decode request to a codec
const DECODE_CHUNK: usize = 16 * 1024;

/// How playback of one track ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The track played to its end
    Finished,
    /// The output buffer was stopped underneath us
    Stopped,
}

/// Decode-loop driver for a queue of tracks
pub struct Player {
    registry: Arc<DecoderRegistry>,
    cache: Option<Arc<TagCache>>,
}

impl Player {
    pub fn new(registry: Arc<DecoderRegistry>, cache: Option<Arc<TagCache>>) -> Self {
        Self { registry, cache }
    }

    /// Decode one file into the output buffer, blocking until the track
    /// finished, failed, or the buffer was stopped.
    pub fn play_file(&self, path: &Path, out: &OutputBuffer) -> Result<PlayOutcome> {
        let decoder = self
            .registry
            .find(None, Some(path), None)
            .ok_or_else(|| Error::NoDecoder(path.display().to_string()))?;
        debug!("Playing {} via {}", path.display(), decoder.name());

        let mut codec = decoder
            .open(path)
            .map_err(|e| Error::Stream(format!("cannot open {}: {}", path.display(), e)))?;

        let mut chunk = vec![0u8; DECODE_CHUNK];
        let mut current: Option<SoundParams> = None;

        loop {
            match codec.decode(&mut chunk) {
                Ok(DecodeOutcome::Pcm { bytes, params }) => {
                    if bytes == 0 {
                        continue;
                    }
                    if current != Some(params) {
                        if current.is_some() {
                            // Let old-format audio leave the buffer before
                            // the device is reconfigured
                            out.wait_drained();
                        }
                        out.set_params(params);
                        current = Some(params);
                    }
                    if !out.write(&chunk[..bytes]) {
                        debug!("Playback of {} stopped", path.display());
                        return Ok(PlayOutcome::Stopped);
                    }
                }
                Ok(DecodeOutcome::Eof) => break,
                Err(e) if !e.is_fatal() => {
                    warn!("Dropping bad audio in {}: {}", path.display(), e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::Stream(format!(
                        "fatal decode error in {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        out.wait_drained();
        Ok(PlayOutcome::Finished)
    }

    /// Play a queue in order. A track that cannot be played is skipped
    /// with a diagnostic; a stop ends the queue. Returns how many tracks
    /// played to completion.
    pub fn play_queue(&self, paths: &[PathBuf], out: &OutputBuffer) -> usize {
        let mut finished = 0;
        for path in paths {
            match self.play_file(path, out) {
                Ok(PlayOutcome::Finished) => finished += 1,
                Ok(PlayOutcome::Stopped) => break,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                }
            }
        }
        info!("Queue done: {}/{} tracks played", finished, paths.len());
        finished
    }

    /// Tags for a file, through the cache when one is configured.
    ///
    /// Holds the per-key lock across the read-check-write so a concurrent
    /// library scan and a playback-tag refresh of the same file cannot
    /// interleave.
    pub fn tags_for(&self, path: &Path) -> Result<Tags> {
        let Some(cache) = &self.cache else {
            return Ok(self.read_file_tags(path));
        };

        let key = TagCache::key_for(path);
        let _guard = cache.lock(&key);

        let mtime = file_mtime(path)?;
        let previous = match cache.get(&key) {
            Ok(record) => record,
            Err(e) => {
                warn!("Tag cache lookup for {} failed ({}), treating as miss", key, e);
                None
            }
        };
        if let Some(record) = &previous {
            if record.mtime == mtime {
                return Ok(record.tags.clone());
            }
        }

        let tags = self.read_file_tags(path);
        let record = TagRecord {
            mtime,
            tags: tags.clone(),
            rating: previous.map(|r| r.rating).unwrap_or(0),
        };
        if let Err(e) = cache.add(&key, &record) {
            warn!("Tag cache update for {} failed: {}", key, e);
        }
        Ok(tags)
    }

    /// Drop a vanished file's cache entry
    pub fn forget_file(&self, path: &Path) -> Result<()> {
        if let Some(cache) = &self.cache {
            let key = TagCache::key_for(path);
            let _guard = cache.lock(&key);
            cache.remove(&key)?;
        }
        Ok(())
    }

    fn read_file_tags(&self, path: &Path) -> Tags {
        let Some(decoder) = self.registry.find(None, Some(path), None) else {
            return Tags::default();
        };
        let mut tags = decoder.read_tags(path).unwrap_or_default();
        if tags.duration < 0 {
            tags.duration = decoder.duration(path);
        }
        tags
    }
}
