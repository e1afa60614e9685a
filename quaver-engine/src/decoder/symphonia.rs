//! Symphonia-backed decoder family
//!
//! One plugin covering the formats symphonia decodes for us (MP3, FLAC,
//! Ogg/Vorbis, AAC/M4A, WAV). Playback pulls bytes through an
//! [`InputStream`] adapted to symphonia's `MediaSource`, so the
//! descriptor/mmap/live distinction stays invisible here too.
//!
//! Error mapping follows the session contract: a bad packet is a `Stream`
//! error (the caller drops it and keeps going, and this codec resumes at
//! the next packet), anything that invalidates the native decoder state is
//! `Fatal`.

use crate::audio::{SampleFormat, SoundParams};
use crate::decoder::{Codec, CodecError, DecodeOutcome, Decoder};
use crate::io::InputStream;
use crate::tags::Tags;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, warn};

/// Adapter exposing an [`InputStream`] as a symphonia `MediaSource`
struct StreamSource {
    stream: InputStream,
}

impl std::io::Read for StreamSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream
            .read(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

impl std::io::Seek for StreamSource {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.stream
            .seek(pos)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

impl MediaSource for StreamSource {
    fn is_seekable(&self) -> bool {
        self.stream.is_seekable()
    }

    fn byte_len(&self) -> Option<u64> {
        let size = self.stream.file_size();
        (size >= 0).then_some(size as u64)
    }
}

/// The symphonia-backed codec family
pub struct SymphoniaDecoder {
    use_mmap: bool,
}

impl SymphoniaDecoder {
    /// `use_mmap` enables the memory-mapped read path for local files
    /// (the config's `use_mmap` switch).
    pub fn new(use_mmap: bool) -> Self {
        Self { use_mmap }
    }

    fn probe(
        stream: InputStream,
        hint: Hint,
    ) -> Result<symphonia::core::probe::ProbeResult, CodecError> {
        let mss = MediaSourceStream::new(Box::new(StreamSource { stream }), Default::default());
        symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| CodecError::fatal(format!("unrecognized format: {}", e)))
    }

    fn hint_for_path(path: &Path) -> Hint {
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        hint
    }

    fn open_probed(
        probed: symphonia::core::probe::ProbeResult,
        byte_len: Option<u64>,
    ) -> Result<Box<dyn Codec>, CodecError> {
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| CodecError::fatal("no audio track found"))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let rate = codec_params
            .sample_rate
            .ok_or_else(|| CodecError::fatal("sample rate not reported"))?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| CodecError::fatal("channel count not reported"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| CodecError::fatal(format!("cannot create decoder: {}", e)))?;

        debug!("Opened symphonia session: {} ch / {} Hz", channels, rate);

        Ok(Box::new(SymphoniaCodec {
            format,
            decoder,
            track_id,
            params: SoundParams::new(channels, rate, SampleFormat::F32Le),
            time_base: codec_params.time_base,
            n_frames: codec_params.n_frames,
            byte_len,
            pending: Vec::new(),
            error: None,
        }))
    }
}

impl Decoder for SymphoniaDecoder {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn matches_ext(&self, ext: &str) -> bool {
        matches!(
            ext,
            "mp3" | "mp2" | "flac" | "ogg" | "oga" | "m4a" | "mp4" | "aac" | "wav" | "wave"
        )
    }

    fn matches_mime(&self, mime: &str) -> bool {
        matches!(
            mime,
            "audio/mpeg"
                | "audio/mp3"
                | "audio/flac"
                | "audio/ogg"
                | "application/ogg"
                | "audio/vorbis"
                | "audio/aac"
                | "audio/aacp"
                | "audio/mp4"
                | "audio/m4a"
                | "audio/wav"
                | "audio/wave"
        )
    }

    fn can_decode(&self, stream: &InputStream) -> bool {
        let mut lead = [0u8; 12];
        let Ok(n) = stream.peek(&mut lead) else {
            return false;
        };
        if n < 12 {
            return false;
        }
        // FLAC, Ogg, RIFF/WAVE, ID3-tagged or bare MP3, ISO-BMFF (ftyp)
        &lead[..4] == b"fLaC"
            || &lead[..4] == b"OggS"
            || (&lead[..4] == b"RIFF" && &lead[8..12] == b"WAVE")
            || &lead[..3] == b"ID3"
            || (lead[0] == 0xFF && lead[1] & 0xE0 == 0xE0)
            || &lead[4..8] == b"ftyp"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Codec>, CodecError> {
        let stream = InputStream::open(path, self.use_mmap)
            .map_err(|e| CodecError::fatal(format!("cannot open {}: {}", path.display(), e)))?;
        let byte_len = stream.file_size();
        let probed = Self::probe(stream, Self::hint_for_path(path))?;
        Self::open_probed(probed, (byte_len >= 0).then_some(byte_len as u64))
    }

    fn open_stream(&self, stream: InputStream) -> Result<Box<dyn Codec>, CodecError> {
        let mut hint = Hint::new();
        if let Some(mime) = stream.mime() {
            hint.mime_type(mime);
        }
        let byte_len = stream.file_size();
        let probed = Self::probe(stream, hint)?;
        Self::open_probed(probed, (byte_len >= 0).then_some(byte_len as u64))
    }

    fn read_tags(&self, path: &Path) -> Option<Tags> {
        let stream = InputStream::open(path, self.use_mmap).ok()?;
        let mut probed = Self::probe(stream, Self::hint_for_path(path)).ok()?;

        let mut tags = Tags::default();
        let mut found = false;

        // Container-level metadata (Vorbis comments, FLAC blocks) lives on
        // the format reader; probe-time metadata (ID3v2) on the probe result
        if let Some(rev) = probed.format.metadata().current() {
            found |= collect_tags(rev, &mut tags);
        }
        if !found {
            if let Some(meta) = probed.metadata.get() {
                if let Some(rev) = meta.current() {
                    found |= collect_tags(rev, &mut tags);
                }
            }
        }

        tags.duration = duration_of(probed.format.as_ref());
        if found || tags.duration >= 0 {
            Some(tags)
        } else {
            None
        }
    }

    fn duration(&self, path: &Path) -> i32 {
        let Ok(stream) = InputStream::open(path, self.use_mmap) else {
            return -1;
        };
        match Self::probe(stream, Self::hint_for_path(path)) {
            Ok(probed) => duration_of(probed.format.as_ref()),
            Err(_) => -1,
        }
    }
}

fn duration_of(format: &dyn FormatReader) -> i32 {
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL);
    let Some(track) = track else {
        return -1;
    };
    match (track.codec_params.n_frames, track.codec_params.sample_rate) {
        (Some(frames), Some(rate)) if rate > 0 => (frames / rate as u64) as i32,
        _ => -1,
    }
}

fn collect_tags(rev: &MetadataRevision, tags: &mut Tags) -> bool {
    let mut found = false;
    for tag in rev.tags() {
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => {
                tags.title = tag.value.to_string();
                found = true;
            }
            Some(StandardTagKey::Artist) => {
                tags.artist = tag.value.to_string();
                found = true;
            }
            Some(StandardTagKey::Album) => {
                tags.album = tag.value.to_string();
                found = true;
            }
            Some(StandardTagKey::TrackNumber) => {
                // "7" or "7/12"
                let text = tag.value.to_string();
                if let Some(n) = text.split('/').next().and_then(|s| s.trim().parse().ok()) {
                    tags.track = n;
                    found = true;
                }
            }
            _ => {}
        }
    }
    found
}

struct SymphoniaCodec {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    params: SoundParams,
    time_base: Option<TimeBase>,
    n_frames: Option<u64>,
    byte_len: Option<u64>,
    /// Decoded PCM not yet handed to the caller
    pending: Vec<u8>,
    error: Option<CodecError>,
}

impl SymphoniaCodec {
    fn fail(&mut self, e: CodecError) -> CodecError {
        self.error = Some(e.clone());
        e
    }
}

impl Codec for SymphoniaCodec {
    fn decode(&mut self, buf: &mut [u8]) -> Result<DecodeOutcome, CodecError> {
        if let Some(e) = &self.error {
            if e.is_fatal() {
                return Err(e.clone());
            }
        }
        self.error = None;

        while self.pending.is_empty() {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(DecodeOutcome::Eof);
                }
                Err(SymError::DecodeError(e)) => {
                    // Bad framing; skip ahead rather than giving up
                    warn!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(SymError::ResetRequired) => {
                    return Err(self.fail(CodecError::fatal("stream requires a decoder reset")));
                }
                Err(e) => {
                    return Err(self.fail(CodecError::fatal(format!("read failed: {}", e))));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut samples =
                        SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    samples.copy_interleaved_ref(decoded);
                    self.pending.reserve(samples.samples().len() * 4);
                    for s in samples.samples() {
                        self.pending.extend_from_slice(&s.to_le_bytes());
                    }
                    // Params can drift on chained streams; report what the
                    // PCM actually is
                    self.params = SoundParams::new(
                        spec.channels.count() as u16,
                        spec.rate,
                        SampleFormat::F32Le,
                    );
                }
                Err(SymError::DecodeError(e)) => {
                    return Err(self.fail(CodecError::stream(format!("bad frame: {}", e))));
                }
                Err(e) => {
                    return Err(self.fail(CodecError::fatal(format!("decode failed: {}", e))));
                }
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(DecodeOutcome::Pcm {
            bytes: n,
            params: self.params,
        })
    }

    fn seek(&mut self, seconds: f64) -> Option<f64> {
        if seconds < 0.0 {
            return None;
        }
        let target = SeekTo::Time {
            time: Time::new(seconds.trunc() as u64, seconds.fract()),
            track_id: Some(self.track_id),
        };
        match self.format.seek(SeekMode::Coarse, target) {
            Ok(seeked) => {
                self.decoder.reset();
                self.pending.clear();
                let reached = self
                    .time_base
                    .map(|tb| {
                        let t = tb.calc_time(seeked.actual_ts);
                        t.seconds as f64 + t.frac
                    })
                    .unwrap_or(seconds);
                Some(reached)
            }
            Err(e) => {
                debug!("Seek to {:.1}s failed: {}", seconds, e);
                None
            }
        }
    }

    fn bit_rate(&self) -> i32 {
        // No per-frame rate from symphonia; the average is the best answer
        self.avg_bit_rate()
    }

    fn avg_bit_rate(&self) -> i32 {
        let duration = self.duration();
        match (self.byte_len, duration) {
            (Some(bytes), d) if d > 0 => ((bytes * 8) / (d as u64 * 1000)) as i32,
            _ => -1,
        }
    }

    fn duration(&self) -> i32 {
        match (self.n_frames, self.params.rate) {
            (Some(frames), rate) if rate > 0 => (frames / rate as u64) as i32,
            _ => -1,
        }
    }

    fn last_error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matchers() {
        let d = SymphoniaDecoder::new(false);
        assert!(d.matches_ext("mp3"));
        assert!(d.matches_ext("flac"));
        assert!(!d.matches_ext("noise"));
        assert!(d.matches_mime("audio/mpeg"));
        // The registry hands over normalized types, x- already stripped
        assert!(d.matches_mime("audio/flac"));
        assert!(!d.matches_mime("video/mp4"));
    }

    #[test]
    fn test_content_probe_signatures() {
        let d = SymphoniaDecoder::new(false);

        let mut flac = b"fLaC".to_vec();
        flac.resize(1024, 0);
        let stream = InputStream::from_reader(Box::new(std::io::Cursor::new(flac)), None);
        assert!(d.can_decode(&stream));

        let mut wav = b"RIFF\x00\x00\x00\x00WAVE".to_vec();
        wav.resize(1024, 0);
        let stream = InputStream::from_reader(Box::new(std::io::Cursor::new(wav)), None);
        assert!(d.can_decode(&stream));

        let garbage = vec![0x42u8; 1024];
        let stream = InputStream::from_reader(Box::new(std::io::Cursor::new(garbage)), None);
        assert!(!d.can_decode(&stream));
    }

    #[test]
    fn test_open_rejects_non_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_audio.mp3");
        std::fs::write(&path, vec![0x42u8; 2048]).unwrap();
        let err = SymphoniaDecoder::new(false).open(&path).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tags_on_unreadable_file() {
        let d = SymphoniaDecoder::new(false);
        assert!(d.read_tags(Path::new("/nonexistent.flac")).is_none());
        assert_eq!(d.duration(Path::new("/nonexistent.flac")), -1);
    }
}
