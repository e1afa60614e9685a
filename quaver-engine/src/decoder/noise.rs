//! Synthetic white-noise decoder
//!
//! Decodes tiny descriptor files instead of real audio: a `.noise` file is
//! a 17-byte header naming rate, channels, and duration, and the "decoded"
//! PCM is seeded white noise generated on the fly. Exercises the whole
//! plugin surface (content probe, stream open, seek, tags) without any
//! native library, which is also what makes hardware-free pipeline tests
//! possible.

use crate::audio::{SampleFormat, SoundParams};
use crate::decoder::{Codec, CodecError, DecodeOutcome, Decoder};
use crate::io::InputStream;
use crate::tags::Tags;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::Path;

const MAGIC: &[u8; 8] = b"QNOISE1\0";

/// Descriptor files are padded to this size so content detection (which
/// needs 512 leading bytes) can see them
const FILE_SIZE: usize = 512;

const MAX_RATE: u32 = 384_000;
const MAX_CHANNELS: u8 = 8;
const MAX_SECONDS: u32 = 24 * 3600;

struct Header {
    rate: u32,
    channels: u8,
    seconds: u32,
}

fn parse_header(stream: &InputStream) -> Result<Header, CodecError> {
    let mut raw = [0u8; 17];
    let mut got = 0;
    while got < raw.len() {
        let n = stream
            .read(&mut raw[got..])
            .map_err(|e| CodecError::fatal(format!("noise header read failed: {}", e)))?;
        if n == 0 {
            return Err(CodecError::fatal("noise file truncated"));
        }
        got += n;
    }

    if &raw[..8] != MAGIC {
        return Err(CodecError::fatal("not a noise file"));
    }
    let rate = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    let channels = raw[12];
    let seconds = u32::from_le_bytes([raw[13], raw[14], raw[15], raw[16]]);

    if rate == 0 || rate > MAX_RATE || channels == 0 || channels > MAX_CHANNELS {
        return Err(CodecError::fatal("noise file has invalid parameters"));
    }
    if seconds > MAX_SECONDS {
        return Err(CodecError::fatal("noise file duration out of range"));
    }
    Ok(Header {
        rate,
        channels,
        seconds,
    })
}

/// Write a noise descriptor file. Fixture generator for tests and demos.
pub fn write_file(
    path: &Path,
    rate: u32,
    channels: u8,
    seconds: u32,
) -> std::io::Result<()> {
    let mut data = Vec::with_capacity(FILE_SIZE);
    data.extend_from_slice(MAGIC);
    data.extend_from_slice(&rate.to_le_bytes());
    data.push(channels);
    data.extend_from_slice(&seconds.to_le_bytes());
    data.resize(FILE_SIZE, 0);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&data)
}

/// The synthetic noise generator family
pub struct NoiseDecoder;

impl Decoder for NoiseDecoder {
    fn name(&self) -> &'static str {
        "noise"
    }

    fn matches_ext(&self, ext: &str) -> bool {
        ext == "noise"
    }

    fn matches_mime(&self, mime: &str) -> bool {
        matches!(mime, "audio/noise" | "audio/x-noise")
    }

    fn can_decode(&self, stream: &InputStream) -> bool {
        let mut lead = [0u8; 8];
        matches!(stream.peek(&mut lead), Ok(8) if &lead == MAGIC)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Codec>, CodecError> {
        let stream = InputStream::open(path, false)
            .map_err(|e| CodecError::fatal(format!("cannot open {}: {}", path.display(), e)))?;
        self.open_stream(stream)
    }

    fn open_stream(&self, stream: InputStream) -> Result<Box<dyn Codec>, CodecError> {
        let header = parse_header(&stream)?;
        // The descriptor is fully consumed; the stream closes here, once
        drop(stream);
        Ok(Box::new(NoiseCodec::new(header)))
    }

    fn read_tags(&self, path: &Path) -> Option<Tags> {
        let stream = InputStream::open(path, false).ok()?;
        let header = parse_header(&stream).ok()?;
        Some(Tags {
            title: "white noise".to_string(),
            duration: header.seconds as i32,
            ..Tags::default()
        })
    }

    fn duration(&self, path: &Path) -> i32 {
        InputStream::open(path, false)
            .ok()
            .and_then(|s| parse_header(&s).ok())
            .map(|h| h.seconds as i32)
            .unwrap_or(-1)
    }
}

struct NoiseCodec {
    params: SoundParams,
    total_frames: u64,
    pos_frames: u64,
    seconds: u32,
    error: Option<CodecError>,
}

impl NoiseCodec {
    fn new(header: Header) -> Self {
        Self {
            params: SoundParams::new(header.channels as u16, header.rate, SampleFormat::S16Le),
            total_frames: header.rate as u64 * header.seconds as u64,
            pos_frames: 0,
            seconds: header.seconds,
            error: None,
        }
    }
}

impl Codec for NoiseCodec {
    fn decode(&mut self, buf: &mut [u8]) -> Result<DecodeOutcome, CodecError> {
        if let Some(e) = &self.error {
            if e.is_fatal() {
                return Err(e.clone());
            }
        }
        self.error = None;

        let frame_bytes = self.params.bytes_per_frame();
        if buf.len() < frame_bytes {
            let e = CodecError::stream("decode buffer smaller than one frame");
            self.error = Some(e.clone());
            return Err(e);
        }

        let remaining = self.total_frames - self.pos_frames;
        if remaining == 0 {
            return Ok(DecodeOutcome::Eof);
        }

        let frames = (buf.len() / frame_bytes).min(remaining as usize);
        // Seeded per position so output is reproducible across seeks
        let mut rng = StdRng::seed_from_u64(0x6e6f_6973_u64 ^ self.pos_frames);
        let mut off = 0;
        for _ in 0..frames {
            for _ in 0..self.params.channels {
                let sample: i16 = rng.gen();
                buf[off..off + 2].copy_from_slice(&sample.to_le_bytes());
                off += 2;
            }
        }
        self.pos_frames += frames as u64;

        Ok(DecodeOutcome::Pcm {
            bytes: off,
            params: self.params,
        })
    }

    fn seek(&mut self, seconds: f64) -> Option<f64> {
        if seconds < 0.0 {
            return None;
        }
        let target = (seconds * self.params.rate as f64) as u64;
        self.pos_frames = target.min(self.total_frames);
        Some(self.pos_frames as f64 / self.params.rate as f64)
    }

    fn bit_rate(&self) -> i32 {
        (self.params.bytes_per_second() * 8 / 1000) as i32
    }

    fn avg_bit_rate(&self) -> i32 {
        self.bit_rate()
    }

    fn duration(&self) -> i32 {
        self.seconds as i32
    }

    fn last_error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }
}
