//! Byte-oriented input streams feeding codec plugins
//!
//! An [`InputStream`] is a sequenced, peekable byte source over a local file
//! or a live connection. Local files use one of two read paths chosen once
//! at open time — plain descriptor reads, or a memory mapping for files of
//! known moderate size — and callers never see which transport is active.
//! Live connections have unknown size and keep an internal read-ahead queue
//! so peeking works without transport support.
//!
//! Every stream guards its own position/size/error fields with a private
//! mutex: a single codec owns the stream, but it tolerates being probed
//! from a second thread (content sniffing before playback begins).
//!
//! Failure policy: transport errors set a sticky error string in addition
//! to returning `Err`; callers across the plugin boundary check [`ok`]
//! rather than catching anything.
//!
//! [`ok`]: InputStream::ok

use crate::{Error, Result};
use memmap2::Mmap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// Files above this size always use the descriptor path; a mapping of a
/// multi-gigabyte file buys nothing and costs address space.
const MMAP_CEILING: u64 = 256 * 1024 * 1024;

enum Source {
    /// Plain descriptor reads; the OS offset tracks `pos` exactly
    Descriptor(File),
    /// Memory mapping, re-validated against the file's stat before each read
    Mapped { file: File, map: Mmap },
    /// Live connection: sequential reader plus a peek read-ahead queue
    Live {
        reader: Box<dyn Read + Send>,
        ahead: VecDeque<u8>,
    },
}

struct Inner {
    source: Source,
    /// Total size in bytes, or -1 when unknown (live streams)
    size: i64,
    /// Current logical position
    pos: u64,
    eof: bool,
    /// Sticky transport error; cleared only by a successful reopen
    error: Option<String>,
}

/// Sequenced, peekable byte source over a file or live connection
pub struct InputStream {
    inner: Mutex<Inner>,
    /// MIME type attached by the transport, if any (network streams)
    mime: Option<String>,
    path: Option<PathBuf>,
}

impl InputStream {
    /// Open a local file.
    ///
    /// When `use_mmap` is set and the file has a known size within the
    /// mapping ceiling, reads go through a memory mapping; a mapping
    /// failure falls back to descriptor reads rather than failing the open.
    pub fn open(path: &Path, use_mmap: bool) -> Result<InputStream> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        let source = if use_mmap && size > 0 && size <= MMAP_CEILING {
            // Safety: the mapping is re-validated against the file's stat
            // before every read and replaced when the size changes.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => {
                    trace!("Opened {} memory-mapped ({} bytes)", path.display(), size);
                    Source::Mapped { file, map }
                }
                Err(e) => {
                    debug!(
                        "mmap of {} failed ({}), using descriptor reads",
                        path.display(),
                        e
                    );
                    Source::Descriptor(file)
                }
            }
        } else {
            Source::Descriptor(file)
        };

        Ok(InputStream {
            inner: Mutex::new(Inner {
                source,
                size: size as i64,
                pos: 0,
                eof: false,
                error: None,
            }),
            mime: None,
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap a live connection of unknown size.
    ///
    /// `mime` is the content type reported by the transport, consulted by
    /// content-based decoder resolution before any bytes are sniffed.
    pub fn from_reader(reader: Box<dyn Read + Send>, mime: Option<String>) -> InputStream {
        InputStream {
            inner: Mutex::new(Inner {
                source: Source::Live {
                    reader,
                    ahead: VecDeque::new(),
                },
                size: -1,
                pos: 0,
                eof: false,
                error: None,
            }),
            mime,
            path: None,
        }
    }

    /// Consume up to `out.len()` bytes, advancing the position.
    /// Returns 0 at end of stream; end of stream is not an error.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let n = Self::read_inner(&mut inner, out)?;
        inner.pos += n as u64;
        if n == 0 && !out.is_empty() {
            inner.eof = true;
        }
        Ok(n)
    }

    /// Read without advancing the position.
    ///
    /// Tries to produce `out.len()` bytes when that many remain; a short
    /// return means the stream ends early.
    pub fn peek(&self, out: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        match &mut inner.source {
            Source::Mapped { .. } => {
                // Pure index arithmetic on the mapping
                Self::read_inner(&mut inner, out)
            }
            Source::Descriptor(_) => {
                // Read ahead, then seek the descriptor back
                let mut total = 0;
                let mut result = Ok(());
                while total < out.len() {
                    match Self::read_inner(&mut inner, &mut out[total..]) {
                        Ok(0) => break,
                        Ok(n) => total += n,
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                if let Source::Descriptor(file) = &mut inner.source {
                    if total > 0 {
                        if let Err(e) = file.seek(SeekFrom::Current(-(total as i64))) {
                            let msg = format!("peek rewind failed: {}", e);
                            warn!("{}", msg);
                            inner.error = Some(msg.clone());
                            return Err(Error::Stream(msg));
                        }
                    }
                }
                result.map(|_| total)
            }
            Source::Live { reader, ahead } => {
                // Pull enough into the read-ahead queue, then copy from it
                while ahead.len() < out.len() {
                    let mut chunk = [0u8; 4096];
                    let want = (out.len() - ahead.len()).min(chunk.len());
                    match reader.read(&mut chunk[..want]) {
                        Ok(0) => break,
                        Ok(n) => ahead.extend(&chunk[..n]),
                        Err(e) => {
                            let msg = format!("read failed: {}", e);
                            inner.error = Some(msg.clone());
                            return Err(Error::Stream(msg));
                        }
                    }
                }
                let n = ahead.len().min(out.len());
                for (dst, src) in out[..n].iter_mut().zip(ahead.iter()) {
                    *dst = *src;
                }
                Ok(n)
            }
        }
    }

    /// Seek to a position clamped to `[0, size]` and return the new
    /// position. Live streams are not seekable.
    pub fn seek(&self, target: SeekFrom) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();

        if inner.size < 0 {
            let msg = "stream is not seekable".to_string();
            inner.error = Some(msg.clone());
            return Err(Error::Stream(msg));
        }
        let size = inner.size as u64;

        let wanted: i64 = match target {
            SeekFrom::Start(off) => off.min(i64::MAX as u64) as i64,
            SeekFrom::End(off) => inner.size + off,
            SeekFrom::Current(off) => inner.pos as i64 + off,
        };
        let new_pos = wanted.clamp(0, inner.size) as u64;

        if let Source::Descriptor(file) = &mut inner.source {
            if let Err(e) = file.seek(SeekFrom::Start(new_pos)) {
                let msg = format!("seek failed: {}", e);
                inner.error = Some(msg.clone());
                return Err(Error::Stream(msg));
            }
        }

        inner.pos = new_pos;
        inner.eof = new_pos >= size;
        Ok(new_pos)
    }

    /// Total size in bytes, or -1 when unknown (live streams).
    pub fn file_size(&self) -> i64 {
        self.inner.lock().unwrap().size
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.inner.lock().unwrap().pos
    }

    pub fn eof(&self) -> bool {
        self.inner.lock().unwrap().eof
    }

    /// True when no transport error has occurred. End of stream is not an
    /// error.
    pub fn ok(&self) -> bool {
        self.inner.lock().unwrap().error.is_none()
    }

    /// Human-readable description of the sticky error, if any.
    pub fn strerror(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// MIME type attached by the transport, if any.
    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_seekable(&self) -> bool {
        self.inner.lock().unwrap().size >= 0
    }

    /// One read against the current source at the current position.
    /// Advancing `pos` and the EOF flag is the caller's job.
    fn read_inner(inner: &mut Inner, out: &mut [u8]) -> Result<usize> {
        match &mut inner.source {
            Source::Descriptor(file) => match file.read(out) {
                Ok(n) => Ok(n),
                Err(e) => {
                    let msg = format!("read failed: {}", e);
                    warn!("{}", msg);
                    inner.error = Some(msg.clone());
                    Err(Error::Stream(msg))
                }
            },
            Source::Mapped { file, map } => {
                // Files can grow or shrink underneath a long-lived mapping;
                // re-validate against the current stat and re-map on mismatch.
                let current = match file.metadata() {
                    Ok(m) => m.len(),
                    Err(e) => {
                        let msg = format!("stat failed: {}", e);
                        inner.error = Some(msg.clone());
                        return Err(Error::Stream(msg));
                    }
                };
                if current != inner.size as u64 {
                    debug!(
                        "mapped file changed size ({} -> {}), re-mapping",
                        inner.size, current
                    );
                    match unsafe { Mmap::map(&*file) } {
                        Ok(new_map) => {
                            *map = new_map;
                            inner.size = current as i64;
                        }
                        Err(e) => {
                            let msg = format!("re-map failed: {}", e);
                            inner.error = Some(msg.clone());
                            return Err(Error::Stream(msg));
                        }
                    }
                }

                let size = inner.size as usize;
                let start = inner.pos as usize;
                if start >= size {
                    return Ok(0);
                }
                let n = out.len().min(size - start);
                out[..n].copy_from_slice(&map[start..start + n]);
                Ok(n)
            }
            Source::Live { reader, ahead } => {
                // Drain the peek queue before touching the transport
                if !ahead.is_empty() {
                    let n = ahead.len().min(out.len());
                    for (dst, byte) in out[..n].iter_mut().zip(ahead.drain(..n)) {
                        *dst = byte;
                    }
                    return Ok(n);
                }
                match reader.read(out) {
                    Ok(n) => Ok(n),
                    Err(e) => {
                        let msg = format!("read failed: {}", e);
                        warn!("{}", msg);
                        inner.error = Some(msg.clone());
                        Err(Error::Stream(msg))
                    }
                }
            }
        }
    }
}
