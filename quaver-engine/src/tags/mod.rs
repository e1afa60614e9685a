//! Tag data model and persistent cache
//!
//! [`Tags`] is what a decoder reads from a file; [`TagRecord`] is the
//! cached snapshot persisted per file path, validated against the file's
//! modification time. The on-disk record layout is fixed:
//!
//! ```text
//! mtime (i64 LE) | artist NUL | album NUL | title NUL
//!               | track (i32 LE) | duration (i32 LE) | rating (u8)
//! ```
//!
//! Deserialization validates that every field fits in the remaining bytes
//! and fails cleanly on truncated or corrupt records — a corrupt record is
//! then treated as a cache miss by the caller, never an error to the user.

pub mod cache;
pub mod store;

pub use cache::TagCache;
pub use store::{KeyGuard, MemoryStore, SqliteStore, Store};

use crate::{Error, Result};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Tags read from one audio file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tags {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Track number, -1 when absent
    pub track: i32,
    /// Duration in seconds, -1 when unknown
    pub duration: i32,
}

impl Default for Tags {
    fn default() -> Self {
        Self {
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            track: -1,
            duration: -1,
        }
    }
}

/// Cached tag snapshot for one file path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    /// Modification time of the file the tags were read from (epoch
    /// seconds). A record is only valid while this matches the file.
    pub mtime: i64,
    pub tags: Tags,
    /// User rating, 0 when unrated
    pub rating: u8,
}

impl TagRecord {
    pub fn new(mtime: i64, tags: Tags) -> Self {
        Self {
            mtime,
            tags,
            rating: 0,
        }
    }

    /// Encode to the fixed on-disk layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + self.tags.artist.len() + self.tags.album.len() + self.tags.title.len() + 12,
        );
        out.extend_from_slice(&self.mtime.to_le_bytes());
        push_cstr(&mut out, &self.tags.artist);
        push_cstr(&mut out, &self.tags.album);
        push_cstr(&mut out, &self.tags.title);
        out.extend_from_slice(&self.tags.track.to_le_bytes());
        out.extend_from_slice(&self.tags.duration.to_le_bytes());
        out.push(self.rating);
        out
    }

    /// Decode a record, validating every field against the remaining
    /// buffer. Trailing bytes after the record are tolerated.
    pub fn deserialize(data: &[u8]) -> Result<TagRecord> {
        let mut cur = Cursor { data, pos: 0 };
        let mtime = i64::from_le_bytes(cur.take::<8>()?);
        let artist = cur.take_cstr()?;
        let album = cur.take_cstr()?;
        let title = cur.take_cstr()?;
        let track = i32::from_le_bytes(cur.take::<4>()?);
        let duration = i32::from_le_bytes(cur.take::<4>()?);
        let rating = cur.take::<1>()?[0];
        Ok(TagRecord {
            mtime,
            tags: Tags {
                title,
                artist,
                album,
                track,
                duration,
            },
            rating,
        })
    }
}

/// NUL-terminated string; an interior NUL would break the framing, so it
/// is stripped rather than persisted
fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend(s.bytes().filter(|&b| b != 0));
    out.push(0);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.pos + N > self.data.len() {
            return Err(Error::CorruptRecord(format!(
                "record truncated at byte {}",
                self.pos
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn take_cstr(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::CorruptRecord(format!("unterminated string at byte {}", self.pos))
        })?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| {
                Error::CorruptRecord(format!("invalid UTF-8 string at byte {}", self.pos))
            })?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Modification time of a file as epoch seconds
pub fn file_mtime(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TagRecord {
        TagRecord {
            mtime: 1_700_000_123,
            tags: Tags {
                title: "Ambient Dusk".to_string(),
                artist: "The Fieldmice".to_string(),
                album: "Quiet Rooms".to_string(),
                track: 7,
                duration: 241,
            },
            rating: 4,
        }
    }

    #[test]
    fn test_roundtrip() {
        let record = sample_record();
        let decoded = TagRecord::deserialize(&record.serialize()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_roundtrip_empty_strings_and_unset_track() {
        // Boundary case: zero-length strings, track = -1
        let record = TagRecord {
            mtime: 42,
            tags: Tags::default(),
            rating: 0,
        };
        let bytes = record.serialize();
        let decoded = TagRecord::deserialize(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.tags.track, -1);
        assert_eq!(decoded.tags.title, "");
    }

    #[test]
    fn test_every_truncation_fails_cleanly() {
        let bytes = sample_record().serialize();
        for len in 0..bytes.len() {
            assert!(
                TagRecord::deserialize(&bytes[..len]).is_err(),
                "truncation to {} bytes must not parse",
                len
            );
        }
    }

    #[test]
    fn test_trailing_bytes_tolerated() {
        let mut bytes = sample_record().serialize();
        bytes.extend_from_slice(b"future-extension");
        assert!(TagRecord::deserialize(&bytes).is_ok());
    }

    #[test]
    fn test_interior_nul_is_stripped() {
        let record = TagRecord {
            mtime: 1,
            tags: Tags {
                title: "a\0b".to_string(),
                ..Tags::default()
            },
            rating: 0,
        };
        let decoded = TagRecord::deserialize(&record.serialize()).unwrap();
        assert_eq!(decoded.tags.title, "ab");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(TagRecord::deserialize(b"not a record").is_err());
        assert!(TagRecord::deserialize(&[]).is_err());
    }
}
