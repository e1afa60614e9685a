//! Decoder registry and preference table
//!
//! The registry holds every installed codec plugin in registration order,
//! plus a preference table mapping filename extensions and MIME types to an
//! ordered decoder search list. It is built once at startup and then shared
//! read-only; there is no runtime plugin loading.
//!
//! Resolution order for [`DecoderRegistry::find`]:
//! 1. A preference entry matching the extension (case-insensitive) or the
//!    normalized MIME type searches only that entry's list, in list order.
//! 2. Otherwise every decoder's MIME matcher, then every decoder's
//!    extension matcher, in registration order; first match wins.
//! 3. Nothing matched: the file has no sound support. That is an ordinary
//!    negative result, not an error — the caller decides what to tell the
//!    user.

use crate::decoder::Decoder;
use crate::io::InputStream;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Content probes get rejected below this many leading bytes; no signature
/// check is reliable on less.
const CONTENT_PROBE_MIN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PreferenceKey {
    /// Lowercase extension without the dot
    Extension(String),
    /// Normalized type/subtype
    Mime(String),
}

struct PreferenceEntry {
    key: PreferenceKey,
    /// Decoder indices to search, in order; wildcard already expanded
    order: Vec<usize>,
}

/// Ordered collection of codec plugins with preference-based lookup
pub struct DecoderRegistry {
    decoders: Vec<Arc<dyn Decoder>>,
    by_name: HashMap<String, usize>,
    prefs: Vec<PreferenceEntry>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self {
            decoders: Vec::new(),
            by_name: HashMap::new(),
            prefs: Vec::new(),
        }
    }

    /// Append a plugin. Called at startup, before any preference entry is
    /// loaded; registration order is the default search order.
    pub fn register(&mut self, decoder: Arc<dyn Decoder>) {
        let name = decoder.name().to_lowercase();
        if self.by_name.contains_key(&name) {
            warn!("Decoder '{}' registered twice, later wins for lookups", name);
        }
        self.by_name.insert(name, self.decoders.len());
        self.decoders.push(decoder);
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Look a plugin up by its preference-entry name
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Decoder>> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|&i| Arc::clone(&self.decoders[i]))
    }

    /// Load configured preference entries, `"key(name,name,...)"` each.
    ///
    /// Malformed entries are rejected; unknown decoder names inside a list
    /// are handled per the wildcard rules and never an error.
    pub fn load_preferences(&mut self, entries: &[String]) -> Result<()> {
        for entry in entries {
            self.add_preference(entry)?;
        }
        Ok(())
    }

    /// Parse and add one preference entry.
    ///
    /// Tokens: a token naming a registered decoder is that decoder — this
    /// includes a plugin literally named `*`. The first unrecognized token
    /// is the wildcard marker and expands, now, to every decoder not
    /// already listed, in registration order, spliced at the marker's
    /// position. Duplicate names and later unrecognized tokens are silently
    /// dropped.
    pub fn add_preference(&mut self, entry: &str) -> Result<()> {
        let entry = entry.trim();
        let open = entry.find('(').ok_or_else(|| {
            Error::InvalidState(format!("preference entry '{}' has no token list", entry))
        })?;
        if !entry.ends_with(')') {
            return Err(Error::InvalidState(format!(
                "preference entry '{}' is not terminated",
                entry
            )));
        }

        let key_text = entry[..open].trim();
        if key_text.is_empty() {
            return Err(Error::InvalidState(format!(
                "preference entry '{}' has an empty key",
                entry
            )));
        }
        let key = if key_text.contains('/') {
            PreferenceKey::Mime(normalize_mime(key_text))
        } else {
            PreferenceKey::Extension(key_text.to_lowercase())
        };

        let mut order: Vec<usize> = Vec::new();
        let mut wildcard_at: Option<usize> = None;
        let list = &entry[open + 1..entry.len() - 1];
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match self.by_name.get(&token.to_lowercase()) {
                Some(&idx) => {
                    if !order.contains(&idx) {
                        order.push(idx);
                    }
                }
                None => {
                    if wildcard_at.is_none() {
                        wildcard_at = Some(order.len());
                    } else {
                        debug!(
                            "Dropping extra unrecognized token '{}' in preference '{}'",
                            token, entry
                        );
                    }
                }
            }
        }

        if let Some(at) = wildcard_at {
            let rest: Vec<usize> =
                (0..self.decoders.len()).filter(|i| !order.contains(i)).collect();
            order.splice(at..at, rest);
        }

        debug!(
            "Preference {:?} -> {:?}",
            key,
            order
                .iter()
                .map(|&i| self.decoders[i].name())
                .collect::<Vec<_>>()
        );
        self.prefs.push(PreferenceEntry { key, order });
        Ok(())
    }

    /// Resolve a decoder for a candidate file, by extension, filename,
    /// and/or MIME type. Returns None when the file has no sound support.
    pub fn find(
        &self,
        ext: Option<&str>,
        filename: Option<&Path>,
        mime: Option<&str>,
    ) -> Option<Arc<dyn Decoder>> {
        let ext: Option<String> = ext
            .map(|e| e.to_lowercase())
            .or_else(|| {
                filename
                    .and_then(|p| p.extension())
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_lowercase())
            });
        let mime: Option<String> = mime.map(normalize_mime);

        // Step 1: preference table, first matching entry only
        for pref in &self.prefs {
            match &pref.key {
                PreferenceKey::Extension(k) => {
                    if let Some(e) = &ext {
                        if e == k {
                            return self.search_entry(pref, |d| d.matches_ext(e));
                        }
                    }
                }
                PreferenceKey::Mime(k) => {
                    if let Some(m) = &mime {
                        if m == k {
                            return self.search_entry(pref, |d| d.matches_mime(m));
                        }
                    }
                }
            }
        }

        // Step 2: all MIME matchers, then all extension matchers
        if let Some(m) = &mime {
            for d in &self.decoders {
                if d.matches_mime(m) {
                    return Some(Arc::clone(d));
                }
            }
        }
        if let Some(e) = &ext {
            for d in &self.decoders {
                if d.matches_ext(e) {
                    return Some(Arc::clone(d));
                }
            }
        }

        None
    }

    fn search_entry(
        &self,
        pref: &PreferenceEntry,
        matches: impl Fn(&dyn Decoder) -> bool,
    ) -> Option<Arc<dyn Decoder>> {
        pref.order
            .iter()
            .map(|&i| &self.decoders[i])
            .find(|d| matches(d.as_ref()))
            .map(Arc::clone)
    }

    /// Resolve a decoder for a stream without a reliable name (network
    /// radio): transport-supplied MIME type first, then content sniffing
    /// on the leading bytes.
    pub fn match_by_content(&self, stream: &InputStream) -> Result<Arc<dyn Decoder>> {
        if let Some(mime) = stream.mime() {
            if let Some(d) = self.find(None, None, Some(mime)) {
                debug!("Matched stream by transport MIME type '{}'", mime);
                return Ok(d);
            }
        }

        let mut lead = [0u8; CONTENT_PROBE_MIN];
        let got = stream.peek(&mut lead)?;
        if got < CONTENT_PROBE_MIN {
            return Err(Error::NoDecoder(format!(
                "only {} bytes available, content detection needs {}",
                got, CONTENT_PROBE_MIN
            )));
        }

        for d in &self.decoders {
            if d.can_decode(stream) {
                debug!("Matched stream by content probe: {}", d.name());
                return Ok(Arc::clone(d));
            }
        }
        Err(Error::NoDecoder("format not supported".to_string()))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase, strip parameters after `;`, strip a vendor `x-` prefix from
/// the subtype: `Audio/X-FLAC; charset=x` becomes `audio/flac`.
fn normalize_mime(mime: &str) -> String {
    let mime = mime.split(';').next().unwrap_or("").trim().to_lowercase();
    match mime.split_once('/') {
        Some((ty, subty)) => {
            let subty = subty.strip_prefix("x-").unwrap_or(subty);
            format!("{}/{}", ty, subty)
        }
        None => mime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Codec, CodecError};

    /// Matcher-only fake plugin for resolution tests
    struct FakeDecoder {
        name: &'static str,
        exts: &'static [&'static str],
        mimes: &'static [&'static str],
        magic: Option<&'static [u8]>,
    }

    impl Decoder for FakeDecoder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn matches_ext(&self, ext: &str) -> bool {
            self.exts.contains(&ext)
        }
        fn matches_mime(&self, mime: &str) -> bool {
            self.mimes.contains(&mime)
        }
        fn can_decode(&self, stream: &InputStream) -> bool {
            let Some(magic) = self.magic else {
                return false;
            };
            let mut lead = vec![0u8; magic.len()];
            matches!(stream.peek(&mut lead), Ok(n) if n == magic.len() && lead == magic)
        }
        fn open(&self, _path: &Path) -> std::result::Result<Box<dyn Codec>, CodecError> {
            Err(CodecError::fatal("fake decoder cannot decode"))
        }
    }

    fn fake(
        name: &'static str,
        exts: &'static [&'static str],
        mimes: &'static [&'static str],
    ) -> Arc<dyn Decoder> {
        Arc::new(FakeDecoder {
            name,
            exts,
            mimes,
            magic: None,
        })
    }

    fn registry_bar_baz_qux() -> DecoderRegistry {
        let mut reg = DecoderRegistry::new();
        reg.register(fake("bar", &["foo", "bar"], &["audio/bar"]));
        reg.register(fake("baz", &["foo", "baz"], &["audio/baz"]));
        reg.register(fake("qux", &["foo", "qux"], &["audio/qux"]));
        reg
    }

    #[test]
    fn test_find_by_ext_registration_order() {
        let mut reg = DecoderRegistry::new();
        reg.register(fake("first", &["ogg"], &[]));
        reg.register(fake("second", &["mp3"], &["audio/mpeg"]));
        reg.register(fake("third", &["mp3"], &[]));

        // No preference entry: first registered decoder matching the
        // extension wins
        let found = reg.find(Some("mp3"), None, None).unwrap();
        assert_eq!(found.name(), "second");

        // Case-insensitive, and derivable from the filename
        let found = reg.find(None, Some(Path::new("x/y/SONG.MP3")), None).unwrap();
        assert_eq!(found.name(), "second");

        assert!(reg.find(Some("flac"), None, None).is_none());
    }

    #[test]
    fn test_find_prefers_mime_probe_over_ext() {
        let mut reg = DecoderRegistry::new();
        reg.register(fake("extonly", &["ogg"], &[]));
        reg.register(fake("mimeonly", &[], &["audio/vorbis"]));

        let found = reg
            .find(Some("ogg"), None, Some("audio/vorbis"))
            .unwrap();
        assert_eq!(found.name(), "mimeonly");
    }

    #[test]
    fn test_mime_normalization() {
        let mut reg = DecoderRegistry::new();
        reg.register(fake("flac", &["flac"], &["audio/flac"]));

        let found = reg
            .find(None, None, Some("Audio/X-FLAC; charset=binary"))
            .unwrap();
        assert_eq!(found.name(), "flac");
    }

    #[test]
    fn test_wildcard_expansion() {
        // "foo(bar,*,baz)" over [bar, baz, qux] expands to [bar, qux, baz]
        let mut reg = registry_bar_baz_qux();
        reg.add_preference("foo(bar,*,baz)").unwrap();

        let pref = &reg.prefs[0];
        let names: Vec<&str> = pref.order.iter().map(|&i| reg.decoders[i].name()).collect();
        assert_eq!(names, vec!["bar", "qux", "baz"]);
        assert_eq!(pref.key, PreferenceKey::Extension("foo".to_string()));
    }

    #[test]
    fn test_preference_entry_search_order() {
        let mut reg = registry_bar_baz_qux();
        reg.add_preference("foo(baz,bar)").unwrap();

        // All three match ext "foo", the entry reorders the search
        let found = reg.find(Some("foo"), None, None).unwrap();
        assert_eq!(found.name(), "baz");
    }

    #[test]
    fn test_preference_list_is_exhaustive_for_its_key() {
        let mut reg = registry_bar_baz_qux();
        // Entry whose list contains only a decoder that does NOT match
        // the extension: resolution fails rather than falling through
        reg.register(fake("other", &["weird"], &[]));
        reg.add_preference("weird(bar)").unwrap();
        assert!(reg.find(Some("weird"), None, None).is_none());
    }

    #[test]
    fn test_preference_dedupe_and_unknown_names() {
        let mut reg = registry_bar_baz_qux();
        // "baz" duplicated; "nosuch" unrecognized -> wildcard marker;
        // "bogus" is a second unrecognized token -> dropped
        reg.add_preference("foo(baz,baz,nosuch,bogus,bar)").unwrap();

        let names: Vec<&str> = reg.prefs[0]
            .order
            .iter()
            .map(|&i| reg.decoders[i].name())
            .collect();
        // dedupe first, wildcard expands with not-yet-listed (qux) at its
        // position, explicit bar keeps its place after
        assert_eq!(names, vec!["baz", "qux", "bar"]);
    }

    #[test]
    fn test_decoder_literally_named_star() {
        let mut reg = DecoderRegistry::new();
        reg.register(fake("bar", &["foo"], &[]));
        reg.register(fake("*", &["foo"], &[]));
        reg.register(fake("baz", &["foo"], &[]));
        reg.add_preference("foo(*,bar)").unwrap();

        // '*' names the registered plugin, it is not a wildcard here
        let names: Vec<&str> = reg.prefs[0]
            .order
            .iter()
            .map(|&i| reg.decoders[i].name())
            .collect();
        assert_eq!(names, vec!["*", "bar"]);
    }

    #[test]
    fn test_mime_keyed_preference() {
        let mut reg = registry_bar_baz_qux();
        reg.add_preference("audio/x-baz(qux,baz)").unwrap();
        // qux doesn't match mime audio/baz, baz does
        let found = reg.find(None, None, Some("audio/baz")).unwrap();
        assert_eq!(found.name(), "baz");
    }

    #[test]
    fn test_malformed_preference_rejected() {
        let mut reg = registry_bar_baz_qux();
        assert!(reg.add_preference("foo").is_err());
        assert!(reg.add_preference("foo(bar").is_err());
        assert!(reg.add_preference("(bar)").is_err());
    }

    #[test]
    fn test_match_by_content_insufficient_data() {
        let reg = registry_bar_baz_qux();
        let stream = InputStream::from_reader(
            Box::new(std::io::Cursor::new(vec![0u8; 100])),
            None,
        );
        let err = reg.match_by_content(&stream).err().unwrap();
        assert!(matches!(err, Error::NoDecoder(_)));
    }

    #[test]
    fn test_match_by_content_probe() {
        let mut reg = DecoderRegistry::new();
        reg.register(Arc::new(FakeDecoder {
            name: "magic",
            exts: &[],
            mimes: &[],
            magic: Some(b"MAGIC!"),
        }));

        let mut data = b"MAGIC!".to_vec();
        data.resize(1024, 0);
        let stream = InputStream::from_reader(Box::new(std::io::Cursor::new(data)), None);
        let found = reg.match_by_content(&stream).unwrap();
        assert_eq!(found.name(), "magic");

        // Transport MIME wins before sniffing
        let mut reg = registry_bar_baz_qux();
        reg.register(Arc::new(FakeDecoder {
            name: "magic",
            exts: &[],
            mimes: &[],
            magic: Some(b"MAGIC!"),
        }));
        let stream = InputStream::from_reader(
            Box::new(std::io::Cursor::new(vec![0u8; 1024])),
            Some("audio/qux".to_string()),
        );
        assert_eq!(reg.match_by_content(&stream).unwrap().name(), "qux");
    }

    #[test]
    fn test_normalize_mime() {
        assert_eq!(normalize_mime("audio/mpeg"), "audio/mpeg");
        assert_eq!(normalize_mime("Audio/X-Wav"), "audio/wav");
        assert_eq!(normalize_mime("audio/ogg; codecs=vorbis"), "audio/ogg");
        assert_eq!(normalize_mime("weird"), "weird");
    }
}
