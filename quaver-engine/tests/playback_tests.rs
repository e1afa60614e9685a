//! End-to-end playback pipeline tests
//!
//! Uses the synthetic noise plugin and the capture sink, so the full
//! registry -> codec -> output buffer -> device path runs without audio
//! hardware or media files.

use quaver_engine::audio::{CaptureSink, OutputBuffer, SampleFormat};
use quaver_engine::decoder::{noise, noise::NoiseDecoder, symphonia::SymphoniaDecoder, DecoderRegistry};
use quaver_engine::player::{PlayOutcome, Player};
use quaver_engine::tags::{TagCache, TagRecord, Tags};
use std::path::Path;
use std::sync::Arc;

fn registry() -> Arc<DecoderRegistry> {
    let mut reg = DecoderRegistry::new();
    reg.register(Arc::new(SymphoniaDecoder::new(false)));
    reg.register(Arc::new(NoiseDecoder));
    Arc::new(reg)
}

fn noise_file(dir: &Path, name: &str, rate: u32, channels: u8, seconds: u32) -> std::path::PathBuf {
    let path = dir.join(name);
    noise::write_file(&path, rate, channels, seconds).unwrap();
    path
}

#[test]
fn test_play_file_delivers_all_pcm() {
    let dir = tempfile::tempdir().unwrap();
    let track = noise_file(dir.path(), "a.noise", 8000, 2, 1);

    let sink = CaptureSink::new();
    let out = OutputBuffer::new(16 * 1024, Box::new(sink.clone()));
    let player = Player::new(registry(), None);

    let outcome = player.play_file(&track, &out).unwrap();
    assert_eq!(outcome, PlayOutcome::Finished);
    drop(out);

    // 1 s of 8 kHz stereo S16
    assert_eq!(sink.delivered().len(), 8000 * 2 * 2);
    let opens = sink.opens();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].rate, 8000);
    assert_eq!(opens[0].channels, 2);
    assert_eq!(opens[0].format, SampleFormat::S16Le);
}

#[test]
fn test_queue_skips_bad_files_and_reconfigures_between_formats() {
    let dir = tempfile::tempdir().unwrap();
    let first = noise_file(dir.path(), "one.noise", 8000, 2, 1);
    let missing = dir.path().join("missing.noise");
    let unsupported = dir.path().join("notes.txt");
    std::fs::write(&unsupported, b"not audio").unwrap();
    let second = noise_file(dir.path(), "two.noise", 16000, 1, 1);

    let sink = CaptureSink::new();
    let out = OutputBuffer::new(16 * 1024, Box::new(sink.clone()));
    let player = Player::new(registry(), None);

    let played = player.play_queue(
        &[first, missing, unsupported, second.clone()],
        &out,
    );
    drop(out);

    // Unreadable and unsupported files are skipped, the queue continues
    assert_eq!(played, 2);
    assert_eq!(
        sink.delivered().len(),
        8000 * 2 * 2 + 16000 * 2
    );
    // The device was reconfigured for the second format
    let opens = sink.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1].rate, 16000);
    assert_eq!(opens[1].channels, 1);
}

#[test]
fn test_stop_ends_playback() {
    let dir = tempfile::tempdir().unwrap();
    // A long track so the stop lands mid-play
    let track = noise_file(dir.path(), "long.noise", 44100, 2, 60);

    let sink = CaptureSink::new();
    // Tiny buffer: the producer will block, giving stop() a window
    let out = OutputBuffer::new(2048, Box::new(sink));
    let player = Player::new(registry(), None);
    // Paused consumer guarantees the decode thread blocks on a full buffer
    out.pause();

    std::thread::scope(|scope| {
        let out_ref = &out;
        let track_ref = &track;
        let player_ref = &player;
        let handle = scope.spawn(move || player_ref.play_file(track_ref, out_ref).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(100));
        out.stop();
        assert_eq!(handle.join().unwrap(), PlayOutcome::Stopped);
    });
}

#[test]
fn test_tags_are_cached_and_validated_by_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let track = noise_file(dir.path(), "tagged.noise", 8000, 1, 30);

    let cache = Arc::new(TagCache::open(&cache_dir, 4).unwrap());
    let player = Player::new(registry(), Some(Arc::clone(&cache)));

    let tags = player.tags_for(&track).unwrap();
    assert_eq!(tags.title, "white noise");
    assert_eq!(tags.duration, 30);

    // The snapshot landed in the cache, keyed by canonical path
    let key = TagCache::key_for(&track);
    let cached = cache.get(&key).unwrap().unwrap();
    assert_eq!(cached.tags, tags);

    // A second lookup is served from the cache: plant a marker title and
    // observe it coming back as long as the mtime still matches
    let mut marked = cached.clone();
    marked.tags.title = "from the cache".to_string();
    cache.add(&key, &marked).unwrap();
    assert_eq!(player.tags_for(&track).unwrap().title, "from the cache");

    // A stale mtime forces a re-read from the file, keeping the rating
    let stale = TagRecord {
        mtime: cached.mtime - 100,
        tags: Tags {
            title: "stale".to_string(),
            ..Tags::default()
        },
        rating: 5,
    };
    cache.add(&key, &stale).unwrap();
    let fresh = player.tags_for(&track).unwrap();
    assert_eq!(fresh.title, "white noise");
    assert_eq!(cache.get(&key).unwrap().unwrap().rating, 5);
}

#[test]
fn test_forget_file_removes_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let track = noise_file(dir.path(), "gone.noise", 8000, 1, 5);

    let cache = Arc::new(TagCache::open(&cache_dir, 4).unwrap());
    let player = Player::new(registry(), Some(Arc::clone(&cache)));

    player.tags_for(&track).unwrap();
    let key = TagCache::key_for(&track);
    assert!(cache.get(&key).unwrap().is_some());

    player.forget_file(&track).unwrap();
    assert!(cache.get(&key).unwrap().is_none());
}

#[test]
fn test_content_match_picks_noise_for_anonymous_stream() {
    let dir = tempfile::tempdir().unwrap();
    let track = noise_file(dir.path(), "anon.noise", 8000, 1, 1);

    // Serve the file bytes as a nameless live stream
    let bytes = std::fs::read(&track).unwrap();
    let stream = quaver_engine::io::InputStream::from_reader(
        Box::new(std::io::Cursor::new(bytes)),
        None,
    );

    let reg = registry();
    let decoder = reg.match_by_content(&stream).unwrap();
    assert_eq!(decoder.name(), "noise");

    // And the matched decoder can open that very stream
    let mut codec = decoder.open_stream(stream).unwrap();
    let mut buf = [0u8; 4096];
    let got = codec.decode(&mut buf).unwrap();
    assert!(matches!(
        got,
        quaver_engine::decoder::DecodeOutcome::Pcm { bytes: b, .. } if b > 0
    ));
}
