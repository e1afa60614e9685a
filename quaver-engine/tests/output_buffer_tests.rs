//! Integration tests for the producer/consumer output buffer
//!
//! Exercises the pipeline with a capture sink so no audio hardware is
//! needed: delivery integrity under concurrent producer/consumer load,
//! and the stop/reset state machine seen from a producer thread.

use quaver_engine::audio::{CaptureSink, OutputBuffer, SampleFormat, SoundParams};
use std::thread;
use std::time::Duration;

/// 10240 Hz stereo S16 = 40960 B/s, so the consumer drains 4096-byte
/// chunks (100 ms each)
fn params() -> SoundParams {
    SoundParams::new(2, 10240, SampleFormat::S16Le)
}

#[test]
fn test_concurrent_delivery_is_exact_and_ordered() {
    let sink = CaptureSink::new();
    // Small capacity so the producer regularly blocks on a full buffer
    let out = OutputBuffer::new(1024, Box::new(sink.clone()));
    out.set_params(params());

    let expected: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    // Producer pushes 37-byte chunks from another thread while the
    // consumer drains 4096-byte chunks to the device
    thread::scope(|scope| {
        scope.spawn(|| {
            for chunk in expected.chunks(37) {
                assert!(out.write(chunk), "write failed mid-stream");
            }
        });
    });

    out.wait_drained();
    drop(out);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 10_000, "no loss, no duplication");
    assert_eq!(delivered, expected, "delivery preserves write order");
}

#[test]
fn test_stop_fails_pending_writes_and_reset_rearms() {
    let sink = CaptureSink::new();
    let out = OutputBuffer::new(512, Box::new(sink.clone()));
    out.set_params(params());
    out.pause(); // keep the consumer from draining

    // Fill the buffer completely, then start a write that must block
    assert!(out.write(&[1u8; 512]));

    thread::scope(|scope| {
        let out_ref = &out;
        let blocked = scope.spawn(move || out_ref.write(&[2u8; 256]));
        thread::sleep(Duration::from_millis(50));
        // Stop while the writer is blocked on a full buffer: it must fail
        // promptly instead of blocking forever
        out.stop();
        assert!(!blocked.join().unwrap());
    });

    // Stopped buffer refuses writes outright
    assert!(!out.write(&[3u8; 8]));

    // Reset only works from stopped, clears fill, and writes flow again
    out.reset().unwrap();
    assert_eq!(out.fill(), 0);
    out.unpause();
    assert!(out.write(&[4u8; 64]));
    out.wait_drained();
    drop(out);

    // Only the post-reset write reached the device
    assert_eq!(sink.delivered(), vec![4u8; 64]);
}

#[test]
fn test_drop_drains_gracefully() {
    let sink = CaptureSink::new();
    let out = OutputBuffer::new(64 * 1024, Box::new(sink.clone()));
    out.set_params(params());
    assert!(out.write(&[9u8; 10_000]));
    // No explicit drain: dropping the buffer is the graceful exit and
    // must deliver everything already accepted
    drop(out);
    assert_eq!(sink.delivered().len(), 10_000);
}

#[test]
fn test_format_change_reopens_device() {
    let sink = CaptureSink::new();
    let out = OutputBuffer::new(4096, Box::new(sink.clone()));

    let first = params();
    out.set_params(first);
    assert!(out.write(&[0u8; 1024]));
    out.wait_drained();

    let second = SoundParams::new(1, 22050, SampleFormat::F32Le);
    out.set_params(second);
    assert!(out.write(&[0u8; 1024]));
    out.wait_drained();
    drop(out);

    assert_eq!(sink.opens(), vec![first, second]);
    assert_eq!(sink.delivered().len(), 2048);
}

#[test]
fn test_position_tolerates_device_residual() {
    let sink = CaptureSink::new();
    let out = OutputBuffer::new(4096, Box::new(sink));
    out.set_params(params());
    // Nothing played yet: position is zero, and callers must tolerate
    // small negative values once hardware buffering is in play
    assert!(out.time_played() <= 0.0 + f64::EPSILON);
}
