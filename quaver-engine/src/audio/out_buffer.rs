//! Producer/consumer output buffering
//!
//! [`OutputBuffer`] decouples the decoding thread from device writes: the
//! producer pushes PCM into a ring buffer and a dedicated consumer thread
//! drains it to an [`AudioSink`] at real-time pace.
//!
//! One mutex covers *all* state — the byte store and the control flags —
//! so flags and buffer contents always change atomically together. Two
//! condition variables distinguish "space became available" (producers,
//! drain waiters) from "data became available" (the consumer), avoiding
//! spurious cross-wakeups.
//!
//! State machine: running / paused / stopped / exiting.
//! - `pause` also requests a device reset so the physical device is closed
//!   while idle; `unpause` resumes.
//! - `stop` drops buffered content and refuses writes until `reset`.
//! - `reset` (only valid while stopped) clears data and counters and
//!   returns to running.
//! - Dropping the buffer is the graceful path: the consumer drains what is
//!   buffered, then exits and is joined.
//!
//! Consumer ordering note: state changes take effect when the consumer
//! next observes the lock, not synchronously with the caller's return.

use crate::audio::device::AudioSink;
use crate::audio::format::SoundParams;
use crate::audio::ring_buffer::RingBuffer;
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Hard ceiling on one device call, bounding worst-case latency of a
/// pause/stop taking effect
const MAX_PLAY_CHUNK: usize = 32 * 1024;

/// Fixed backoff between retries when the device will not open or accept
/// audio; there is nothing to do but wait for it to come back
const DEVICE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Callback invoked (outside the state lock) whenever buffer space is
/// freed; re-entrant buffer calls from inside it are fine
pub type FreeCallback = Box<dyn FnMut() + Send>;

struct BufferState {
    ring: RingBuffer,
    /// Format of the PCM currently flowing through the buffer
    params: Option<SoundParams>,
    paused: bool,
    stopped: bool,
    exit: bool,
    reset_device: bool,
    /// Seconds of audio handed to the device since the last reset
    time_played: f64,
}

struct Shared {
    state: Mutex<BufferState>,
    space_freed: Condvar,
    data_avail: Condvar,
    /// Device-side fill estimate in bytes, maintained by the consumer
    hw_buffered: AtomicUsize,
    free_callback: Mutex<Option<FreeCallback>>,
}

/// Bounded PCM buffer with a dedicated device-draining consumer thread
pub struct OutputBuffer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl OutputBuffer {
    /// Create the buffer and start its consumer thread. `capacity` is the
    /// ring size in bytes; `sink` is the device the consumer drains to.
    pub fn new(capacity: usize, sink: Box<dyn AudioSink>) -> OutputBuffer {
        let shared = Arc::new(Shared {
            state: Mutex::new(BufferState {
                ring: RingBuffer::new(capacity),
                params: None,
                paused: false,
                stopped: false,
                exit: false,
                reset_device: false,
                time_played: 0.0,
            }),
            space_freed: Condvar::new(),
            data_avail: Condvar::new(),
            hw_buffered: AtomicUsize::new(0),
            free_callback: Mutex::new(None),
        });

        let consumer_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || Self::consumer_loop(consumer_shared, sink));

        OutputBuffer {
            shared,
            thread: Some(thread),
        }
    }

    /// Declare the format of subsequent writes. Requests a device
    /// reconfiguration, applied by the consumer before the next chunk.
    pub fn set_params(&self, params: SoundParams) {
        let mut st = self.shared.state.lock().unwrap();
        if st.params != Some(params) {
            debug!(
                "Output format now {} ch / {} Hz / {:?}",
                params.channels, params.rate, params.format
            );
            st.params = Some(params);
            st.reset_device = true;
            self.shared.data_avail.notify_one();
        }
    }

    /// Queue PCM for the device, blocking while the buffer is full.
    ///
    /// Returns false when the buffer is (or becomes) stopped, in which
    /// case the remainder of `data` was discarded.
    pub fn write(&self, data: &[u8]) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        let mut written = 0;
        while written < data.len() {
            if st.stopped || st.exit {
                trace!(
                    "Discarding write of {} bytes: buffer {}",
                    data.len() - written,
                    if st.stopped { "stopped" } else { "exiting" }
                );
                return false;
            }
            let n = st.ring.put(&data[written..]);
            if n > 0 {
                written += n;
                self.shared.data_avail.notify_one();
            } else {
                st = self.shared.space_freed.wait(st).unwrap();
            }
        }
        true
    }

    /// Pause playback. Also requests a device reset so the physical device
    /// is closed while idle.
    pub fn pause(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.paused = true;
        st.reset_device = true;
        self.shared.data_avail.notify_one();
    }

    pub fn unpause(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.paused = false;
        self.shared.data_avail.notify_one();
    }

    /// Drop buffered content and refuse writes until [`OutputBuffer::reset`].
    pub fn stop(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.stopped = true;
        drop(st);
        // Wake writers (they fail) and the consumer (it discards)
        self.shared.space_freed.notify_all();
        self.shared.data_avail.notify_all();
    }

    /// Leave the stopped state, clearing all buffered data and counters.
    pub fn reset(&self) -> Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        if !st.stopped {
            return Err(Error::InvalidState(
                "output buffer reset is only valid while stopped".to_string(),
            ));
        }
        st.ring.clear();
        st.time_played = 0.0;
        st.stopped = false;
        self.shared.hw_buffered.store(0, Ordering::Relaxed);
        drop(st);
        self.shared.space_freed.notify_all();
        Ok(())
    }

    /// Block until everything buffered has been handed to the device (or
    /// the buffer is stopped).
    pub fn wait_drained(&self) {
        let mut st = self.shared.state.lock().unwrap();
        while !st.ring.is_empty() && !st.stopped && !st.exit {
            st = self.shared.space_freed.wait(st).unwrap();
        }
    }

    /// Bytes currently buffered (not counting the device's own buffer)
    pub fn fill(&self) -> usize {
        self.shared.state.lock().unwrap().ring.len()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().unwrap().paused
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().unwrap().stopped
    }

    /// True playback position in seconds: accumulated played time minus
    /// the estimated residual sitting in the hardware buffer. May be
    /// transiently negative right after playback starts.
    pub fn time_played(&self) -> f64 {
        let st = self.shared.state.lock().unwrap();
        let hw = self.shared.hw_buffered.load(Ordering::Relaxed);
        let residual = st
            .params
            .map(|p| p.bytes_to_seconds(hw))
            .unwrap_or(0.0);
        st.time_played - residual
    }

    /// Install the space-freed callback. It runs on the consumer thread,
    /// outside the state lock.
    pub fn set_free_callback(&self, callback: FreeCallback) {
        *self.shared.free_callback.lock().unwrap() = Some(callback);
    }

    fn run_free_callback(shared: &Shared) {
        let mut cb = shared.free_callback.lock().unwrap();
        if let Some(cb) = cb.as_mut() {
            cb();
        }
    }

    /// Bytes the consumer hands to the device per call: ~100 ms of audio,
    /// frame-aligned, never more than [`MAX_PLAY_CHUNK`].
    fn chunk_limit(params: &SoundParams) -> usize {
        let frame = params.bytes_per_frame().max(1);
        let limit = (params.bytes_per_second() / 10)
            .clamp(frame, MAX_PLAY_CHUNK);
        limit - (limit % frame)
    }

    /// True when the current chunk should be abandoned: a stop discards
    /// buffered audio, and retrying a dead device for it makes no sense.
    fn chunk_abandoned(shared: &Shared) -> bool {
        shared.state.lock().unwrap().stopped
    }

    /// Push one chunk to the device, opening/reopening it as needed.
    /// Device failures are retried with a fixed backoff; returns the bytes
    /// actually delivered (short only when the chunk was abandoned).
    fn deliver(
        shared: &Shared,
        sink: &mut Box<dyn AudioSink>,
        sink_params: &mut Option<SoundParams>,
        params: SoundParams,
        data: &[u8],
    ) -> usize {
        let mut sent = 0;
        loop {
            if *sink_params != Some(params) {
                if sink_params.is_some() {
                    sink.close();
                    *sink_params = None;
                    shared.hw_buffered.store(0, Ordering::Relaxed);
                }
                match sink.open(&params) {
                    Ok(()) => *sink_params = Some(params),
                    Err(e) => {
                        warn!("Cannot open audio device ({}), retrying", e);
                        thread::sleep(DEVICE_RETRY_DELAY);
                        if Self::chunk_abandoned(shared) {
                            return sent;
                        }
                        continue;
                    }
                }
            }

            match sink.play(&data[sent..]) {
                Ok(n) => {
                    sent += n;
                    if sent >= data.len() {
                        return sent;
                    }
                }
                Err(e) => {
                    warn!("Audio write failed ({}), resetting device", e);
                    sink.close();
                    *sink_params = None;
                    shared.hw_buffered.store(0, Ordering::Relaxed);
                    thread::sleep(DEVICE_RETRY_DELAY);
                    if Self::chunk_abandoned(shared) {
                        return sent;
                    }
                }
            }
        }
    }

    fn consumer_loop(shared: Arc<Shared>, mut sink: Box<dyn AudioSink>) {
        debug!("Output buffer consumer started");
        let mut sink_params: Option<SoundParams> = None;
        let mut chunk = vec![0u8; MAX_PLAY_CHUNK];

        'main: loop {
            let mut freed = false;

            // Everything up to pulling a chunk happens under the one lock
            let taken: Option<(SoundParams, usize)> = {
                let mut st = shared.state.lock().unwrap();
                loop {
                    if st.stopped && !st.ring.is_empty() {
                        trace!("Stop: discarding {} buffered bytes", st.ring.len());
                        st.ring.clear();
                        shared.space_freed.notify_all();
                        freed = true;
                    }

                    if st.exit && (st.ring.is_empty() || st.paused || st.stopped) {
                        break None;
                    }

                    if st.ring.is_empty() || st.paused || st.stopped {
                        // Close the physical device before idling on pause
                        // or stop; a transiently empty buffer keeps it open
                        if (st.paused || st.stopped) && sink_params.is_some() {
                            drop(st);
                            trace!("Closing audio device while idle");
                            sink.close();
                            sink_params = None;
                            shared.hw_buffered.store(0, Ordering::Relaxed);
                            st = shared.state.lock().unwrap();
                            continue;
                        }
                        st = shared.data_avail.wait(st).unwrap();
                        continue;
                    }

                    // Running with data. Apply a pending device reset by
                    // closing now; reopening happens with the next chunk.
                    if st.reset_device {
                        st.reset_device = false;
                        if sink_params.is_some() {
                            drop(st);
                            sink.close();
                            sink_params = None;
                            shared.hw_buffered.store(0, Ordering::Relaxed);
                            st = shared.state.lock().unwrap();
                            continue;
                        }
                    }

                    let params = match st.params {
                        Some(p) => p,
                        None => {
                            // Data with no declared format cannot be played
                            warn!(
                                "Discarding {} bytes queued before set_params",
                                st.ring.len()
                            );
                            st.ring.clear();
                            shared.space_freed.notify_all();
                            freed = true;
                            continue;
                        }
                    };

                    let limit = Self::chunk_limit(&params);
                    let n = st.ring.get(&mut chunk[..limit]);
                    break Some((params, n));
                }
            };

            let Some((params, n)) = taken else {
                break 'main;
            };

            // Space was freed by the chunk pull; wake producers and run the
            // callback outside the lock so it may call back into the buffer
            shared.space_freed.notify_all();
            if freed || n > 0 {
                Self::run_free_callback(&shared);
            }
            if n == 0 {
                continue;
            }

            let sent = Self::deliver(&shared, &mut sink, &mut sink_params, params, &chunk[..n]);
            shared
                .hw_buffered
                .store(sink.buffered_bytes(), Ordering::Relaxed);

            if sent > 0 {
                let mut st = shared.state.lock().unwrap();
                st.time_played += params.bytes_to_seconds(sent);
            }
        }

        sink.close();
        debug!("Output buffer consumer exiting");
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.exit = true;
        }
        self.shared.data_avail.notify_all();
        self.shared.space_freed.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::CaptureSink;
    use crate::audio::format::SampleFormat;

    fn test_params() -> SoundParams {
        // 10240 Hz stereo S16: 40960 B/s, so the consumer chunk is 4096 B
        SoundParams::new(2, 10240, SampleFormat::S16Le)
    }

    #[test]
    fn test_chunk_limit_is_time_boxed_and_aligned() {
        let p = test_params();
        assert_eq!(OutputBuffer::chunk_limit(&p), 4096);

        // High-rate audio hits the byte ceiling, still frame-aligned
        let hi = SoundParams::new(2, 192000, SampleFormat::S32Le);
        let limit = OutputBuffer::chunk_limit(&hi);
        assert!(limit <= MAX_PLAY_CHUNK);
        assert_eq!(limit % hi.bytes_per_frame(), 0);
    }

    #[test]
    fn test_write_after_stop_fails_fast() {
        let sink = CaptureSink::new();
        let out = OutputBuffer::new(256, Box::new(sink.clone()));
        out.set_params(test_params());

        out.stop();
        // Larger than capacity: would block forever if stop didn't fail it
        assert!(!out.write(&[0u8; 1024]));
        assert!(out.is_stopped());

        // Reset re-arms the buffer with zero fill
        out.reset().unwrap();
        assert_eq!(out.fill(), 0);
        assert!(out.write(&[1u8; 128]));
        drop(out);
        assert_eq!(sink.delivered().len(), 128);
    }

    #[test]
    fn test_reset_requires_stopped() {
        let out = OutputBuffer::new(256, Box::new(CaptureSink::new()));
        assert!(out.reset().is_err());
    }

    #[test]
    fn test_stop_discards_buffered_audio() {
        let sink = CaptureSink::new();
        let out = OutputBuffer::new(64 * 1024, Box::new(sink.clone()));
        out.pause();
        out.set_params(test_params());
        assert!(out.write(&[7u8; 4000]));
        out.stop();
        out.wait_drained();
        drop(out);
        // Everything was discarded, nothing reached the device
        assert_eq!(sink.delivered().len(), 0);
    }

    #[test]
    fn test_pause_holds_back_delivery() {
        let sink = CaptureSink::new();
        let out = OutputBuffer::new(64 * 1024, Box::new(sink.clone()));
        out.set_params(test_params());
        out.pause();
        assert!(out.write(&[3u8; 2048]));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.delivered().len(), 0);

        out.unpause();
        out.wait_drained();
        drop(out);
        assert_eq!(sink.delivered().len(), 2048);
    }

    #[test]
    fn test_time_played_accounting() {
        let sink = CaptureSink::new();
        let out = OutputBuffer::new(64 * 1024, Box::new(sink.clone()));
        let params = test_params();
        out.set_params(params);
        let data = vec![0u8; 8192];
        assert!(out.write(&data));
        out.wait_drained();
        // Give the consumer time to account the final in-flight chunk
        for _ in 0..100 {
            if (out.time_played() - params.bytes_to_seconds(8192)).abs() < 1e-9 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!((out.time_played() - params.bytes_to_seconds(8192)).abs() < 1e-9);
    }

    #[test]
    fn test_free_callback_runs() {
        let sink = CaptureSink::new();
        let out = OutputBuffer::new(1024, Box::new(sink));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        out.set_free_callback(Box::new(move || {
            hits_cb.fetch_add(1, Ordering::Relaxed);
        }));
        out.set_params(test_params());
        assert!(out.write(&[0u8; 512]));
        out.wait_drained();
        drop(out);
        assert!(hits.load(Ordering::Relaxed) > 0);
    }
}
