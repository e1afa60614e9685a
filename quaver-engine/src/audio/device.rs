//! Audio device output
//!
//! [`AudioSink`] is the push-model device contract the output buffer's
//! consumer thread drains into: open with a format, push byte chunks, ask
//! how much the device still holds, close. [`CpalSink`] implements it on
//! top of cpal's callback model by parking the cpal stream on a dedicated
//! thread and feeding its callback through a lock-free SPSC ring buffer.
//! [`CaptureSink`] records everything for tests, no hardware needed.

use crate::audio::format::SoundParams;
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Push-model audio device consumed by the output buffer
pub trait AudioSink: Send {
    /// Open (or reconfigure) the device for PCM of this format
    fn open(&mut self, params: &SoundParams) -> Result<()>;

    /// Queue a chunk, blocking until the device accepted it. Returns bytes
    /// accepted; an error means the device needs a reset.
    fn play(&mut self, data: &[u8]) -> Result<usize>;

    /// Estimated bytes queued device-side but not yet audible, in the
    /// format the sink was opened with
    fn buffered_bytes(&self) -> usize;

    /// Close the device. Harmless when already closed.
    fn close(&mut self);
}

// ========================================
// cpal-backed sink
// ========================================

struct ActiveStream {
    producer: HeapProd<f32>,
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
    params: SoundParams,
    /// Set by the cpal error callback; play() surfaces it for recovery
    error_flag: Arc<AtomicBool>,
}

/// Real audio output through cpal
pub struct CpalSink {
    device_name: Option<String>,
    active: Option<ActiveStream>,
}

impl CpalSink {
    /// `device_name` selects an output device; None means the system
    /// default, and an unknown name falls back to the default with a
    /// warning rather than failing.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            active: None,
        }
    }

    /// List available output device names
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|d| d.name().ok())
            .collect();
        Ok(devices)
    }

    fn pick_device(name: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(name) = name {
            let mut devices = host.output_devices().map_err(|e| {
                Error::AudioOutput(format!("Failed to enumerate devices: {}", e))
            })?;
            if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                info!("Using audio device: {}", name);
                return Ok(dev);
            }
            warn!("Audio device '{}' not found, falling back to default", name);
        }
        host.default_output_device()
            .ok_or_else(|| Error::AudioOutput("No default output device".to_string()))
    }

    /// Best supported config for the requested params: exact channel count
    /// and rate in f32 when available, the device default otherwise.
    fn pick_config(
        device: &cpal::Device,
        params: &SoundParams,
    ) -> Result<(cpal::StreamConfig, cpal::SampleFormat)> {
        let mut supported = device.supported_output_configs().map_err(|e| {
            Error::AudioOutput(format!("Failed to get device configs: {}", e))
        })?;

        let wanted = supported.find(|c| {
            c.channels() == params.channels
                && c.min_sample_rate().0 <= params.rate
                && c.max_sample_rate().0 >= params.rate
                && c.sample_format() == cpal::SampleFormat::F32
        });
        if let Some(cfg) = wanted {
            let sample_format = cfg.sample_format();
            let config = cfg.with_sample_rate(cpal::SampleRate(params.rate)).config();
            return Ok((config, sample_format));
        }

        let fallback = device.default_output_config().map_err(|e| {
            Error::AudioOutput(format!("Failed to get default config: {}", e))
        })?;
        let sample_format = fallback.sample_format();
        Ok((fallback.config(), sample_format))
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        in_channels: usize,
        mut cons: HeapCons<f32>,
        error_flag: Arc<AtomicBool>,
    ) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let device_channels = config.channels as usize;
        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(device_channels) {
                        // One input frame per device frame; extra device
                        // channels replicate the last sample, extra input
                        // channels are dropped. Underrun plays silence.
                        let mut last = 0.0f32;
                        for i in 0..in_channels.max(device_channels) {
                            let sample = if i < in_channels {
                                last = cons.try_pop().unwrap_or(0.0);
                                last
                            } else {
                                last
                            };
                            if let Some(slot) = frame.get_mut(i) {
                                *slot = T::from_sample(sample.clamp(-1.0, 1.0));
                            }
                        }
                    }
                },
                move |err| {
                    error!("Audio stream error: {} - marking for recovery", err);
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))?;
        Ok(stream)
    }
}

impl AudioSink for CpalSink {
    fn open(&mut self, params: &SoundParams) -> Result<()> {
        self.close();

        // ~500 ms of device-side buffering
        let capacity = ((params.rate as usize * params.channels as usize) / 2).max(4096);
        let rb = HeapRb::<f32>::new(capacity);
        let (producer, consumer) = rb.split();

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let error_flag = Arc::new(AtomicBool::new(false));

        let device_name = self.device_name.clone();
        let stream_params = *params;
        let stream_error_flag = Arc::clone(&error_flag);

        // cpal streams are not Send, so the stream lives on its own thread
        // for its whole life; this thread just parks until close
        let thread = thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                let built = (|| {
                    let device = Self::pick_device(device_name.as_deref())?;
                    let (config, sample_format) = Self::pick_config(&device, &stream_params)?;
                    debug!(
                        "Audio config: rate={}, channels={}, format={:?}",
                        config.sample_rate.0, config.channels, sample_format
                    );
                    let in_channels = stream_params.channels as usize;
                    let stream = match sample_format {
                        cpal::SampleFormat::F32 => Self::build_stream::<f32>(
                            &device,
                            &config,
                            in_channels,
                            consumer,
                            stream_error_flag,
                        )?,
                        cpal::SampleFormat::I16 => Self::build_stream::<i16>(
                            &device,
                            &config,
                            in_channels,
                            consumer,
                            stream_error_flag,
                        )?,
                        cpal::SampleFormat::U16 => Self::build_stream::<u16>(
                            &device,
                            &config,
                            in_channels,
                            consumer,
                            stream_error_flag,
                        )?,
                        other => {
                            return Err(Error::AudioOutput(format!(
                                "Unsupported device sample format: {:?}",
                                other
                            )))
                        }
                    };
                    stream
                        .play()
                        .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))?;
                    Ok(stream)
                })();

                match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Park until close; dropping the stream stops it
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.active = Some(ActiveStream {
                    producer,
                    stop_tx,
                    thread: Some(thread),
                    params: *params,
                    error_flag,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::AudioOutput("audio device thread died".to_string()))
            }
        }
    }

    fn play(&mut self, data: &[u8]) -> Result<usize> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::AudioOutput("device not open".to_string()))?;

        let bps = active.params.format.bytes_per_sample();
        let usable = data.len() - data.len() % bps;
        if usable < data.len() {
            debug!("Dropping {} trailing partial-sample bytes", data.len() - usable);
        }

        let samples: Vec<f32> = data[..usable]
            .chunks_exact(bps)
            .map(|s| active.params.format.sample_to_f32(s))
            .collect();

        let mut pushed = 0;
        while pushed < samples.len() {
            if active.error_flag.load(Ordering::SeqCst) {
                return Err(Error::AudioOutput("audio stream failed".to_string()));
            }
            let n = active.producer.push_slice(&samples[pushed..]);
            if n == 0 {
                // Device side is full; the callback drains in real time
                thread::sleep(Duration::from_millis(5));
            } else {
                pushed += n;
            }
        }
        Ok(data.len())
    }

    fn buffered_bytes(&self) -> usize {
        match &self.active {
            Some(a) => a.producer.occupied_len() * a.params.format.bytes_per_sample(),
            None => 0,
        }
    }

    fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            let _ = active.stop_tx.send(());
            if let Some(thread) = active.thread.take() {
                let _ = thread.join();
            }
            debug!("Audio device closed");
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

// ========================================
// Capture sink for tests
// ========================================

#[derive(Default)]
struct Capture {
    delivered: Vec<u8>,
    opens: Vec<SoundParams>,
    closes: usize,
    open: bool,
}

/// Test sink recording everything the output buffer delivers
#[derive(Clone, Default)]
pub struct CaptureSink {
    inner: Arc<Mutex<Capture>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes delivered so far, in delivery order
    pub fn delivered(&self) -> Vec<u8> {
        self.inner.lock().unwrap().delivered.clone()
    }

    /// Every params the sink was opened with, in order
    pub fn opens(&self) -> Vec<SoundParams> {
        self.inner.lock().unwrap().opens.clone()
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().closes
    }
}

impl AudioSink for CaptureSink {
    fn open(&mut self, params: &SoundParams) -> Result<()> {
        let mut c = self.inner.lock().unwrap();
        c.opens.push(*params);
        c.open = true;
        Ok(())
    }

    fn play(&mut self, data: &[u8]) -> Result<usize> {
        let mut c = self.inner.lock().unwrap();
        if !c.open {
            return Err(Error::AudioOutput("capture sink not open".to_string()));
        }
        c.delivered.extend_from_slice(data);
        Ok(data.len())
    }

    fn buffered_bytes(&self) -> usize {
        0
    }

    fn close(&mut self) {
        let mut c = self.inner.lock().unwrap();
        if c.open {
            c.open = false;
            c.closes += 1;
        }
    }
}
