//! Audio output seam and PCM helpers.
//!
//! # Design constraints
//!
//! The engine hands decoded 16-bit PCM to an [`AudioSink`] from its tick
//! thread. Sinks backed by a real device (see `CpalSink`, behind the
//! `audio-cpal` feature) must keep their device callback free of locks and
//! allocation: PCM crosses into the callback through an SPSC ring buffer
//! whose `pop_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms, so `AudioSink` carries no
//! `Send` bound. The engine that owns a sink lives on the thread that
//! created it.

pub mod resample;
pub mod wav;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

#[cfg(feature = "audio-cpal")]
pub use self::cpal_sink::CpalSink;

/// Bytes in one 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Playback duration of `bytes` of interleaved 16-bit PCM.
pub fn pcm_duration_secs(bytes: usize, sample_rate: u32, channels: u16) -> f64 {
    if sample_rate == 0 || channels == 0 {
        return 0.0;
    }
    bytes as f64 / (f64::from(sample_rate) * f64::from(channels) * BYTES_PER_SAMPLE as f64)
}

/// Whole sample frames of PCM covering at most `seconds`.
pub fn pcm_bytes_for(seconds: f64, sample_rate: u32, channels: u16) -> usize {
    let block = usize::from(channels) * BYTES_PER_SAMPLE;
    if block == 0 || sample_rate == 0 || seconds <= 0.0 {
        return 0;
    }
    // Nudge up so durations computed from byte counts map back exactly.
    let frames = (seconds * f64::from(sample_rate) + 1e-6).floor() as usize;
    frames * block
}

/// Whether a reconfiguration finished inside `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Ready,
    /// The sink finishes asynchronously and will be told via
    /// `StreamEngine::finish_reconfiguration`.
    Pending,
}

/// Where dispatched PCM goes.
pub trait AudioSink {
    /// Format the sink is currently configured for.
    fn format(&self) -> Option<(u32, u16)>;

    fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<ConfigureOutcome>;

    /// Queue interleaved 16-bit little-endian PCM for playback.
    fn queue_audio(&mut self, pcm: &[u8]);

    fn set_volume(&mut self, volume: f32);

    /// Drop everything queued but not yet played.
    fn reset(&mut self);

    fn pause(&mut self) {}

    fn resume(&mut self) {}
}

/// What a [`MemorySink`] has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct SinkRecord {
    pub format: Option<(u32, u16)>,
    pub queued: Vec<u8>,
    pub queue_calls: usize,
    pub configures: usize,
    pub resets: usize,
    pub volumes: Vec<f32>,
    pub paused: bool,
}

/// In-memory sink. Clones share one record, so a caller can keep a handle
/// after moving the sink into an engine.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    record: Arc<Mutex<SinkRecord>>,
    defer_configure: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every reconfiguration as [`ConfigureOutcome::Pending`].
    pub fn with_deferred_configure(mut self) -> Self {
        self.defer_configure = true;
        self
    }

    pub fn record(&self) -> SinkRecord {
        self.record.lock().clone()
    }

    pub fn queued_bytes(&self) -> usize {
        self.record.lock().queued.len()
    }

    pub fn last_volume(&self) -> Option<f32> {
        self.record.lock().volumes.last().copied()
    }
}

impl AudioSink for MemorySink {
    fn format(&self) -> Option<(u32, u16)> {
        self.record.lock().format
    }

    fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<ConfigureOutcome> {
        let mut record = self.record.lock();
        record.format = Some((sample_rate, channels));
        record.configures += 1;
        Ok(if self.defer_configure {
            ConfigureOutcome::Pending
        } else {
            ConfigureOutcome::Ready
        })
    }

    fn queue_audio(&mut self, pcm: &[u8]) {
        let mut record = self.record.lock();
        record.queued.extend_from_slice(pcm);
        record.queue_calls += 1;
    }

    fn set_volume(&mut self, volume: f32) {
        self.record.lock().volumes.push(volume);
    }

    fn reset(&mut self) {
        let mut record = self.record.lock();
        record.queued.clear();
        record.resets += 1;
    }

    fn pause(&mut self) {
        self.record.lock().paused = true;
    }

    fn resume(&mut self) {
        self.record.lock().paused = false;
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_sink {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleRate, Stream, StreamConfig};
    use ringbuf::traits::{Consumer, Observer, Producer, Split};
    use ringbuf::{HeapProd, HeapRb};
    use tracing::{error, info, warn};

    use super::{AudioSink, ConfigureOutcome};
    use crate::error::{Result, VoxsyncError};

    /// Seconds of audio the device-side queue can hold.
    const DEVICE_QUEUE_SECONDS: usize = 4;

    struct ActiveStream {
        stream: Stream,
        producer: HeapProd<f32>,
        format: (u32, u16),
    }

    /// Plays PCM on the default output device.
    ///
    /// **Not `Send`**: `cpal::Stream` is bound to its creation thread.
    pub struct CpalSink {
        device: Device,
        active: Option<ActiveStream>,
        volume: Arc<AtomicU32>,
        flush: Arc<AtomicBool>,
        scratch: Vec<f32>,
    }

    impl CpalSink {
        /// # Errors
        /// `VoxsyncError::NoDefaultOutputDevice` when the host has no output.
        pub fn open_default() -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(VoxsyncError::NoDefaultOutputDevice)?;
            info!(
                device = device.name().unwrap_or_default().as_str(),
                "opening output device"
            );
            Ok(Self {
                device,
                active: None,
                volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
                flush: Arc::new(AtomicBool::new(false)),
                scratch: Vec::new(),
            })
        }
    }

    impl AudioSink for CpalSink {
        fn format(&self) -> Option<(u32, u16)> {
            self.active.as_ref().map(|a| a.format)
        }

        fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<ConfigureOutcome> {
            self.active = None;

            let config = StreamConfig {
                channels,
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let capacity = sample_rate as usize * usize::from(channels) * DEVICE_QUEUE_SECONDS;
            let (producer, mut consumer) = HeapRb::<f32>::new(capacity).split();

            let volume = Arc::clone(&self.volume);
            let flush = Arc::clone(&self.flush);
            let stream = self
                .device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        if flush.swap(false, Ordering::AcqRel) {
                            consumer.clear();
                        }
                        let gain = f32::from_bits(volume.load(Ordering::Relaxed));
                        let filled = consumer.pop_slice(data);
                        for sample in &mut data[..filled] {
                            *sample *= gain;
                        }
                        data[filled..].fill(0.0);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
                .map_err(|e| VoxsyncError::AudioStream(e.to_string()))?;

            stream
                .play()
                .map_err(|e| VoxsyncError::AudioStream(e.to_string()))?;

            info!(sample_rate, channels, "output stream configured");
            self.active = Some(ActiveStream {
                stream,
                producer,
                format: (sample_rate, channels),
            });
            Ok(ConfigureOutcome::Ready)
        }

        fn queue_audio(&mut self, pcm: &[u8]) {
            let Some(active) = self.active.as_mut() else {
                warn!(bytes = pcm.len(), "output not configured, dropping audio");
                return;
            };
            self.scratch.clear();
            self.scratch.extend(
                pcm.chunks_exact(2)
                    .map(|s| f32::from(i16::from_le_bytes([s[0], s[1]])) / 32_768.0),
            );
            let written = active.producer.push_slice(&self.scratch);
            if written < self.scratch.len() {
                warn!(
                    dropped = self.scratch.len() - written,
                    free = active.producer.vacant_len(),
                    "device queue full"
                );
            }
        }

        fn set_volume(&mut self, volume: f32) {
            self.volume
                .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        }

        fn reset(&mut self) {
            self.flush.store(true, Ordering::Release);
        }

        fn pause(&mut self) {
            if let Some(active) = &self.active {
                if let Err(e) = active.stream.pause() {
                    warn!("output pause failed: {e}");
                }
            }
        }

        fn resume(&mut self) {
            if let Some(active) = &self.active {
                if let Err(e) = active.stream.play() {
                    warn!("output resume failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn duration_and_byte_conversions_agree() {
        assert_relative_eq!(pcm_duration_secs(32_000, 16_000, 1), 1.0);
        assert_relative_eq!(pcm_duration_secs(19_200, 48_000, 2), 0.1);
        assert_eq!(pcm_duration_secs(100, 0, 1), 0.0);

        assert_eq!(pcm_bytes_for(1.0, 16_000, 1), 32_000);
        assert_eq!(pcm_bytes_for(0.1, 48_000, 2), 19_200);
        assert_eq!(pcm_bytes_for(-1.0, 48_000, 2), 0);
        let seconds = pcm_duration_secs(12_346, 24_000, 1);
        assert_eq!(pcm_bytes_for(seconds, 24_000, 1), 12_346);
    }

    #[test]
    fn memory_sink_clones_share_record() {
        let sink = MemorySink::new();
        let mut moved = sink.clone();
        assert_eq!(moved.configure(16_000, 1).unwrap(), ConfigureOutcome::Ready);
        moved.queue_audio(&[1, 2, 3, 4]);
        moved.set_volume(0.5);
        assert_eq!(sink.format(), Some((16_000, 1)));
        assert_eq!(sink.queued_bytes(), 4);
        assert_eq!(sink.last_volume(), Some(0.5));
        moved.reset();
        assert_eq!(sink.queued_bytes(), 0);
        assert_eq!(sink.record().resets, 1);
    }

    #[test]
    fn deferred_sink_reports_pending() {
        let mut sink = MemorySink::new().with_deferred_configure();
        assert_eq!(sink.configure(24_000, 2).unwrap(), ConfigureOutcome::Pending);
    }
}
