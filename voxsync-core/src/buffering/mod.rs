//! Byte-oriented jitter buffer for decoded PCM.
//!
//! `AudioRingBuffer` wraps a `ringbuf::HeapRb<u8>` behind a `parking_lot`
//! mutex together with the format and duration bookkeeping, so appends,
//! removals and duration updates are observed atomically by the tick thread
//! and by transport threads.

pub mod chunk;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::{debug, warn};

use crate::audio::pcm_duration_secs;
use crate::error::{Result, VoxsyncError};

pub use chunk::AudioChunk;

/// 4 MiB: about 43 s of 24 kHz mono or 22 s of 48 kHz stereo.
pub const RING_CAPACITY: usize = 4 * 1024 * 1024;

struct RingState {
    data: HeapRb<u8>,
    sample_rate: u32,
    channels: u16,
    duration: f64,
}

/// Fixed-capacity FIFO of PCM bytes plus the playback duration they cover.
pub struct AudioRingBuffer {
    state: Mutex<RingState>,
}

impl Default for AudioRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                data: HeapRb::new(capacity),
                sample_rate: 0,
                channels: 0,
                duration: 0.0,
            }),
        }
    }

    /// Append raw bytes. Fails without writing anything when they do not fit.
    pub fn append_data(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        Self::append_locked(&mut state, bytes)
    }

    /// Ingest a validated chunk: format update, append and duration bump
    /// happen under one lock. A format change between chunks is logged but
    /// does not block ingestion. Returns the seconds added.
    pub fn enqueue_chunk(&self, chunk: &AudioChunk<'_>) -> Result<f64> {
        let mut state = self.state.lock();
        let previous = (state.sample_rate, state.channels);
        if previous != (0, 0) && previous != (chunk.sample_rate, chunk.channels) {
            warn!(
                old_rate = previous.0,
                old_channels = previous.1,
                new_rate = chunk.sample_rate,
                new_channels = chunk.channels,
                "audio format changed mid-stream"
            );
        }

        Self::append_locked(&mut state, chunk.pcm)?;
        state.sample_rate = chunk.sample_rate;
        state.channels = chunk.channels;
        let seconds = chunk.duration_secs();
        state.duration += seconds;
        Ok(seconds)
    }

    fn append_locked(state: &mut RingState, bytes: &[u8]) -> Result<()> {
        let available = state.data.vacant_len();
        if bytes.len() > available {
            return Err(VoxsyncError::RingBufferFull {
                requested: bytes.len(),
                available,
            });
        }
        let written = state.data.push_slice(bytes);
        debug_assert_eq!(written, bytes.len());
        Ok(())
    }

    /// Copy up to `out.len()` bytes from the front without consuming them.
    pub fn get_data(&self, out: &mut [u8]) -> usize {
        let state = self.state.lock();
        let (head, tail) = state.data.as_slices();
        let n = out.len().min(head.len() + tail.len());
        let from_head = n.min(head.len());
        out[..from_head].copy_from_slice(&head[..from_head]);
        out[from_head..n].copy_from_slice(&tail[..n - from_head]);
        n
    }

    /// Consume up to `count` bytes from the front and shrink the recorded
    /// duration by the time they covered. Returns the bytes removed.
    pub fn remove_data(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        let removed = state.data.skip(count);
        let seconds = pcm_duration_secs(removed, state.sample_rate, state.channels);
        state.duration = (state.duration - seconds).max(0.0);
        if state.data.is_empty() {
            state.duration = 0.0;
        }
        removed
    }

    /// Drop all bytes and forget the format.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let cleared = state.data.clear();
        state.sample_rate = 0;
        state.channels = 0;
        state.duration = 0.0;
        if cleared > 0 {
            debug!(bytes = cleared, "audio buffer reset");
        }
    }

    pub fn set_format(&self, sample_rate: u32, channels: u16) {
        let mut state = self.state.lock();
        state.sample_rate = sample_rate;
        state.channels = channels;
    }

    pub fn format(&self) -> (u32, u16) {
        let state = self.state.lock();
        (state.sample_rate, state.channels)
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.state.lock().channels
    }

    pub fn set_total_duration(&self, seconds: f64) {
        self.state.lock().duration = seconds.max(0.0);
    }

    pub fn append_to_total_duration(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.duration = (state.duration + seconds).max(0.0);
    }

    pub fn total_duration(&self) -> f64 {
        self.state.lock().duration
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }

    pub fn available_bytes(&self) -> usize {
        self.state.lock().data.occupied_len()
    }

    pub fn free_bytes(&self) -> usize {
        self.state.lock().data.vacant_len()
    }
}
