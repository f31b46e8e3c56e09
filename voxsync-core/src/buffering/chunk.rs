//! Validated audio chunk handed from transport callbacks to the ring buffer.

use tracing::warn;

use crate::audio::{pcm_duration_secs, wav};
use crate::buffering::RING_CAPACITY;
use crate::error::{Result, VoxsyncError};

pub const MAX_SAMPLE_RATE: u32 = 192_000;
pub const MAX_CHANNELS: u16 = 8;

/// A borrowed block of interleaved 16-bit PCM at a known format.
///
/// The ring buffer copies the bytes in; the caller keeps ownership.
#[derive(Debug, Clone, Copy)]
pub struct AudioChunk<'a> {
    pub pcm: &'a [u8],
    pub sample_rate: u32,
    pub channels: u16,
}

impl<'a> AudioChunk<'a> {
    /// # Errors
    /// `VoxsyncError::InvalidAudio` for an empty or oversized payload, a zero
    /// or out-of-range sample rate, or an unsupported channel count.
    pub fn new(pcm: &'a [u8], sample_rate: u32, channels: u16) -> Result<Self> {
        if pcm.is_empty() {
            return Err(VoxsyncError::InvalidAudio("empty payload".into()));
        }
        if pcm.len() > RING_CAPACITY {
            return Err(VoxsyncError::InvalidAudio(format!(
                "{} bytes exceeds the {RING_CAPACITY}-byte buffer",
                pcm.len()
            )));
        }
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(VoxsyncError::InvalidAudio(format!(
                "sample rate {sample_rate} Hz out of range"
            )));
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(VoxsyncError::InvalidAudio(format!(
                "{channels} channel(s) not supported"
            )));
        }
        Ok(Self {
            pcm,
            sample_rate,
            channels,
        })
    }

    /// Build a chunk from a transport payload that may start with a WAV
    /// header. A header that fails to parse is logged and left in place,
    /// and the caller's format is used.
    pub fn from_transport(
        bytes: &'a [u8],
        sample_rate: u32,
        channels: u16,
        has_wav_header: bool,
    ) -> Result<Self> {
        if !has_wav_header {
            return Self::new(bytes, sample_rate, channels);
        }
        match wav::strip_wav_header(bytes) {
            Ok((info, pcm)) => Self::new(pcm, info.sample_rate, info.channels),
            Err(e) => {
                warn!(sample_rate, channels, "{e}; using caller format");
                Self::new(bytes, sample_rate, channels)
            }
        }
    }

    pub fn duration_secs(&self) -> f64 {
        pcm_duration_secs(self.pcm.len(), self.sample_rate, self.channels)
    }

    pub fn len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}
