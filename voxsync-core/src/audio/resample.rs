//! Sample-rate conversion for interleaved 16-bit PCM using a rubato
//! `FastFixedIn` resampler.
//!
//! The relay encoder needs one of the Opus rates; speech sources often
//! arrive at 22.05 or 44.1 kHz. When source rate == target rate the
//! converter is a passthrough and no rubato session is created.
//!
//! ```ignore
//! let mut rc = RateConverter::new(44_100, 48_000, 1, 1024)?;
//! let out = rc.process(&pcm_le_bytes); // i16 LE at 48 kHz
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::audio::BYTES_PER_SAMPLE;
use crate::error::{Result, VoxsyncError};

/// Converts interleaved i16 PCM between two fixed sample rates.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    channels: usize,
    /// Per-channel accumulation, held between calls until a full chunk exists.
    input_buf: Vec<Vec<f32>>,
    chunk_size: usize,
    /// `[channels][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `VoxsyncError::Resample` if rubato rejects the parameters.
    pub fn new(source_rate: u32, target_rate: u32, channels: u16, chunk_size: usize) -> Result<Self> {
        let channels = usize::from(channels.max(1));
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                channels,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            channels,
        )
        .map_err(|e| VoxsyncError::Resample(format!("init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::info!(source_rate, target_rate, channels, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            channels,
            input_buf: vec![Vec::with_capacity(chunk_size * 2); channels],
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; channels],
        })
    }

    /// Feed PCM bytes, returning whatever output is ready (may be empty).
    pub fn process(&mut self, pcm: &[u8]) -> Vec<u8> {
        if self.resampler.is_none() {
            return pcm.to_vec();
        }

        let block = self.channels * BYTES_PER_SAMPLE;
        for frame in pcm.chunks_exact(block) {
            for (channel, sample) in frame.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
                let value = i16::from_le_bytes([sample[0], sample[1]]);
                self.input_buf[channel].push(f32::from(value) / 32_768.0);
            }
        }

        let mut result = Vec::new();
        while self.input_buf[0].len() >= self.chunk_size {
            let produced = self.run_chunk();
            self.append_output(produced, &mut result);
            for buf in &mut self.input_buf {
                buf.drain(..self.chunk_size);
            }
        }
        result
    }

    /// Pad the held remainder with silence and emit its share of output.
    pub fn flush(&mut self) -> Vec<u8> {
        let held = self.input_buf.first().map_or(0, Vec::len);
        if self.resampler.is_none() || held == 0 {
            return Vec::new();
        }
        for buf in &mut self.input_buf {
            buf.resize(self.chunk_size, 0.0);
        }
        let produced = self.run_chunk();
        let keep = produced * held / self.chunk_size;
        let mut result = Vec::new();
        self.append_output(keep, &mut result);
        for buf in &mut self.input_buf {
            buf.clear();
        }
        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    fn run_chunk(&mut self) -> usize {
        let Some(ref mut resampler) = self.resampler else {
            return 0;
        };
        let input: Vec<&[f32]> = self
            .input_buf
            .iter()
            .map(|buf| &buf[..self.chunk_size])
            .collect();
        match resampler.process_into_buffer(&input, &mut self.output_buf, None) {
            Ok((_consumed, produced)) => produced,
            Err(e) => {
                error!("resampler process error: {e}");
                0
            }
        }
    }

    fn append_output(&self, frames: usize, out: &mut Vec<u8>) {
        out.reserve(frames * self.channels * BYTES_PER_SAMPLE);
        for index in 0..frames {
            for channel in &self.output_buf {
                let sample = (channel[index] * 32_767.0).clamp(-32_768.0, 32_767.0) as i16;
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence(frames: usize, channels: usize) -> Vec<u8> {
        vec![0u8; frames * channels * BYTES_PER_SAMPLE]
    }

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 1, 960).unwrap();
        assert!(rc.is_passthrough());
        let pcm: Vec<u8> = (0..480u16).flat_map(|i| i.to_le_bytes()).collect();
        assert_eq!(rc.process(&pcm), pcm);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn ratio_44k_to_48k_correct_length() {
        let mut rc = RateConverter::new(44_100, 48_000, 1, 1024).unwrap();
        let out = rc.process(&silence(1024, 1));
        let frames = out.len() / BYTES_PER_SAMPLE;
        let expected = 1024 * 48_000 / 44_100;
        assert!(
            (frames as isize - expected as isize).unsigned_abs() <= 10,
            "frames={frames} expected≈{expected}"
        );
    }

    #[test]
    fn stereo_output_stays_interleaved() {
        let mut rc = RateConverter::new(22_050, 24_000, 2, 512).unwrap();
        let out = rc.process(&silence(1024, 2));
        assert!(!out.is_empty());
        assert_eq!(out.len() % (2 * BYTES_PER_SAMPLE), 0);
    }

    #[test]
    fn partial_chunks_accumulate_until_flush() {
        let mut rc = RateConverter::new(44_100, 48_000, 1, 1024).unwrap();
        assert!(rc.process(&silence(500, 1)).is_empty());
        assert!(!rc.process(&silence(600, 1)).is_empty());
        // 76 frames remain; flush emits roughly their resampled share.
        let tail = rc.flush();
        assert!(!tail.is_empty());
        assert!(tail.len() / BYTES_PER_SAMPLE <= 90);
        assert!(rc.flush().is_empty());
    }
}
