//! Sender half of the relay: bring arbitrary-rate speech PCM to an Opus
//! rate and cut it into packets.

use tracing::debug;

use super::{CodecFormat, EncoderHint, OpusPacketEncoder, SUPPORTED_SAMPLE_RATES};
use crate::audio::resample::RateConverter;
use crate::error::Result;

/// Input frames per rubato chunk.
const RESAMPLE_CHUNK: usize = 1024;

/// Smallest Opus rate at or above `source_rate`, capped at 48 kHz.
pub fn relay_rate(source_rate: u32) -> u32 {
    SUPPORTED_SAMPLE_RATES
        .iter()
        .copied()
        .find(|rate| *rate >= source_rate)
        .unwrap_or(48_000)
}

pub struct RelayEncoder {
    converter: RateConverter,
    encoder: OpusPacketEncoder,
    format: CodecFormat,
    /// Converted PCM not yet packed.
    pending: Vec<u8>,
}

impl RelayEncoder {
    pub fn new(source_rate: u32, channels: u16, hint: EncoderHint) -> Result<Self> {
        let target = relay_rate(source_rate);
        let format = CodecFormat::new(target, channels)?;
        let converter = RateConverter::new(source_rate, target, channels, RESAMPLE_CHUNK)?;
        let mut encoder = OpusPacketEncoder::new();
        encoder.init(target, channels, hint)?;
        debug!(source_rate, target, channels, "relay encoder ready");
        Ok(Self {
            converter,
            encoder,
            format,
            pending: Vec::new(),
        })
    }

    /// Format of the packets produced, which the receiving decoder must use.
    pub fn format(&self) -> CodecFormat {
        self.format
    }

    /// Feed source PCM; returns every packet that could be completed.
    pub fn push(&mut self, pcm: &[u8]) -> Vec<Vec<u8>> {
        let converted = self.converter.process(pcm);
        self.pending.extend_from_slice(&converted);
        self.drain()
    }

    /// Pad whatever is held to a whole frame and pack it.
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        let tail = self.converter.flush();
        self.pending.extend_from_slice(&tail);
        let frame = self.format.frame_bytes();
        let partial = self.pending.len() % frame;
        if partial != 0 {
            self.pending.resize(self.pending.len() + frame - partial, 0);
        }
        self.drain()
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        let frame = self.format.frame_bytes();
        let mut packets = Vec::new();
        while self.pending.len() >= frame {
            let out = self.encoder.encode(&self.pending);
            let consumed = self.pending.len() - out.leftover;
            if !out.packet.is_empty() {
                packets.push(out.packet.to_vec());
            }
            self.pending.drain(..consumed);
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusPacketDecoder;

    fn tone(samples: usize, rate: u32) -> Vec<u8> {
        (0..samples)
            .map(|i| {
                let t = i as f32 / rate as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16
            })
            .flat_map(i16::to_le_bytes)
            .collect()
    }

    fn decode_all(format: CodecFormat, packets: &[Vec<u8>]) -> usize {
        let mut decoder = OpusPacketDecoder::new();
        decoder
            .init(format.sample_rate, format.channels)
            .expect("decoder init");
        packets.iter().map(|p| decoder.decode(p).len()).sum()
    }

    #[test]
    fn picks_nearest_opus_rate() {
        assert_eq!(relay_rate(8_000), 8_000);
        assert_eq!(relay_rate(16_000), 16_000);
        assert_eq!(relay_rate(22_050), 24_000);
        assert_eq!(relay_rate(44_100), 48_000);
        assert_eq!(relay_rate(96_000), 48_000);
    }

    #[test]
    fn splits_long_input_into_full_packets() {
        let mut relay = RelayEncoder::new(16_000, 1, EncoderHint::Voice).unwrap();
        // 1.5 s: one full packet and one half packet.
        let packets = relay.push(&tone(24_000, 16_000));
        assert_eq!(packets.len(), 2);
        assert!(relay.flush().is_empty());
        assert_eq!(decode_all(relay.format(), &packets), 48_000);
    }

    #[test]
    fn flush_pads_partial_frame() {
        let mut relay = RelayEncoder::new(16_000, 1, EncoderHint::Voice).unwrap();
        assert!(relay.push(&tone(50, 16_000)).is_empty());
        let packets = relay.flush();
        assert_eq!(packets.len(), 1);
        assert_eq!(decode_all(relay.format(), &packets), 640);
    }

    #[test]
    fn resamples_to_relay_rate() {
        let mut relay = RelayEncoder::new(22_050, 1, EncoderHint::Audio).unwrap();
        assert_eq!(relay.format().sample_rate, 24_000);
        let mut packets = relay.push(&tone(22_050, 22_050));
        packets.extend(relay.flush());
        let samples = decode_all(relay.format(), &packets) / 2;
        assert!((23_000..=25_000).contains(&samples), "samples={samples}");
    }

    #[test]
    fn rejects_unsupported_channel_count() {
        assert!(RelayEncoder::new(16_000, 3, EncoderHint::Voice).is_err());
    }
}
