//! Opus relay codec: many 20 ms frames per packet, one header per packet.
//!
//! Both halves keep their scratch buffers sized for the worst case
//! ([`MAX_OPUS_FRAMES`] frames) from construction, so `encode`/`decode` do
//! not allocate on the per-packet path.
//!
//! The encoder stamps each packet with a wrapping generation counter. The
//! decoder only uses it to count gaps; it never reorders.

pub mod packet;
pub mod relay;

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Bitrate, Channels, SampleRate as OpusSampleRate};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audio::BYTES_PER_SAMPLE;
use crate::error::{Result, VoxsyncError};
use packet::PacketView;

/// Sample rates libopus accepts natively.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// 20 ms frames.
pub const FRAMES_PER_SECOND: u32 = 50;

/// Frames per packet; one second of audio.
pub const MAX_OPUS_FRAMES: usize = 50;

/// Largest Opus frame libopus can produce.
pub const MAX_FRAME_BYTES: usize = 1275;

/// Worst-case encoded packet size.
pub const MAX_PACKET_BYTES: usize = packet::header_len(MAX_OPUS_FRAMES) + MAX_OPUS_FRAMES * MAX_FRAME_BYTES;

const ENCODER_COMPLEXITY: u8 = 1;
const BITRATE_PER_CHANNEL: i32 = 24_000;

/// Application hint forwarded to libopus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderHint {
    #[default]
    Voice,
    Audio,
    LowDelay,
}

impl From<EncoderHint> for Application {
    fn from(hint: EncoderHint) -> Self {
        match hint {
            EncoderHint::Voice => Application::Voip,
            EncoderHint::Audio => Application::Audio,
            EncoderHint::LowDelay => Application::LowDelay,
        }
    }
}

/// Validated (rate, channels) pair the codec runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl CodecFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if is_supported(sample_rate, channels) {
            Ok(Self {
                sample_rate,
                channels,
            })
        } else {
            Err(VoxsyncError::UnsupportedFormat {
                sample_rate,
                channels,
            })
        }
    }

    /// Samples per channel in one 20 ms frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate / FRAMES_PER_SECOND) as usize
    }

    /// Interleaved PCM bytes in one 20 ms frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * usize::from(self.channels) * BYTES_PER_SAMPLE
    }

    fn opus_rate(&self) -> OpusSampleRate {
        match self.sample_rate {
            8_000 => OpusSampleRate::Hz8000,
            12_000 => OpusSampleRate::Hz12000,
            16_000 => OpusSampleRate::Hz16000,
            24_000 => OpusSampleRate::Hz24000,
            _ => OpusSampleRate::Hz48000,
        }
    }

    fn opus_channels(&self) -> Channels {
        if self.channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        }
    }
}

pub fn is_supported(sample_rate: u32, channels: u16) -> bool {
    SUPPORTED_SAMPLE_RATES.contains(&sample_rate) && matches!(channels, 1 | 2)
}

/// Result of one encode call.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOutput<'a> {
    /// Header + frames. Empty on failure.
    pub packet: &'a [u8],
    /// Trailing input bytes that did not fill a whole frame, or that did not
    /// fit in this packet. The caller resubmits them with the next chunk.
    pub leftover: usize,
    pub frames: usize,
}

impl EncodeOutput<'_> {
    fn failed() -> Self {
        Self {
            packet: &[],
            leftover: 0,
            frames: 0,
        }
    }
}

struct EncoderState {
    opus: OpusEncoder,
    format: CodecFormat,
}

/// Packs interleaved 16-bit PCM into multi-frame packets.
pub struct OpusPacketEncoder {
    state: Option<EncoderState>,
    generation: u8,
    packet: Vec<u8>,
    frame_pcm: Vec<i16>,
}

impl Default for OpusPacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl OpusPacketEncoder {
    /// An encoder that rejects every call until [`init`](Self::init) succeeds.
    pub fn new() -> Self {
        Self {
            state: None,
            generation: 0,
            packet: vec![0u8; MAX_PACKET_BYTES],
            frame_pcm: Vec::new(),
        }
    }

    /// (Re)initialize for `sample_rate`/`channels`. Resets the generation
    /// counter. A failed init leaves the encoder uninitialized.
    pub fn init(&mut self, sample_rate: u32, channels: u16, hint: EncoderHint) -> Result<()> {
        self.state = None;
        let format = CodecFormat::new(sample_rate, channels).inspect_err(|e| {
            warn!("opus encoder init rejected: {e}");
        })?;

        let mut opus = OpusEncoder::new(format.opus_rate(), format.opus_channels(), hint.into())
            .map_err(|e| VoxsyncError::Codec(format!("encoder create: {e}")))?;
        opus.set_vbr(true)
            .map_err(|e| VoxsyncError::Codec(format!("set_vbr: {e}")))?;
        opus.set_complexity(ENCODER_COMPLEXITY)
            .map_err(|e| VoxsyncError::Codec(format!("set_complexity: {e}")))?;
        opus.set_bitrate(Bitrate::BitsPerSecond(
            BITRATE_PER_CHANNEL * i32::from(channels),
        ))
        .map_err(|e| VoxsyncError::Codec(format!("set_bitrate: {e}")))?;

        self.frame_pcm = vec![0i16; format.frame_samples() * usize::from(channels)];
        self.generation = 0;
        self.state = Some(EncoderState { opus, format });

        info!(sample_rate, channels, ?hint, "opus encoder ready");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn format(&self) -> Option<CodecFormat> {
        self.state.as_ref().map(|s| s.format)
    }

    /// Generation the next packet will carry.
    pub fn next_generation(&self) -> u8 {
        self.generation
    }

    /// Encode as many whole frames of `raw` as fit in one packet.
    ///
    /// Every call consumes a generation number, including failed ones. On a
    /// libopus failure the header is zeroed and no partial packet is
    /// returned.
    pub fn try_encode(&mut self, raw: &[u8]) -> Result<EncodeOutput<'_>> {
        let state = self
            .state
            .as_mut()
            .ok_or(VoxsyncError::CodecNotInitialized)?;

        let frame_bytes = state.format.frame_bytes();
        let frames = (raw.len() / frame_bytes).min(MAX_OPUS_FRAMES);
        let leftover = raw.len() - frames * frame_bytes;

        let generation = self.generation;
        self.generation = self.generation.wrapping_add(1);

        let header_len = packet::header_len(frames);
        packet::write_prefix(&mut self.packet, frames as u8, generation);

        let mut cursor = header_len;
        for (index, frame) in raw[..frames * frame_bytes]
            .chunks_exact(frame_bytes)
            .enumerate()
        {
            for (dst, src) in self.frame_pcm.iter_mut().zip(frame.chunks_exact(2)) {
                *dst = i16::from_le_bytes([src[0], src[1]]);
            }

            let end = cursor + MAX_FRAME_BYTES;
            let written = match state.opus.encode(&self.frame_pcm, &mut self.packet[cursor..end]) {
                Ok(written) => written,
                Err(e) => {
                    self.packet[..header_len].fill(0);
                    return Err(VoxsyncError::Codec(format!("frame {index}: {e}")));
                }
            };

            // 0/1 byte results are DTX no-ops; keep the slot empty.
            if written > 1 {
                cursor += written;
            }
            packet::write_offset(&mut self.packet, index, (cursor - header_len) as u16);
        }

        Ok(EncodeOutput {
            packet: &self.packet[..cursor],
            leftover,
            frames,
        })
    }

    /// [`try_encode`](Self::try_encode) that logs failures and returns an
    /// empty packet. Input from a failed call is dropped.
    pub fn encode(&mut self, raw: &[u8]) -> EncodeOutput<'_> {
        match self.try_encode(raw) {
            Ok(out) => out,
            Err(e) => {
                error!("opus encode failed: {e}");
                EncodeOutput::failed()
            }
        }
    }
}

/// Counters kept by the decoder. Cheap to copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoderStats {
    pub packets: u64,
    pub rejected: u64,
    pub frames_decoded: u64,
    pub frames_skipped: u64,
    pub generation_gaps: u64,
}

struct DecoderState {
    opus: OpusDecoder,
    format: CodecFormat,
}

/// Unpacks multi-frame packets back to interleaved 16-bit PCM.
pub struct OpusPacketDecoder {
    state: Option<DecoderState>,
    last_generation: Option<u8>,
    pcm: Vec<u8>,
    frame_pcm: Vec<i16>,
    stats: DecoderStats,
}

impl Default for OpusPacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl OpusPacketDecoder {
    pub fn new() -> Self {
        Self {
            state: None,
            last_generation: None,
            pcm: Vec::new(),
            frame_pcm: Vec::new(),
            stats: DecoderStats::default(),
        }
    }

    pub fn init(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        self.state = None;
        let format = CodecFormat::new(sample_rate, channels).inspect_err(|e| {
            warn!("opus decoder init rejected: {e}");
        })?;

        let opus = OpusDecoder::new(format.opus_rate(), format.opus_channels())
            .map_err(|e| VoxsyncError::Codec(format!("decoder create: {e}")))?;

        self.frame_pcm = vec![0i16; format.frame_samples() * usize::from(channels)];
        self.pcm = Vec::with_capacity(MAX_OPUS_FRAMES * format.frame_bytes());
        self.last_generation = None;
        self.stats = DecoderStats::default();
        self.state = Some(DecoderState { opus, format });

        info!(sample_rate, channels, "opus decoder ready");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn format(&self) -> Option<CodecFormat> {
        self.state.as_ref().map(|s| s.format)
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Decode one packet into interleaved little-endian PCM.
    ///
    /// The header is fully validated before any frame is decoded. Empty
    /// frames are skipped; a frame libopus rejects is logged and skipped
    /// while the rest of the packet still decodes.
    pub fn try_decode(&mut self, packet: &[u8]) -> Result<&[u8]> {
        self.pcm.clear();
        if self.state.is_none() {
            return Err(VoxsyncError::CodecNotInitialized);
        }

        self.stats.packets += 1;
        let view = PacketView::parse(packet, MAX_OPUS_FRAMES).inspect_err(|_| {
            self.stats.rejected += 1;
        })?;
        self.track_generation(view.generation());

        let state = self
            .state
            .as_mut()
            .ok_or(VoxsyncError::CodecNotInitialized)?;
        let channels = usize::from(state.format.channels);

        for (index, frame) in view.frames().enumerate() {
            if frame.is_empty() {
                continue;
            }
            let decoded = frame.try_into().and_then(|packet| {
                let output = (&mut self.frame_pcm[..]).try_into()?;
                state.opus.decode(Some(packet), output, false)
            });
            match decoded {
                Ok(per_channel) => {
                    let samples = (per_channel * channels).min(self.frame_pcm.len());
                    for sample in &self.frame_pcm[..samples] {
                        self.pcm.extend_from_slice(&sample.to_le_bytes());
                    }
                    self.stats.frames_decoded += 1;
                }
                Err(e) => {
                    warn!(frame = index, "opus frame decode failed, skipping: {e}");
                    self.stats.frames_skipped += 1;
                }
            }
        }

        Ok(&self.pcm)
    }

    /// [`try_decode`](Self::try_decode) that logs rejects and returns an
    /// empty slice.
    pub fn decode(&mut self, packet: &[u8]) -> &[u8] {
        match self.try_decode(packet) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("dropping packet: {e}");
                &[]
            }
        }
    }

    fn track_generation(&mut self, generation: u8) {
        if let Some(last) = self.last_generation {
            let expected = last.wrapping_add(1);
            if generation != expected {
                let missed = generation.wrapping_sub(expected);
                debug!(expected, got = generation, missed, "packet generation gap");
                self.stats.generation_gaps += 1;
            }
        }
        self.last_generation = Some(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(format: CodecFormat, samples_per_channel: usize) -> Vec<u8> {
        let channels = usize::from(format.channels);
        let mut out = Vec::with_capacity(samples_per_channel * channels * 2);
        for i in 0..samples_per_channel {
            let t = i as f32 / format.sample_rate as f32;
            let s = ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16;
            for _ in 0..channels {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        out
    }

    fn pair(sample_rate: u32, channels: u16) -> (OpusPacketEncoder, OpusPacketDecoder) {
        let mut encoder = OpusPacketEncoder::new();
        encoder
            .init(sample_rate, channels, EncoderHint::Voice)
            .expect("encoder init");
        let mut decoder = OpusPacketDecoder::new();
        decoder.init(sample_rate, channels).expect("decoder init");
        (encoder, decoder)
    }

    #[test]
    fn init_accepts_every_supported_format() {
        for rate in SUPPORTED_SAMPLE_RATES {
            for channels in [1u16, 2] {
                let mut encoder = OpusPacketEncoder::new();
                assert!(encoder.init(rate, channels, EncoderHint::Voice).is_ok());
                let mut decoder = OpusPacketDecoder::new();
                assert!(decoder.init(rate, channels).is_ok());
            }
        }
    }

    #[test]
    fn init_rejects_unsupported_formats() {
        let mut encoder = OpusPacketEncoder::new();
        for (rate, channels) in [(44_100, 1), (22_050, 2), (16_000, 0), (16_000, 3), (0, 1)] {
            assert!(encoder.init(rate, channels, EncoderHint::Audio).is_err());
            assert!(!encoder.is_initialized());
        }
    }

    #[test]
    fn uninitialized_codec_returns_empty_output() {
        let mut encoder = OpusPacketEncoder::new();
        let out = encoder.encode(&[0u8; 640]);
        assert!(out.packet.is_empty());

        let mut decoder = OpusPacketDecoder::new();
        assert!(decoder.decode(&[1, 0, 0, 0]).is_empty());
        assert!(matches!(
            decoder.try_decode(&[0, 0]),
            Err(VoxsyncError::CodecNotInitialized)
        ));
    }

    #[test]
    fn round_trip_preserves_frame_aligned_sample_count() {
        for rate in SUPPORTED_SAMPLE_RATES {
            for channels in [1u16, 2] {
                let (mut encoder, mut decoder) = pair(rate, channels);
                let format = CodecFormat::new(rate, channels).expect("format");
                let frame_samples = format.frame_samples();
                let input = tone(format, frame_samples * 7 + 13);

                let out = encoder.encode(&input);
                assert_eq!(out.frames, 7);
                assert_eq!(out.leftover, 13 * usize::from(channels) * 2);
                let packet = out.packet.to_vec();

                let pcm = decoder.decode(&packet);
                assert_eq!(
                    pcm.len(),
                    7 * format.frame_bytes(),
                    "rate={rate} channels={channels}"
                );
            }
        }
    }

    #[test]
    fn packet_is_capped_at_max_frames() {
        let (mut encoder, _) = pair(16_000, 1);
        let format = CodecFormat::new(16_000, 1).expect("format");
        let input = tone(format, format.frame_samples() * (MAX_OPUS_FRAMES + 3));
        let out = encoder.encode(&input);
        assert_eq!(out.frames, MAX_OPUS_FRAMES);
        assert_eq!(out.leftover, 3 * format.frame_bytes());
    }

    #[test]
    fn short_input_produces_header_only_packet() {
        let (mut encoder, mut decoder) = pair(16_000, 1);
        let out = encoder.encode(&[0u8; 100]);
        assert_eq!(out.frames, 0);
        assert_eq!(out.leftover, 100);
        let packet = out.packet.to_vec();
        assert_eq!(packet, vec![0, 0]);
        assert!(decoder.decode(&packet).is_empty());
        assert_eq!(decoder.stats().rejected, 0);
    }

    #[test]
    fn generation_advances_and_wraps() {
        let (mut encoder, _) = pair(8_000, 1);
        let format = CodecFormat::new(8_000, 1).expect("format");
        let frame = tone(format, format.frame_samples());
        for expected in 0..=255u8 {
            let out = encoder.encode(&frame);
            assert_eq!(out.packet[1], expected);
        }
        assert_eq!(encoder.next_generation(), 0);
    }

    #[test]
    fn decoder_counts_generation_gaps() {
        let (mut encoder, mut decoder) = pair(16_000, 1);
        let format = CodecFormat::new(16_000, 1).expect("format");
        let frame = tone(format, format.frame_samples());
        let packets: Vec<Vec<u8>> = (0..3).map(|_| encoder.encode(&frame).packet.to_vec()).collect();

        decoder.decode(&packets[0]);
        decoder.decode(&packets[2]);
        assert_eq!(decoder.stats().generation_gaps, 1);
        assert_eq!(decoder.stats().frames_decoded, 2);
    }

    #[test]
    fn corrupt_header_yields_empty_output() {
        let (mut encoder, mut decoder) = pair(16_000, 1);
        let format = CodecFormat::new(16_000, 1).expect("format");
        let input = tone(format, format.frame_samples() * 2);
        let mut packet = encoder.encode(&input).packet.to_vec();

        // Swap the two offsets so they decrease.
        let first = [packet[2], packet[3]];
        let second = [packet[4], packet[5]];
        packet[2..4].copy_from_slice(&second);
        packet[4..6].copy_from_slice(&first);
        assert!(decoder.decode(&packet).is_empty());

        let mut truncated = encoder.encode(&input).packet.to_vec();
        truncated.truncate(truncated.len() - 1);
        assert!(decoder.decode(&truncated).is_empty());
        assert_eq!(decoder.stats().rejected, 2);
    }

    #[test]
    fn empty_frame_slots_are_skipped() {
        let (mut encoder, mut decoder) = pair(16_000, 1);
        let format = CodecFormat::new(16_000, 1).expect("format");
        let single = encoder.encode(&tone(format, format.frame_samples())).packet.to_vec();
        let frame = &single[packet::header_len(1)..];

        // Two declared frames, the first one empty.
        let mut crafted = vec![0u8; packet::header_len(2)];
        packet::write_prefix(&mut crafted, 2, 1);
        packet::write_offset(&mut crafted, 0, 0);
        packet::write_offset(&mut crafted, 1, frame.len() as u16);
        crafted.extend_from_slice(frame);

        let pcm = decoder.decode(&crafted);
        assert_eq!(pcm.len(), format.frame_bytes());
    }

    #[test]
    fn corrupt_frame_is_skipped_and_neighbours_decode() {
        let (mut encoder, mut decoder) = pair(16_000, 1);
        let format = CodecFormat::new(16_000, 1).expect("format");
        let single = encoder.encode(&tone(format, format.frame_samples())).packet.to_vec();
        let frame = &single[packet::header_len(1)..];
        // Code-3 TOC declaring zero frames; libopus rejects it as invalid.
        let garbage = [0x03u8, 0x00];

        let mut crafted = vec![0u8; packet::header_len(3)];
        packet::write_prefix(&mut crafted, 3, 0);
        let mut offset = 0usize;
        for (index, bytes) in [frame, &garbage[..], frame].into_iter().enumerate() {
            offset += bytes.len();
            packet::write_offset(&mut crafted, index, offset as u16);
        }
        crafted.extend_from_slice(frame);
        crafted.extend_from_slice(&garbage);
        crafted.extend_from_slice(frame);

        let pcm = decoder.try_decode(&crafted).expect("header is valid").len();
        assert_eq!(pcm, 2 * format.frame_bytes());
        let stats = decoder.stats();
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.rejected, 0);
    }
}
