//! WAV header handling for inbound chunks.
//!
//! Streaming producers often write 0 or 0xFFFFFFFF into the RIFF and `data`
//! length fields. Those fields are rewritten in a copy of the header before
//! hound sees it; the PCM itself is never copied.

use std::io::Cursor;

use crate::error::{Result, VoxsyncError};

/// Length of a canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// Length of a RIFF chunk header: id + u32 size.
const CHUNK_HEADER_LEN: usize = 8;

/// Byte offset of the first sub-chunk after `RIFF....WAVE`.
const FIRST_CHUNK: usize = 12;

/// A located WAV header: parsed format plus where the PCM starts and ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WavLayout {
    info: WavInfo,
    data_start: usize,
    data_end: usize,
}

/// Walk the RIFF chunks and return the offset of the `data` payload.
fn find_data_chunk(bytes: &[u8]) -> Result<usize> {
    let mut at = FIRST_CHUNK;
    while at
        .checked_add(CHUNK_HEADER_LEN)
        .is_some_and(|end| end <= bytes.len())
    {
        let id = &bytes[at..at + 4];
        if id == b"data" {
            return Ok(at + CHUNK_HEADER_LEN);
        }
        let size = u32::from_le_bytes([bytes[at + 4], bytes[at + 5], bytes[at + 6], bytes[at + 7]]);
        // Chunks are word aligned.
        let padded = (size as usize).saturating_add(size as usize & 1);
        at = at
            .saturating_add(CHUNK_HEADER_LEN)
            .saturating_add(padded);
    }
    Err(VoxsyncError::WavHeader("no data chunk in header".into()))
}

fn locate(bytes: &[u8]) -> Result<WavLayout> {
    if bytes.len() < WAV_HEADER_LEN {
        return Err(VoxsyncError::WavHeader(format!(
            "{} bytes is shorter than a {WAV_HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(VoxsyncError::WavHeader("missing RIFF/WAVE signature".into()));
    }

    let data_start = find_data_chunk(bytes)?;
    let available = bytes.len() - data_start;
    let declared = u32::from_le_bytes([
        bytes[data_start - 4],
        bytes[data_start - 3],
        bytes[data_start - 2],
        bytes[data_start - 1],
    ]) as usize;
    // 0 and 0xFFFFFFFF both mean "until the end of the stream".
    let data_end = if declared == 0 || declared >= available {
        bytes.len()
    } else {
        data_start + declared
    };

    // hound validates both length fields; give it a header that describes an
    // empty data chunk so any declared length parses.
    let mut header = bytes[..data_start].to_vec();
    let riff_len = u32::try_from(data_start - CHUNK_HEADER_LEN).unwrap_or(u32::MAX);
    header[4..8].copy_from_slice(&riff_len.to_le_bytes());
    header[data_start - 4..data_start].copy_from_slice(&0u32.to_le_bytes());

    let reader = hound::WavReader::new(Cursor::new(header.as_slice()))
        .map_err(|e| VoxsyncError::WavHeader(e.to_string()))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(VoxsyncError::WavHeader(format!(
            "expected 16-bit integer PCM, got {:?} {}-bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let parsed_start = reader.into_inner().position() as usize;
    if parsed_start != data_start {
        return Err(VoxsyncError::WavHeader(format!(
            "data chunk at {data_start}, decoder stopped at {parsed_start}"
        )));
    }

    Ok(WavLayout {
        info: WavInfo {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            bits_per_sample: spec.bits_per_sample,
        },
        data_start,
        data_end,
    })
}

/// Parse the header at the start of `bytes` with hound.
pub fn parse_wav_header(bytes: &[u8]) -> Result<WavInfo> {
    locate(bytes).map(|layout| layout.info)
}

/// Parse the header and return it together with the PCM that follows.
///
/// Extra chunks before `data` (LIST, fact, ...) are skipped. A declared data
/// length shorter than the payload trims trailing chunks off.
pub fn strip_wav_header(bytes: &[u8]) -> Result<(WavInfo, &[u8])> {
    let layout = locate(bytes)?;
    Ok((layout.info, &bytes[layout.data_start..layout.data_end]))
}

/// Build a canonical 16-bit PCM header for `data_len` bytes of audio.
pub fn wav_header(sample_rate: u32, channels: u16, data_len: u32) -> [u8; WAV_HEADER_LEN] {
    let block_align = channels * 2;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&data_len.saturating_add(36).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&16u16.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}
