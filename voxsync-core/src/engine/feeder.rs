//! Cloneable ingest handle for transport threads.
//!
//! A `StreamFeeder` writes straight into the engine's shared buffers and
//! posts an `IngestNotice` on a crossbeam channel. The engine drains the
//! notices on its next `tick` and re-evaluates there, so transport threads
//! never touch the state machine or the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::buffering::{AudioChunk, AudioRingBuffer};
use crate::codec::OpusPacketDecoder;
use crate::engine::dispatch::StreamDiagnostics;
use crate::error::Result;
use crate::lipsync::{AnimationSequence, LipSyncQueue};

/// The two buffers every ingest path writes to.
#[derive(Default)]
pub struct SharedBuffers {
    pub audio: AudioRingBuffer,
    pub lipsync: LipSyncQueue,
}

/// What a feeder thread did, for the tick thread to pick up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IngestNotice {
    Audio { bytes: usize, seconds: f64 },
    LipSync { seconds: f64 },
    EndOfStream,
}

/// Validate and store one audio payload. Shared by the engine and feeders.
pub(crate) fn ingest_audio(
    buffers: &SharedBuffers,
    diagnostics: &StreamDiagnostics,
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
    has_wav_header: bool,
) -> Result<IngestNotice> {
    let stored = AudioChunk::from_transport(bytes, sample_rate, channels, has_wav_header)
        .and_then(|chunk| {
            let seconds = buffers.audio.enqueue_chunk(&chunk)?;
            Ok(IngestNotice::Audio {
                bytes: chunk.len(),
                seconds,
            })
        });
    match &stored {
        Ok(_) => StreamDiagnostics::bump(&diagnostics.chunks_ingested, 1),
        Err(e) => {
            warn!(bytes = bytes.len(), sample_rate, channels, "audio chunk rejected: {e}");
            StreamDiagnostics::bump(&diagnostics.chunks_rejected, 1);
        }
    }
    stored
}

/// Queue one lip-sync sequence if the active provider wants precomputed
/// data. Returns the notice to post, or `None` when dropped.
pub(crate) fn ingest_lipsync(
    buffers: &SharedBuffers,
    diagnostics: &StreamDiagnostics,
    accepting: bool,
    sequence: AnimationSequence,
) -> Option<IngestNotice> {
    let seconds = sequence.duration;
    if !accepting {
        debug!(seconds, "no precomputed lip-sync consumer, dropping sequence");
        StreamDiagnostics::bump(&diagnostics.sequences_dropped, 1);
        return None;
    }
    if !buffers.lipsync.add_sequence(sequence) {
        StreamDiagnostics::bump(&diagnostics.sequences_dropped, 1);
        return None;
    }
    StreamDiagnostics::bump(&diagnostics.sequences_ingested, 1);
    Some(IngestNotice::LipSync { seconds })
}

#[derive(Clone)]
pub struct StreamFeeder {
    pub(crate) buffers: Arc<SharedBuffers>,
    pub(crate) diagnostics: Arc<StreamDiagnostics>,
    pub(crate) accept_lipsync: Arc<AtomicBool>,
    pub(crate) notices: Sender<IngestNotice>,
}

impl StreamFeeder {
    /// Buffer one audio payload. See `StreamEngine::push_audio`.
    pub fn push_audio(
        &self,
        bytes: &[u8],
        sample_rate: u32,
        channels: u16,
        has_wav_header: bool,
    ) -> Result<()> {
        let notice = ingest_audio(
            &self.buffers,
            &self.diagnostics,
            bytes,
            sample_rate,
            channels,
            has_wav_header,
        )?;
        self.post(notice);
        Ok(())
    }

    /// Decode a relay packet and buffer the PCM it carries. A rejected or
    /// empty packet buffers nothing.
    pub fn push_packet(&self, decoder: &mut OpusPacketDecoder, packet: &[u8]) -> Result<()> {
        let Some(format) = decoder.format() else {
            return Err(crate::error::VoxsyncError::CodecNotInitialized);
        };
        let pcm = decoder.decode(packet);
        if pcm.is_empty() {
            return Ok(());
        }
        self.push_audio(pcm, format.sample_rate, format.channels, false)
    }

    pub fn push_lipsync(&self, sequence: AnimationSequence) {
        let accepting = self.accept_lipsync.load(Ordering::Acquire);
        if let Some(notice) = ingest_lipsync(&self.buffers, &self.diagnostics, accepting, sequence)
        {
            self.post(notice);
        }
    }

    /// No more content follows for the current utterance.
    pub fn finish_stream(&self) {
        self.post(IngestNotice::EndOfStream);
    }

    fn post(&self, notice: IngestNotice) {
        if self.notices.send(notice).is_err() {
            debug!("engine dropped, ingest notice discarded");
        }
    }
}
