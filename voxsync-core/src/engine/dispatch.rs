//! Dispatch sizing and the counters kept while streaming.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::audio::pcm_bytes_for;
use crate::sync::BufferLevels;

/// Shared streaming counters, updated from the tick thread and from
/// feeder threads.
#[derive(Debug, Default)]
pub struct StreamDiagnostics {
    pub chunks_ingested: AtomicUsize,
    pub chunks_rejected: AtomicUsize,
    pub sequences_ingested: AtomicUsize,
    pub sequences_dropped: AtomicUsize,
    pub dispatches: AtomicUsize,
    pub bytes_dispatched: AtomicUsize,
    pub sequences_dispatched: AtomicUsize,
    pub sink_errors: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub sessions: AtomicUsize,
}

impl StreamDiagnostics {
    pub fn reset(&self) {
        self.chunks_ingested.store(0, Ordering::Relaxed);
        self.chunks_rejected.store(0, Ordering::Relaxed);
        self.sequences_ingested.store(0, Ordering::Relaxed);
        self.sequences_dropped.store(0, Ordering::Relaxed);
        self.dispatches.store(0, Ordering::Relaxed);
        self.bytes_dispatched.store(0, Ordering::Relaxed);
        self.sequences_dispatched.store(0, Ordering::Relaxed);
        self.sink_errors.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
        self.sessions.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_ingested: self.chunks_ingested.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            sequences_ingested: self.sequences_ingested.load(Ordering::Relaxed),
            sequences_dropped: self.sequences_dropped.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            bytes_dispatched: self.bytes_dispatched.load(Ordering::Relaxed),
            sequences_dispatched: self.sequences_dispatched.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub chunks_ingested: usize,
    pub chunks_rejected: usize,
    pub sequences_ingested: usize,
    pub sequences_dropped: usize,
    pub dispatches: usize,
    pub bytes_dispatched: usize,
    pub sequences_dispatched: usize,
    pub sink_errors: usize,
    pub interrupts: usize,
    pub sessions: usize,
}

/// Seconds of content to release on a `Playing` evaluation.
///
/// Synchronized streams release as much audio as there is lip-sync to go
/// with it; unsynchronized streams release all buffered audio. Once the
/// sender has finished, everything goes.
pub fn dispatch_duration(levels: &BufferLevels) -> f64 {
    if levels.end_of_stream {
        levels.audio_seconds.max(levels.lipsync_seconds)
    } else if levels.lipsync_required {
        levels.lipsync_seconds
    } else {
        levels.audio_seconds
    }
}

/// Frame-aligned byte count for one dispatch.
pub fn playable_bytes(
    seconds: f64,
    sample_rate: u32,
    channels: u16,
    available: usize,
    max_bytes: usize,
) -> usize {
    let block = usize::from(channels) * crate::audio::BYTES_PER_SAMPLE;
    if block == 0 {
        return 0;
    }
    let bytes = pcm_bytes_for(seconds, sample_rate, channels)
        .min(available)
        .min(max_bytes);
    bytes - bytes % block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_follows_lipsync_when_synchronized() {
        let levels = BufferLevels {
            audio_seconds: 2.0,
            lipsync_seconds: 0.5,
            lipsync_required: true,
            ..BufferLevels::default()
        };
        assert_eq!(dispatch_duration(&levels), 0.5);

        let unsynced = BufferLevels {
            lipsync_required: false,
            ..levels
        };
        assert_eq!(dispatch_duration(&unsynced), 2.0);

        let finished = BufferLevels {
            end_of_stream: true,
            ..levels
        };
        assert_eq!(dispatch_duration(&finished), 2.0);
    }

    #[test]
    fn playable_bytes_respects_all_bounds() {
        assert_eq!(playable_bytes(1.0, 16_000, 1, 100_000, 400 * 1024), 32_000);
        assert_eq!(playable_bytes(1.0, 16_000, 1, 10_001, 400 * 1024), 10_000);
        assert_eq!(playable_bytes(10.0, 48_000, 2, usize::MAX, 1_001), 1_000);
        assert_eq!(playable_bytes(1.0, 16_000, 0, 100, 100), 0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let diagnostics = StreamDiagnostics::default();
        StreamDiagnostics::bump(&diagnostics.dispatches, 2);
        StreamDiagnostics::bump(&diagnostics.bytes_dispatched, 640);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.dispatches, 2);
        assert_eq!(snap.bytes_dispatched, 640);
        diagnostics.reset();
        assert_eq!(diagnostics.snapshot(), DiagnosticsSnapshot::default());
    }
}
