//! Gate between buffered content and playback.
//!
//! The machine is pure: the engine samples buffer levels into
//! [`BufferLevels`], asks [`SyncStateMachine::evaluate`] where to go, then
//! applies the side effects of the transition itself.

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    #[default]
    Stopped,
    Playing,
    WaitingOnLipSync,
    WaitingOnAudio,
}

impl StreamState {
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingOnLipSync | Self::WaitingOnAudio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncThresholds {
    /// Seconds of content to hold before starting a talk session.
    pub min_buffer_duration: f64,
    /// Lip-sync seconds required per audio second, in `[0, 1]`.
    pub audio_lipsync_ratio: f64,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self {
            min_buffer_duration: 0.9,
            audio_lipsync_ratio: 0.1,
        }
    }
}

/// What the engine currently holds, sampled once per evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferLevels {
    pub audio_seconds: f64,
    pub audio_empty: bool,
    pub lipsync_seconds: f64,
    /// A provider needs precomputed data and synchronization is on.
    pub lipsync_required: bool,
    /// Audio has already been dispatched in the current session.
    pub primed: bool,
    /// The sender has announced that no more content follows.
    pub end_of_stream: bool,
}

impl BufferLevels {
    fn threshold_waived(&self) -> bool {
        self.primed || self.end_of_stream
    }
}

pub struct SyncStateMachine {
    state: StreamState,
    thresholds: SyncThresholds,
}

impl SyncStateMachine {
    pub fn new(thresholds: SyncThresholds) -> Self {
        Self {
            state: StreamState::Stopped,
            thresholds,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn thresholds(&self) -> SyncThresholds {
        self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: SyncThresholds) {
        self.thresholds = thresholds;
    }

    pub fn has_sufficient_lipsync(&self, levels: &BufferLevels) -> bool {
        if !levels.lipsync_required || levels.end_of_stream {
            return true;
        }
        levels.lipsync_seconds >= self.thresholds.min_buffer_duration
            || levels.lipsync_seconds >= levels.audio_seconds * self.thresholds.audio_lipsync_ratio
    }

    pub fn has_sufficient_audio(&self, levels: &BufferLevels) -> bool {
        if levels.audio_empty {
            return false;
        }
        let enough = levels.threshold_waived()
            || levels.audio_seconds >= self.thresholds.min_buffer_duration;
        if !levels.lipsync_required || levels.end_of_stream {
            return enough;
        }
        enough && levels.audio_seconds >= levels.lipsync_seconds
    }

    /// Where the gate says to go. Lip-sync is checked before audio.
    pub fn evaluate(&self, levels: &BufferLevels) -> StreamState {
        if !self.has_sufficient_lipsync(levels) {
            StreamState::WaitingOnLipSync
        } else if !self.has_sufficient_audio(levels) {
            StreamState::WaitingOnAudio
        } else {
            StreamState::Playing
        }
    }

    /// Move to `next`. Returns the previous state when it changed.
    pub fn transition(&mut self, next: StreamState) -> Option<StreamState> {
        if next == self.state {
            return None;
        }
        let previous = self.state;
        self.state = next;
        debug!(from = ?previous, to = ?next, "stream state");
        Some(previous)
    }
}
