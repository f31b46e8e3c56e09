//! Event types broadcast by `StreamEngine`.
//!
//! ## Channels
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `TalkEvent` | `subscribe_talk()` |
//! | `StreamStatusEvent` | `subscribe_status()` |
//! | `FrameReadyEvent` | `subscribe_frames()` |
//! | `PeerInterruptEvent` | `subscribe_peer()` |
//!
//! All payloads serialize to camelCase JSON so hosts can forward them
//! verbatim to a UI or a network transport.

use serde::{Deserialize, Serialize};

use crate::lipsync::AnimationFrame;
use crate::sync::StreamState;

// ---------------------------------------------------------------------------
// Talk session events
// ---------------------------------------------------------------------------

/// Start/end of an audible talk session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Talk session this event belongs to.
    pub session: u64,
    pub kind: TalkEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TalkEventKind {
    /// First audio of the session reached the sink.
    Started,
    /// Playback drained or was stopped.
    Finished,
    /// Speech was cut short by `interrupt`.
    Interrupted,
}

// ---------------------------------------------------------------------------
// Stream status events
// ---------------------------------------------------------------------------

/// Emitted on every state machine transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusEvent {
    pub seq: u64,
    pub state: StreamState,
    pub previous: StreamState,
}

// ---------------------------------------------------------------------------
// Face animation events
// ---------------------------------------------------------------------------

/// A new face frame is ready to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReadyEvent {
    pub seq: u64,
    /// `true` when `frame` holds blendshapes, `false` for visemes.
    pub blendshapes: bool,
    pub frame: AnimationFrame,
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Broadcast by an authority so peers can mirror an interrupt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInterruptEvent {
    pub seq: u64,
    pub fade_seconds: f64,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of the engine for UIs and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    pub state: StreamState,
    pub talking: bool,
    pub paused: bool,
    pub fading: bool,
    pub volume: f32,
    pub buffered_audio_seconds: f64,
    pub buffered_lipsync_seconds: f64,
    pub remaining_content_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn talk_event_serializes_with_camel_case_and_lowercase_kind() {
        let event = TalkEvent {
            seq: 3,
            session: 1,
            kind: TalkEventKind::Interrupted,
        };
        let json = serde_json::to_value(&event).expect("serialize talk event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["session"], 1);
        assert_eq!(json["kind"], "interrupted");
    }

    #[test]
    fn status_event_uses_camel_case_states() {
        let event = StreamStatusEvent {
            seq: 9,
            state: StreamState::WaitingOnLipSync,
            previous: StreamState::Stopped,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["state"], "waitingOnLipSync");
        assert_eq!(json["previous"], "stopped");
    }

    #[test]
    fn frame_event_embeds_flat_frame() {
        let event = FrameReadyEvent {
            seq: 1,
            blendshapes: false,
            frame: AnimationFrame::from_pairs([("aa", 0.5)]),
        };
        let json = serde_json::to_value(&event).expect("serialize frame event");
        assert_eq!(json["blendshapes"], false);
        let weight = json["frame"]["aa"].as_f64().expect("aa weight");
        assert!((weight - 0.5).abs() < 1e-6);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = StreamSnapshot {
            state: StreamState::Playing,
            talking: true,
            paused: false,
            fading: false,
            volume: 1.0,
            buffered_audio_seconds: 0.25,
            buffered_lipsync_seconds: 0.0,
            remaining_content_seconds: 1.25,
        };
        let json = serde_json::to_string(&snapshot).expect("serialize snapshot");
        assert!(json.contains("\"remainingContentSeconds\":1.25"));
        let back: StreamSnapshot = serde_json::from_str(&json).expect("deserialize snapshot");
        assert_eq!(back, snapshot);
    }

    #[test]
    fn peer_interrupt_serializes_fade() {
        let event = PeerInterruptEvent {
            seq: 2,
            fade_seconds: 0.5,
        };
        let json = serde_json::to_value(event).expect("serialize peer event");
        assert_eq!(json["fadeSeconds"], 0.5);
    }
}
