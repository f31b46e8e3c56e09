//! Facial animation data and the lip-sync provider seam.
//!
//! The `LipSyncProvider` trait is the extension point: the bundled
//! [`FaceSyncPlayer`] replays precomputed frames from the server, while a
//! live viseme generator can instead derive animation from the dispatched
//! PCM via `infer_from_audio`.

pub mod face_sync;
pub mod queue;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use face_sync::FaceSyncPlayer;
pub use queue::{ConsumedLipSync, LipSyncQueue};

/// Viseme channel names in the order providers emit them.
pub const VISEME_NAMES: [&str; 15] = [
    "sil", "PP", "FF", "TH", "DD", "kk", "CH", "SS", "nn", "RR", "aa", "E", "ih", "oh", "ou",
];

/// One frame of facial animation: named scalar weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnimationFrame {
    values: BTreeMap<String, f32>,
}

impl AnimationFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// A frame with every named channel at zero.
    pub fn zeroed<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self::from_pairs(names.into_iter().map(|name| (name, 0.0)))
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.values.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f32) {
        self.values.insert(name.into(), value);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Same channels, all at zero.
    pub fn to_zeroed(&self) -> Self {
        Self::zeroed(self.names())
    }

    /// Linear blend toward `next`. Channels missing on one side count as 0.
    pub fn lerp(&self, next: &AnimationFrame, alpha: f32) -> AnimationFrame {
        let alpha = alpha.clamp(0.0, 1.0);
        let mut values = BTreeMap::new();
        for name in self.values.keys().chain(next.values.keys()) {
            if values.contains_key(name) {
                continue;
            }
            let a = self.get(name).unwrap_or(0.0);
            let b = next.get(name).unwrap_or(0.0);
            values.insert(name.clone(), a + (b - a) * alpha);
        }
        AnimationFrame { values }
    }
}

/// Frames sampled at a fixed rate, covering `duration` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationSequence {
    pub frames: Vec<AnimationFrame>,
    pub frame_rate: u32,
    pub duration: f64,
}

/// Absorbs float error when a budget lands exactly on a frame boundary.
const FRAME_EPSILON: f64 = 1e-9;

impl AnimationSequence {
    /// Duration derived from the frame count and rate.
    pub fn new(frames: Vec<AnimationFrame>, frame_rate: u32) -> Self {
        let duration = if frame_rate == 0 {
            0.0
        } else {
            frames.len() as f64 / f64::from(frame_rate)
        };
        Self {
            frames,
            frame_rate,
            duration,
        }
    }

    pub fn with_duration(frames: Vec<AnimationFrame>, frame_rate: u32, duration: f64) -> Self {
        Self {
            frames,
            frame_rate,
            duration,
        }
    }

    /// Non-empty, with a positive duration.
    pub fn is_valid(&self) -> bool {
        !self.frames.is_empty() && self.duration > 0.0 && self.duration.is_finite()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Seconds covered by one frame.
    pub fn frame_duration(&self) -> f64 {
        if self.frame_rate > 0 {
            1.0 / f64::from(self.frame_rate)
        } else if !self.frames.is_empty() {
            self.duration / self.frames.len() as f64
        } else {
            0.0
        }
    }

    /// Split off the whole frames that fit in `budget` seconds.
    ///
    /// Returns `(prefix, remainder)`. The two durations always add back to
    /// the original; the remainder is `None` when every frame fit.
    pub fn split_at_duration(mut self, budget: f64) -> (AnimationSequence, Option<AnimationSequence>) {
        let frame_duration = self.frame_duration();
        if frame_duration <= 0.0 || budget >= self.duration {
            return (self, None);
        }

        let whole = ((budget.max(0.0) / frame_duration) + FRAME_EPSILON).floor() as usize;
        let take = whole.min(self.frames.len());
        if take == self.frames.len() {
            return (self, None);
        }

        let rest = self.frames.split_off(take);
        let prefix_duration = take as f64 * frame_duration;
        let remainder = AnimationSequence {
            frames: rest,
            frame_rate: self.frame_rate,
            duration: (self.duration - prefix_duration).max(0.0),
        };
        let prefix = AnimationSequence {
            frames: self.frames,
            frame_rate: self.frame_rate,
            duration: prefix_duration,
        };
        (prefix, Some(remainder))
    }
}

/// Drives a face from animation data.
///
/// Implementors are stateful; the engine calls `advance` once per tick and
/// reads `current_frame` when it returns `true`.
pub trait LipSyncProvider: Send + 'static {
    /// `true` when the provider plays server-computed sequences that must be
    /// buffered alongside the audio.
    fn requires_precomputed_face_data(&self) -> bool;

    /// `true` for blendshape output, `false` for visemes.
    fn generates_blendshapes(&self) -> bool {
        false
    }

    /// Queue a sequence released by the dispatcher.
    fn apply_sequence(&mut self, sequence: AnimationSequence);

    /// Live providers receive each dispatched PCM block here.
    fn infer_from_audio(&mut self, _pcm: &[u8], _sample_rate: u32, _channels: u16) {}

    /// Advance playback by `delta_seconds`. Returns `true` when
    /// `current_frame` changed.
    fn advance(&mut self, delta_seconds: f64) -> bool;

    fn current_frame(&self) -> AnimationFrame;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Drop queued animation and return to a neutral face.
    fn stop(&mut self);
}
