//! Precomputed face-data player.
//!
//! Plays the sequences the dispatcher releases back to back, sampling at
//! the sequence frame rate and optionally blending between neighbouring
//! frames. When the queued frames run out the face returns to neutral.

use tracing::debug;

use super::{AnimationFrame, AnimationSequence, LipSyncProvider, VISEME_NAMES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceOutput {
    Visemes,
    Blendshapes,
}

pub struct FaceSyncPlayer {
    output: FaceOutput,
    interpolate: bool,
    frames: Vec<AnimationFrame>,
    frame_rate: u32,
    elapsed: f64,
    current: AnimationFrame,
    last_index: Option<usize>,
    playing: bool,
    paused: bool,
}

impl FaceSyncPlayer {
    pub fn new(output: FaceOutput) -> Self {
        Self {
            output,
            interpolate: true,
            frames: Vec::new(),
            frame_rate: 0,
            elapsed: 0.0,
            current: Self::neutral_for(output, None),
            last_index: None,
            playing: false,
            paused: false,
        }
    }

    pub fn with_interpolation(mut self, interpolate: bool) -> Self {
        self.interpolate = interpolate;
        self
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Frames queued and not yet passed.
    pub fn pending_frames(&self) -> usize {
        self.last_index
            .map_or(self.frames.len(), |i| self.frames.len().saturating_sub(i + 1))
    }

    fn neutral_for(output: FaceOutput, like: Option<&AnimationFrame>) -> AnimationFrame {
        match (output, like) {
            (_, Some(frame)) if !frame.is_empty() => frame.to_zeroed(),
            (FaceOutput::Visemes, _) => AnimationFrame::zeroed(VISEME_NAMES),
            (FaceOutput::Blendshapes, _) => AnimationFrame::new(),
        }
    }

    fn finish(&mut self) {
        let neutral = Self::neutral_for(self.output, self.frames.last());
        self.current = neutral;
        self.frames.clear();
        self.elapsed = 0.0;
        self.last_index = None;
        self.playing = false;
    }
}

impl LipSyncProvider for FaceSyncPlayer {
    fn requires_precomputed_face_data(&self) -> bool {
        true
    }

    fn generates_blendshapes(&self) -> bool {
        self.output == FaceOutput::Blendshapes
    }

    fn apply_sequence(&mut self, sequence: AnimationSequence) {
        if sequence.is_empty() {
            return;
        }
        if self.frame_rate != 0 && sequence.frame_rate != self.frame_rate && self.playing {
            debug!(
                old = self.frame_rate,
                new = sequence.frame_rate,
                "face frame rate changed mid-playback"
            );
        }
        if sequence.frame_rate > 0 {
            self.frame_rate = sequence.frame_rate;
        }
        self.frames.extend(sequence.frames);
        self.playing = true;
    }

    fn advance(&mut self, delta_seconds: f64) -> bool {
        if !self.playing || self.paused || self.frame_rate == 0 {
            return false;
        }

        self.elapsed += delta_seconds.max(0.0);
        let position = self.elapsed * f64::from(self.frame_rate);
        let index = position.floor() as usize;

        if index >= self.frames.len() {
            self.finish();
            return true;
        }

        let frame = &self.frames[index];
        let next = if self.interpolate {
            self.frames.get(index + 1)
        } else {
            None
        };
        self.current = match next {
            Some(next) => frame.lerp(next, position.fract() as f32),
            None => frame.clone(),
        };

        let changed = self.interpolate || self.last_index != Some(index);
        self.last_index = Some(index);
        changed
    }

    fn current_frame(&self) -> AnimationFrame {
        self.current.clone()
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn stop(&mut self) {
        self.finish();
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(n: usize, fps: u32) -> AnimationSequence {
        AnimationSequence::new(
            (0..n)
                .map(|i| AnimationFrame::from_pairs([("aa", i as f32 / 10.0)]))
                .collect(),
            fps,
        )
    }

    #[test]
    fn starts_neutral_with_viseme_channels() {
        let player = FaceSyncPlayer::new(FaceOutput::Visemes);
        let frame = player.current_frame();
        assert_eq!(frame.len(), VISEME_NAMES.len());
        assert!(frame.iter().all(|(_, v)| v == 0.0));
    }

    #[test]
    fn steps_through_frames_without_interpolation() {
        let mut player = FaceSyncPlayer::new(FaceOutput::Visemes).with_interpolation(false);
        player.apply_sequence(ramp(4, 10));
        assert!(player.advance(0.0));
        assert_relative_eq!(player.current_frame().get("aa").unwrap(), 0.0);
        assert!(player.advance(0.15));
        assert_relative_eq!(player.current_frame().get("aa").unwrap(), 0.1);
        // Still inside frame 1.
        assert!(!player.advance(0.01));
    }

    #[test]
    fn interpolates_between_frames() {
        let mut player = FaceSyncPlayer::new(FaceOutput::Visemes);
        player.apply_sequence(ramp(4, 10));
        player.advance(0.05);
        assert_relative_eq!(player.current_frame().get("aa").unwrap(), 0.05, epsilon = 1e-4);
    }

    #[test]
    fn returns_to_neutral_when_frames_run_out() {
        let mut player = FaceSyncPlayer::new(FaceOutput::Blendshapes);
        player.apply_sequence(ramp(3, 10));
        assert!(player.advance(0.5));
        assert!(!player.is_playing());
        let frame = player.current_frame();
        assert_eq!(frame.get("aa"), Some(0.0));
        assert!(!player.advance(0.1));
    }

    #[test]
    fn pause_freezes_and_stop_clears() {
        let mut player = FaceSyncPlayer::new(FaceOutput::Visemes);
        player.apply_sequence(ramp(10, 10));
        player.advance(0.1);
        player.pause();
        assert!(!player.advance(0.5));
        player.resume();
        assert!(player.advance(0.1));
        player.stop();
        assert!(!player.is_playing());
        assert_eq!(player.pending_frames(), 0);
    }
}
