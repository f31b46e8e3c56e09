//! Finish timer and fade-out bookkeeping, both advanced by `tick`.

use tracing::trace;

/// Identifies one arming of the finish timer. Completions carrying an older
/// epoch are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken {
    epoch: u64,
}

/// Counts down the audio that has been handed to the sink.
#[derive(Debug, Default)]
pub struct FinishTimer {
    remaining: f64,
    epoch: u64,
    armed: bool,
    paused: bool,
}

impl FinishTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `seconds` of dispatched audio to the countdown.
    pub fn extend(&mut self, seconds: f64) -> CompletionToken {
        self.remaining = self.remaining.max(0.0) + seconds.max(0.0);
        self.armed = true;
        self.token()
    }

    pub fn remaining(&self) -> f64 {
        if self.armed {
            self.remaining.max(0.0)
        } else {
            0.0
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn token(&self) -> CompletionToken {
        CompletionToken { epoch: self.epoch }
    }

    pub fn is_current(&self, token: CompletionToken) -> bool {
        token.epoch == self.epoch
    }

    /// Disarm and invalidate every outstanding token.
    pub fn cancel(&mut self) {
        self.epoch += 1;
        self.armed = false;
        self.remaining = 0.0;
        self.paused = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Returns the token to complete once the countdown reaches zero.
    pub fn advance(&mut self, delta_seconds: f64) -> Option<CompletionToken> {
        if !self.armed || self.paused {
            return None;
        }
        self.remaining -= delta_seconds;
        if self.remaining > 0.0 {
            return None;
        }
        trace!(epoch = self.epoch, "finish timer elapsed");
        self.armed = false;
        self.remaining = 0.0;
        Some(self.token())
    }
}

/// Outcome of advancing a fade by one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FadeStep {
    Idle,
    Volume(f32),
    Finished,
}

/// Linear fade-out from full volume to silence.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FadeState {
    total: f64,
    remaining: f64,
}

impl FadeState {
    /// Fade over `requested` seconds, but never past the content still
    /// playing (`available`).
    pub fn begin(requested: f64, available: f64) -> Self {
        let total = requested.min(available).max(0.0);
        Self {
            total,
            remaining: total,
        }
    }

    pub fn is_active(&self) -> bool {
        self.total > 0.0 && self.remaining > 0.0
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn advance(&mut self, delta_seconds: f64) -> FadeStep {
        if !self.is_active() {
            return FadeStep::Idle;
        }
        self.remaining -= delta_seconds;
        if self.remaining <= 0.0 {
            self.reset();
            return FadeStep::Finished;
        }
        FadeStep::Volume((self.remaining / self.total) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn timer_accumulates_and_fires_once() {
        let mut timer = FinishTimer::new();
        assert_eq!(timer.advance(1.0), None);
        let token = timer.extend(0.5);
        timer.extend(0.25);
        assert_relative_eq!(timer.remaining(), 0.75);
        assert_eq!(timer.advance(0.5), None);
        assert_eq!(timer.advance(0.5), Some(token));
        assert!(timer.is_current(token));
        assert_eq!(timer.advance(0.5), None);
    }

    #[test]
    fn cancel_invalidates_outstanding_tokens() {
        let mut timer = FinishTimer::new();
        let stale = timer.extend(1.0);
        timer.cancel();
        assert!(!timer.is_current(stale));
        assert_eq!(timer.remaining(), 0.0);
        let fresh = timer.extend(0.1);
        assert_ne!(stale, fresh);
    }

    #[test]
    fn paused_timer_holds_its_value() {
        let mut timer = FinishTimer::new();
        timer.extend(1.0);
        timer.pause();
        assert_eq!(timer.advance(5.0), None);
        assert_relative_eq!(timer.remaining(), 1.0);
        timer.resume();
        assert!(timer.advance(1.0).is_some());
    }

    #[test]
    fn fade_is_clamped_to_available_content() {
        let fade = FadeState::begin(2.0, 1.0);
        assert_relative_eq!(fade.total(), 1.0);
        assert!(!FadeState::begin(2.0, 0.0).is_active());
        assert!(!FadeState::begin(-1.0, 3.0).is_active());
    }

    #[test]
    fn fade_volume_falls_linearly() {
        let mut fade = FadeState::begin(1.0, 10.0);
        let mut volumes = Vec::new();
        loop {
            match fade.advance(0.25) {
                FadeStep::Volume(v) => volumes.push(v),
                FadeStep::Finished => break,
                FadeStep::Idle => panic!("fade went idle before finishing"),
            }
        }
        assert_eq!(volumes.len(), 3);
        for (v, expected) in volumes.iter().zip([0.75f32, 0.5, 0.25]) {
            assert_relative_eq!(*v, expected, epsilon = 1e-6);
        }
        assert_eq!(fade.advance(0.25), FadeStep::Idle);
    }
}
