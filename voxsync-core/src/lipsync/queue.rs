//! FIFO of animation sequences awaiting release alongside audio.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::AnimationSequence;

/// Budgets below this are treated as exhausted.
const BUDGET_EPSILON: f64 = 1e-9;

#[derive(Default)]
struct QueueState {
    sequences: VecDeque<AnimationSequence>,
    total: f64,
}

/// Sequences released by one [`LipSyncQueue::consume_up_to`] call.
#[derive(Debug, Clone, Default)]
pub struct ConsumedLipSync {
    pub sequences: Vec<AnimationSequence>,
    pub duration: f64,
}

impl ConsumedLipSync {
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Thread-safe queue whose cumulative duration always equals the sum of
/// the queued sequence durations.
#[derive(Default)]
pub struct LipSyncQueue {
    state: Mutex<QueueState>,
}

impl LipSyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a sequence. Empty or zero-length sequences are dropped.
    pub fn add_sequence(&self, sequence: AnimationSequence) -> bool {
        if !sequence.is_valid() {
            warn!(
                frames = sequence.frames.len(),
                duration = sequence.duration,
                "ignoring empty lip-sync sequence"
            );
            return false;
        }
        let mut state = self.state.lock();
        state.total += sequence.duration;
        state.sequences.push_back(sequence);
        true
    }

    /// Release whole sequences from the front until `budget` seconds are
    /// covered, splitting the sequence that straddles the budget at a frame
    /// boundary. The unplayed part stays at the front.
    pub fn consume_up_to(&self, budget: f64) -> ConsumedLipSync {
        let mut state = self.state.lock();
        let mut out = ConsumedLipSync::default();
        let mut remaining = budget;

        while remaining > BUDGET_EPSILON {
            let Some(front) = state.sequences.pop_front() else {
                break;
            };

            if front.duration <= remaining + BUDGET_EPSILON {
                remaining -= front.duration;
                out.duration += front.duration;
                out.sequences.push(front);
                continue;
            }

            let (prefix, rest) = front.split_at_duration(remaining);
            if let Some(rest) = rest {
                state.sequences.push_front(rest);
            }
            if !prefix.is_empty() {
                out.duration += prefix.duration;
                out.sequences.push(prefix);
            }
            break;
        }

        state.total = state.sequences.iter().map(|s| s.duration).sum();
        if !out.is_empty() {
            debug!(
                sequences = out.sequences.len(),
                seconds = out.duration,
                left = state.total,
                "lip-sync released"
            );
        }
        out
    }

    pub fn total_duration(&self) -> f64 {
        self.state.lock().total
    }

    pub fn len(&self) -> usize {
        self.state.lock().sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().sequences.is_empty()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.sequences.clear();
        state.total = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lipsync::AnimationFrame;
    use approx::assert_relative_eq;

    fn seq(frames: usize, fps: u32) -> AnimationSequence {
        AnimationSequence::new(vec![AnimationFrame::from_pairs([("aa", 1.0)]); frames], fps)
    }

    #[test]
    fn partial_consume_splits_front_sequence() {
        let queue = LipSyncQueue::new();
        queue.add_sequence(seq(50, 100)); // 500 ms
        let consumed = queue.consume_up_to(0.2);
        assert_eq!(consumed.sequences.len(), 1);
        assert_relative_eq!(consumed.duration, 0.2, epsilon = 1e-9);
        assert_relative_eq!(queue.total_duration(), 0.3, epsilon = 1e-9);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn consume_spans_multiple_sequences() {
        let queue = LipSyncQueue::new();
        queue.add_sequence(seq(10, 100));
        queue.add_sequence(seq(10, 100));
        queue.add_sequence(seq(10, 100));
        let consumed = queue.consume_up_to(0.25);
        assert_eq!(consumed.sequences.len(), 3);
        assert_eq!(consumed.sequences[2].frames.len(), 5);
        assert_relative_eq!(queue.total_duration(), 0.05, epsilon = 1e-9);
    }

    #[test]
    fn total_tracks_sum_of_queued_durations() {
        let queue = LipSyncQueue::new();
        for frames in [7, 13, 4] {
            queue.add_sequence(seq(frames, 30));
        }
        for budget in [0.1, 0.05, 0.3, 0.01] {
            queue.consume_up_to(budget);
        }
        let expected: f64 = queue.state.lock().sequences.iter().map(|s| s.duration).sum();
        assert_relative_eq!(queue.total_duration(), expected);
    }

    #[test]
    fn sub_frame_budget_releases_nothing() {
        let queue = LipSyncQueue::new();
        queue.add_sequence(seq(10, 30));
        let consumed = queue.consume_up_to(0.01);
        assert!(consumed.is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state.lock().sequences[0].frames.len(), 10);
    }

    #[test]
    fn empty_sequences_are_ignored() {
        let queue = LipSyncQueue::new();
        assert!(!queue.add_sequence(AnimationSequence::new(Vec::new(), 30)));
        assert!(queue.is_empty());
        assert!(queue.consume_up_to(1.0).is_empty());
    }

    #[test]
    fn reset_empties_queue() {
        let queue = LipSyncQueue::new();
        queue.add_sequence(seq(30, 30));
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.total_duration(), 0.0);
    }
}
