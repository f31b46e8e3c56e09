//! Hands dispatched PCM to the sink, reconfiguring it when the format
//! changes and holding audio back while a reconfiguration is in flight.

use tracing::{debug, info, warn};

use crate::audio::{AudioSink, ConfigureOutcome};
use crate::error::Result;

/// Where a submitted block went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Handed to the sink; it is playing or about to.
    Queued,
    /// Held until the in-flight reconfiguration finishes.
    Held,
}

pub struct OutputStage {
    sink: Box<dyn AudioSink>,
    configuring: bool,
    pending: Vec<u8>,
    pending_format: Option<(u32, u16)>,
}

impl OutputStage {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            configuring: false,
            pending: Vec::new(),
            pending_format: None,
        }
    }

    pub fn is_configuring(&self) -> bool {
        self.configuring
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Queue `pcm` on the sink, or hold it while the sink reconfigures.
    pub fn submit(&mut self, pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Submitted> {
        if self.configuring {
            if self.pending_format != Some((sample_rate, channels)) {
                warn!(
                    sample_rate,
                    channels, "format changed during reconfiguration, holding audio anyway"
                );
            }
            self.pending.extend_from_slice(pcm);
            return Ok(Submitted::Held);
        }

        if self.sink.format() == Some((sample_rate, channels)) {
            self.sink.queue_audio(pcm);
            return Ok(Submitted::Queued);
        }

        info!(sample_rate, channels, "reconfiguring audio output");
        self.configuring = true;
        match self.sink.configure(sample_rate, channels) {
            Ok(ConfigureOutcome::Ready) => {
                self.sink.queue_audio(pcm);
                self.flush_pending();
                self.configuring = false;
                Ok(Submitted::Queued)
            }
            Ok(ConfigureOutcome::Pending) => {
                self.pending_format = Some((sample_rate, channels));
                self.pending.extend_from_slice(pcm);
                Ok(Submitted::Held)
            }
            Err(e) => {
                self.configuring = false;
                Err(e)
            }
        }
    }

    /// The sink finished an asynchronous reconfiguration. Held audio goes
    /// out in arrival order.
    pub fn finish_reconfiguration(&mut self) {
        if !self.configuring {
            return;
        }
        self.flush_pending();
        self.configuring = false;
        self.pending_format = None;
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        debug!(bytes = self.pending.len(), "flushing held audio");
        self.sink.queue_audio(&self.pending);
        self.pending.clear();
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.sink.reset();
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.sink.set_volume(volume);
    }

    pub fn pause(&mut self) {
        self.sink.pause();
    }

    pub fn resume(&mut self) {
        self.sink.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemorySink;

    #[test]
    fn first_submit_configures_then_queues() {
        let sink = MemorySink::new();
        let mut stage = OutputStage::new(Box::new(sink.clone()));
        assert_eq!(stage.submit(&[1, 2], 16_000, 1).unwrap(), Submitted::Queued);
        stage.submit(&[3, 4], 16_000, 1).unwrap();
        let record = sink.record();
        assert_eq!(record.configures, 1);
        assert_eq!(record.queued, vec![1, 2, 3, 4]);
    }

    #[test]
    fn pending_reconfiguration_holds_audio_in_order() {
        let sink = MemorySink::new().with_deferred_configure();
        let mut stage = OutputStage::new(Box::new(sink.clone()));
        assert_eq!(stage.submit(&[1, 2], 24_000, 1).unwrap(), Submitted::Held);
        assert_eq!(stage.submit(&[3, 4], 24_000, 1).unwrap(), Submitted::Held);
        assert!(stage.is_configuring());
        assert_eq!(sink.queued_bytes(), 0);
        assert_eq!(stage.pending_bytes(), 4);

        stage.finish_reconfiguration();
        assert!(!stage.is_configuring());
        assert_eq!(sink.record().queued, vec![1, 2, 3, 4]);

        // Same format now: straight through.
        assert_eq!(stage.submit(&[5, 6], 24_000, 1).unwrap(), Submitted::Queued);
        assert_eq!(sink.queued_bytes(), 6);
    }

    #[test]
    fn format_change_reconfigures_again() {
        let sink = MemorySink::new();
        let mut stage = OutputStage::new(Box::new(sink.clone()));
        stage.submit(&[0; 4], 16_000, 1).unwrap();
        stage.submit(&[0; 4], 48_000, 2).unwrap();
        let record = sink.record();
        assert_eq!(record.configures, 2);
        assert_eq!(record.format, Some((48_000, 2)));
    }
}
