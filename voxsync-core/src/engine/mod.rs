//! `StreamEngine`: top-level controller for one speaking character.
//!
//! ## Lifecycle
//!
//! ```text
//! StreamEngine::new(config, sink)
//!     └─► push_audio / push_lipsync / push_packet   (or StreamFeeder from other threads)
//!         └─► evaluate → Playing → dispatch → sink + lip-sync provider
//!             └─► tick(dt) → finish timer / fade / face frames
//!                 └─► playback finished → Stopped
//! ```
//!
//! ## Threading
//!
//! The engine owns the audio sink, which may be `!Send`, so every method
//! runs on the thread that created it. Transport threads write through a
//! cloned [`StreamFeeder`]; the engine picks their notices up on `tick`.
//! Only the two content buffers are shared, each behind its own mutex.

pub mod dispatch;
pub mod feeder;
pub mod output;
pub mod timer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, trace, Span};

use crate::audio::{pcm_duration_secs, AudioSink};
use crate::buffering::RING_CAPACITY;
use crate::codec::OpusPacketDecoder;
use crate::error::{Result, VoxsyncError};
use crate::ipc::events::{
    FrameReadyEvent, PeerInterruptEvent, StreamSnapshot, StreamStatusEvent, TalkEvent,
    TalkEventKind,
};
use crate::lipsync::{AnimationFrame, AnimationSequence, LipSyncProvider};
use crate::sync::{BufferLevels, StreamState, SyncStateMachine, SyncThresholds};

use dispatch::{DiagnosticsSnapshot, StreamDiagnostics};
use feeder::{IngestNotice, SharedBuffers, StreamFeeder};
use output::{OutputStage, Submitted};
use timer::{CompletionToken, FadeState, FadeStep, FinishTimer};

/// Broadcast channel capacity per event kind.
const BROADCAST_CAP: usize = 256;

/// Smallest per-dispatch byte cap `normalize` allows.
const MIN_DISPATCH_BYTES: usize = 4 * 1024;

/// Who owns interrupts in a replicated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkRole {
    #[default]
    Standalone,
    /// Decides interrupts and may replicate them to peers.
    Authority,
    /// Mirrors interrupts received from the authority.
    Peer,
}

/// Configuration for `StreamEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct StreamConfig {
    /// Seconds buffered before a talk session starts. Default: 0.9.
    pub min_buffer_duration: f64,
    /// Lip-sync seconds needed per buffered audio second, `[0, 1]`.
    /// Default: 0.1.
    pub audio_lipsync_ratio: f64,
    /// Hold audio until matching lip-sync has arrived. Default: true.
    pub enable_sync: bool,
    /// Upper bound on PCM handed to the sink in one dispatch.
    /// Default: 400 KiB.
    pub max_dispatch_bytes: usize,
    pub network_role: NetworkRole,
    /// Authority only: broadcast interrupts on `subscribe_peer()`.
    pub replicate_to_peers: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_buffer_duration: 0.9,
            audio_lipsync_ratio: 0.1,
            enable_sync: true,
            max_dispatch_bytes: 400 * 1024,
            network_role: NetworkRole::Standalone,
            replicate_to_peers: false,
        }
    }
}

impl StreamConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)
            .map_err(|e| VoxsyncError::Other(anyhow::anyhow!("stream config: {e}")))?;
        config.normalize();
        Ok(config)
    }

    pub fn normalize(&mut self) {
        let defaults = Self::default();
        if !self.min_buffer_duration.is_finite() {
            self.min_buffer_duration = defaults.min_buffer_duration;
        }
        if !self.audio_lipsync_ratio.is_finite() {
            self.audio_lipsync_ratio = defaults.audio_lipsync_ratio;
        }
        self.min_buffer_duration = self.min_buffer_duration.clamp(0.0, 10.0);
        self.audio_lipsync_ratio = self.audio_lipsync_ratio.clamp(0.0, 1.0);
        self.max_dispatch_bytes = self.max_dispatch_bytes.clamp(MIN_DISPATCH_BYTES, RING_CAPACITY);
    }

    pub fn thresholds(&self) -> SyncThresholds {
        SyncThresholds {
            min_buffer_duration: self.min_buffer_duration,
            audio_lipsync_ratio: self.audio_lipsync_ratio,
        }
    }
}

/// The streaming controller.
pub struct StreamEngine {
    config: StreamConfig,
    buffers: Arc<SharedBuffers>,
    machine: SyncStateMachine,
    output: OutputStage,
    provider: Option<Box<dyn LipSyncProvider>>,
    accept_lipsync: Arc<AtomicBool>,
    timer: FinishTimer,
    fade: FadeState,
    volume: f32,
    talking: bool,
    processing: bool,
    paused: bool,
    /// Audio has gone out in the current session; the minimum-buffer gate
    /// no longer applies.
    primed: bool,
    /// `start()` was called, so evaluation runs even with empty buffers.
    started: bool,
    end_of_stream: bool,
    /// Dispatched audio the output stage is holding for a reconfiguration.
    /// Joins the finish countdown once the sink is ready.
    held_seconds: f64,
    scratch: Vec<u8>,
    notice_tx: Sender<IngestNotice>,
    notice_rx: Receiver<IngestNotice>,
    talk_tx: broadcast::Sender<TalkEvent>,
    status_tx: broadcast::Sender<StreamStatusEvent>,
    frame_tx: broadcast::Sender<FrameReadyEvent>,
    peer_tx: broadcast::Sender<PeerInterruptEvent>,
    seq: u64,
    session: u64,
    session_span: Option<Span>,
    diagnostics: Arc<StreamDiagnostics>,
}

impl StreamEngine {
    pub fn new(mut config: StreamConfig, sink: Box<dyn AudioSink>) -> Self {
        config.normalize();
        let (notice_tx, notice_rx) = crossbeam_channel::unbounded();
        let (talk_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (frame_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (peer_tx, _) = broadcast::channel(BROADCAST_CAP);

        info!(
            min_buffer = config.min_buffer_duration,
            ratio = config.audio_lipsync_ratio,
            sync = config.enable_sync,
            role = ?config.network_role,
            "stream engine created"
        );

        Self {
            machine: SyncStateMachine::new(config.thresholds()),
            config,
            buffers: Arc::new(SharedBuffers::default()),
            output: OutputStage::new(sink),
            provider: None,
            accept_lipsync: Arc::new(AtomicBool::new(false)),
            timer: FinishTimer::new(),
            fade: FadeState::default(),
            volume: 1.0,
            talking: false,
            processing: false,
            paused: false,
            primed: false,
            started: false,
            end_of_stream: false,
            held_seconds: 0.0,
            scratch: Vec::new(),
            notice_tx,
            notice_rx,
            talk_tx,
            status_tx,
            frame_tx,
            peer_tx,
            seq: 0,
            session: 0,
            session_span: None,
            diagnostics: Arc::new(StreamDiagnostics::default()),
        }
    }

    pub fn with_lipsync(mut self, provider: Box<dyn LipSyncProvider>) -> Self {
        self.set_lipsync_provider(Some(provider));
        self
    }

    /// Swap the face driver. Queued lip-sync is dropped when the new
    /// provider does not consume precomputed data.
    pub fn set_lipsync_provider(&mut self, provider: Option<Box<dyn LipSyncProvider>>) {
        if let Some(old) = self.provider.as_mut() {
            old.stop();
        }
        let accepts = provider
            .as_ref()
            .is_some_and(|p| p.requires_precomputed_face_data());
        self.accept_lipsync.store(accepts, Ordering::Release);
        if !accepts {
            self.buffers.lipsync.reset();
        }
        self.provider = provider;
    }

    /// A handle transport threads can push through.
    pub fn feeder(&self) -> StreamFeeder {
        StreamFeeder {
            buffers: Arc::clone(&self.buffers),
            diagnostics: Arc::clone(&self.diagnostics),
            accept_lipsync: Arc::clone(&self.accept_lipsync),
            notices: self.notice_tx.clone(),
        }
    }

    // ── Ingest ───────────────────────────────────────────────────────────────

    /// Buffer one audio payload and re-evaluate.
    ///
    /// `has_wav_header` payloads carry their own format; a header that does
    /// not parse is logged and the caller's format is used instead.
    ///
    /// # Errors
    /// `VoxsyncError::InvalidAudio` or `VoxsyncError::RingBufferFull`. Buffer
    /// state is untouched on error.
    pub fn push_audio(
        &mut self,
        bytes: &[u8],
        sample_rate: u32,
        channels: u16,
        has_wav_header: bool,
    ) -> Result<()> {
        let notice = feeder::ingest_audio(
            &self.buffers,
            &self.diagnostics,
            bytes,
            sample_rate,
            channels,
            has_wav_header,
        )?;
        self.handle_notice(notice);
        self.evaluate();
        Ok(())
    }

    /// Decode a relay packet and buffer its PCM.
    pub fn push_packet(&mut self, decoder: &mut OpusPacketDecoder, packet: &[u8]) -> Result<()> {
        let format = decoder.format().ok_or(VoxsyncError::CodecNotInitialized)?;
        let pcm = decoder.decode(packet);
        if pcm.is_empty() {
            return Ok(());
        }
        self.push_audio(pcm, format.sample_rate, format.channels, false)
    }

    /// Buffer one animation sequence and re-evaluate. Dropped when no
    /// provider consumes precomputed data.
    pub fn push_lipsync(&mut self, sequence: AnimationSequence) {
        let accepting = self.accept_lipsync.load(Ordering::Acquire);
        if let Some(notice) =
            feeder::ingest_lipsync(&self.buffers, &self.diagnostics, accepting, sequence)
        {
            self.handle_notice(notice);
        }
        self.evaluate();
    }

    /// The sender is done with this utterance: release whatever is left
    /// regardless of thresholds.
    pub fn finish_stream(&mut self) {
        self.handle_notice(IngestNotice::EndOfStream);
        self.evaluate();
    }

    // ── Control ──────────────────────────────────────────────────────────────

    /// Begin evaluating even while nothing is buffered.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.evaluate();
    }

    /// Hard stop: drop buffered content, silence the sink, end the session.
    pub fn stop(&mut self) {
        let was_talking = self.talking;

        self.fade.reset();
        self.apply_volume(1.0);
        self.timer.cancel();
        self.output.reset();
        if self.paused {
            self.paused = false;
            self.output.resume();
        }
        self.buffers.audio.reset();
        self.buffers.lipsync.reset();
        while self.notice_rx.try_recv().is_ok() {}

        self.primed = false;
        self.started = false;
        self.end_of_stream = false;
        self.held_seconds = 0.0;
        self.processing = false;
        self.talking = false;

        self.stop_provider();
        self.set_state(StreamState::Stopped);

        if was_talking {
            info!("talk session stopped");
            self.emit_talk(TalkEventKind::Finished);
        }
        self.session_span = None;
    }

    /// Fade to silence over `fade_seconds` (never longer than the audio
    /// still playing), then stop. No new content is dispatched meanwhile.
    pub fn stop_with_fade(&mut self, fade_seconds: f64) {
        let fade = FadeState::begin(fade_seconds, self.timer.remaining() + self.held_seconds);
        if !fade.is_active() {
            self.stop();
            return;
        }
        info!(
            requested = fade_seconds,
            effective = fade.total(),
            "fading out"
        );
        self.fade = fade;
    }

    /// Cut the character off. Fades when speech is audible or a response is
    /// being prepared; otherwise stops outright.
    pub fn interrupt(&mut self, fade_seconds: f64) {
        if self.config.network_role == NetworkRole::Authority && self.config.replicate_to_peers {
            let seq = self.next_seq();
            let _ = self.peer_tx.send(PeerInterruptEvent { seq, fade_seconds });
        }
        StreamDiagnostics::bump(&self.diagnostics.interrupts, 1);

        if self.talking || self.processing {
            info!(fade_seconds, "interrupting speech");
            self.emit_talk(TalkEventKind::Interrupted);
            self.stop_with_fade(fade_seconds);
        } else {
            self.stop();
        }
    }

    /// Apply an interrupt replicated from the authority. Ignored unless this
    /// engine is a peer.
    pub fn apply_remote_interrupt(&mut self, fade_seconds: f64) {
        if self.config.network_role != NetworkRole::Peer {
            debug!(role = ?self.config.network_role, "ignoring remote interrupt");
            return;
        }
        self.interrupt(fade_seconds);
    }

    /// Mark that a response is being generated but no audio has arrived yet.
    /// Cleared whenever the engine stops.
    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    /// Freeze playback, the finish timer and the face.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.timer.pause();
        self.output.pause();
        if let Some(provider) = self.provider.as_mut() {
            provider.pause();
        }
        info!("stream paused");
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.timer.resume();
        self.output.resume();
        if let Some(provider) = self.provider.as_mut() {
            provider.resume();
        }
        info!("stream resumed");
        self.evaluate();
    }

    /// Advance timers, fades and the face by `delta_seconds`, then
    /// re-evaluate. Call once per host frame.
    pub fn tick(&mut self, delta_seconds: f64) {
        let dt = if delta_seconds.is_finite() {
            delta_seconds.max(0.0)
        } else {
            0.0
        };
        let span = self.session_span.clone().unwrap_or_else(Span::none);
        let _entered = span.enter();

        while let Ok(notice) = self.notice_rx.try_recv() {
            self.handle_notice(notice);
        }
        if self.paused {
            return;
        }

        match self.fade.advance(dt) {
            FadeStep::Idle => {}
            FadeStep::Volume(volume) => self.apply_volume(volume),
            FadeStep::Finished => {
                info!("fade-out complete");
                self.stop();
            }
        }

        if let Some(token) = self.timer.advance(dt) {
            self.on_playback_finished(token);
        }

        self.advance_face(dt);
        self.evaluate();
    }

    /// Completion signal for the audio dispatched so far. Tokens from before
    /// a stop or an earlier session are ignored.
    pub fn on_playback_finished(&mut self, token: CompletionToken) {
        if !self.timer.is_current(token) {
            debug!("stale playback completion ignored");
            return;
        }
        if self.held_seconds > 0.0 {
            debug!(held = self.held_seconds, "finish deferred until output is reconfigured");
            return;
        }
        self.timer.cancel();
        self.primed = false;
        self.end_of_stream = false;

        if self.talking {
            self.talking = false;
            self.stop_provider();
            info!("talk session finished");
            self.emit_talk(TalkEventKind::Finished);
        }
        self.session_span = None;

        if self.buffers.audio.is_empty() && self.buffers.lipsync.is_empty() {
            self.started = false;
            self.set_state(StreamState::Stopped);
        }
    }

    /// The sink completed an asynchronous reconfiguration.
    pub fn finish_reconfiguration(&mut self) {
        if !self.output.is_configuring() {
            return;
        }
        self.output.finish_reconfiguration();
        let held = std::mem::take(&mut self.held_seconds);
        if held > 0.0 {
            debug!(held, "held audio released");
            self.timer.extend(held);
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Token for the current finish countdown, if one is running.
    pub fn playback_token(&self) -> Option<CompletionToken> {
        self.timer.is_armed().then(|| self.timer.token())
    }

    /// Audio still to be heard: dispatched-but-unplayed plus buffered.
    pub fn remaining_content_duration(&self) -> f64 {
        self.timer.remaining() + self.held_seconds + self.buffers.audio.total_duration()
    }

    /// Current viseme weights, empty when the provider drives blendshapes.
    pub fn visemes(&self) -> AnimationFrame {
        match &self.provider {
            Some(p) if !p.generates_blendshapes() => p.current_frame(),
            _ => AnimationFrame::new(),
        }
    }

    /// Current blendshape weights, empty when the provider drives visemes.
    pub fn blendshapes(&self) -> AnimationFrame {
        match &self.provider {
            Some(p) if p.generates_blendshapes() => p.current_frame(),
            _ => AnimationFrame::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.machine.state()
    }

    pub fn is_talking(&self) -> bool {
        self.talking
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_fading(&self) -> bool {
        self.fade.is_active()
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn is_configuring_output(&self) -> bool {
        self.output.is_configuring()
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            state: self.machine.state(),
            talking: self.talking,
            paused: self.paused,
            fading: self.fade.is_active(),
            volume: self.volume,
            buffered_audio_seconds: self.buffers.audio.total_duration(),
            buffered_lipsync_seconds: self.buffers.lipsync.total_duration(),
            remaining_content_seconds: self.remaining_content_duration(),
        }
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn reset_diagnostics(&self) {
        self.diagnostics.reset();
    }

    pub fn subscribe_talk(&self) -> broadcast::Receiver<TalkEvent> {
        self.talk_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameReadyEvent> {
        self.frame_tx.subscribe()
    }

    pub fn subscribe_peer(&self) -> broadcast::Receiver<PeerInterruptEvent> {
        self.peer_tx.subscribe()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn lipsync_required(&self) -> bool {
        self.config.enable_sync
            && self
                .provider
                .as_ref()
                .is_some_and(|p| p.requires_precomputed_face_data())
    }

    fn buffer_levels(&self) -> BufferLevels {
        BufferLevels {
            audio_seconds: self.buffers.audio.total_duration(),
            audio_empty: self.buffers.audio.is_empty(),
            lipsync_seconds: self.buffers.lipsync.total_duration(),
            lipsync_required: self.lipsync_required(),
            primed: self.primed,
            end_of_stream: self.end_of_stream,
        }
    }

    fn handle_notice(&mut self, notice: IngestNotice) {
        match notice {
            IngestNotice::Audio { bytes, seconds } => trace!(bytes, seconds, "audio buffered"),
            IngestNotice::LipSync { seconds } => trace!(seconds, "lip-sync buffered"),
            IngestNotice::EndOfStream => {
                debug!("end of stream");
                self.end_of_stream = true;
            }
        }
    }

    fn evaluate(&mut self) {
        if self.paused || self.fade.is_active() {
            return;
        }
        let levels = self.buffer_levels();
        if self.machine.state() == StreamState::Stopped
            && !self.started
            && levels.audio_empty
            && self.buffers.lipsync.is_empty()
        {
            return;
        }

        let next = self.machine.evaluate(&levels);
        self.set_state(next);
        if next == StreamState::Playing {
            self.dispatch(&levels);
        }
    }

    fn set_state(&mut self, next: StreamState) {
        let Some(previous) = self.machine.transition(next) else {
            return;
        };
        if next == StreamState::Stopped {
            self.buffers.audio.reset();
            self.buffers.lipsync.reset();
            self.processing = false;
        }
        let seq = self.next_seq();
        let _ = self.status_tx.send(StreamStatusEvent {
            seq,
            state: next,
            previous,
        });
    }

    fn dispatch(&mut self, levels: &BufferLevels) {
        let (sample_rate, channels) = self.buffers.audio.format();
        let max_seconds = pcm_duration_secs(self.config.max_dispatch_bytes, sample_rate, channels);
        let seconds = dispatch::dispatch_duration(levels).min(max_seconds);
        let bytes = dispatch::playable_bytes(
            seconds,
            sample_rate,
            channels,
            self.buffers.audio.available_bytes(),
            self.config.max_dispatch_bytes,
        );
        if bytes == 0 {
            return;
        }

        if self.scratch.len() < bytes {
            self.scratch.resize(bytes, 0);
        }
        let copied = self.buffers.audio.get_data(&mut self.scratch[..bytes]);
        let block = &self.scratch[..copied];

        let audio_seconds = pcm_duration_secs(copied, sample_rate, channels);
        match self.output.submit(block, sample_rate, channels) {
            Ok(Submitted::Queued) => {
                self.timer.extend(audio_seconds);
            }
            Ok(Submitted::Held) => self.held_seconds += audio_seconds,
            Err(e) => {
                // Dropped blocks still count toward the finish countdown.
                error!("audio output rejected dispatch: {e}");
                StreamDiagnostics::bump(&self.diagnostics.sink_errors, 1);
                self.timer.extend(audio_seconds);
            }
        }
        if let Some(provider) = self.provider.as_mut() {
            if !provider.requires_precomputed_face_data() {
                provider.infer_from_audio(block, sample_rate, channels);
            }
        }
        self.buffers.audio.remove_data(copied);

        let released = self.buffers.lipsync.consume_up_to(seconds);
        let released_seconds = released.duration;
        let released_count = released.sequences.len();
        if let Some(provider) = self.provider.as_mut() {
            for sequence in released.sequences {
                provider.apply_sequence(sequence);
            }
        }

        StreamDiagnostics::bump(&self.diagnostics.dispatches, 1);
        StreamDiagnostics::bump(&self.diagnostics.bytes_dispatched, copied);
        StreamDiagnostics::bump(&self.diagnostics.sequences_dispatched, released_count);
        debug!(
            bytes = copied,
            seconds = audio_seconds,
            lipsync = released_seconds,
            "dispatched"
        );

        if !self.talking {
            self.begin_talking();
        }
    }

    fn begin_talking(&mut self) {
        self.talking = true;
        self.processing = false;
        self.primed = true;
        self.session += 1;
        StreamDiagnostics::bump(&self.diagnostics.sessions, 1);

        let span = info_span!("talk_session", session = self.session);
        span.in_scope(|| info!("talk session started"));
        self.session_span = Some(span);

        if let Some(provider) = self.provider.as_mut() {
            provider.resume();
        }
        self.emit_talk(TalkEventKind::Started);
    }

    fn advance_face(&mut self, dt: f64) {
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        if !provider.advance(dt) {
            return;
        }
        let frame = provider.current_frame();
        let blendshapes = provider.generates_blendshapes();
        self.publish_frame(frame, blendshapes);
    }

    fn stop_provider(&mut self) {
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        provider.stop();
        let frame = provider.current_frame();
        let blendshapes = provider.generates_blendshapes();
        self.publish_frame(frame, blendshapes);
    }

    fn publish_frame(&mut self, frame: AnimationFrame, blendshapes: bool) {
        let seq = self.next_seq();
        let _ = self.frame_tx.send(FrameReadyEvent {
            seq,
            blendshapes,
            frame,
        });
    }

    fn apply_volume(&mut self, volume: f32) {
        self.volume = volume;
        self.output.set_volume(volume);
    }

    fn emit_talk(&mut self, kind: TalkEventKind) {
        let seq = self.next_seq();
        let _ = self.talk_tx.send(TalkEvent {
            seq,
            session: self.session,
            kind,
        });
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}
