//! # voxsync-core
//!
//! Streaming speech playback with synchronized lip-sync.
//!
//! ## Architecture
//!
//! ```text
//! RelayEncoder ─► packets ─► OpusPacketDecoder ─► StreamFeeder / StreamEngine::push_*
//!                                                        │
//!                                       AudioRingBuffer + LipSyncQueue
//!                                                        │
//!                                        SyncStateMachine (per tick)
//!                                                        │
//!                                 Playing ─► AudioSink + LipSyncProvider
//!                                                        │
//!                             broadcast::Sender<TalkEvent / FrameReadyEvent / ...>
//! ```
//!
//! The engine is driven by `tick(dt)` from the host's frame loop. Transport
//! threads only touch the two shared buffers.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod lipsync;
pub mod sync;

// Convenience re-exports for downstream crates
pub use audio::{AudioSink, MemorySink};
pub use buffering::{AudioChunk, AudioRingBuffer};
pub use codec::relay::RelayEncoder;
pub use codec::{EncoderHint, OpusPacketDecoder, OpusPacketEncoder};
pub use engine::feeder::StreamFeeder;
pub use engine::{NetworkRole, StreamConfig, StreamEngine};
pub use error::VoxsyncError;
pub use ipc::events::{
    FrameReadyEvent, PeerInterruptEvent, StreamSnapshot, StreamStatusEvent, TalkEvent,
    TalkEventKind,
};
pub use lipsync::{
    AnimationFrame, AnimationSequence, FaceSyncPlayer, LipSyncProvider, LipSyncQueue,
};
pub use sync::{StreamState, SyncStateMachine};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalSink;
