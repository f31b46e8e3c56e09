use thiserror::Error;

/// All errors produced by voxsync-core.
#[derive(Debug, Error)]
pub enum VoxsyncError {
    #[error("unsupported audio format: {sample_rate} Hz, {channels} channel(s)")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },

    #[error("codec used before a successful init")]
    CodecNotInitialized,

    #[error("opus codec error: {0}")]
    Codec(String),

    #[error("corrupt packet header: {0}")]
    CorruptPacket(String),

    #[error("invalid audio chunk: {0}")]
    InvalidAudio(String),

    #[error("audio ring buffer full: requested {requested} bytes, {available} free")]
    RingBufferFull { requested: usize, available: usize },

    #[error("malformed WAV header: {0}")]
    WavHeader(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxsyncError>;
