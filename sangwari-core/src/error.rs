use thiserror::Error;

/// All errors produced by sangwari-core.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Microphone or speaker could not be acquired (permission, missing hardware).
    #[error("audio device unavailable: {0}")]
    DeviceAcquisition(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    /// The live session could not be opened or ended abnormally.
    #[error("connection failure: {0}")]
    Connection(String),

    /// An audio chunk could not be decoded. Recoverable: drop the chunk.
    #[error("malformed audio data: {0}")]
    MalformedAudioData(String),

    /// Stopping a buffer that already finished. Always swallowed by callers.
    #[error("playback buffer {0} is not active")]
    PlaybackStop(u64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("completion request failed: {0}")]
    Completion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoiceError>;
