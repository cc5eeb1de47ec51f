use thiserror::Error;

/// All errors produced by studyvoice-core.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Microphone access was refused by the platform.
    #[error("microphone permission denied: {0}")]
    Permission(String),

    /// Opening the live connection failed, or it failed mid-session.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed audio payload (bad base64, odd PCM length, zero sample rate).
    #[error("audio decode error: {0}")]
    Decode(String),

    /// Malformed structured response from a one-shot generation call.
    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("an audio output service is already acquired in this process")]
    OutputBusy,

    #[error("session is closed")]
    SessionClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoiceError {
    /// Whether this error ends a session (as opposed to a per-chunk failure).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoiceError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
