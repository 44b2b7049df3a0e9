//! Error taxonomy for voice sessions and audio sources.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoiceError {
    /// The guild has no active voice session.
    #[error("no voice session for this guild")]
    NoVoiceState,

    #[error("unknown source `{0}`")]
    UnknownSource(String),

    #[error("a source named `{0}` is already registered")]
    DuplicateSource(String),

    /// Join/move was given something that is not a voice channel.
    #[error("invalid voice target: {0}")]
    InvalidTarget(String),

    #[error("already connected to a voice channel")]
    AlreadyConnected,

    #[error("no source attached")]
    NothingAttached,

    /// Decode session died or its pipe closed unexpectedly.
    #[error("source backend failed: {0}")]
    Backend(String),

    #[error("voice transport error: {0}")]
    Transport(String),
}

impl VoiceError {
    /// Text shown to the user at the command boundary.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::NoVoiceState => "Not in a voice channel.".to_string(),
            VoiceError::UnknownSource(name) => format!("There is no source called `{name}`."),
            VoiceError::DuplicateSource(name) => {
                format!("A source called `{name}` is already registered.")
            }
            VoiceError::InvalidTarget(_) => "This is not a voice channel...".to_string(),
            VoiceError::AlreadyConnected => "Already in a voice channel...".to_string(),
            VoiceError::NothingAttached => "No source attached, use `attach` first.".to_string(),
            VoiceError::Backend(_) => "Source stopped.".to_string(),
            VoiceError::Transport(reason) => format!("Voice connection failed: {reason}"),
        }
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;
