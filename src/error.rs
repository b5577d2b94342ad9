//! Error types for composer4u.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request rejected before any work started (empty prompt, bad
    /// output directory, missing credential, generation already running).
    #[error("validation: {0}")]
    Validation(String),

    /// Could not reach the generation service, or the connection dropped.
    #[error("connect: {0}")]
    Connect(String),

    /// The service rejected the API credential.
    #[error("auth: {0}")]
    Auth(String),

    /// The service refused the prompt; carries the remote reason verbatim.
    #[error("prompt filtered: {0}")]
    Filtered(String),

    /// Audio sink error (WAV I/O, playback device).
    #[error("audio: {0}")]
    Audio(String),

    /// Background engine error (worker not running, task lost).
    #[error("engine: {0}")]
    Engine(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
