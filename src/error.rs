//! Error types for tone detection

use std::fmt;

/// Errors that can occur while detecting a tone
#[derive(Debug, Clone, PartialEq)]
pub enum DetectError {
    /// Invalid settings, or a tone the derived FFT cannot resolve
    Config(String),

    /// Input could not be opened or recognized as audio
    DecodeOpen(String),

    /// I/O or decoder failure after analysis started
    StreamRead(String),

    /// Spectral transform failure
    Transform(String),
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            DetectError::DecodeOpen(msg) => write!(f, "Cannot open audio: {}", msg),
            DetectError::StreamRead(msg) => write!(f, "Stream read error: {}", msg),
            DetectError::Transform(msg) => write!(f, "Transform error: {}", msg),
        }
    }
}

impl std::error::Error for DetectError {}
