// src/error.rs

//! Engine error kinds. These are surfaced on `EngineEvent::Error` and never
//! propagate across the engine boundary as panics.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Capture source missing or lost mid-session.
    #[error("microphone unavailable: {0}")]
    MicUnavailable(String),

    /// The recording lease is held by another operation.
    #[error("recorder busy: {0}")]
    RecorderBusy(String),

    /// Captured frames could not be decoded into an audio buffer.
    #[error("decode failed: {0}")]
    DecodeError(String),

    /// An offline pitch job was cancelled before completion.
    #[error("pitch job cancelled on track {0}")]
    PitchCancelled(usize),

    /// An offline pitch job failed.
    #[error("pitch job failed on track {track}: {message}")]
    PitchFailed { track: usize, message: String },

    /// A command arrived in a state where it cannot apply.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Playback is re-entering the capture path. Advisory; the user may
    /// confirm and proceed.
    #[error("loopback detected (mic rms {rms:.4} over threshold {threshold:.4})")]
    LoopbackDetected { rms: f32, threshold: f32 },
}

impl EngineError {
    /// Stable short name for event consumers that key on kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::MicUnavailable(_) => "MicUnavailable",
            EngineError::RecorderBusy(_) => "RecorderBusy",
            EngineError::DecodeError(_) => "DecodeError",
            EngineError::PitchCancelled(_) => "PitchCancelled",
            EngineError::PitchFailed { .. } => "PitchFailed",
            EngineError::InvalidState(_) => "InvalidState",
            EngineError::LoopbackDetected { .. } => "LoopbackDetected",
        }
    }
}
