//! Error types for session construction and per-frame processing.

use thiserror::Error;

/// Fatal errors raised while building a session or engine.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported sample rate: {0} Hz (only 48000 Hz is supported)")]
    UnsupportedSampleRate(u32),

    #[error("unsupported channel count: {0} (only mono is supported)")]
    UnsupportedChannels(u16),

    #[error("echo canceller initialization failed: {0}")]
    EchoCanceller(String),

    #[error("filter design failed: {0}")]
    Filter(String),
}

/// Non-fatal errors for a single frame. The session passes the frame
/// through unmodified when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("expected a frame of {expected} samples, got {actual}")]
    BadFrameLength { expected: usize, actual: usize },

    #[error("echo canceller failed: {0}")]
    EchoCanceller(String),
}
