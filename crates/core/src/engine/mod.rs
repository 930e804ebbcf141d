//! Processing engine interface and its adapters.
//!
//! Every adapter exposes the same operation set; the session never needs to
//! know which one it is driving. The adapter is picked once, from
//! [`EngineKind`], when the session is created.

mod lite;
mod standard;

pub use lite::LiteEngine;
pub use standard::StandardEngine;

use crate::config::{EngineConfig, EngineKind};
use crate::error::{ConfigError, EngineError};
use crate::metrics::DelayMetrics;

/// A stateful DSP unit working on one 10ms frame at a time.
///
/// Forward and reverse calls share adaptive filter state. Callers must
/// serialize all calls on one engine.
pub trait ProcessingEngine: Send {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Processes one near-end (microphone) frame in place.
    ///
    /// On error the frame content is unspecified; the session restores it.
    fn process_forward(&mut self, frame: &mut [i16]) -> Result<(), EngineError>;

    /// Feeds one far-end (playback) frame to the echo canceller.
    fn process_reverse(&mut self, frame: &[i16]) -> Result<(), EngineError>;

    /// Delay between a far-end frame being played and its echo being captured.
    fn set_stream_delay_ms(&mut self, delay_ms: i32);

    fn metrics(&self) -> DelayMetrics;

    fn set_analog_gain_level(&mut self, level: i32);

    fn suggested_analog_gain_level(&self) -> i32;

    /// `None` when this engine cannot detect voice, `Some(false)` when it
    /// can and heard none.
    fn has_voice(&self) -> Option<bool>;

    fn config(&self) -> &EngineConfig;

    /// Applies a new configuration, rebuilding only the stages that changed.
    fn apply_config(&mut self, config: EngineConfig) -> Result<(), ConfigError>;
}

pub fn create_engine(
    kind: EngineKind,
    config: EngineConfig,
) -> Result<Box<dyn ProcessingEngine>, ConfigError> {
    Ok(match kind {
        EngineKind::Standard => Box::new(StandardEngine::new(config)?),
        EngineKind::Lite => Box::new(LiteEngine::new(config)?),
    })
}

pub(crate) fn check_frame(frame_len: usize, expected: usize) -> Result<(), EngineError> {
    if frame_len != expected {
        return Err(EngineError::BadFrameLength {
            expected,
            actual: frame_len,
        });
    }
    Ok(())
}
