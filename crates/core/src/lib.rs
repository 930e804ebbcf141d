pub mod config;
pub mod constants;
pub mod delay;
pub mod echo_cancel;
pub mod engine;
pub mod error;
pub mod frame_adapter;
pub mod gain;
pub mod metrics;
pub mod processor;
pub mod session;

pub use config::{EngineConfig, EngineKind, Profile, SessionConfig, StreamFormat};
pub use delay::{DelayAdjustment, DelayController};
pub use engine::{create_engine, LiteEngine, ProcessingEngine, StandardEngine};
pub use error::{ConfigError, EngineError};
pub use frame_adapter::FrameAccumulator;
pub use gain::{GainConfig, GainMode, GainPostProcessor};
pub use metrics::DelayMetrics;
pub use session::Session;
