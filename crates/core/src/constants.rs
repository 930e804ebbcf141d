//! Shared constants for voice processing.

/// Sample rate the engines run at (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame size in samples (10ms at 48kHz = 480 samples)
pub const FRAME_SIZE: usize = 480;

/// Frame duration in milliseconds
pub const FRAME_MS: i32 = 10;

/// Upper bound for the stream delay the delay controller will settle on
pub const MAX_STREAM_DELAY_MS: i32 = 384;

/// Largest single step the delay controller takes
pub const MAX_DELAY_STEP_MS: i32 = 48;

/// Render history kept for delay alignment (500ms)
pub const MAX_RENDER_DELAY_MS: i32 = 500;
