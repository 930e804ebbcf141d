//! Session and engine configuration.
//!
//! An [`EngineConfig`] describes which DSP stages run and how they are tuned.
//! Profiles produce the two configurations used in practice: one for
//! recorded messages and one for live calls.

use crate::constants::{FRAME_MS, SAMPLE_RATE};
use crate::error::ConfigError;

/// What the session is processing. Selects the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Offline recording (voice messages). Leveling is left to external gain stages.
    Message,
    /// Live two-way call with echo cancellation and adaptive gain.
    #[default]
    Call,
}

/// Engine adapter to build. Chosen once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Full stage set, delay statistics and voice detection.
    #[default]
    Standard,
    /// Reduced stage set without statistics or voice detection.
    Lite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
        }
    }
}

impl StreamFormat {
    /// Samples per 10ms frame.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as usize * FRAME_MS as usize) / 1000
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels != 1 {
            return Err(ConfigError::UnsupportedChannels(self.channels));
        }
        if self.sample_rate != SAMPLE_RATE {
            return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EchoCancellerConfig {
    pub enabled: bool,
    /// Adds residual echo suppression during far-end single talk.
    pub mobile_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoiseSuppressionLevel {
    Low,
    #[default]
    Moderate,
    High,
    VeryHigh,
}

impl NoiseSuppressionLevel {
    /// Wet mix of the denoised signal against the input.
    pub fn strength(&self) -> f32 {
        match self {
            Self::Low => 0.5,
            Self::Moderate => 0.75,
            Self::High => 0.9,
            Self::VeryHigh => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoiseSuppressionConfig {
    pub enabled: bool,
    pub level: NoiseSuppressionLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GainControlMode {
    /// Digital gain stays at 0 dB; the analog level suggestion does the work.
    AdaptiveAnalog,
    #[default]
    AdaptiveDigital,
    /// Constant `compression_gain_db` of digital gain.
    FixedDigital,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainControllerConfig {
    pub enabled: bool,
    pub mode: GainControlMode,
    /// Target peak level, in dB below full scale (3 means -3 dBFS).
    pub target_level_dbfs: i32,
    /// Maximum digital gain applied to quiet input.
    pub compression_gain_db: i32,
    pub enable_limiter: bool,
}

pub const BASELINE_TARGET_LEVEL_DBFS: i32 = 3;
pub const DEFAULT_COMPRESSION_GAIN_DB: i32 = 9;

impl Default for GainControllerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: GainControlMode::AdaptiveDigital,
            target_level_dbfs: BASELINE_TARGET_LEVEL_DBFS,
            compression_gain_db: DEFAULT_COMPRESSION_GAIN_DB,
            enable_limiter: true,
        }
    }
}

impl GainControllerConfig {
    /// Resets mode, target and limiter to the baseline, keeping `enabled`.
    pub fn reset_to_baseline(&mut self, compression_gain_db: i32) {
        self.mode = GainControlMode::AdaptiveDigital;
        self.target_level_dbfs = BASELINE_TARGET_LEVEL_DBFS;
        self.enable_limiter = true;
        self.compression_gain_db = compression_gain_db;
    }

    pub fn is_baseline(&self) -> bool {
        self.mode == GainControlMode::AdaptiveDigital
            && self.target_level_dbfs == BASELINE_TARGET_LEVEL_DBFS
            && self.enable_limiter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageToggle {
    pub enabled: bool,
}

impl StageToggle {
    pub const ON: Self = Self { enabled: true };
    pub const OFF: Self = Self { enabled: false };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineConfig {
    pub echo_canceller: EchoCancellerConfig,
    pub noise_suppression: NoiseSuppressionConfig,
    pub gain_controller: GainControllerConfig,
    pub high_pass_filter: StageToggle,
    pub transient_suppression: StageToggle,
    pub voice_detection: StageToggle,
}

impl EngineConfig {
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Message => Self::message(),
            Profile::Call => Self::call(),
        }
    }

    /// Noise suppression and high-pass only. Internal AGC stays off: with
    /// external gain stages after it the two would pump against each other.
    pub fn message() -> Self {
        Self {
            echo_canceller: EchoCancellerConfig {
                enabled: false,
                mobile_mode: false,
            },
            noise_suppression: NoiseSuppressionConfig {
                enabled: true,
                level: NoiseSuppressionLevel::Moderate,
            },
            gain_controller: GainControllerConfig {
                enabled: false,
                ..GainControllerConfig::default()
            },
            high_pass_filter: StageToggle::ON,
            transient_suppression: StageToggle::OFF,
            voice_detection: StageToggle::OFF,
        }
    }

    pub fn call() -> Self {
        Self {
            echo_canceller: EchoCancellerConfig {
                enabled: true,
                mobile_mode: true,
            },
            noise_suppression: NoiseSuppressionConfig {
                enabled: true,
                level: NoiseSuppressionLevel::High,
            },
            gain_controller: GainControllerConfig {
                enabled: true,
                mode: GainControlMode::AdaptiveDigital,
                target_level_dbfs: BASELINE_TARGET_LEVEL_DBFS,
                compression_gain_db: DEFAULT_COMPRESSION_GAIN_DB,
                enable_limiter: true,
            },
            high_pass_filter: StageToggle::ON,
            transient_suppression: StageToggle::ON,
            voice_detection: StageToggle::ON,
        }
    }
}

/// Everything needed to create a [`crate::Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionConfig {
    pub profile: Profile,
    pub initial_delay_ms: i32,
    pub format: StreamFormat,
    pub engine: EngineKind,
}

impl SessionConfig {
    pub fn new(profile: Profile, initial_delay_ms: i32) -> Self {
        Self {
            profile,
            initial_delay_ms,
            ..Self::default()
        }
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }
}
