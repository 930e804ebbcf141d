//! DSP stages shared by the engine adapters.
//!
//! All stages work on one frame of `f32` samples in i16 scale
//! (`-32768.0..=32767.0`), which is what RNNoise expects.

use crate::config::{GainControlMode, GainControllerConfig, NoiseSuppressionLevel};
use crate::constants::{FRAME_SIZE, SAMPLE_RATE};
use crate::error::ConfigError;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use nnnoiseless::DenoiseState;

const FULL_SCALE: f32 = 32768.0;

/// Second-order high-pass removing DC offset and low-frequency rumble.
pub struct HighPassFilter {
    filter: DirectForm2Transposed<f32>,
}

impl HighPassFilter {
    pub const CUTOFF_HZ: f32 = 80.0;

    pub fn new() -> Result<Self, ConfigError> {
        let coeffs = Coefficients::<f32>::from_params(
            Type::HighPass,
            SAMPLE_RATE.hz(),
            Self::CUTOFF_HZ.hz(),
            Q_BUTTERWORTH_F32,
        )
        .map_err(|e| ConfigError::Filter(format!("high-pass: {:?}", e)))?;
        Ok(Self {
            filter: DirectForm2Transposed::<f32>::new(coeffs),
        })
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            *sample = self.filter.run(*sample);
        }
    }
}

/// RNNoise denoiser blended against the input according to the level.
pub struct NoiseSuppressor {
    denoise: Box<DenoiseState<'static>>,
    level: NoiseSuppressionLevel,
    output: [f32; FRAME_SIZE],
    voice_probability: f32,
}

impl NoiseSuppressor {
    pub fn new(level: NoiseSuppressionLevel) -> Self {
        Self {
            denoise: DenoiseState::new(),
            level,
            output: [0.0; FRAME_SIZE],
            voice_probability: 0.0,
        }
    }

    pub fn set_level(&mut self, level: NoiseSuppressionLevel) {
        self.level = level;
    }

    /// RNNoise's voice probability for the last frame.
    pub fn voice_probability(&self) -> f32 {
        self.voice_probability
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        self.voice_probability = self.denoise.process_frame(&mut self.output, frame);
        let strength = self.level.strength();
        for (sample, &denoised) in frame.iter_mut().zip(self.output.iter()) {
            *sample = sample.mul_add(1.0 - strength, denoised * strength);
        }
    }
}

/// Attenuates short clicks (keyboard, mouse) that stand far above the
/// running background level while nobody is talking.
pub struct TransientSuppressor {
    background: f32,
}

impl Default for TransientSuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransientSuppressor {
    const BLOCKS: usize = 10;
    const BLOCK_LEN: usize = FRAME_SIZE / Self::BLOCKS;
    /// Block energy over background (12 dB) that marks a transient.
    const RATIO: f32 = 16.0;
    const SMOOTHING: f32 = 0.95;
    const FLOOR: f32 = 1.0;

    pub fn new() -> Self {
        Self {
            background: Self::FLOOR,
        }
    }

    /// `voice_probability` gates suppression: speech onsets are left alone.
    pub fn process(&mut self, frame: &mut [f32], voice_probability: f32) {
        let limit = self.background * Self::RATIO;
        let mut min_energy = f32::MAX;

        for block in frame.chunks_mut(Self::BLOCK_LEN) {
            let energy = block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32;
            min_energy = min_energy.min(energy);
            if energy > limit && voice_probability < 0.5 {
                let gain = (limit / energy).sqrt();
                for sample in block.iter_mut() {
                    *sample *= gain;
                }
            }
        }

        // Background follows the quietest block, so a click never raises it.
        if min_energy < f32::MAX {
            self.background = self
                .background
                .mul_add(Self::SMOOTHING, min_energy * (1.0 - Self::SMOOTHING))
                .max(Self::FLOOR);
        }
    }
}

/// Digital gain control with an optional peak limiter.
///
/// Quiet speech is raised toward the target by at most
/// `compression_gain_db`; the limiter keeps peaks under the target level.
/// In `AdaptiveAnalog` mode the digital gain stays at unity and the
/// controller instead suggests a new analog (microphone) level.
pub struct DigitalGainController {
    config: GainControllerConfig,
    current_gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
    applied_level: i32,
    suggested_level: i32,
}

impl DigitalGainController {
    /// Crest factor assumed between the RMS of speech and its peaks.
    const CREST_DB: f32 = 15.0;
    /// Frames below this RMS level are treated as silence and hold the gain.
    const SILENCE_DB: f32 = -60.0;
    pub const MAX_ANALOG_LEVEL: i32 = 255;
    const ANALOG_STEP: i32 = 4;

    pub fn new(config: GainControllerConfig) -> Self {
        let mut agc = Self {
            config,
            current_gain: 1.0,
            attack_coeff: 0.3,
            release_coeff: 0.02,
            applied_level: 0,
            suggested_level: 0,
        };
        if config.mode == GainControlMode::FixedDigital {
            agc.current_gain = db_to_linear(config.compression_gain_db as f32);
        }
        agc
    }

    /// Retunes without resetting the gain state.
    pub fn set_config(&mut self, config: GainControllerConfig) {
        if config.mode != self.config.mode {
            self.current_gain = match config.mode {
                GainControlMode::FixedDigital => db_to_linear(config.compression_gain_db as f32),
                _ => 1.0,
            };
        }
        self.config = config;
    }

    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    /// The analog level the capture device is currently set to.
    pub fn set_applied_level(&mut self, level: i32) {
        let level = level.clamp(0, Self::MAX_ANALOG_LEVEL);
        self.applied_level = level;
        self.suggested_level = level;
    }

    /// The applied level, unless `AdaptiveAnalog` mode wants it changed.
    pub fn suggested_level(&self) -> i32 {
        if self.config.enabled && self.config.mode == GainControlMode::AdaptiveAnalog {
            self.suggested_level
        } else {
            self.applied_level
        }
    }

    fn update_analog_suggestion(&mut self, level_db: f32) {
        if level_db <= Self::SILENCE_DB {
            return;
        }
        let target_db = -(self.config.target_level_dbfs as f32) - Self::CREST_DB;
        if level_db < target_db - 6.0 {
            self.suggested_level = (self.suggested_level + Self::ANALOG_STEP).min(Self::MAX_ANALOG_LEVEL);
        } else if level_db > target_db + 3.0 {
            self.suggested_level = (self.suggested_level - Self::ANALOG_STEP).max(0);
        }
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        let level_db = rms_dbfs(frame);

        let max_gain_db = self.config.compression_gain_db.max(0) as f32;
        match self.config.mode {
            GainControlMode::AdaptiveAnalog => {
                self.current_gain = 1.0;
                self.update_analog_suggestion(level_db);
            }
            GainControlMode::FixedDigital => self.current_gain = db_to_linear(max_gain_db),
            GainControlMode::AdaptiveDigital => {
                if level_db > Self::SILENCE_DB {
                    let target_db = -(self.config.target_level_dbfs as f32) - Self::CREST_DB;
                    let desired_db = (target_db - level_db).clamp(0.0, max_gain_db);
                    let desired = db_to_linear(desired_db);
                    let coeff = if desired < self.current_gain {
                        self.attack_coeff
                    } else {
                        self.release_coeff
                    };
                    self.current_gain += (desired - self.current_gain) * coeff;
                }
            }
        }

        let mut gain = self.current_gain;
        if self.config.enable_limiter {
            let ceiling = db_to_linear(-(self.config.target_level_dbfs as f32)) * (FULL_SCALE - 1.0);
            let peak = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            if peak * gain > ceiling {
                gain = ceiling / peak;
            }
        }

        for sample in frame.iter_mut() {
            *sample *= gain;
        }
    }
}

pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// RMS of an i16-scale frame in dBFS.
pub fn rms_dbfs(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return -90.0;
    }
    let ms = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
    let rms = ms.sqrt() / FULL_SCALE;
    if rms < 1e-5 {
        -90.0
    } else {
        20.0 * rms.log10()
    }
}

/// Writes a processed frame back to i16 with saturation.
pub fn to_i16(src: &[f32], dst: &mut [i16]) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = sample.clamp(-32768.0, 32767.0) as i16;
    }
}

pub fn to_f32(src: &[i16], dst: &mut [f32]) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = sample as f32;
    }
}
