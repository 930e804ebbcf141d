//! Manual linear gain applied after the engine.
//!
//! Manual gain and the engine's adaptive gain are kept from fighting by
//! convention: the engine AGC always stays at its baseline setting and the
//! manual factor rides on top of its output.

/// Who sets the user-facing loudness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GainMode {
    #[default]
    Adaptive,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainConfig {
    pub mode: GainMode,
    pub compression_db: i32,
    /// `10^(compression_db / 20)` in manual mode, exactly 1.0 otherwise.
    pub manual_factor: f32,
}

impl GainConfig {
    pub fn adaptive(compression_db: i32) -> Self {
        Self {
            mode: GainMode::Adaptive,
            compression_db,
            manual_factor: 1.0,
        }
    }

    pub fn manual(compression_db: i32) -> Self {
        Self {
            mode: GainMode::Manual,
            compression_db,
            manual_factor: db_to_factor(compression_db),
        }
    }
}

pub fn db_to_factor(db: i32) -> f32 {
    10.0f32.powf(db as f32 / 20.0)
}

pub struct GainPostProcessor {
    config: GainConfig,
}

impl GainPostProcessor {
    pub fn new(compression_db: i32) -> Self {
        Self {
            config: GainConfig::adaptive(compression_db),
        }
    }

    pub fn set_gain(&mut self, db: i32, manual: bool) {
        self.config = if manual {
            GainConfig::manual(db)
        } else {
            GainConfig::adaptive(db)
        };
    }

    pub fn config(&self) -> GainConfig {
        self.config
    }

    pub fn factor(&self) -> f32 {
        self.config.manual_factor
    }

    /// Scales the frame in place with hard clipping to the i16 range.
    pub fn apply(&self, frame: &mut [i16]) {
        let factor = self.config.manual_factor;
        if factor == 1.0 {
            return;
        }
        for sample in frame.iter_mut() {
            let scaled = *sample as f32 * factor;
            *sample = scaled.clamp(-32768.0, 32767.0) as i16;
        }
    }
}
