use super::{check_frame, ProcessingEngine};
use crate::config::EngineConfig;
use crate::constants::{FRAME_SIZE, MAX_RENDER_DELAY_MS};
use crate::echo_cancel::EchoCanceller;
use crate::error::{ConfigError, EngineError};
use crate::metrics::DelayMetrics;
use crate::processor::{to_f32, to_i16, DigitalGainController, HighPassFilter, NoiseSuppressor};

/// Reduced engine for constrained targets: no voice detection, no delay
/// statistics and no transient suppression.
pub struct LiteEngine {
    config: EngineConfig,
    high_pass: Option<HighPassFilter>,
    echo: Option<EchoCanceller>,
    noise: Option<NoiseSuppressor>,
    agc: DigitalGainController,
    stream_delay_ms: i32,
    transient_logged: bool,
    work: [f32; FRAME_SIZE],
}

// SAFETY: the echo canceller is owned exclusively and never aliased. The
// engine is moved between threads, never shared (no Sync).
#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for LiteEngine {}

impl LiteEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let mut engine = Self {
            config,
            high_pass: None,
            echo: None,
            noise: None,
            agc: DigitalGainController::new(config.gain_controller),
            stream_delay_ms: 0,
            transient_logged: false,
            work: [0.0; FRAME_SIZE],
        };
        engine.sync_stages()?;
        Ok(engine)
    }

    fn sync_stages(&mut self) -> Result<(), ConfigError> {
        let config = self.config;

        if !config.high_pass_filter.enabled {
            self.high_pass = None;
        } else if self.high_pass.is_none() {
            self.high_pass = Some(HighPassFilter::new()?);
        }

        if !config.echo_canceller.enabled {
            self.echo = None;
        } else if let Some(echo) = &mut self.echo {
            echo.set_mobile_mode(config.echo_canceller.mobile_mode);
        } else {
            let mut echo = EchoCanceller::new(config.echo_canceller.mobile_mode)?;
            echo.set_delay_ms(self.stream_delay_ms);
            self.echo = Some(echo);
        }

        if !config.noise_suppression.enabled {
            self.noise = None;
        } else if let Some(ns) = &mut self.noise {
            ns.set_level(config.noise_suppression.level);
        } else {
            self.noise = Some(NoiseSuppressor::new(config.noise_suppression.level));
        }

        if config.transient_suppression.enabled && !self.transient_logged {
            log::debug!("lite engine: transient suppression not supported, ignoring");
            self.transient_logged = true;
        }

        self.agc.set_config(config.gain_controller);
        Ok(())
    }
}

impl ProcessingEngine for LiteEngine {
    fn name(&self) -> &'static str {
        "lite"
    }

    fn process_forward(&mut self, frame: &mut [i16]) -> Result<(), EngineError> {
        check_frame(frame.len(), FRAME_SIZE)?;
        to_f32(frame, &mut self.work);

        if let Some(hpf) = &mut self.high_pass {
            hpf.process(&mut self.work);
        }
        if let Some(echo) = &mut self.echo {
            echo.process(&mut self.work)?;
        }
        if let Some(ns) = &mut self.noise {
            ns.process(&mut self.work);
        }
        if self.config.gain_controller.enabled {
            self.agc.process(&mut self.work);
        }

        to_i16(&self.work, frame);
        Ok(())
    }

    fn process_reverse(&mut self, frame: &[i16]) -> Result<(), EngineError> {
        check_frame(frame.len(), FRAME_SIZE)?;
        if let Some(echo) = &mut self.echo {
            echo.push_render(frame)?;
        }
        Ok(())
    }

    fn set_stream_delay_ms(&mut self, delay_ms: i32) {
        self.stream_delay_ms = delay_ms.clamp(0, MAX_RENDER_DELAY_MS);
        if let Some(echo) = &mut self.echo {
            echo.set_delay_ms(self.stream_delay_ms);
        }
    }

    fn metrics(&self) -> DelayMetrics {
        DelayMetrics::UNAVAILABLE
    }

    fn set_analog_gain_level(&mut self, level: i32) {
        self.agc.set_applied_level(level);
    }

    fn suggested_analog_gain_level(&self) -> i32 {
        self.agc.suggested_level()
    }

    fn has_voice(&self) -> Option<bool> {
        None
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn apply_config(&mut self, config: EngineConfig) -> Result<(), ConfigError> {
        self.config = config;
        self.sync_stages()
    }
}
