use super::{check_frame, ProcessingEngine};
use crate::config::EngineConfig;
use crate::constants::{FRAME_SIZE, MAX_RENDER_DELAY_MS};
use crate::echo_cancel::EchoCanceller;
use crate::error::{ConfigError, EngineError};
use crate::metrics::{DelayMetrics, DelayStatistics};
use crate::processor::{
    to_f32, to_i16, DigitalGainController, HighPassFilter, NoiseSuppressor, TransientSuppressor,
};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Full engine: high-pass, echo cancellation with delay statistics, noise
/// suppression, transient suppression, gain control and voice detection.
///
/// Stage order follows the usual capture chain: HPF, AEC, NS, TS, AGC.
pub struct StandardEngine {
    config: EngineConfig,
    high_pass: Option<HighPassFilter>,
    echo: Option<EchoCanceller>,
    noise: Option<NoiseSuppressor>,
    transient: TransientSuppressor,
    agc: DigitalGainController,
    vad: Vad,
    voice: bool,
    stats: DelayStatistics,
    stream_delay_ms: i32,
    work: [f32; FRAME_SIZE],
}

// SAFETY: StandardEngine owns its Vad and echo canceller exclusively. They hold
// raw pointers internally (preventing auto-Send) but are never aliased, so
// moving the engine to another thread is sound. It is not Sync.
#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for StandardEngine {}

impl StandardEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let mut engine = Self {
            config,
            high_pass: None,
            echo: None,
            noise: None,
            transient: TransientSuppressor::new(),
            agc: DigitalGainController::new(config.gain_controller),
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate48kHz, VadMode::Aggressive),
            voice: false,
            stats: DelayStatistics::new(),
            stream_delay_ms: 0,
            work: [0.0; FRAME_SIZE],
        };
        engine.sync_stages()?;
        Ok(engine)
    }

    /// Creates or drops stages to match `self.config`.
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
            self.stats.reset();
            self.echo = Some(echo);
        }

        if !config.noise_suppression.enabled {
            self.noise = None;
        } else if let Some(ns) = &mut self.noise {
            ns.set_level(config.noise_suppression.level);
        } else {
            self.noise = Some(NoiseSuppressor::new(config.noise_suppression.level));
        }

        self.agc.set_config(config.gain_controller);
        if !config.voice_detection.enabled {
            self.voice = false;
        }
        Ok(())
    }
}

impl ProcessingEngine for StandardEngine {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn process_forward(&mut self, frame: &mut [i16]) -> Result<(), EngineError> {
        check_frame(frame.len(), FRAME_SIZE)?;
        to_f32(frame, &mut self.work);

        if let Some(hpf) = &mut self.high_pass {
            hpf.process(&mut self.work);
        }

        if let Some(echo) = &mut self.echo {
            let activity = echo.process(&mut self.work)?;
            self.stats.on_capture(&activity);
        }

        let mut voice_probability = 0.0;
        if let Some(ns) = &mut self.noise {
            ns.process(&mut self.work);
            voice_probability = ns.voice_probability();
        }

        if self.config.transient_suppression.enabled {
            self.transient.process(&mut self.work, voice_probability);
        }

        if self.config.gain_controller.enabled {
            self.agc.process(&mut self.work);
        }

        to_i16(&self.work, frame);

        if self.config.voice_detection.enabled {
            self.voice = self.vad.is_voice_segment(frame).unwrap_or(false);
        }
        Ok(())
    }

    fn process_reverse(&mut self, frame: &[i16]) -> Result<(), EngineError> {
        check_frame(frame.len(), FRAME_SIZE)?;
        if let Some(echo) = &mut self.echo {
            let energy = echo.push_render(frame)?;
            self.stats.on_render(energy);
        }
        Ok(())
    }

    fn set_stream_delay_ms(&mut self, delay_ms: i32) {
        let delay_ms = delay_ms.clamp(0, MAX_RENDER_DELAY_MS);
        self.stream_delay_ms = delay_ms;
        self.stats.set_configured_delay_ms(delay_ms);
        if let Some(echo) = &mut self.echo {
            echo.set_delay_ms(delay_ms);
        }
    }

    fn metrics(&self) -> DelayMetrics {
        if self.echo.is_some() {
            self.stats.metrics()
        } else {
            DelayMetrics::UNAVAILABLE
        }
    }

    fn set_analog_gain_level(&mut self, level: i32) {
        self.agc.set_applied_level(level);
    }

    fn suggested_analog_gain_level(&self) -> i32 {
        self.agc.suggested_level()
    }

    fn has_voice(&self) -> Option<bool> {
        self.config.voice_detection.enabled.then_some(self.voice)
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn apply_config(&mut self, config: EngineConfig) -> Result<(), ConfigError> {
        self.config = config;
        self.sync_stages()
    }
}
