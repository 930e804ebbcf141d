//! One voice-processing stream: an engine plus the state around it.
//!
//! A [`Session`] is owned by a single thread at a time. Forward, reverse and
//! control calls must be serialized by the caller; nothing here locks.

use crate::config::{EngineConfig, Profile, SessionConfig};
use crate::delay::{DelayAdjustment, DelayController};
use crate::engine::{create_engine, ProcessingEngine};
use crate::error::{ConfigError, EngineError};
use crate::frame_adapter::FrameAccumulator;
use crate::gain::{GainConfig, GainPostProcessor};
use crate::metrics::DelayMetrics;

pub struct Session {
    engine: Box<dyn ProcessingEngine>,
    gain: GainPostProcessor,
    delay: DelayController,
    stream_delay_ms: i32,
    last_metrics: DelayMetrics,
    forward: FrameAccumulator,
    reverse: FrameAccumulator,
    backup: Vec<i16>,
}

impl Session {
    pub fn create(profile: Profile, initial_delay_ms: i32) -> Result<Self, ConfigError> {
        Self::with_config(SessionConfig::new(profile, initial_delay_ms))
    }

    pub fn with_config(config: SessionConfig) -> Result<Self, ConfigError> {
        config.format.validate()?;
        let engine = create_engine(config.engine, EngineConfig::for_profile(config.profile))?;
        Self::with_engine(config, engine)
    }

    /// Wraps an already built engine. The engine's current configuration is
    /// kept; `config.profile` only shows up in the init log.
    pub fn with_engine(
        config: SessionConfig,
        mut engine: Box<dyn ProcessingEngine>,
    ) -> Result<Self, ConfigError> {
        config.format.validate()?;
        let frame_size = config.format.frame_size();
        engine.set_stream_delay_ms(config.initial_delay_ms);

        let compression_db = engine.config().gain_controller.compression_gain_db;
        log::debug!(
            "Session init: engine={} profile={:?} rate={} channels={} delay={}ms",
            engine.name(),
            config.profile,
            config.format.sample_rate,
            config.format.channels,
            config.initial_delay_ms
        );

        Ok(Self {
            engine,
            gain: GainPostProcessor::new(compression_db),
            delay: DelayController::new(),
            stream_delay_ms: config.initial_delay_ms,
            last_metrics: DelayMetrics::UNAVAILABLE,
            forward: FrameAccumulator::new(frame_size),
            reverse: FrameAccumulator::new(frame_size),
            backup: vec![0; frame_size],
        })
    }

    /// Processes exactly one near-end frame in place.
    ///
    /// On failure the frame is restored to its input and the error returned.
    pub fn process_forward(&mut self, frame: &mut [i16]) -> Result<(), EngineError> {
        run_forward(
            self.engine.as_mut(),
            &self.gain,
            self.stream_delay_ms,
            &mut self.backup,
            frame,
        )
    }

    /// Feeds exactly one far-end frame.
    pub fn process_reverse(&mut self, frame: &[i16]) -> Result<(), EngineError> {
        let result = self.engine.process_reverse(frame);
        if let Err(e) = &result {
            log::warn!("process_reverse failed: {}", e);
        }
        result
    }

    /// Processes a near-end chunk of any length in place. Returns the number
    /// of complete frames that went through the engine.
    pub fn process_chunk(&mut self, chunk: &mut [i16]) -> usize {
        let Self {
            engine,
            gain,
            stream_delay_ms,
            backup,
            forward,
            ..
        } = self;
        let delay = *stream_delay_ms;
        forward.accumulate(chunk, |frame| {
            // Failures are logged inside; the frame is already restored.
            let _ = run_forward(engine.as_mut(), gain, delay, backup, frame);
        })
    }

    /// Feeds a far-end chunk of any length. Returns the number of complete
    /// frames handed to the engine.
    pub fn process_reverse_chunk(&mut self, chunk: &[i16]) -> usize {
        let Self {
            engine, reverse, ..
        } = self;
        reverse.feed(chunk, |frame| {
            if let Err(e) = engine.process_reverse(frame) {
                log::warn!("process_reverse failed: {}", e);
            }
        })
    }

    /// Sets the stream delay used from the next forward frame on. The engine
    /// clamps it to what it can align.
    pub fn set_delay(&mut self, delay_ms: i32) {
        self.stream_delay_ms = delay_ms;
    }

    pub fn stream_delay_ms(&self) -> i32 {
        self.stream_delay_ms
    }

    /// Reads the engine's delay metrics and, if they call for it, moves the
    /// stream delay one bounded step. Call once per processed buffer.
    pub fn adjust_delay(&mut self) -> DelayAdjustment {
        self.last_metrics = self.engine.metrics();
        let adjustment = self.delay.adjust(&self.last_metrics, self.stream_delay_ms);
        if let DelayAdjustment::Moved { to, .. } = adjustment {
            self.stream_delay_ms = to;
        }
        adjustment
    }

    /// Switches between adaptive and manual gain.
    ///
    /// The engine's gain controller goes back to its baseline tuning either
    /// way; only its `enabled` flag is left alone.
    pub fn set_gain(&mut self, db: i32, manual: bool) {
        let mut config = *self.engine.config();
        config.gain_controller.reset_to_baseline(db);
        if let Err(e) = self.engine.apply_config(config) {
            log::warn!("Failed to reset gain controller: {}", e);
        }
        self.gain.set_gain(db, manual);
        log::debug!(
            "set_gain: db={} manual={} factor={}",
            db,
            manual,
            self.gain.factor()
        );
    }

    pub fn gain_config(&self) -> GainConfig {
        self.gain.config()
    }

    pub fn notify_analog_gain_level(&mut self, level: i32) {
        self.engine.set_analog_gain_level(level);
    }

    pub fn suggested_analog_gain_level(&self) -> i32 {
        self.engine.suggested_analog_gain_level()
    }

    pub fn has_voice(&self) -> Option<bool> {
        self.engine.has_voice()
    }

    /// Current engine metrics.
    pub fn metrics(&self) -> DelayMetrics {
        self.engine.metrics()
    }

    /// Metrics seen by the last [`adjust_delay`](Self::adjust_delay).
    pub fn last_metrics(&self) -> DelayMetrics {
        self.last_metrics
    }

    pub fn engine_config(&self) -> EngineConfig {
        *self.engine.config()
    }

    /// Tears the session down, releasing the engine.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::debug!("Session destroyed: engine={}", self.engine.name());
    }
}

/// Forward path shared by single-frame and chunked processing.
fn run_forward(
    engine: &mut dyn ProcessingEngine,
    gain: &GainPostProcessor,
    stream_delay_ms: i32,
    backup: &mut Vec<i16>,
    frame: &mut [i16],
) -> Result<(), EngineError> {
    backup.clear();
    backup.extend_from_slice(frame);

    engine.set_stream_delay_ms(stream_delay_ms);
    match engine.process_forward(frame) {
        Ok(()) => {
            gain.apply(frame);
            Ok(())
        }
        Err(e) => {
            frame.copy_from_slice(backup);
            log::warn!("process_forward failed, passing frame through: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineKind, GainControlMode, StreamFormat};
    use crate::constants::FRAME_SIZE;
    use crate::gain::GainMode;

    /// Scribbles over the frame and then fails, or doubles it on success.
    struct FakeEngine {
        config: EngineConfig,
        fail: bool,
        last_delay: i32,
        metrics: DelayMetrics,
    }

    impl FakeEngine {
        fn boxed(fail: bool) -> Box<dyn ProcessingEngine> {
            Box::new(Self::new(fail))
        }

        fn new(fail: bool) -> Self {
            Self {
                config: EngineConfig::call(),
                fail,
                last_delay: -1,
                metrics: DelayMetrics::UNAVAILABLE,
            }
        }
    }

    impl ProcessingEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn process_forward(&mut self, frame: &mut [i16]) -> Result<(), EngineError> {
            if self.fail {
                frame.fill(0x55);
                return Err(EngineError::EchoCanceller("diverged".into()));
            }
            for s in frame.iter_mut() {
                *s = s.saturating_mul(2);
            }
            Ok(())
        }

        fn process_reverse(&mut self, frame: &[i16]) -> Result<(), EngineError> {
            if frame.len() != FRAME_SIZE {
                return Err(EngineError::BadFrameLength {
                    expected: FRAME_SIZE,
                    actual: frame.len(),
                });
            }
            Ok(())
        }

        fn set_stream_delay_ms(&mut self, delay_ms: i32) {
            self.last_delay = delay_ms;
        }

        fn metrics(&self) -> DelayMetrics {
            self.metrics
        }

        fn set_analog_gain_level(&mut self, _level: i32) {}

        fn suggested_analog_gain_level(&self) -> i32 {
            self.last_delay
        }

        fn has_voice(&self) -> Option<bool> {
            None
        }

        fn config(&self) -> &EngineConfig {
            &self.config
        }

        fn apply_config(&mut self, config: EngineConfig) -> Result<(), ConfigError> {
            self.config = config;
            Ok(())
        }
    }

    fn fake_session(fail: bool) -> Session {
        Session::with_engine(SessionConfig::new(Profile::Call, 40), FakeEngine::boxed(fail)).unwrap()
    }

    // ── Construction ──

    #[test]
    fn test_create_both_profiles() {
        let call = Session::create(Profile::Call, 60).unwrap();
        assert!(call.engine_config().echo_canceller.enabled);
        assert_eq!(call.stream_delay_ms(), 60);

        let message = Session::create(Profile::Message, 0).unwrap();
        assert!(!message.engine_config().gain_controller.enabled);
        assert_eq!(message.has_voice(), None);
    }

    #[test]
    fn test_rejects_unsupported_format() {
        let stereo = SessionConfig::new(Profile::Call, 0).with_format(StreamFormat {
            sample_rate: 48000,
            channels: 2,
        });
        assert!(matches!(
            Session::with_config(stereo),
            Err(ConfigError::UnsupportedChannels(2))
        ));

        let rate = SessionConfig::new(Profile::Call, 0).with_format(StreamFormat {
            sample_rate: 44100,
            channels: 1,
        });
        assert!(matches!(
            Session::with_config(rate),
            Err(ConfigError::UnsupportedSampleRate(44100))
        ));
    }

    #[test]
    fn test_voice_detection_depends_on_engine() {
        let standard = Session::create(Profile::Call, 0).unwrap();
        assert!(standard.has_voice().is_some());

        let lite =
            Session::with_config(SessionConfig::new(Profile::Call, 0).with_engine(EngineKind::Lite))
                .unwrap();
        assert_eq!(lite.has_voice(), None);
    }

    // ── Forward path ──

    #[test]
    fn test_failed_frame_passes_through() {
        let mut session = fake_session(true);
        session.set_gain(20, true);
        let input: Vec<i16> = (0..FRAME_SIZE as i16).collect();
        let mut frame = input.clone();
        assert_eq!(session.process_forward(&mut frame), Err(EngineError::EchoCanceller("diverged".into())));
        assert_eq!(frame, input);
    }

    #[test]
    fn test_gain_applied_after_engine() {
        let mut session = fake_session(false);
        session.set_gain(20, true);
        let mut frame = vec![100i16; FRAME_SIZE];
        session.process_forward(&mut frame).unwrap();
        // Engine doubles, then manual gain of 10x.
        assert!(frame.iter().all(|&s| (s - 2000).abs() <= 1));
    }

    #[test]
    fn test_stream_delay_passed_each_frame() {
        // The fake engine reports its last stream delay as the analog suggestion.
        let mut session = fake_session(false);
        assert_eq!(session.suggested_analog_gain_level(), 40);
        session.set_delay(120);
        assert_eq!(session.suggested_analog_gain_level(), 40);
        let mut frame = vec![0i16; FRAME_SIZE];
        session.process_forward(&mut frame).unwrap();
        assert_eq!(session.suggested_analog_gain_level(), 120);
        assert_eq!(session.stream_delay_ms(), 120);
    }

    #[test]
    fn test_chunked_processing_keeps_leftover() {
        let mut session = fake_session(false);
        let mut first = vec![10i16; 700];
        assert_eq!(session.process_chunk(&mut first), 1);
        assert!(first[..480].iter().all(|&s| s == 20));
        assert!(first[480..].iter().all(|&s| s == 10));

        let mut second = vec![10i16; 260];
        assert_eq!(session.process_chunk(&mut second), 1);
        assert!(second.iter().all(|&s| s == 20));
    }

    #[test]
    fn test_chunked_failure_restores_frames() {
        let mut session = fake_session(true);
        let input: Vec<i16> = (0..1000).map(|i| (i % 300) as i16).collect();
        let mut chunk = input.clone();
        assert_eq!(session.process_chunk(&mut chunk), 2);
        assert_eq!(chunk, input);
    }

    #[test]
    fn test_reverse_chunk_counts_frames() {
        let mut session = fake_session(false);
        assert_eq!(session.process_reverse_chunk(&[0i16; 300]), 0);
        assert_eq!(session.process_reverse_chunk(&[0i16; 700]), 2);
        assert!(session.process_reverse(&[0i16; 12]).is_err());
    }

    #[test]
    fn test_real_engine_processes_chunks() {
        let mut session = Session::create(Profile::Call, 40).unwrap();
        let mut near = vec![0i16; 2048];
        let far = vec![0i16; 2048];
        for _ in 0..10 {
            session.process_reverse_chunk(&far);
            session.process_chunk(&mut near);
            session.adjust_delay();
        }
        assert_eq!(near.len(), 2048);
    }

    // ── Delay control ──

    #[test]
    fn test_adjust_delay_moves_stream_delay() {
        let mut engine = FakeEngine::new(false);
        engine.metrics = DelayMetrics {
            median_ms: 30,
            stddev_ms: 2,
            poor_fraction: Some(0.95),
        };
        let mut session =
            Session::with_engine(SessionConfig::new(Profile::Call, 100), Box::new(engine)).unwrap();
        assert_eq!(
            session.adjust_delay(),
            DelayAdjustment::Moved { from: 100, to: 130 }
        );
        assert_eq!(session.stream_delay_ms(), 130);
        assert_eq!(session.last_metrics().median_ms, 30);

        // Same observation again is ignored.
        assert_eq!(session.adjust_delay(), DelayAdjustment::Repeated);
        assert_eq!(session.stream_delay_ms(), 130);
    }

    #[test]
    fn test_adjust_delay_without_metrics_is_noop() {
        let mut session = fake_session(false);
        assert_eq!(session.adjust_delay(), DelayAdjustment::Unavailable);
        assert_eq!(session.stream_delay_ms(), 40);
    }

    // ── Gain ──

    #[test]
    fn test_set_gain_resets_agc_to_baseline_both_ways() {
        let mut session = Session::create(Profile::Call, 0).unwrap();

        session.set_gain(12, true);
        let agc = session.engine_config().gain_controller;
        assert!(agc.enabled);
        assert_eq!(agc.mode, GainControlMode::AdaptiveDigital);
        assert_eq!(agc.target_level_dbfs, 3);
        assert_eq!(agc.compression_gain_db, 12);
        assert!(agc.enable_limiter);
        assert_eq!(session.gain_config().mode, GainMode::Manual);

        session.set_gain(6, false);
        let agc = session.engine_config().gain_controller;
        assert!(agc.is_baseline());
        assert_eq!(agc.compression_gain_db, 6);
        assert_eq!(session.gain_config().manual_factor, 1.0);
    }

    #[test]
    fn test_set_gain_keeps_agc_disabled_for_messages() {
        let mut session = Session::create(Profile::Message, 0).unwrap();
        session.set_gain(9, true);
        assert!(!session.engine_config().gain_controller.enabled);
        assert!(session.gain_config().manual_factor > 2.8);
    }

    #[test]
    fn test_analog_level_round_trip() {
        let mut session = Session::create(Profile::Call, 0).unwrap();
        session.notify_analog_gain_level(128);
        assert_eq!(session.suggested_analog_gain_level(), 128);
    }

    #[test]
    fn test_destroy() {
        let session = Session::create(Profile::Message, 0).unwrap();
        session.destroy();
    }
}
