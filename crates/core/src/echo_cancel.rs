//! Echo cancellation stage.
//!
//! Uses the aec3 crate (Rust port of WebRTC AEC3). Reverse-stream frames are
//! queued in arrival order and capture frames walk that queue one frame at a
//! time, so the canceller is fed the far-end frame that lines up with the
//! configured stream delay even when both streams arrive in bursts.

use crate::constants::{FRAME_MS, FRAME_SIZE, MAX_RENDER_DELAY_MS, SAMPLE_RATE};
use crate::error::{ConfigError, EngineError};
use aec3::voip::VoipAec3;
use std::collections::VecDeque;

const MAX_DELAY_FRAMES: u64 = (MAX_RENDER_DELAY_MS / FRAME_MS) as u64;
/// How far the render stream may run ahead of capture before the capture
/// position is pulled forward.
const RENDER_BACKLOG_FRAMES: u64 = 50;
const RENDER_HISTORY_FRAMES: usize = (MAX_DELAY_FRAMES + RENDER_BACKLOG_FRAMES) as usize + 1;

/// Mean-square level (normalized scale) above which the far end counts as active.
pub const RENDER_ACTIVE_ENERGY: f32 = 1e-5;

// Mobile mode residual suppression: -12 dB once the canceller has already
// removed more than 6 dB during far-end single talk.
const RESIDUAL_ERLE_RATIO: f32 = 0.25;
const RESIDUAL_ATTENUATION: f32 = 0.25;

const I16_SCALE: f32 = 32768.0;

/// Energies observed while cancelling one frame. Feeds the delay statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EchoActivity {
    /// Mean square of the render frame used for this capture frame (0 if none).
    pub render_energy: f32,
    /// Mean square of the capture frame before cancellation.
    pub capture_energy: f32,
    /// Mean square of the capture frame after cancellation.
    pub output_energy: f32,
}

impl EchoActivity {
    pub fn far_end_active(&self) -> bool {
        self.render_energy > RENDER_ACTIVE_ENERGY
    }
}

/// Echo canceller wrapper
pub struct EchoCanceller {
    aec: VoipAec3,
    mobile_mode: bool,
    render_history: VecDeque<[f32; FRAME_SIZE]>,
    /// Serial of the next render frame to arrive.
    render_serial: u64,
    /// Render serial that lines up with the next capture frame at zero delay.
    capture_pos: u64,
    last_served: Option<u64>,
    delay_frames: usize,
    capture: [f32; FRAME_SIZE],
    output: [f32; FRAME_SIZE], // Pre-allocated to avoid heap allocation
}

impl EchoCanceller {
    pub fn new(mobile_mode: bool) -> Result<Self, ConfigError> {
        let aec = build_aec()?;
        Ok(Self {
            aec,
            mobile_mode,
            render_history: VecDeque::with_capacity(RENDER_HISTORY_FRAMES),
            render_serial: 0,
            capture_pos: 0,
            last_served: None,
            delay_frames: 0,
            capture: [0.0; FRAME_SIZE],
            output: [0.0; FRAME_SIZE],
        })
    }

    pub fn set_mobile_mode(&mut self, mobile_mode: bool) {
        self.mobile_mode = mobile_mode;
    }

    /// Sets which render frame lines up with the next capture frame.
    pub fn set_delay_ms(&mut self, delay_ms: i32) {
        let clamped = delay_ms.clamp(0, MAX_RENDER_DELAY_MS);
        self.delay_frames = ((clamped + FRAME_MS / 2) / FRAME_MS) as usize;
    }

    pub fn delay_frames(&self) -> usize {
        self.delay_frames
    }

    /// Stores one far-end frame and returns its mean-square level.
    pub fn push_render(&mut self, frame: &[i16]) -> Result<f32, EngineError> {
        if frame.len() != FRAME_SIZE {
            return Err(EngineError::BadFrameLength {
                expected: FRAME_SIZE,
                actual: frame.len(),
            });
        }
        if self.render_history.len() == RENDER_HISTORY_FRAMES {
            self.render_history.pop_front();
        }
        let mut normalized = [0.0f32; FRAME_SIZE];
        for (dst, &src) in normalized.iter_mut().zip(frame) {
            *dst = src as f32 / I16_SCALE;
        }
        let energy = mean_square(&normalized);
        self.render_history.push_back(normalized);
        self.render_serial += 1;
        Ok(energy)
    }

    /// Cancels echo in a capture frame given in i16 scale.
    ///
    /// On error `frame` is left untouched.
    pub fn process(&mut self, frame: &mut [f32]) -> Result<EchoActivity, EngineError> {
        if frame.len() != FRAME_SIZE {
            return Err(EngineError::BadFrameLength {
                expected: FRAME_SIZE,
                actual: frame.len(),
            });
        }

        for (dst, &src) in self.capture.iter_mut().zip(frame.iter()) {
            *dst = src / I16_SCALE;
        }

        let render = self
            .next_render_index()
            .map(|idx| &self.render_history[idx][..]);

        let render_energy = render.map(mean_square).unwrap_or(0.0);
        let capture_energy = mean_square(&self.capture);

        self.output.fill(0.0);
        // level_change = false (analog level changes are not tracked here)
        self.aec
            .process(&self.capture, render, false, &mut self.output)
            .map_err(|e| EngineError::EchoCanceller(format!("{:?}", e)))?;

        let mut output_energy = mean_square(&self.output);
        if self.mobile_mode
            && render_energy > RENDER_ACTIVE_ENERGY
            && output_energy < capture_energy * RESIDUAL_ERLE_RATIO
        {
            for sample in self.output.iter_mut() {
                *sample *= RESIDUAL_ATTENUATION;
            }
            output_energy *= RESIDUAL_ATTENUATION * RESIDUAL_ATTENUATION;
        }

        for (dst, &src) in frame.iter_mut().zip(self.output.iter()) {
            *dst = src * I16_SCALE;
        }

        Ok(EchoActivity {
            render_energy,
            capture_energy,
            output_energy,
        })
    }

    /// Resets the echo canceller state and render history.
    pub fn reset(&mut self) -> Result<(), ConfigError> {
        self.aec = build_aec()?;
        self.render_history.clear();
        self.capture_pos = self.render_serial;
        self.last_served = None;
        Ok(())
    }

    /// Advances the capture position by one frame and returns the history
    /// index of the render frame `delay_frames` behind it.
    ///
    /// Served serials only ever increase: after the delay grows, capture
    /// frames go without a reference until the position catches up.
    fn next_render_index(&mut self) -> Option<usize> {
        self.capture_pos = self
            .capture_pos
            .max(self.render_serial.saturating_sub(RENDER_BACKLOG_FRAMES));
        let now = self.capture_pos;
        if now < self.render_serial {
            self.capture_pos += 1;
        }

        let target = now.checked_sub(self.delay_frames as u64)?;
        let oldest = self.render_serial - self.render_history.len() as u64;
        if target < oldest || target >= self.render_serial {
            return None;
        }
        if self.last_served.is_some_and(|served| target <= served) {
            return None;
        }
        self.last_served = Some(target);
        Some((target - oldest) as usize)
    }
}

fn build_aec() -> Result<VoipAec3, ConfigError> {
    VoipAec3::builder(SAMPLE_RATE as usize, 1, 1)
        .build()
        .map_err(|e| ConfigError::EchoCanceller(format!("{:?}", e)))
}

pub(crate) fn mean_square(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
}
