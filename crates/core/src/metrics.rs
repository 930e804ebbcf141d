//! Echo delay quality metrics.
//!
//! [`DelayStatistics`] watches the echo canceller frame by frame and
//! produces [`DelayMetrics`] snapshots:
//!
//! * the residual misalignment between the configured stream delay and the
//!   delay seen in the signals, from cross-correlating the render and capture
//!   energy envelopes over the last half second;
//! * the fraction of far-end-active frames that are poor: the canceller
//!   achieved less than 3 dB of echo reduction, or the measured delay is off
//!   the configured one by more than the alignment tolerance.
//!
//! Render energies are queued in arrival order and consumed one per capture
//! frame, so bursty delivery keeps both envelopes on the same timeline.

use crate::constants::FRAME_MS;
use crate::echo_cancel::EchoActivity;
use std::collections::VecDeque;

/// Snapshot of echo delay quality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayMetrics {
    /// Median of recent misalignment estimates (positive: the echo arrives
    /// later than the configured delay).
    pub median_ms: i32,
    pub stddev_ms: i32,
    /// `None` when the engine cannot tell, which is not the same as 0.
    pub poor_fraction: Option<f32>,
}

impl DelayMetrics {
    pub const UNAVAILABLE: Self = Self {
        median_ms: -1,
        stddev_ms: -1,
        poor_fraction: None,
    };

    /// `poor_fraction` as a truncated percentage.
    pub fn poor_delays_percent(&self) -> Option<i32> {
        self.poor_fraction.map(|f| (f * 100.0) as i32)
    }
}

impl Default for DelayMetrics {
    fn default() -> Self {
        Self::UNAVAILABLE
    }
}

/// Capture frames correlated per estimate (500ms).
const ENVELOPE_WINDOW: usize = 50;
/// Largest lag searched, in frames (500ms).
const MAX_LAG_FRAMES: usize = 50;
/// Estimates kept for the median (~4s at one estimate per 50ms).
const ESTIMATE_HISTORY: usize = 80;
const ESTIMATE_INTERVAL_FRAMES: u32 = 5;
const MIN_CORRELATION: f32 = 0.5;

/// Far-end-active frames kept for the poor fraction.
const QUALITY_WINDOW: usize = 100;
const MIN_QUALITY_FRAMES: usize = 50;
/// Output/capture energy ratio above which a frame is poor (less than 3 dB ERLE).
const POOR_ERLE_RATIO: f32 = 0.5;
const CAPTURE_ACTIVE_ENERGY: f32 = 1e-6;
/// Measured delay further than this from the configured one marks frames poor.
const ALIGNMENT_TOLERANCE_MS: i32 = 20;
/// Render energies waiting for their capture frame.
const RENDER_BACKLOG: usize = 50;

pub struct DelayStatistics {
    render_envelope: VecDeque<f32>,
    capture_envelope: VecDeque<f32>,
    pending_render: VecDeque<f32>,
    /// Total delay estimates in ms (configured + misalignment).
    estimates: VecDeque<i32>,
    median_estimate: Option<i32>,
    quality: VecDeque<bool>,
    frames_since_estimate: u32,
    configured_delay_ms: i32,
}

impl Default for DelayStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayStatistics {
    pub fn new() -> Self {
        Self {
            render_envelope: VecDeque::with_capacity(ENVELOPE_WINDOW + MAX_LAG_FRAMES),
            capture_envelope: VecDeque::with_capacity(ENVELOPE_WINDOW),
            pending_render: VecDeque::with_capacity(RENDER_BACKLOG),
            estimates: VecDeque::with_capacity(ESTIMATE_HISTORY),
            median_estimate: None,
            quality: VecDeque::with_capacity(QUALITY_WINDOW),
            frames_since_estimate: 0,
            configured_delay_ms: 0,
        }
    }

    pub fn set_configured_delay_ms(&mut self, delay_ms: i32) {
        self.configured_delay_ms = delay_ms;
    }

    /// Queues one far-end frame energy. Each [`on_capture`](Self::on_capture)
    /// consumes the oldest queued energy.
    pub fn on_render(&mut self, energy: f32) {
        push_bounded(&mut self.pending_render, energy, RENDER_BACKLOG);
    }

    pub fn on_capture(&mut self, activity: &EchoActivity) {
        let render_energy = self.pending_render.pop_front().unwrap_or(0.0);
        push_bounded(
            &mut self.render_envelope,
            log_energy(render_energy),
            ENVELOPE_WINDOW + MAX_LAG_FRAMES,
        );
        push_bounded(
            &mut self.capture_envelope,
            log_energy(activity.capture_energy),
            ENVELOPE_WINDOW,
        );

        if activity.far_end_active() && activity.capture_energy > CAPTURE_ACTIVE_ENERGY {
            let low_erle = activity.output_energy > activity.capture_energy * POOR_ERLE_RATIO;
            let misaligned = self
                .median_estimate
                .is_some_and(|m| (m - self.configured_delay_ms).abs() > ALIGNMENT_TOLERANCE_MS);
            push_bounded(&mut self.quality, low_erle || misaligned, QUALITY_WINDOW);
        }

        self.frames_since_estimate += 1;
        if self.frames_since_estimate >= ESTIMATE_INTERVAL_FRAMES {
            self.frames_since_estimate = 0;
            if let Some(lag) = self.estimate_lag() {
                push_bounded(&mut self.estimates, lag as i32 * FRAME_MS, ESTIMATE_HISTORY);
                self.median_estimate = median(&self.estimates);
            }
        }
    }

    pub fn metrics(&self) -> DelayMetrics {
        if self.quality.len() < MIN_QUALITY_FRAMES {
            return DelayMetrics::UNAVAILABLE;
        }
        let poor = self.quality.iter().filter(|&&p| p).count();
        let poor_fraction = poor as f32 / self.quality.len() as f32;

        let (median_ms, stddev_ms) = match self.median_estimate {
            None => (0, 0),
            Some(median) => {
                let count = self.estimates.len() as f32;
                let mean = self.estimates.iter().map(|&v| v as f32).sum::<f32>() / count;
                let var = self
                    .estimates
                    .iter()
                    .map(|&v| (v as f32 - mean).powi(2))
                    .sum::<f32>()
                    / count;
                (median - self.configured_delay_ms, var.sqrt().round() as i32)
            }
        };

        DelayMetrics {
            median_ms,
            stddev_ms,
            poor_fraction: Some(poor_fraction),
        }
    }

    pub fn reset(&mut self) {
        self.render_envelope.clear();
        self.capture_envelope.clear();
        self.estimates.clear();
        self.median_estimate = None;
        self.quality.clear();
        self.pending_render.clear();
        self.frames_since_estimate = 0;
    }

    /// Lag in frames between the render and capture envelopes with the
    /// strongest normalized correlation, if it is convincing.
    fn estimate_lag(&self) -> Option<usize> {
        if self.capture_envelope.len() < ENVELOPE_WINDOW
            || self.render_envelope.len() < ENVELOPE_WINDOW + MAX_LAG_FRAMES
        {
            return None;
        }

        let capture: Vec<f32> = centered(self.capture_envelope.iter().copied());
        let capture_norm = norm(&capture);
        if capture_norm < 1e-3 {
            return None;
        }

        // render_envelope[newest - lag - k] lines up with capture[newest - k].
        let newest = self.render_envelope.len() - 1;
        let mut best: Option<(usize, f32)> = None;
        for lag in 0..=MAX_LAG_FRAMES {
            let start = newest + 1 - ENVELOPE_WINDOW - lag;
            let render = centered(self.render_envelope.range(start..start + ENVELOPE_WINDOW).copied());
            let render_norm = norm(&render);
            if render_norm < 1e-3 {
                continue;
            }
            let dot: f32 = capture.iter().zip(&render).map(|(c, r)| c * r).sum();
            let corr = dot / (capture_norm * render_norm);
            if best.map_or(true, |(_, b)| corr > b) {
                best = Some((lag, corr));
            }
        }

        best.filter(|&(_, corr)| corr >= MIN_CORRELATION).map(|(lag, _)| lag)
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, cap: usize) {
    if queue.len() == cap {
        queue.pop_front();
    }
    queue.push_back(value);
}

fn median(values: &VecDeque<i32>) -> Option<i32> {
    let mut sorted: Vec<i32> = values.iter().copied().collect();
    sorted.sort_unstable();
    sorted.get(sorted.len() / 2).copied()
}

fn log_energy(energy: f32) -> f32 {
    (energy + 1e-10).log10()
}

fn centered(values: impl Iterator<Item = f32>) -> Vec<f32> {
    let v: Vec<f32> = values.collect();
    let mean = v.iter().sum::<f32>() / v.len().max(1) as f32;
    v.into_iter().map(|x| x - mean).collect()
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(render: f32, capture: f32, output: f32) -> EchoActivity {
        EchoActivity {
            render_energy: render,
            capture_energy: capture,
            output_energy: output,
        }
    }

    /// Pseudo-random on/off far-end envelope so the correlation has one clear peak.
    fn talk_pattern(frame: usize) -> f32 {
        let x = (frame as u32).wrapping_mul(2654435761) >> 28;
        if x % 3 == 0 {
            1e-2
        } else {
            1e-4
        }
    }

    #[test]
    fn test_unavailable_without_far_end() {
        let mut stats = DelayStatistics::new();
        for _ in 0..500 {
            stats.on_capture(&activity(0.0, 1e-3, 1e-3));
        }
        let metrics = stats.metrics();
        assert_eq!(metrics.poor_fraction, None);
        assert_eq!(metrics.poor_delays_percent(), None);
    }

    #[test]
    fn test_poor_fraction_counts_low_erle_frames() {
        let mut stats = DelayStatistics::new();
        for i in 0..100 {
            let output = if i % 4 == 0 { 1e-4 } else { 1e-3 };
            stats.on_capture(&activity(1e-3, 1e-3, output));
        }
        let fraction = stats.metrics().poor_fraction.unwrap();
        assert!((fraction - 0.75).abs() < 1e-6, "fraction={}", fraction);
    }

    #[test]
    fn test_lag_estimate_relative_to_configured_delay() {
        let mut stats = DelayStatistics::new();
        stats.set_configured_delay_ms(40);
        let echo_lag = 12;
        for frame in 0..400 {
            stats.on_render(talk_pattern(frame));
            let echoed = if frame >= echo_lag {
                talk_pattern(frame - echo_lag)
            } else {
                1e-4
            };
            stats.on_capture(&activity(1e-3, echoed, echoed));
        }
        let metrics = stats.metrics();
        assert_eq!(metrics.poor_fraction, Some(1.0));
        assert_eq!(metrics.median_ms, 120 - 40);
        assert_eq!(metrics.stddev_ms, 0);
    }

    #[test]
    fn test_lag_estimate_survives_paired_render_delivery() {
        let mut stats = DelayStatistics::new();
        stats.set_configured_delay_ms(40);
        let echo_lag = 12;
        for pair in 0..200 {
            stats.on_render(talk_pattern(2 * pair));
            stats.on_render(talk_pattern(2 * pair + 1));
            for frame in [2 * pair, 2 * pair + 1] {
                let echoed = if frame >= echo_lag {
                    talk_pattern(frame - echo_lag)
                } else {
                    1e-4
                };
                stats.on_capture(&activity(1e-3, echoed, echoed));
            }
        }
        let metrics = stats.metrics();
        assert_eq!(metrics.median_ms, 120 - 40);
        assert_eq!(metrics.stddev_ms, 0);
    }

    #[test]
    fn test_misaligned_frames_are_poor_despite_good_erle() {
        let echo_lag = 12;
        let run = |configured_ms: i32| {
            let mut stats = DelayStatistics::new();
            stats.set_configured_delay_ms(configured_ms);
            for frame in 0..400 {
                stats.on_render(talk_pattern(frame));
                let echoed = if frame >= echo_lag {
                    talk_pattern(frame - echo_lag)
                } else {
                    1e-4
                };
                // 10 dB of cancellation on every frame.
                stats.on_capture(&activity(1e-3, echoed, echoed * 0.1));
            }
            stats.metrics()
        };

        let misaligned = run(40);
        assert_eq!(misaligned.median_ms, 80);
        assert_eq!(misaligned.poor_fraction, Some(1.0));

        let aligned = run(120);
        assert_eq!(aligned.median_ms, 0);
        assert_eq!(aligned.poor_fraction, Some(0.0));
    }

    #[test]
    fn test_render_backlog_is_bounded() {
        let mut stats = DelayStatistics::new();
        for _ in 0..500 {
            stats.on_render(1e-2);
        }
        assert_eq!(stats.pending_render.len(), RENDER_BACKLOG);
    }

    #[test]
    fn test_reset_makes_metrics_unavailable() {
        let mut stats = DelayStatistics::new();
        for _ in 0..100 {
            stats.on_capture(&activity(1e-3, 1e-3, 1e-3));
        }
        assert!(stats.metrics().poor_fraction.is_some());
        stats.reset();
        assert_eq!(stats.metrics(), DelayMetrics::UNAVAILABLE);
    }
}
