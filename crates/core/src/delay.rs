//! Slow feedback loop on the echo canceller's stream delay.
//!
//! Acts only on persistent, strong evidence of misalignment (more than 90%
//! poor frames), moves at most 48ms per step and keeps the delay within a
//! plausible acoustic round trip.

use crate::constants::{MAX_DELAY_STEP_MS, MAX_STREAM_DELAY_MS};
use crate::metrics::DelayMetrics;

const POOR_DELAYS_THRESHOLD_PERCENT: i32 = 90;

/// What a call to [`DelayController::adjust`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayAdjustment {
    /// The engine has no delay statistics right now.
    Unavailable,
    /// Same median and poor percentage as last time; nothing logged.
    Repeated,
    /// New observation, delay left as is (including a step that would land
    /// on the current delay).
    Held,
    Moved { from: i32, to: i32 },
}

pub struct DelayController {
    last_median: i32,
    last_poor_delays: i32,
}

impl Default for DelayController {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayController {
    pub fn new() -> Self {
        Self {
            last_median: 0,
            last_poor_delays: 0,
        }
    }

    /// Call once per processed buffer, never per sample.
    pub fn adjust(&mut self, metrics: &DelayMetrics, current_delay_ms: i32) -> DelayAdjustment {
        // NaN fails the comparison and counts as unavailable.
        let poor_delays = match metrics.poor_fraction {
            Some(fraction) if fraction >= 0.0 => (fraction * 100.0) as i32,
            _ => return DelayAdjustment::Unavailable,
        };
        if metrics.median_ms == self.last_median && poor_delays == self.last_poor_delays {
            return DelayAdjustment::Repeated;
        }

        log::debug!(
            "Stream delay metrics: median={} std={} poor_delays={}%",
            metrics.median_ms,
            metrics.stddev_ms,
            poor_delays
        );
        self.last_median = metrics.median_ms;
        self.last_poor_delays = poor_delays;

        if poor_delays > POOR_DELAYS_THRESHOLD_PERCENT
            && (-MAX_STREAM_DELAY_MS..=MAX_STREAM_DELAY_MS).contains(&metrics.median_ms)
        {
            let to = next_delay(current_delay_ms, metrics.median_ms);
            if to == current_delay_ms {
                return DelayAdjustment::Held;
            }
            log::debug!("set stream_delay={}", to);
            return DelayAdjustment::Moved {
                from: current_delay_ms,
                to,
            };
        }
        DelayAdjustment::Held
    }
}

/// One bounded step of the delay toward the measured misalignment.
pub fn next_delay(current_delay_ms: i32, median_ms: i32) -> i32 {
    let delta = median_ms.clamp(-MAX_DELAY_STEP_MS, MAX_DELAY_STEP_MS);
    current_delay_ms
        .saturating_add(delta)
        .clamp(0, MAX_STREAM_DELAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(median_ms: i32, poor_fraction: Option<f32>) -> DelayMetrics {
        DelayMetrics {
            median_ms,
            stddev_ms: 4,
            poor_fraction,
        }
    }

    #[test]
    fn test_low_poor_fraction_holds_delay() {
        for median in [-400, -384, -20, 0, 20, 384, 1000] {
            let mut controller = DelayController::new();
            let result = controller.adjust(&metrics(median, Some(0.5)), 100);
            assert!(
                matches!(result, DelayAdjustment::Held | DelayAdjustment::Repeated),
                "median={} gave {:?}",
                median,
                result
            );
        }
    }

    #[test]
    fn test_small_misalignment_moves_by_median() {
        let mut controller = DelayController::new();
        assert_eq!(
            controller.adjust(&metrics(20, Some(0.95)), 100),
            DelayAdjustment::Moved { from: 100, to: 120 }
        );
    }

    #[test]
    fn test_out_of_range_median_is_ignored() {
        let mut controller = DelayController::new();
        assert_eq!(
            controller.adjust(&metrics(500, Some(0.95)), 100),
            DelayAdjustment::Held
        );
        assert_eq!(
            controller.adjust(&metrics(-385, Some(0.99)), 100),
            DelayAdjustment::Held
        );
    }

    #[test]
    fn test_step_is_clamped() {
        let mut controller = DelayController::new();
        assert_eq!(
            controller.adjust(&metrics(300, Some(0.95)), 100),
            DelayAdjustment::Moved { from: 100, to: 148 }
        );
        assert_eq!(
            controller.adjust(&metrics(-300, Some(0.95)), 100),
            DelayAdjustment::Moved { from: 100, to: 52 }
        );
    }

    #[test]
    fn test_delay_stays_in_range() {
        assert_eq!(next_delay(370, 48), 384);
        assert_eq!(next_delay(10, -48), 0);
        assert_eq!(next_delay(384, 384), 384);
        assert_eq!(next_delay(0, -384), 0);
    }

    #[test]
    fn test_unavailable_never_acts() {
        let mut controller = DelayController::new();
        for _ in 0..3 {
            assert_eq!(
                controller.adjust(&DelayMetrics::UNAVAILABLE, 100),
                DelayAdjustment::Unavailable
            );
        }
        assert_eq!(
            controller.adjust(&metrics(20, Some(-1.0)), 100),
            DelayAdjustment::Unavailable
        );
    }

    #[test]
    fn test_small_negative_or_nan_fraction_is_unavailable() {
        let mut controller = DelayController::new();
        for poor in [-0.005, -0.5, f32::NAN] {
            assert_eq!(
                controller.adjust(&metrics(20, Some(poor)), 100),
                DelayAdjustment::Unavailable,
                "poor_fraction={}",
                poor
            );
        }
        // Nothing was recorded, so a real observation still acts.
        assert_eq!(
            controller.adjust(&metrics(20, Some(0.95)), 100),
            DelayAdjustment::Moved { from: 100, to: 120 }
        );
    }

    #[test]
    fn test_step_onto_current_delay_is_held() {
        let mut controller = DelayController::new();
        assert_eq!(
            controller.adjust(&metrics(0, Some(0.95)), 100),
            DelayAdjustment::Held
        );
        assert_eq!(
            controller.adjust(&metrics(20, Some(0.96)), MAX_STREAM_DELAY_MS),
            DelayAdjustment::Held
        );
        assert_eq!(
            controller.adjust(&metrics(-30, Some(0.97)), 0),
            DelayAdjustment::Held
        );
    }

    #[test]
    fn test_repeated_observation_is_skipped() {
        let mut controller = DelayController::new();
        let observed = metrics(20, Some(0.95));
        assert!(matches!(
            controller.adjust(&observed, 100),
            DelayAdjustment::Moved { .. }
        ));
        assert_eq!(controller.adjust(&observed, 120), DelayAdjustment::Repeated);

        // Either value changing counts as a new observation.
        assert!(matches!(
            controller.adjust(&metrics(20, Some(0.97)), 120),
            DelayAdjustment::Moved { from: 120, to: 140 }
        ));
    }

    #[test]
    fn test_first_zero_observation_matches_initial_state() {
        let mut controller = DelayController::new();
        assert_eq!(
            controller.adjust(&metrics(0, Some(0.0)), 50),
            DelayAdjustment::Repeated
        );
    }

    #[test]
    fn test_converges_without_oscillating() {
        // The echo sits at 200ms; each step re-measures against the new delay.
        let true_delay = 200;
        let mut delay = 0;
        let mut controller = DelayController::new();
        let mut history = vec![delay];
        for step in 0..20 {
            let residual = true_delay - delay;
            let poor = if residual == 0 { 0.1 } else { 0.95 + step as f32 * 0.001 };
            if let DelayAdjustment::Moved { to, .. } =
                controller.adjust(&metrics(residual, Some(poor)), delay)
            {
                delay = to;
            }
            history.push(delay);
        }
        assert_eq!(delay, true_delay);
        assert!(history.windows(2).all(|w| w[1] >= w[0]), "{:?}", history);
    }
}
