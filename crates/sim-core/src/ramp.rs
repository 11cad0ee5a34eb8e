use serde::Serialize;
use std::time::Duration;

use crate::config::RampConfig;
use crate::error::{Result, SimError};

/// One segment of the offered-load schedule.
///
/// Within the segment the rate moves exponentially from `start_rps` to
/// `end_rps`: `rate(t) = start * (end / start) ^ (t / duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatePhase {
    pub start_rps: f64,
    pub end_rps: f64,
    pub duration: Duration,
}

impl RatePhase {
    pub fn exponential(start_rps: f64, end_rps: f64, duration: Duration) -> Self {
        Self {
            start_rps,
            end_rps,
            duration,
        }
    }

    pub fn constant(rps: f64, duration: Duration) -> Self {
        Self::exponential(rps, rps, duration)
    }

    /// Instantaneous target rate `elapsed` into this phase. Clamped to the
    /// phase bounds.
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        if self.start_rps == self.end_rps || self.duration.is_zero() {
            return self.start_rps;
        }
        let progress = (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0);
        self.start_rps * (self.end_rps / self.start_rps).powf(progress)
    }

    pub(crate) fn validate(&self, idx: usize) -> Result<()> {
        for (name, rps) in [("start_rps", self.start_rps), ("end_rps", self.end_rps)] {
            if !rps.is_finite() || rps <= 0.0 {
                return Err(SimError::config(format!(
                    "phase {idx}: {name} must be a positive number, got {rps}"
                )));
            }
        }
        if self.duration.is_zero() {
            return Err(SimError::config(format!(
                "phase {idx}: duration must be non-zero"
            )));
        }
        Ok(())
    }
}

/// Ordered phase schedule. Phases are applied strictly in order.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    phases: Vec<RatePhase>,
}

impl RampPlanner {
    pub fn new(phases: Vec<RatePhase>) -> Self {
        Self { phases }
    }

    pub fn from_config(config: &RampConfig) -> Self {
        Self::new(config.phases.iter().map(|p| p.to_phase()).collect())
    }

    pub fn phases(&self) -> &[RatePhase] {
        &self.phases
    }

    /// Length of one pass over every phase.
    pub fn total_duration(&self) -> Duration {
        self.phases.iter().map(|p| p.duration).sum()
    }

    /// Locate the phase active `elapsed` into a single pass, with the offset
    /// into that phase.
    pub fn phase_at(&self, elapsed: Duration) -> Option<(usize, &RatePhase, Duration)> {
        let mut phase_start = Duration::ZERO;
        for (idx, phase) in self.phases.iter().enumerate() {
            if elapsed < phase_start + phase.duration {
                return Some((idx, phase, elapsed - phase_start));
            }
            phase_start += phase.duration;
        }
        None
    }

    /// Target rate `elapsed` into a single pass.
    pub fn current_rps(&self, elapsed: Duration) -> Option<f64> {
        self.phase_at(elapsed)
            .map(|(_, phase, offset)| phase.rate_at(offset))
    }

    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(SimError::config("at least one rate phase is required"));
        }
        self.phases
            .iter()
            .enumerate()
            .try_for_each(|(idx, phase)| phase.validate(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_rate_endpoints() {
        let phase = RatePhase::exponential(100.0, 400.0, secs(60));
        assert!((phase.rate_at(Duration::ZERO) - 100.0).abs() < 1e-9);
        assert!((phase.rate_at(secs(60)) - 400.0).abs() < 1e-9);
        // Geometric midpoint.
        assert!((phase.rate_at(secs(30)) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_is_continuous_and_monotonic_within_phase() {
        let phase = RatePhase::exponential(200.0, 50.0, secs(10));
        let mut prev = phase.rate_at(Duration::ZERO);
        for ms in (10..=10_000).step_by(10) {
            let rate = phase.rate_at(Duration::from_millis(ms));
            assert!(rate <= prev);
            assert!(prev - rate < 1.0, "jump of {} at {}ms", prev - rate, ms);
            prev = rate;
        }
    }

    #[test]
    fn test_rate_clamps_past_phase_end() {
        let phase = RatePhase::exponential(10.0, 20.0, secs(1));
        assert!((phase.rate_at(secs(5)) - 20.0).abs() < 1e-9);
        assert_eq!(RatePhase::constant(7.0, secs(1)).rate_at(secs(3)), 7.0);
    }

    #[test]
    fn test_ramp_planner_total_duration() {
        let planner = RampPlanner::new(vec![
            RatePhase::constant(1000.0, Duration::from_millis(5000)),
            RatePhase::constant(2000.0, Duration::from_millis(10000)),
        ]);
        assert_eq!(planner.total_duration(), Duration::from_millis(15000));
    }

    #[test]
    fn test_current_rps_with_discontinuity() {
        let planner = RampPlanner::new(vec![
            RatePhase::exponential(100.0, 200.0, secs(5)),
            RatePhase::exponential(50.0, 50.0, secs(10)),
        ]);
        assert_eq!(planner.current_rps(Duration::ZERO), Some(100.0));
        assert!(planner.current_rps(Duration::from_millis(4999)).unwrap() > 199.0);
        assert_eq!(planner.current_rps(secs(5)), Some(50.0));
        assert_eq!(planner.current_rps(Duration::from_millis(14999)), Some(50.0));
        assert_eq!(planner.current_rps(secs(15)), None);

        let (idx, _, offset) = planner.phase_at(secs(7)).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(offset, secs(2));
    }

    #[test]
    fn test_validate_rejects_bad_phases() {
        assert!(RampPlanner::new(vec![]).validate().is_err());
        assert!(RampPlanner::new(vec![RatePhase::constant(0.0, secs(1))])
            .validate()
            .is_err());
        assert!(RampPlanner::new(vec![RatePhase::constant(5.0, Duration::ZERO)])
            .validate()
            .is_err());
        assert!(
            RampPlanner::new(vec![RatePhase::exponential(5.0, f64::NAN, secs(1))])
                .validate()
                .is_err()
        );
        assert!(RampPlanner::new(vec![RatePhase::constant(5.0, secs(1))])
            .validate()
            .is_ok());
    }
}
