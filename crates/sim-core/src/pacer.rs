use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How inter-arrival gaps are drawn for a given instantaneous rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrivalProcess {
    /// Evenly spaced arrivals, `1 / rate` apart.
    #[default]
    Uniform,
    /// Exponentially distributed gaps with mean `1 / rate`.
    Poisson,
}

/// Computes the wait before the next call from the current target rate.
///
/// The rate is re-evaluated on every call so the pacer follows a ramp
/// without being rebuilt.
pub struct ArrivalPacer {
    process: ArrivalProcess,
    rng: StdRng,
}

impl ArrivalPacer {
    pub fn new(process: ArrivalProcess, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { process, rng }
    }

    /// Gap until the next arrival at `rate` requests per second, never
    /// shorter than 1ns. A non-positive rate yields `Duration::MAX`.
    pub fn next_interval(&mut self, rate: f64) -> Duration {
        if rate.is_nan() || rate <= 0.0 {
            return Duration::MAX;
        }
        let secs = match self.process {
            ArrivalProcess::Uniform => 1.0 / rate,
            ArrivalProcess::Poisson => match Exp::new(rate) {
                Ok(exp) => exp.sample(&mut self.rng),
                Err(_) => 1.0 / rate,
            },
        };
        let nanos = (secs * 1e9).round();
        if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos((nanos as u64).max(1))
        } else {
            Duration::MAX
        }
    }
}
