use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SimError};
use crate::limiter::{AimdConfig, ConcurrencyLimiter, DEFAULT_RTT_WINDOWS};
use crate::pacer::ArrivalProcess;
use crate::ramp::{RampPlanner, RatePhase};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scenario: ScenarioConfig,
    pub ramp: RampConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        RampPlanner::from_config(&self.ramp).validate()?;
        self.server.latency.validate()?;
        if self.report.interval_ms == 0 {
            return Err(SimError::config("report.interval_ms must be non-zero"));
        }
        if self.scenario.runtime_ms == Some(0) {
            return Err(SimError::config("scenario.runtime_ms must be non-zero"));
        }
        Ok(())
    }

    /// Configured runtime, or one pass over the ramp when unset.
    pub fn runtime(&self) -> Duration {
        match self.scenario.runtime_ms {
            Some(ms) => Duration::from_millis(ms),
            None => RampPlanner::from_config(&self.ramp).total_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Seed for the arrival and latency RNG streams
    pub seed: Option<u64>,
    /// Total driver runtime; the ramp repeats until it elapses
    pub runtime_ms: Option<u64>,
    #[serde(default)]
    pub arrival: ArrivalProcess,
    /// How long to wait for in-flight calls after the runtime ends
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            seed: None,
            runtime_ms: None,
            arrival: ArrivalProcess::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Requests per second at the start of the phase
    pub start_rps: f64,
    /// Requests per second at the end of the phase; defaults to `start_rps`
    pub end_rps: Option<f64>,
    pub duration_ms: u64,
}

impl PhaseConfig {
    pub fn to_phase(&self) -> RatePhase {
        RatePhase::exponential(
            self.start_rps,
            self.end_rps.unwrap_or(self.start_rps),
            Duration::from_millis(self.duration_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Nanos,
    Micros,
    Millis,
    Seconds,
    Minutes,
}

impl TimeUnit {
    fn nanos_per_unit(self) -> f64 {
        match self {
            TimeUnit::Nanos => 1.0,
            TimeUnit::Micros => 1e3,
            TimeUnit::Millis => 1e6,
            TimeUnit::Seconds => 1e9,
            TimeUnit::Minutes => 60e9,
        }
    }

    /// Convert a (possibly fractional) amount of this unit to a duration,
    /// rounded to the nearest nanosecond.
    pub fn to_duration(self, amount: f64) -> Option<Duration> {
        let nanos = amount * self.nanos_per_unit();
        if !nanos.is_finite() || nanos < 0.0 || nanos >= u64::MAX as f64 {
            return None;
        }
        Some(Duration::from_nanos(nanos.round() as u64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConfig {
    /// Mean service time, in `unit`; 0 serves instantly
    pub mean: f64,
    /// Log-space standard deviation; 0 gives a fixed latency
    #[serde(default)]
    pub sigma: f64,
    pub unit: TimeUnit,
}

impl LatencyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.mean.is_finite() || self.mean < 0.0 {
            return Err(SimError::config(format!(
                "server.latency.mean must be a non-negative number, got {}",
                self.mean
            )));
        }
        if !self.sigma.is_finite() || self.sigma < 0.0 {
            return Err(SimError::config(format!(
                "server.latency.sigma must be a non-negative number, got {}",
                self.sigma
            )));
        }
        if self.unit.to_duration(self.mean).is_none() {
            return Err(SimError::config("server.latency.mean is out of range"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum simultaneous calls in the service-time wait
    pub concurrency: usize,
    /// Listen port for the TCP transport (0 = ephemeral)
    #[serde(default)]
    pub port: u16,
    pub latency: LatencyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LimiterKind {
    Unbounded,
    Fixed { limit: usize },
    Aimd(AimdConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(flatten)]
    pub kind: LimiterKind,
    #[serde(default = "default_short_window")]
    pub rtt_short_window: usize,
    #[serde(default = "default_long_window")]
    pub rtt_long_window: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            kind: LimiterKind::Aimd(AimdConfig::default()),
            rtt_short_window: default_short_window(),
            rtt_long_window: default_long_window(),
        }
    }
}

fn default_short_window() -> usize {
    DEFAULT_RTT_WINDOWS.0
}

fn default_long_window() -> usize {
    DEFAULT_RTT_WINDOWS.1
}

impl LimiterConfig {
    pub fn build(&self) -> ConcurrencyLimiter {
        let limiter = match &self.kind {
            LimiterKind::Unbounded => ConcurrencyLimiter::unbounded(),
            LimiterKind::Fixed { limit } => ConcurrencyLimiter::fixed(*limit),
            LimiterKind::Aimd(aimd) => ConcurrencyLimiter::aimd(aimd.clone()),
        };
        limiter.with_rtt_windows(self.rtt_short_window, self.rtt_long_window)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::Limiter;

    const EXAMPLE: &str = r#"
[scenario]
seed = 42
arrival = "poisson"

[[ramp.phases]]
start_rps = 100
duration_ms = 60000

[[ramp.phases]]
start_rps = 200
end_rps = 500
duration_ms = 500000

[server]
concurrency = 2

[server.latency]
mean = 20
sigma = 1.0
unit = "millis"

[limiter]
kind = "aimd"
initial_limit = 10
max_limit = 200

[report]
interval_ms = 500
"#;

    #[test]
    fn test_config_serde() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.scenario.seed, Some(42));
        assert_eq!(config.scenario.arrival, ArrivalProcess::Poisson);
        assert_eq!(config.scenario.drain_timeout_ms, 30_000);
        assert_eq!(config.ramp.phases.len(), 2);
        assert_eq!(config.ramp.phases[0].to_phase().end_rps, 100.0);
        assert_eq!(config.ramp.phases[1].to_phase().end_rps, 500.0);
        assert_eq!(config.server.concurrency, 2);
        assert_eq!(config.server.port, 0);
        assert_eq!(config.server.latency.unit, TimeUnit::Millis);
        assert_eq!(config.report.interval_ms, 500);
        assert_eq!(config.limiter.rtt_long_window, 100);

        match &config.limiter.kind {
            LimiterKind::Aimd(aimd) => {
                assert_eq!(aimd.initial_limit, 10);
                assert_eq!(aimd.max_limit, 200);
                assert_eq!(aimd.min_limit, 1);
            }
            other => panic!("unexpected limiter kind {other:?}"),
        }
        assert_eq!(config.limiter.build().limit(), 10);

        config.validate().unwrap();
        assert_eq!(config.runtime(), Duration::from_millis(560_000));
    }

    #[test]
    fn test_fixed_limiter_and_defaults() {
        let config: Config = toml::from_str(
            r#"
[ramp]
phases = [{ start_rps = 10, duration_ms = 1000 }]

[server]
concurrency = 8
port = 9001
latency = { mean = 0.5, unit = "seconds" }

[limiter]
kind = "fixed"
limit = 4
"#,
        )
        .unwrap();
        assert_eq!(config.scenario.arrival, ArrivalProcess::Uniform);
        assert_eq!(config.server.latency.sigma, 0.0);
        assert_eq!(config.report.interval_ms, 1000);
        assert_eq!(config.limiter.build().limit(), 4);
        assert_eq!(
            config.server.latency.unit.to_duration(config.server.latency.mean),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.server.latency.sigma = -1.0;
        assert!(matches!(config.validate(), Err(SimError::Config(_))));

        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.ramp.phases.clear();
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.report.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_example_config() {
        let config: Config =
            toml::from_str(include_str!("../../../config/example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ramp.phases.len(), 4);
        assert_eq!(config.runtime(), Duration::from_secs(3600));
        assert_eq!(config.limiter.build().limit(), 20);
    }

    #[test]
    fn test_latency_mean_bounds() {
        let latency = |mean: f64| LatencyConfig {
            mean,
            sigma: 1.0,
            unit: TimeUnit::Millis,
        };
        latency(0.0).validate().unwrap();
        latency(20.0).validate().unwrap();
        assert!(matches!(latency(-1.0).validate(), Err(SimError::Config(_))));
        assert!(latency(f64::NAN).validate().is_err());
        assert!(latency(f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_time_units() {
        assert_eq!(
            TimeUnit::Minutes.to_duration(2.0),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            TimeUnit::Micros.to_duration(1500.0),
            Some(Duration::from_micros(1500))
        );
        assert_eq!(TimeUnit::Seconds.to_duration(-1.0), None);
    }
}
