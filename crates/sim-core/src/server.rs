use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};

use crate::config::{LatencyConfig, TimeUnit};
use crate::error::{Result, SimError};
use crate::limiter::{ConcurrencyLimiter, Limiter};

/// What the driver sees for one simulated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Admitted and served; carries the end-to-end latency.
    Admitted(Duration),
    /// Refused by admission control or a saturated server.
    Rejected,
}

/// Anything the driver can fire calls at: the server itself, or a remote
/// handle to it.
pub trait CallTarget: Send + Sync {
    fn name(&self) -> &'static str;

    fn call<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<CallOutcome>> + Send + 'a>>;
}

/// Service-time distribution.
#[derive(Debug, Clone)]
pub enum LatencyModel {
    Fixed(Duration),
    /// `exp(N(ln(mean) - sigma^2 / 2, sigma))` in `unit`, so samples average
    /// to `mean`.
    LogNormal {
        dist: LogNormal<f64>,
        unit: TimeUnit,
    },
}

impl LatencyModel {
    pub fn fixed(latency: Duration) -> Self {
        LatencyModel::Fixed(latency)
    }

    pub fn lognormal(mean: f64, sigma: f64, unit: TimeUnit) -> Result<Self> {
        Self::from_config(&LatencyConfig { mean, sigma, unit })
    }

    pub fn from_config(config: &LatencyConfig) -> Result<Self> {
        config.validate()?;
        if config.sigma == 0.0 || config.mean == 0.0 {
            let latency = config
                .unit
                .to_duration(config.mean)
                .ok_or_else(|| SimError::config("latency mean is out of range"))?;
            return Ok(LatencyModel::Fixed(latency));
        }
        let mu = config.mean.ln() - config.sigma * config.sigma / 2.0;
        let dist = LogNormal::new(mu, config.sigma)
            .map_err(|e| SimError::config(format!("invalid log-normal parameters: {e}")))?;
        Ok(LatencyModel::LogNormal {
            dist,
            unit: config.unit,
        })
    }

    /// Draw one service time. Samples that do not fit a `Duration` are
    /// reported as a simulation fault.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Duration> {
        match self {
            LatencyModel::Fixed(latency) => Ok(*latency),
            LatencyModel::LogNormal { dist, unit } => {
                let amount = dist.sample(rng);
                unit.to_duration(amount).ok_or_else(|| {
                    SimError::Simulation(format!("latency sample {amount} is out of range"))
                })
            }
        }
    }
}

/// Bounded-concurrency service guarded by an injected limiter.
///
/// The slot pool is a hard cap modelling physical saturation: admitted calls
/// queue for a slot, and the queueing time is part of the latency the limiter
/// observes.
pub struct SimulatedServer {
    capacity: usize,
    slots: Semaphore,
    latency: LatencyModel,
    limiter: Arc<dyn Limiter>,
    rng: Mutex<StdRng>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedServer {
    pub fn builder() -> SimulatedServerBuilder {
        SimulatedServerBuilder::default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn limiter(&self) -> &Arc<dyn Limiter> {
        &self.limiter
    }

    /// Calls currently in the service-time wait.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest value `in_flight` has reached.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub async fn handle(&self) -> Result<CallOutcome> {
        let Some(token) = self.limiter.acquire() else {
            return Ok(CallOutcome::Rejected);
        };
        if self.capacity == 0 {
            token.on_dropped();
            return Ok(CallOutcome::Rejected);
        }

        let started = Instant::now();
        let service_time = match self.sample_latency() {
            Ok(service_time) => service_time,
            Err(e) => {
                token.on_ignore();
                return Err(e);
            }
        };
        let Ok(permit) = self.slots.acquire().await else {
            token.on_ignore();
            return Err(SimError::Simulation("server slot pool closed".into()));
        };

        {
            let _busy = Busy::enter(&self.in_flight, &self.peak_in_flight);
            sleep(service_time).await;
        }
        drop(permit);

        let latency = started.elapsed();
        token.on_success(latency);
        Ok(CallOutcome::Admitted(latency))
    }

    fn sample_latency(&self) -> Result<Duration> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        self.latency.sample(&mut *rng)
    }
}

impl CallTarget for SimulatedServer {
    fn name(&self) -> &'static str {
        "inproc"
    }

    fn call<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<CallOutcome>> + Send + 'a>> {
        Box::pin(self.handle())
    }
}

struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(in_flight: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        peak.fetch_max(now, Ordering::AcqRel);
        Busy(in_flight)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct SimulatedServerBuilder {
    concurrency: usize,
    latency: LatencyConfig,
    limiter: Option<Arc<dyn Limiter>>,
    seed: Option<u64>,
}

impl Default for SimulatedServerBuilder {
    fn default() -> Self {
        Self {
            concurrency: 1,
            latency: LatencyConfig {
                mean: 0.0,
                sigma: 0.0,
                unit: TimeUnit::Millis,
            },
            limiter: None,
            seed: None,
        }
    }
}

impl SimulatedServerBuilder {
    /// Maximum calls in the service-time wait. 0 rejects every call.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn lognormal(mut self, mean: f64, sigma: f64, unit: TimeUnit) -> Self {
        self.latency = LatencyConfig { mean, sigma, unit };
        self
    }

    pub fn fixed_latency(mut self, latency: Duration) -> Self {
        self.latency = LatencyConfig {
            mean: latency.as_nanos() as f64,
            sigma: 0.0,
            unit: TimeUnit::Nanos,
        };
        self
    }

    pub fn latency(mut self, latency: LatencyConfig) -> Self {
        self.latency = latency;
        self
    }

    /// Admission control for the server. Defaults to admitting everything.
    pub fn limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<SimulatedServer> {
        let latency = LatencyModel::from_config(&self.latency)?;
        let capacity = self.concurrency.min(Semaphore::MAX_PERMITS);
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(SimulatedServer {
            capacity,
            slots: Semaphore::new(capacity),
            latency,
            limiter: self
                .limiter
                .unwrap_or_else(|| Arc::new(ConcurrencyLimiter::unbounded())),
            rng: Mutex::new(rng),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinSet;

    fn server(concurrency: usize, latency: Duration, limiter: ConcurrencyLimiter) -> Arc<SimulatedServer> {
        Arc::new(
            SimulatedServer::builder()
                .concurrency(concurrency)
                .fixed_latency(latency)
                .limiter(Arc::new(limiter))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_capacity() {
        let server = server(3, Duration::from_millis(100), ConcurrencyLimiter::unbounded());

        let mut calls = JoinSet::new();
        for _ in 0..50 {
            let server = server.clone();
            calls.spawn(async move { server.handle().await });
        }

        let mut admitted = 0;
        let mut slowest = Duration::ZERO;
        while let Some(result) = calls.join_next().await {
            match result.unwrap().unwrap() {
                CallOutcome::Admitted(latency) => {
                    admitted += 1;
                    slowest = slowest.max(latency);
                }
                CallOutcome::Rejected => panic!("unbounded limiter rejected a call"),
            }
        }

        assert_eq!(admitted, 50);
        assert_eq!(server.peak_in_flight(), 3);
        assert_eq!(server.in_flight(), 0);
        // 50 calls through 3 slots take 17 service rounds.
        assert!(slowest >= Duration::from_millis(1700), "slowest {slowest:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_never_admits() {
        let limiter = ConcurrencyLimiter::fixed(10);
        let server = server(0, Duration::from_millis(5), limiter.clone());

        for _ in 0..5 {
            assert_eq!(server.handle().await.unwrap(), CallOutcome::Rejected);
        }
        assert_eq!(limiter.inflight(), 0);
        assert_eq!(server.peak_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_rejection_consumes_no_slot() {
        let limiter = ConcurrencyLimiter::fixed(1);
        let server = server(4, Duration::from_millis(5), limiter.clone());

        let held = limiter.acquire().unwrap();
        assert_eq!(server.handle().await.unwrap(), CallOutcome::Rejected);
        assert_eq!(server.peak_in_flight(), 0);
        held.on_ignore();

        assert!(matches!(
            server.handle().await.unwrap(),
            CallOutcome::Admitted(_)
        ));
        assert_eq!(limiter.inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sigma_is_deterministic() {
        let server = Arc::new(
            SimulatedServer::builder()
                .concurrency(1)
                .lognormal(20.0, 0.0, TimeUnit::Millis)
                .build()
                .unwrap(),
        );
        for _ in 0..3 {
            let CallOutcome::Admitted(latency) = server.handle().await.unwrap() else {
                panic!("call was rejected");
            };
            assert!(latency >= Duration::from_millis(20));
            assert!(latency < Duration::from_millis(21), "latency {latency:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_reports_latency_to_limiter() {
        let limiter = ConcurrencyLimiter::fixed(1).with_rtt_windows(1, 1);
        let server = server(1, Duration::from_millis(40), limiter.clone());
        server.handle().await.unwrap();
        assert!(limiter.short_rtt() >= Duration::from_millis(40));
        assert!(limiter.long_rtt() < Duration::from_millis(41));
    }

    #[test]
    fn test_lognormal_samples_average_to_mean() {
        let model = LatencyModel::lognormal(20.0, 1.0, TimeUnit::Millis).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut samples: Vec<Duration> = (0..200_000)
            .map(|_| model.sample(&mut rng).unwrap())
            .collect();

        let total: Duration = samples.iter().sum();
        let mean = total.as_secs_f64() * 1000.0 / samples.len() as f64;
        assert!((mean - 20.0).abs() < 1.0, "mean {mean}ms");

        // The median sits at mean * e^(-sigma^2 / 2).
        samples.sort();
        let median = samples[samples.len() / 2].as_secs_f64() * 1000.0;
        let expected = 20.0 * (-0.5f64).exp();
        assert!((median - expected).abs() < 0.5, "median {median}ms");
    }

    #[test]
    fn test_latency_model_validation() {
        assert!(LatencyModel::lognormal(10.0, -0.5, TimeUnit::Millis).is_err());
        assert!(matches!(
            LatencyModel::lognormal(0.0, 1.0, TimeUnit::Millis).unwrap(),
            LatencyModel::Fixed(d) if d.is_zero()
        ));
    }
}
