//! Admission-control interface consumed by the simulated server.
//!
//! The harness only needs a decision ([`Limiter::acquire`]), feedback through
//! the returned [`Token`], and read-only introspection for the reporter. The
//! [`ConcurrencyLimiter`] implementations here are simple baselines; real
//! algorithms plug in by implementing [`Limiter`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of one admitted call, reported back to the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed; carries the observed round-trip time.
    Success(Duration),
    /// Shed or timed out after admission.
    Dropped,
    /// Not representative of load (e.g. a simulation fault).
    Ignore,
}

/// Receiver for token outcomes. Implemented by limiter internals.
pub trait Feedback: Send + Sync {
    fn record(&self, outcome: Outcome);
}

/// Permit for one admitted call.
///
/// Reporting consumes the token, so at most one outcome is recorded. A token
/// dropped without a report records [`Outcome::Ignore`].
pub struct Token {
    feedback: Option<Arc<dyn Feedback>>,
}

impl Token {
    pub fn new(feedback: Arc<dyn Feedback>) -> Self {
        Self {
            feedback: Some(feedback),
        }
    }

    pub fn on_success(mut self, rtt: Duration) {
        self.report(Outcome::Success(rtt));
    }

    pub fn on_dropped(mut self) {
        self.report(Outcome::Dropped);
    }

    pub fn on_ignore(mut self) {
        self.report(Outcome::Ignore);
    }

    fn report(&mut self, outcome: Outcome) {
        if let Some(feedback) = self.feedback.take() {
            feedback.record(outcome);
        }
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.report(Outcome::Ignore);
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("reported", &self.feedback.is_none())
            .finish()
    }
}

pub trait Limiter: Send + Sync {
    /// Admission decision. `None` means the call is rejected.
    fn acquire(&self) -> Option<Token>;

    /// Current concurrency limit.
    fn limit(&self) -> usize;

    /// Short-window smoothed RTT.
    fn short_rtt(&self) -> Duration;

    /// Long-window smoothed RTT.
    fn long_rtt(&self) -> Duration;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AimdConfig {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    /// Multiplicative decrease applied on a drop or timeout.
    pub backoff_ratio: f64,
    /// Successful samples slower than this count as a timeout.
    pub timeout_ms: u64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            initial_limit: 20,
            min_limit: 1,
            max_limit: 1000,
            backoff_ratio: 0.9,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone)]
enum LimitAlgorithm {
    Fixed,
    Aimd(AimdConfig),
}

/// Exponentially weighted short/long RTT pair, in nanoseconds.
#[derive(Debug)]
struct RttEstimator {
    short_alpha: f64,
    long_alpha: f64,
    state: Mutex<Option<(f64, f64)>>,
}

impl RttEstimator {
    fn new(short_window: usize, long_window: usize) -> Self {
        Self {
            short_alpha: 2.0 / (short_window.max(1) as f64 + 1.0),
            long_alpha: 2.0 / (long_window.max(1) as f64 + 1.0),
            state: Mutex::new(None),
        }
    }

    fn record(&self, rtt: Duration) {
        let sample = rtt.as_nanos() as f64;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = Some(match *state {
            None => (sample, sample),
            Some((short, long)) => (
                short + self.short_alpha * (sample - short),
                long + self.long_alpha * (sample - long),
            ),
        });
    }

    fn get(&self) -> (Duration, Duration) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            None => (Duration::ZERO, Duration::ZERO),
            Some((short, long)) => (
                Duration::from_nanos(short.round() as u64),
                Duration::from_nanos(long.round() as u64),
            ),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    algorithm: LimitAlgorithm,
    limit: AtomicUsize,
    inflight: AtomicUsize,
    rtt: RttEstimator,
}

impl LimiterState {
    fn adjust(&self, f: impl Fn(usize) -> usize) {
        let _ = self
            .limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| Some(f(limit)));
    }
}

impl Feedback for LimiterState {
    fn record(&self, outcome: Outcome) {
        // Value before the decrement includes this call.
        let inflight = self.inflight.fetch_sub(1, Ordering::AcqRel);

        if let Outcome::Success(rtt) = outcome {
            self.rtt.record(rtt);
        }

        let LimitAlgorithm::Aimd(config) = &self.algorithm else {
            return;
        };
        let backoff = |limit: usize| {
            let reduced = (limit as f64 * config.backoff_ratio).floor() as usize;
            reduced.max(config.min_limit)
        };
        match outcome {
            Outcome::Success(rtt) if rtt > Duration::from_millis(config.timeout_ms) => {
                self.adjust(backoff)
            }
            Outcome::Success(_) => self.adjust(|limit| {
                if inflight * 2 >= limit {
                    (limit + 1).min(config.max_limit)
                } else {
                    limit
                }
            }),
            Outcome::Dropped => self.adjust(backoff),
            Outcome::Ignore => {}
        }
    }
}

/// In-flight counting limiter with a fixed or AIMD-adjusted limit.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter(Arc<LimiterState>);

/// Window sizes (in samples) for the short and long RTT averages.
pub const DEFAULT_RTT_WINDOWS: (usize, usize) = (10, 100);

impl ConcurrencyLimiter {
    fn with_algorithm(algorithm: LimitAlgorithm, limit: usize) -> Self {
        let (short, long) = DEFAULT_RTT_WINDOWS;
        Self(Arc::new(LimiterState {
            algorithm,
            limit: AtomicUsize::new(limit),
            inflight: AtomicUsize::new(0),
            rtt: RttEstimator::new(short, long),
        }))
    }

    /// Admits at most `limit` concurrent tokens.
    pub fn fixed(limit: usize) -> Self {
        Self::with_algorithm(LimitAlgorithm::Fixed, limit)
    }

    /// Admits every call.
    pub fn unbounded() -> Self {
        Self::fixed(usize::MAX)
    }

    pub fn aimd(config: AimdConfig) -> Self {
        let initial = config
            .initial_limit
            .clamp(config.min_limit, config.max_limit.max(config.min_limit));
        Self::with_algorithm(LimitAlgorithm::Aimd(config), initial)
    }

    /// Override the RTT smoothing windows. Call before any token is issued.
    pub fn with_rtt_windows(self, short: usize, long: usize) -> Self {
        let state = &self.0;
        Self(Arc::new(LimiterState {
            algorithm: state.algorithm.clone(),
            limit: AtomicUsize::new(state.limit.load(Ordering::Acquire)),
            inflight: AtomicUsize::new(state.inflight.load(Ordering::Acquire)),
            rtt: RttEstimator::new(short, long),
        }))
    }

    pub fn inflight(&self) -> usize {
        self.0.inflight.load(Ordering::Acquire)
    }
}

impl Limiter for ConcurrencyLimiter {
    fn acquire(&self) -> Option<Token> {
        let limit = self.0.limit.load(Ordering::Acquire);
        self.0
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Token::new(self.0.clone()))
    }

    fn limit(&self) -> usize {
        self.0.limit.load(Ordering::Acquire)
    }

    fn short_rtt(&self) -> Duration {
        self.0.rtt.get().0
    }

    fn long_rtt(&self) -> Duration {
        self.0.rtt.get().1
    }
}
