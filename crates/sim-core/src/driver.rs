use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SimError};
use crate::pacer::{ArrivalPacer, ArrivalProcess};
use crate::ramp::{RampPlanner, RatePhase};
use crate::server::{CallOutcome, CallTarget};
use crate::stats::{LatencyCollector, RunMetrics};
use crate::transport::RemoteTarget;

pub type Action = Arc<dyn Fn() + Send + Sync>;

/// Receives the latency of every admitted call.
pub trait LatencySink: Send + Sync {
    fn accept(&self, sample: Duration);
}

impl LatencySink for LatencyCollector {
    fn accept(&self, sample: Duration) {
        LatencyCollector::accept(self, sample);
    }
}

impl LatencySink for RunMetrics {
    fn accept(&self, sample: Duration) {
        self.latency.accept(sample);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    Idle,
    Running,
    Stopped,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Totals for one `run`, counted at call completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverSummary {
    pub issued: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Still in flight when the drain timeout expired.
    pub aborted: u64,
    /// Complete passes over the phase schedule.
    pub cycles: u64,
    pub elapsed_ms: u64,
}

impl DriverSummary {
    fn record(&mut self, joined: std::result::Result<CallResult, JoinError>) {
        match joined {
            Ok(CallResult::Admitted) => self.admitted += 1,
            Ok(CallResult::Rejected) => self.rejected += 1,
            Ok(CallResult::Failed) => self.failed += 1,
            Err(e) => {
                warn!(error = %e, "simulated call task did not complete");
                self.failed += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CallResult {
    Admitted,
    Rejected,
    Failed,
}

#[derive(Default)]
struct Hooks {
    on_success: Option<Action>,
    on_drop: Option<Action>,
    latency: Option<Arc<dyn LatencySink>>,
}

#[derive(Clone)]
enum Endpoint {
    Target(Arc<dyn CallTarget>),
    Port(u16),
}

/// Open-loop load generator.
///
/// Calls are paced against the scheduled arrival times, not against the
/// completion of earlier calls, so a slow server never slows the offered
/// load. Each call runs as its own task.
pub struct Driver {
    planner: RampPlanner,
    hooks: Arc<Hooks>,
    runtime: Duration,
    endpoint: Endpoint,
    arrival: ArrivalProcess,
    seed: Option<u64>,
    drain_timeout: Duration,
    state: AtomicU8,
}

impl Driver {
    pub fn builder() -> DriverBuilder {
        DriverBuilder::default()
    }

    pub fn state(&self) -> DriverState {
        match self.state.load(Ordering::Acquire) {
            IDLE => DriverState::Idle,
            RUNNING => DriverState::Running,
            _ => DriverState::Stopped,
        }
    }

    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    pub fn planner(&self) -> &RampPlanner {
        &self.planner
    }

    /// Drive load until the runtime elapses, then drain in-flight calls.
    /// A driver runs at most once.
    pub async fn run(&self) -> Result<DriverSummary> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SimError::AlreadyStarted)?;
        let result = self.drive().await;
        self.state.store(STOPPED, Ordering::Release);
        result
    }

    async fn drive(&self) -> Result<DriverSummary> {
        let target: Arc<dyn CallTarget> = match &self.endpoint {
            Endpoint::Target(target) => target.clone(),
            Endpoint::Port(port) => Arc::new(RemoteTarget::connect(*port).await?),
        };
        info!(
            target = target.name(),
            phases = self.planner.phases().len(),
            runtime_ms = self.runtime.as_millis() as u64,
            arrival = ?self.arrival,
            "driver starting"
        );

        let started = Instant::now();
        let deadline = started + self.runtime;
        let mut pacer = ArrivalPacer::new(self.arrival, self.seed);
        let mut calls = JoinSet::new();
        let mut summary = DriverSummary::default();
        let mut phase_start = started;

        'run: loop {
            for (idx, phase) in self.planner.phases().iter().enumerate() {
                if phase_start >= deadline {
                    break 'run;
                }
                let phase_end = (phase_start + phase.duration).min(deadline);
                debug!(
                    phase = idx,
                    start_rps = phase.start_rps,
                    end_rps = phase.end_rps,
                    duration_ms = phase.duration.as_millis() as u64,
                    "entering phase"
                );

                self.drive_phase(
                    phase,
                    phase_start,
                    phase_end,
                    &mut pacer,
                    &target,
                    &mut calls,
                    &mut summary,
                )
                .await;
                phase_start = phase_end;
            }
            summary.cycles += 1;
        }

        info!(
            issued = summary.issued,
            in_flight = calls.len(),
            "runtime elapsed, draining in-flight calls"
        );
        let drained = timeout(self.drain_timeout, async {
            while let Some(joined) = calls.join_next().await {
                summary.record(joined);
            }
        })
        .await;
        if drained.is_err() {
            summary.aborted = calls.len() as u64;
            warn!(
                aborted = summary.aborted,
                "drain timeout expired, aborting remaining calls"
            );
            calls.shutdown().await;
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            issued = summary.issued,
            admitted = summary.admitted,
            rejected = summary.rejected,
            failed = summary.failed,
            elapsed_ms = summary.elapsed_ms,
            "driver stopped"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_phase(
        &self,
        phase: &RatePhase,
        phase_start: Instant,
        phase_end: Instant,
        pacer: &mut ArrivalPacer,
        target: &Arc<dyn CallTarget>,
        calls: &mut JoinSet<CallResult>,
        summary: &mut DriverSummary,
    ) {
        let mut next_at = phase_start;
        while next_at < phase_end {
            sleep_until(next_at).await;
            self.dispatch(target, calls);
            summary.issued += 1;
            while let Some(joined) = calls.try_join_next() {
                summary.record(joined);
            }

            let gap = pacer.next_interval(phase.rate_at(next_at - phase_start));
            next_at = next_at.checked_add(gap).unwrap_or(phase_end);
        }
        sleep_until(phase_end).await;
    }

    fn dispatch(&self, target: &Arc<dyn CallTarget>, calls: &mut JoinSet<CallResult>) {
        let target = target.clone();
        let hooks = self.hooks.clone();
        calls.spawn(async move {
            match target.call().await {
                Ok(CallOutcome::Admitted(latency)) => {
                    if let Some(on_success) = &hooks.on_success {
                        on_success();
                    }
                    if let Some(sink) = &hooks.latency {
                        sink.accept(latency);
                    }
                    CallResult::Admitted
                }
                Ok(CallOutcome::Rejected) => {
                    if let Some(on_drop) = &hooks.on_drop {
                        on_drop();
                    }
                    CallResult::Rejected
                }
                Err(e) => {
                    warn!(error = %e, "simulated call failed");
                    CallResult::Failed
                }
            }
        });
    }
}

pub struct DriverBuilder {
    phases: Vec<RatePhase>,
    hooks: Hooks,
    runtime: Option<Duration>,
    endpoint: Option<Endpoint>,
    arrival: ArrivalProcess,
    seed: Option<u64>,
    drain_timeout: Duration,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self {
            phases: Vec::new(),
            hooks: Hooks::default(),
            runtime: None,
            endpoint: None,
            arrival: ArrivalProcess::default(),
            seed: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl DriverBuilder {
    /// Seed the builder from a config file: phases, runtime, arrival
    /// process, seed and drain timeout. Callbacks and the endpoint still
    /// have to be supplied.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::default()
            .arrival(config.scenario.arrival)
            .drain_timeout(Duration::from_millis(config.scenario.drain_timeout_ms));
        builder.phases = RampPlanner::from_config(&config.ramp).phases().to_vec();
        builder.runtime = config.scenario.runtime_ms.map(Duration::from_millis);
        builder.seed = config.scenario.seed;
        builder
    }

    /// Append a phase moving exponentially from `start_rps` to `end_rps`.
    pub fn exponential_rps(self, start_rps: f64, end_rps: f64, duration: Duration) -> Self {
        self.phase(RatePhase::exponential(start_rps, end_rps, duration))
    }

    pub fn constant_rps(self, rps: f64, duration: Duration) -> Self {
        self.phase(RatePhase::constant(rps, duration))
    }

    pub fn phase(mut self, phase: RatePhase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn success_action(mut self, action: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_success = Some(Arc::new(action));
        self
    }

    pub fn drop_action(mut self, action: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_drop = Some(Arc::new(action));
        self
    }

    pub fn latency_accumulator(mut self, sink: Arc<dyn LatencySink>) -> Self {
        self.hooks.latency = Some(sink);
        self
    }

    /// Total runtime. Defaults to one pass over the phases; longer runtimes
    /// repeat the schedule.
    pub fn runtime(mut self, runtime: Duration) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Drive a server on `127.0.0.1:port` over the TCP transport.
    pub fn port(mut self, port: u16) -> Self {
        self.endpoint = Some(Endpoint::Port(port));
        self
    }

    /// Drive an in-process target directly.
    pub fn target(mut self, target: Arc<dyn CallTarget>) -> Self {
        self.endpoint = Some(Endpoint::Target(target));
        self
    }

    pub fn arrival(mut self, arrival: ArrivalProcess) -> Self {
        self.arrival = arrival;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn build(self) -> Result<Driver> {
        let planner = RampPlanner::new(self.phases);
        planner.validate()?;
        let endpoint = self
            .endpoint
            .ok_or_else(|| SimError::config("driver needs a target or a port"))?;
        let runtime = self.runtime.unwrap_or_else(|| planner.total_duration());
        if runtime.is_zero() {
            return Err(SimError::config("driver runtime must be non-zero"));
        }

        Ok(Driver {
            planner,
            hooks: Arc::new(self.hooks),
            runtime,
            endpoint,
            arrival: self.arrival,
            seed: self.seed,
            drain_timeout: self.drain_timeout,
            state: AtomicU8::new(IDLE),
        })
    }
}
