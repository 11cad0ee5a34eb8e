use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::Result;
use crate::limiter::Limiter;
use crate::stats::RunMetrics;

pub const HEADER: &str = "iteration, limit, success, drop, latency, shortRtt, longRtt";

/// One reporting tick. Counts cover the interval since the previous tick;
/// times are in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub iteration: u64,
    /// `None` for a limiter with no limit; printed as `-`.
    pub limit: Option<u64>,
    pub success: u64,
    pub drop: u64,
    pub latency_ms: u64,
    pub short_rtt_ms: u64,
    pub long_rtt_ms: u64,
}

impl Snapshot {
    pub fn to_row(&self) -> String {
        let limit = match self.limit {
            Some(limit) => limit.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{}, {}, {}, {}, {}, {}, {}",
            self.iteration,
            limit,
            self.success,
            self.drop,
            self.latency_ms,
            self.short_rtt_ms,
            self.long_rtt_ms
        )
    }
}

pub trait SnapshotSink: Send {
    /// Called once before the first tick.
    fn header(&mut self) {}

    fn emit(&mut self, snapshot: &Snapshot);
}

/// Writes the header and one comma-separated row per tick.
///
/// Writes and flushes synchronously from the reporter task, which is fine at
/// the usual one-second cadence. A slow writer (a blocked pipe on stdout)
/// stalls that worker thread until the write completes.
pub struct CsvSink<W> {
    out: W,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            warn!(error = %e, "failed to write report line");
        }
    }
}

impl<W: Write + Send> SnapshotSink for CsvSink<W> {
    fn header(&mut self) {
        self.write_line(HEADER);
    }

    fn emit(&mut self, snapshot: &Snapshot) {
        self.write_line(&snapshot.to_row());
    }
}

/// Forwards every snapshot over a channel.
pub struct ChannelSink(mpsc::UnboundedSender<Snapshot>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Snapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl SnapshotSink for ChannelSink {
    fn emit(&mut self, snapshot: &Snapshot) {
        let _ = self.0.send(*snapshot);
    }
}

/// Fixed-cadence sampler of the run metrics.
///
/// Runs on its own task. The ticker uses `MissedTickBehavior::Burst`: if a
/// tick is delayed, the missed ticks fire back to back, so every interval
/// gets exactly one snapshot and iterations are never skipped.
pub struct Reporter {
    interval: Duration,
    limiter: Arc<dyn Limiter>,
    metrics: Arc<RunMetrics>,
    sinks: Vec<Box<dyn SnapshotSink>>,
}

impl Reporter {
    pub fn new(interval: Duration, limiter: Arc<dyn Limiter>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            interval,
            limiter,
            metrics,
            sinks: Vec::new(),
        }
    }

    pub fn sink(mut self, sink: impl SnapshotSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Read the limiter and drain the counters. Each counter is reset on its
    /// own, so values in one snapshot may be skewed by calls completing
    /// mid-sample.
    pub fn sample(&self, iteration: u64) -> Snapshot {
        Snapshot {
            iteration,
            limit: reported_limit(self.limiter.limit()),
            success: self.metrics.success.take(),
            drop: self.metrics.drop.take(),
            latency_ms: self.metrics.latency.get_and_reset().as_millis() as u64,
            short_rtt_ms: self.limiter.short_rtt().as_millis() as u64,
            long_rtt_ms: self.limiter.long_rtt().as_millis() as u64,
        }
    }

    /// Start ticking. The first snapshot is taken one interval from now.
    pub fn spawn(self) -> ReporterHandle {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(self.run(stopped));
        ReporterHandle {
            stop: Some(stop),
            task,
        }
    }

    async fn run(mut self, mut stopped: oneshot::Receiver<()>) -> u64 {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        for sink in &mut self.sinks {
            sink.header();
        }

        let mut iteration = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    iteration += 1;
                    let snapshot = self.sample(iteration);
                    debug!(?snapshot, "report tick");
                    for sink in &mut self.sinks {
                        sink.emit(&snapshot);
                    }
                }
            }
        }
        iteration
    }
}

/// A limit of `usize::MAX` means the limiter never rejects.
pub fn reported_limit(limit: usize) -> Option<u64> {
    (limit != usize::MAX).then_some(limit as u64)
}

pub struct ReporterHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl ReporterHandle {
    /// Stop ticking and return the number of snapshots emitted.
    pub async fn stop(mut self) -> Result<u64> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        Ok(self.task.await?)
    }
}
