use portable_atomic::AtomicU128;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Immutable (count, total) pair describing the samples accepted since the
/// last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub total_nanos: u64,
}

impl LatencySnapshot {
    /// Mean latency, or zero when no samples were recorded.
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_nanos / self.count)
    }

    /// Add one sample. `None` if either field would overflow.
    fn merge(self, sample_nanos: u64) -> Option<Self> {
        Some(Self {
            count: self.count.checked_add(1)?,
            total_nanos: self.total_nanos.checked_add(sample_nanos)?,
        })
    }

    fn pack(self) -> u128 {
        (u128::from(self.count) << 64) | u128::from(self.total_nanos)
    }

    fn unpack(packed: u128) -> Self {
        Self {
            count: (packed >> 64) as u64,
            total_nanos: packed as u64,
        }
    }
}

/// Lock-free latency accumulator.
///
/// The snapshot lives in a single 128-bit atomic (64-bit count, 64-bit
/// nanosecond total), so a merge is one compare-and-swap and a reset is one
/// swap. A sample racing a reset is therefore counted in exactly one of the
/// two snapshots. A window that would overflow a field (about 584 years of
/// summed latency) keeps its last consistent snapshot.
#[derive(Debug, Default)]
pub struct LatencyCollector {
    packed: AtomicU128,
}

impl LatencyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sample into the current snapshot, retrying on contention.
    pub fn accept(&self, sample: Duration) {
        let nanos = u64::try_from(sample.as_nanos()).unwrap_or(u64::MAX);
        let mut current = self.packed.load(Ordering::Relaxed);
        loop {
            let Some(next) = LatencySnapshot::unpack(current).merge(nanos) else {
                return;
            };
            match self.packed.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Swap in the zero snapshot and return the previous one.
    pub fn take(&self) -> LatencySnapshot {
        LatencySnapshot::unpack(self.packed.swap(0, Ordering::AcqRel))
    }

    /// Swap in the zero snapshot and return the previous average.
    pub fn get_and_reset(&self) -> Duration {
        self.take().average()
    }

    /// Current snapshot without resetting it.
    pub fn peek(&self) -> LatencySnapshot {
        LatencySnapshot::unpack(self.packed.load(Ordering::Acquire))
    }
}

/// Monotonic event counter that can be drained by a reader.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Read the current value and reset it to zero in one step.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Shared state written by the driver's callbacks and drained by the
/// reporter. Each field is reset independently, so one tick may show a small
/// skew between them.
#[derive(Debug, Default)]
pub struct RunMetrics {
    pub success: Counter,
    pub drop: Counter,
    pub latency: LatencyCollector,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_collector_averages_to_zero() {
        let collector = LatencyCollector::new();
        assert_eq!(collector.get_and_reset(), Duration::ZERO);
        assert_eq!(collector.take(), LatencySnapshot::default());
    }

    #[test]
    fn test_average_and_reset() {
        let collector = LatencyCollector::new();
        collector.accept(Duration::from_millis(10));
        collector.accept(Duration::from_millis(20));
        collector.accept(Duration::from_millis(30));

        assert_eq!(collector.peek().count, 3);
        assert_eq!(collector.get_and_reset(), Duration::from_millis(20));
        assert_eq!(collector.peek(), LatencySnapshot::default());

        collector.accept(Duration::from_millis(4));
        assert_eq!(collector.get_and_reset(), Duration::from_millis(4));
    }

    #[test]
    fn test_sub_microsecond_samples_keep_precision() {
        let collector = LatencyCollector::new();
        for _ in 0..10 {
            collector.accept(Duration::from_nanos(1900));
        }
        collector.accept(Duration::from_nanos(7));
        assert_eq!(collector.peek().total_nanos, 19_007);
        assert_eq!(collector.get_and_reset(), Duration::from_nanos(1727));
    }

    #[test]
    fn test_overflowing_merge_keeps_fields_consistent() {
        let full = LatencySnapshot {
            count: 3,
            total_nanos: u64::MAX - 1,
        };
        assert_eq!(full.merge(100), None);
        let packed = LatencySnapshot {
            count: u64::MAX - 1,
            total_nanos: 42,
        };
        assert_eq!(LatencySnapshot::unpack(packed.pack()), packed);

        let collector = LatencyCollector::new();
        collector.accept(Duration::MAX);
        collector.accept(Duration::from_nanos(5));
        assert_eq!(
            collector.take(),
            LatencySnapshot {
                count: 1,
                total_nanos: u64::MAX,
            }
        );
    }

    #[test]
    fn test_concurrent_accept_with_resets_loses_nothing() {
        const WRITERS: u64 = 8;
        const PER_WRITER: u64 = 20_000;

        let collector = Arc::new(LatencyCollector::new());
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let collector = collector.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut drained = LatencySnapshot::default();
                while !done.load(Ordering::Acquire) {
                    let taken = collector.take();
                    drained.count += taken.count;
                    drained.total_nanos += taken.total_nanos;
                    thread::yield_now();
                }
                drained
            })
        };

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let collector = collector.clone();
                thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        collector.accept(Duration::from_micros(w * 10 + i % 7));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);

        let mut drained = reader.join().unwrap();
        let tail = collector.take();
        drained.count += tail.count;
        drained.total_nanos += tail.total_nanos;

        let expected_total: u64 = (0..WRITERS)
            .map(|w| (0..PER_WRITER).map(|i| w * 10 + i % 7).sum::<u64>())
            .sum();
        assert_eq!(drained.count, WRITERS * PER_WRITER);
        assert_eq!(drained.total_nanos, expected_total * 1_000);
    }

    #[test]
    fn test_counter_take_resets() {
        let counter = Counter::new();
        counter.incr();
        counter.incr();
        assert_eq!(counter.get(), 2);
        assert_eq!(counter.take(), 2);
        assert_eq!(counter.take(), 0);
    }
}
