#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Bumps one [`Metrics`] counter on `$shared`. Compiles to nothing without the
/// `metrics` feature.
#[cfg(feature = "metrics")]
macro_rules! count {
    ($shared:expr, $field:ident) => {
        $shared
            .metrics
            .$field
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    };
}

#[cfg(not(feature = "metrics"))]
macro_rules! count {
    ($shared:expr, $field:ident) => {
        ()
    };
}

/// Optional scheduler counters.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Group main-loop passes that found active fibers.
    pub passes: AtomicU64,
    /// Fiber suspensions.
    pub context_switches: AtomicU64,
    /// Buffer handles appended to fiber-local queues.
    pub inputs_delivered: AtomicU64,
    pub outputs_produced: AtomicU64,
    /// Records lost because the output channel was full.
    pub outputs_dropped: AtomicU64,
    /// Staged records evicted by a reader to make room.
    pub outputs_evicted: AtomicU64,
    pub timers_fired: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            passes: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            inputs_delivered: AtomicU64::new(0),
            outputs_produced: AtomicU64::new(0),
            outputs_dropped: AtomicU64::new(0),
            outputs_evicted: AtomicU64::new(0),
            timers_fired: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            inputs_delivered: self.inputs_delivered.load(Ordering::Relaxed),
            outputs_produced: self.outputs_produced.load(Ordering::Relaxed),
            outputs_dropped: self.outputs_dropped.load(Ordering::Relaxed),
            outputs_evicted: self.outputs_evicted.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub passes: u64,
    pub context_switches: u64,
    pub inputs_delivered: u64,
    pub outputs_produced: u64,
    pub outputs_dropped: u64,
    pub outputs_evicted: u64,
    pub timers_fired: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Context switches per second since the simulator was created.
    pub fn switches_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.context_switches as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Records that never reached a reader.
    pub fn outputs_lost(&self) -> u64 {
        self.outputs_dropped + self.outputs_evicted
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    struct Holder {
        metrics: Metrics,
    }

    #[test]
    fn test_metrics_creation() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.passes, 0);
        assert_eq!(snapshot.context_switches, 0);
        assert_eq!(snapshot.outputs_lost(), 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_count_macro() {
        let holder = Holder { metrics: Metrics::new() };
        count!(holder, passes);
        count!(holder, passes);
        count!(holder, outputs_dropped);
        count!(holder, outputs_evicted);

        let snapshot = holder.metrics.snapshot();
        assert_eq!(snapshot.passes, 2);
        assert_eq!(snapshot.outputs_lost(), 2);
    }

    #[test]
    fn test_switch_rate() {
        let metrics = Metrics::new();
        metrics.context_switches.fetch_add(100, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.snapshot().switches_per_second() > 0.0);
    }
}
