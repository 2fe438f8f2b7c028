//! Prometheus-style round metrics.
//!
//! Provides counters, gauges, and histograms, and the set of them a
//! training session updates after every round.

use crate::federated::summary::{RoundStatus, RoundSummary};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric (monotonically increasing).
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by amount.
    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Get current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64, // f64 bits
}

impl Gauge {
    /// Create a new gauge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gauge value.
    pub fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Get current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// A histogram metric for measuring distributions.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create with custom upper bounds, ascending.
    pub fn with_buckets(buckets: Vec<f64>) -> Self {
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        // Cumulative: every bucket at or above the value counts it
        for (i, bucket) in self.buckets.iter().enumerate() {
            if value <= *bucket {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }

        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get observation count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get sum of observations.
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    /// Get mean value.
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() / count as f64
        }
    }

    /// `(upper bound, cumulative count)` pairs.
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .zip(&self.bucket_counts)
            .map(|(bound, count)| (*bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Metrics a training session keeps about its rounds.
#[derive(Debug)]
pub struct RoundMetrics {
    pub rounds_committed: Counter,
    pub rounds_failed: Counter,
    /// Failed or timed-out participant calls, both phases
    pub participant_failures: Counter,
    /// Rounds aborted because a participant broke its contract
    pub contract_violations: Counter,
    /// Most recent aggregated evaluation loss
    pub last_loss: Gauge,
    pub registered_participants: Gauge,
    pub round_duration_seconds: Histogram,
}

impl RoundMetrics {
    pub fn new() -> Self {
        Self {
            rounds_committed: Counter::new(),
            rounds_failed: Counter::new(),
            participant_failures: Counter::new(),
            contract_violations: Counter::new(),
            last_loss: Gauge::new(),
            registered_participants: Gauge::new(),
            round_duration_seconds: Histogram::with_buckets(vec![
                0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
            ]),
        }
    }

    /// Fold one finished round into the metrics.
    pub fn record_round(&self, summary: &RoundSummary, registered: usize) {
        match &summary.status {
            RoundStatus::Committed => self.rounds_committed.inc(),
            RoundStatus::Failed {
                contract_violation, ..
            } => {
                self.rounds_failed.inc();
                if *contract_violation {
                    self.contract_violations.inc();
                }
            }
        }
        self.participant_failures.add(summary.failures.len() as u64);
        if let Some(loss) = summary.loss {
            self.last_loss.set(loss);
        }
        self.registered_participants.set(registered as f64);

        let seconds = summary.duration().num_milliseconds().max(0) as f64 / 1000.0;
        self.round_duration_seconds.observe(seconds);
    }

    /// Render in the Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        for (name, help, counter) in [
            ("dronefed_rounds_committed_total", "Rounds that committed new parameters", &self.rounds_committed),
            ("dronefed_rounds_failed_total", "Rounds that committed nothing", &self.rounds_failed),
            ("dronefed_participant_failures_total", "Participant calls that failed or timed out", &self.participant_failures),
            ("dronefed_contract_violations_total", "Rounds aborted by a contract violation", &self.contract_violations),
        ] {
            let _ = writeln!(output, "# HELP {} {}", name, help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}", name, counter.get());
        }

        for (name, help, gauge) in [
            ("dronefed_last_loss", "Most recent aggregated evaluation loss", &self.last_loss),
            ("dronefed_registered_participants", "Participants registered at round end", &self.registered_participants),
        ] {
            let _ = writeln!(output, "# HELP {} {}", name, help);
            let _ = writeln!(output, "# TYPE {} gauge", name);
            let _ = writeln!(output, "{} {}", name, gauge.get());
        }

        let name = "dronefed_round_duration_seconds";
        let histogram = &self.round_duration_seconds;
        let _ = writeln!(output, "# HELP {} Wall-clock round duration", name);
        let _ = writeln!(output, "# TYPE {} histogram", name);
        for (bound, count) in histogram.buckets() {
            let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", name, bound, count);
        }
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, histogram.count());
        let _ = writeln!(output, "{}_sum {}", name, histogram.sum());
        let _ = writeln!(output, "{}_count {}", name, histogram.count());

        output
    }
}

impl Default for RoundMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::now;
    use crate::federated::participant::MetricMap;
    use crate::federated::summary::{EvaluationStatus, FailureKind, ParticipantFailure};
    use crate::core::Phase;

    fn summary(status: RoundStatus, loss: Option<f64>, failures: usize) -> RoundSummary {
        let started_at = now();
        RoundSummary {
            round_index: 0,
            status,
            participants_used: 2,
            fit_selected: 2,
            evaluation: EvaluationStatus::Aggregated,
            evaluated_by: 2,
            loss,
            metrics: MetricMap::new(),
            fit_metrics: MetricMap::new(),
            failures: (0..failures)
                .map(|i| {
                    ParticipantFailure::new(&format!("drone{}", i), Phase::Fit, FailureKind::Timeout)
                })
                .collect(),
            model_version: 1,
            model_fingerprint: None,
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(750),
        }
    }

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        assert_eq!(gauge.get(), 0.0);

        gauge.set(10.5);
        assert!((gauge.get() - 10.5).abs() < 1e-10);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::with_buckets(vec![0.5, 1.0]);
        histogram.observe(0.1);
        histogram.observe(0.5);
        histogram.observe(2.0);

        assert_eq!(histogram.count(), 3);
        assert!((histogram.sum() - 2.6).abs() < 1e-10);
        assert_eq!(histogram.buckets(), vec![(0.5, 2), (1.0, 2)]);
    }

    #[test]
    fn test_record_round() {
        let metrics = RoundMetrics::new();
        metrics.record_round(&summary(RoundStatus::Committed, Some(0.25), 1), 3);
        metrics.record_round(
            &summary(
                RoundStatus::Failed {
                    reason: "bad shapes".into(),
                    contract_violation: true,
                },
                None,
                0,
            ),
            2,
        );

        assert_eq!(metrics.rounds_committed.get(), 1);
        assert_eq!(metrics.rounds_failed.get(), 1);
        assert_eq!(metrics.contract_violations.get(), 1);
        assert_eq!(metrics.participant_failures.get(), 1);
        assert_eq!(metrics.last_loss.get(), 0.25);
        assert_eq!(metrics.registered_participants.get(), 2.0);
        assert_eq!(metrics.round_duration_seconds.count(), 2);
        assert!((metrics.round_duration_seconds.mean() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = RoundMetrics::new();
        metrics.record_round(&summary(RoundStatus::Committed, Some(0.5), 0), 2);

        let output = metrics.export_prometheus();
        assert!(output.contains("# TYPE dronefed_rounds_committed_total counter"));
        assert!(output.contains("dronefed_rounds_committed_total 1"));
        assert!(output.contains("dronefed_last_loss 0.5"));
        assert!(output.contains("dronefed_round_duration_seconds_bucket{le=\"1\"} 1"));
        assert!(output.contains("dronefed_round_duration_seconds_count 1"));
    }
}
