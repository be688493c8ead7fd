//! Simulation metrics.

use std::collections::VecDeque;
use std::time::Duration;

use bankcore_common::BankError;
use serde::Serialize;

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total operations attempted.
    pub total_operations: u64,
    /// Committed operations.
    pub successful_operations: u64,
    /// Business rejections (validation, ownership, funds).
    pub rejected_operations: u64,
    /// Storage faults and timeouts.
    pub storage_faults: u64,
    /// Operations that moved money without an audit record.
    pub diverged_operations: u64,
    /// Latency samples (microseconds).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            rejected_operations: 0,
            storage_faults: 0,
            diverged_operations: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record one finished operation.
    pub fn record<T>(&mut self, outcome: &Result<T, BankError>, latency: Duration) {
        self.total_operations += 1;

        match outcome {
            Ok(_) => self.successful_operations += 1,
            Err(e) if e.money_moved() => self.diverged_operations += 1,
            Err(e) if e.is_storage_fault() => self.storage_faults += 1,
            Err(_) => self.rejected_operations += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples
            .push_back(latency.as_micros().min(u64::MAX as u128) as u64);
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        self.successful_operations as f64 / self.total_operations as f64
    }

    /// Get throughput (operations per second).
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }

        self.total_operations as f64 / elapsed.as_secs_f64()
    }

    /// Serializable summary for the final report.
    pub fn summary(&self, elapsed: Duration) -> SimulationSummary {
        SimulationSummary {
            total_operations: self.total_operations,
            successful_operations: self.successful_operations,
            rejected_operations: self.rejected_operations,
            storage_faults: self.storage_faults,
            diverged_operations: self.diverged_operations,
            success_rate: self.success_rate(),
            throughput_per_sec: self.throughput(elapsed),
            average_latency_us: self.average_latency_us(),
            p50_latency_us: self.p50_latency_us(),
            p99_latency_us: self.p99_latency_us(),
        }
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`SimulationMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub rejected_operations: u64,
    pub storage_faults: u64,
    pub diverged_operations: u64,
    pub success_rate: f64,
    pub throughput_per_sec: f64,
    pub average_latency_us: u64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
}
