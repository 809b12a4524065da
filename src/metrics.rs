//! Prometheus-backed metrics sink.
//!
//! The sink is a constructed service owning its own `Registry`; the
//! bootstrap builds one and hands `Arc<MetricsSink>` to the worker pool
//! and the auto-scaler. Embedders exposing a `/metrics` endpoint serve
//! [`MetricsSink::export`].

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

use crate::breaker::CircuitState;
use crate::job::JobStatus;

/// Metrics recorded by the worker pool, processors, and auto-scaler.
pub struct MetricsSink {
    registry: Registry,
    jobs_total: CounterVec,
    job_duration: HistogramVec,
    errors_total: CounterVec,
    scaling_actions_total: CounterVec,
    queue_depth: GaugeVec,
    worker_count: GaugeVec,
    worker_utilization: GaugeVec,
    circuit_state: GaugeVec,
    cache_events_total: CounterVec,
}

impl std::fmt::Debug for MetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSink").finish_non_exhaustive()
    }
}

impl MetricsSink {
    /// Creates a sink with all metrics registered on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_total = CounterVec::new(
            Opts::new("loadshift_jobs_total", "Jobs processed by terminal status"),
            &["queue", "job_type", "status"],
        )?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "loadshift_job_duration_seconds",
                "Job processing duration in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
            &["queue", "job_type"],
        )?;

        let errors_total = CounterVec::new(
            Opts::new("loadshift_errors_total", "Errors by kind"),
            &["kind", "queue"],
        )?;

        let scaling_actions_total = CounterVec::new(
            Opts::new("loadshift_scaling_actions_total", "Scaling actions taken"),
            &["queue", "direction"],
        )?;

        let queue_depth = GaugeVec::new(
            Opts::new("loadshift_queue_depth", "Waiting plus active jobs"),
            &["queue"],
        )?;

        let worker_count = GaugeVec::new(
            Opts::new("loadshift_worker_count", "Workers currently running"),
            &["queue"],
        )?;

        let worker_utilization = GaugeVec::new(
            Opts::new(
                "loadshift_worker_utilization",
                "Active jobs over concurrency capacity",
            ),
            &["queue"],
        )?;

        let circuit_state = GaugeVec::new(
            Opts::new(
                "loadshift_circuit_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["queue"],
        )?;

        let cache_events_total = CounterVec::new(
            Opts::new("loadshift_cache_events_total", "Result cache activity"),
            &["queue", "outcome"],
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(scaling_actions_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(worker_count.clone()))?;
        registry.register(Box::new(worker_utilization.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(cache_events_total.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            job_duration,
            errors_total,
            scaling_actions_total,
            queue_depth,
            worker_count,
            worker_utilization,
            circuit_state,
            cache_events_total,
        })
    }

    /// Records a job's terminal status and, when known, its duration.
    pub fn record_job(
        &self,
        queue: &str,
        job_type: &str,
        status: JobStatus,
        duration_ms: Option<u64>,
    ) {
        self.jobs_total
            .with_label_values(&[queue, job_type, &status.to_string()])
            .inc();
        if let Some(ms) = duration_ms {
            self.job_duration
                .with_label_values(&[queue, job_type])
                .observe(ms as f64 / 1000.0);
        }
    }

    /// Counts an error of the given kind against a queue.
    pub fn record_error(&self, kind: &str, queue: &str) {
        self.errors_total.with_label_values(&[kind, queue]).inc();
    }

    /// Counts a scaling action (`direction` is `up` or `down`).
    pub fn record_scaling_action(&self, queue: &str, direction: &str) {
        self.scaling_actions_total
            .with_label_values(&[queue, direction])
            .inc();
    }

    /// Updates the queue-depth gauge.
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[queue])
            .set(depth as f64);
    }

    /// Updates the worker-count gauge.
    pub fn set_worker_count(&self, queue: &str, workers: usize) {
        self.worker_count
            .with_label_values(&[queue])
            .set(workers as f64);
    }

    /// Updates the utilization gauge.
    pub fn set_worker_utilization(&self, queue: &str, utilization: f64) {
        self.worker_utilization
            .with_label_values(&[queue])
            .set(utilization);
    }

    /// Mirrors a circuit breaker's state into its gauge.
    pub fn update_circuit_breaker_state(&self, queue: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        self.circuit_state.with_label_values(&[queue]).set(value);
    }

    /// Counts a cache event (`outcome` is `hit`, `miss`, or `store`).
    pub fn record_cache_event(&self, queue: &str, outcome: &str) {
        self.cache_events_total
            .with_label_values(&[queue, outcome])
            .inc();
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
