//! Feedback-driven worker scaling.
//!
//! The control loop runs on a fixed interval. Each pass samples system
//! metrics once, then per queue: snapshot, record history, and — given
//! enough samples and an expired cooldown — evaluate the scale-up and
//! scale-down predicates. Decisions move worker counts by at most one
//! configured step and always stay within `[min_workers, max_workers]`.
//!
//! The decision logic itself is a pure function over the snapshot
//! history, the system snapshot, and the current worker count, so every
//! scaling property is testable without timers or queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ScalingConfig;
use crate::metrics::MetricsSink;
use crate::system::{SystemMetricsSource, SystemSnapshot};
use crate::worker::WorkerPool;

use super::history::SnapshotHistory;
use super::sampler::QueueStatsSampler;

/// Outcome of evaluating one queue's scaling predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    /// No action warranted.
    None,
    /// Add `add` workers.
    Up {
        /// How many workers to add (already capped by `max_workers`).
        add: usize,
        /// The load signals that fired.
        reasons: Vec<String>,
    },
    /// Remove `remove` workers.
    Down {
        /// How many workers to remove (already floored by `min_workers`).
        remove: usize,
        /// The idle signals that fired.
        reasons: Vec<String>,
    },
}

/// Read-only scaling advice for one queue.
#[derive(Debug, Clone)]
pub struct QueueRecommendation {
    /// The queue being advised on.
    pub queue: String,
    /// Its current worker count.
    pub workers: usize,
    /// What the scaler would do right now.
    pub decision: ScalingDecision,
}

/// Output of [`AutoScaler::recommendations`].
#[derive(Debug, Clone)]
pub struct Recommendations {
    /// The system snapshot the advice was computed against.
    pub system: SystemSnapshot,
    /// Host-level warnings (resource gates currently closed).
    pub warnings: Vec<String>,
    /// Per-queue advice.
    pub queues: Vec<QueueRecommendation>,
}

#[derive(Default)]
struct ScalerState {
    histories: HashMap<String, SnapshotHistory>,
    last_scaled: HashMap<String, Instant>,
}

/// Periodic control loop reconciling worker counts with observed load.
pub struct AutoScaler {
    config: ScalingConfig,
    pool: Arc<WorkerPool>,
    sampler: QueueStatsSampler,
    system: Arc<dyn SystemMetricsSource>,
    metrics: Arc<MetricsSink>,
    state: Mutex<ScalerState>,
    pass_in_flight: AtomicBool,
}

impl std::fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScaler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AutoScaler {
    /// Creates a scaler over the given pool.
    pub fn new(
        config: ScalingConfig,
        pool: Arc<WorkerPool>,
        system: Arc<dyn SystemMetricsSource>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        let sampler = QueueStatsSampler::new(Arc::clone(&pool));
        Self {
            config,
            pool,
            sampler,
            system,
            metrics,
            state: Mutex::new(ScalerState::default()),
            pass_in_flight: AtomicBool::new(false),
        }
    }

    /// Starts the control loop; it runs until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?self.config.check_interval, "auto-scaler started");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => self.tick().await,
                }
            }
            info!("auto-scaler stopped");
        })
    }

    /// Runs one scaling pass, skipping if a previous pass is in flight.
    pub async fn tick(&self) {
        if self.pass_in_flight.swap(true, Ordering::SeqCst) {
            debug!("scaling pass still in flight, skipping tick");
            return;
        }
        self.run_pass().await;
        self.pass_in_flight.store(false, Ordering::SeqCst);
    }

    async fn run_pass(&self) {
        let system = self.sample_system();

        for queue in self.pool.queue_names() {
            let snapshot = self.sampler.sample(&queue).await;
            self.metrics.set_queue_depth(&queue, snapshot.queue_size());
            self.metrics
                .set_worker_utilization(&queue, snapshot.utilization);

            let workers = match self.pool.worker_count(&queue) {
                Ok(workers) => workers,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "worker count unavailable");
                    continue;
                }
            };

            let decision = {
                let mut state = self.lock();
                let history = state
                    .histories
                    .entry(queue.clone())
                    .or_insert_with(|| SnapshotHistory::new(self.config.history_retention));
                history.push(snapshot);

                let in_cooldown = state
                    .last_scaled
                    .get(&queue)
                    .map(|at| at.elapsed() < self.config.cooldown)
                    .unwrap_or(false);
                if in_cooldown {
                    debug!(queue = %queue, "in scaling cooldown");
                    ScalingDecision::None
                } else {
                    let history = &state.histories[&queue];
                    evaluate(history, &system, workers, &self.config)
                }
            };

            self.apply(&queue, decision);
        }
    }

    fn apply(&self, queue: &str, decision: ScalingDecision) {
        match decision {
            ScalingDecision::None => {}
            ScalingDecision::Up { add, reasons } => {
                info!(queue = %queue, add, reasons = ?reasons, "scaling up");
                let mut added = 0;
                for _ in 0..add {
                    match self.pool.add_worker(queue) {
                        Ok(_) => added += 1,
                        Err(e) => {
                            error!(queue = %queue, error = %e, "failed to add worker");
                            self.metrics.record_error("scale_up_failed", queue);
                            break;
                        }
                    }
                }
                if added > 0 {
                    self.mark_scaled(queue);
                    self.metrics.record_scaling_action(queue, "up");
                }
            }
            ScalingDecision::Down { remove, reasons } => {
                info!(queue = %queue, remove, reasons = ?reasons, "scaling down");
                let mut removed = 0;
                for _ in 0..remove {
                    match self.pool.remove_worker(queue) {
                        Ok(_) => removed += 1,
                        Err(e) => {
                            error!(queue = %queue, error = %e, "failed to remove worker");
                            self.metrics.record_error("scale_down_failed", queue);
                            break;
                        }
                    }
                }
                if removed > 0 {
                    self.mark_scaled(queue);
                    self.metrics.record_scaling_action(queue, "down");
                }
            }
        }
    }

    /// Computes advice without mutating any scaler state.
    ///
    /// Evaluates each queue against a fresh snapshot layered onto a copy
    /// of its history; cooldowns are ignored because nothing executes.
    pub async fn recommendations(&self) -> Recommendations {
        let system = self.sample_system();

        let mut warnings = Vec::new();
        if system.cpu_usage > self.config.cpu_ceiling {
            warnings.push(format!(
                "cpu usage {:.2} above ceiling {:.2}, scale-ups suppressed",
                system.cpu_usage, self.config.cpu_ceiling
            ));
        }
        if system.memory_usage > self.config.memory_limit {
            warnings.push(format!(
                "memory usage {:.2} above limit {:.2}, scale-ups suppressed",
                system.memory_usage, self.config.memory_limit
            ));
        }
        if system.load_average > system.cpu_cores as f64 {
            warnings.push(format!(
                "load average {:.2} exceeds {} cores",
                system.load_average, system.cpu_cores
            ));
        }

        let mut queues = Vec::new();
        for queue in self.pool.queue_names() {
            let snapshot = self.sampler.sample(&queue).await;
            let Ok(workers) = self.pool.worker_count(&queue) else {
                continue;
            };

            let mut history = {
                let state = self.lock();
                state
                    .histories
                    .get(&queue)
                    .cloned()
                    .unwrap_or_else(|| SnapshotHistory::new(self.config.history_retention))
            };
            history.push(snapshot);

            queues.push(QueueRecommendation {
                queue,
                workers,
                decision: evaluate(&history, &system, workers, &self.config),
            });
        }

        Recommendations {
            system,
            warnings,
            queues,
        }
    }

    fn sample_system(&self) -> SystemSnapshot {
        match self.system.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "system sampling failed, assuming high load");
                self.metrics.record_error("system_metrics", "-");
                SystemSnapshot::conservative()
            }
        }
    }

    fn mark_scaled(&self, queue: &str) {
        self.lock()
            .last_scaled
            .insert(queue.to_string(), Instant::now());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScalerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Evaluates the scaling predicates for one queue.
///
/// Scale-up needs resource headroom (CPU and memory both under their
/// gates) plus at least two of three load signals; scale-down needs at
/// least two of three idle signals. Both directions respect the
/// `[min_workers, max_workers]` bounds and return the step already
/// clamped to the remaining headroom.
pub fn evaluate(
    history: &SnapshotHistory,
    system: &SystemSnapshot,
    current_workers: usize,
    config: &ScalingConfig,
) -> ScalingDecision {
    if history.len() < config.min_samples {
        return ScalingDecision::None;
    }
    let Some(latest) = history.latest() else {
        return ScalingDecision::None;
    };

    let headroom = system.cpu_usage <= config.cpu_ceiling
        && system.memory_usage <= config.memory_limit;
    if headroom && current_workers < config.max_workers {
        let mut reasons = Vec::new();
        if latest.queue_size() > config.queue_size_up_threshold {
            reasons.push(format!(
                "queue size {} above {}",
                latest.queue_size(),
                config.queue_size_up_threshold
            ));
        }
        if latest.avg_wait > config.avg_wait_up_threshold {
            reasons.push(format!(
                "average wait {:?} above {:?}",
                latest.avg_wait, config.avg_wait_up_threshold
            ));
        }
        if history.size_increasing(3) {
            reasons.push("queue size rising across last 3 samples".to_string());
        }
        if reasons.len() >= 2 {
            let add = config.scale_up_step.min(config.max_workers - current_workers);
            return ScalingDecision::Up { add, reasons };
        }
    }

    if current_workers > config.min_workers {
        let mut reasons = Vec::new();
        if latest.queue_size() < config.queue_size_down_threshold {
            reasons.push(format!(
                "queue size {} below {}",
                latest.queue_size(),
                config.queue_size_down_threshold
            ));
        }
        if history.idle_for(config.idle_time) {
            reasons.push(format!("no active jobs for {:?}", config.idle_time));
        }
        if latest.utilization < config.utilization_down_threshold {
            reasons.push(format!(
                "utilization {:.2} below {:.2}",
                latest.utilization, config.utilization_down_threshold
            ));
        }
        if reasons.len() >= 2 {
            let remove = config
                .scale_down_step
                .min(current_workers - config.min_workers);
            return ScalingDecision::Down { remove, reasons };
        }
    }

    ScalingDecision::None
}
