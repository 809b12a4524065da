//! Auto-scaling control plane.
//!
//! This module owns everything the scaler needs:
//!
//! - **QueueStatsSampler**: read-only queue snapshots
//! - **SnapshotHistory**: bounded rolling history per queue
//! - **AutoScaler**: the periodic control loop and its pure decision
//!   function, plus read-only recommendations
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────┐  sample   ┌────────────────┐
//!   │ AutoScaler ├──────────▶│ QueueSampler   │──▶ QueueBackend
//!   │  (loop)    │           └────────────────┘
//!   │            ├──────────▶ SystemMetricsSource (/proc)
//!   │            │  evaluate
//!   │            ├──────────▶ SnapshotHistory (per queue)
//!   │            │  apply
//!   │            ├──────────▶ WorkerPool::add_worker / remove_worker
//!   └────────────┘
//! ```

mod autoscaler;
mod history;
mod sampler;

pub use autoscaler::{
    evaluate, AutoScaler, QueueRecommendation, Recommendations, ScalingDecision,
};
pub use history::SnapshotHistory;
pub use sampler::{QueueStatsSampler, QueueSnapshot};
