//! End-to-end tests driving the pool and auto-scaler against in-memory
//! queues, the way an embedder wires the crate together.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use loadshift::cache::MemoryCache;
use loadshift::queue::{MemoryJobQueue, QueueBackend};
use loadshift::registry::JobTypeSpec;
use loadshift::scaler::AutoScaler;
use loadshift::{
    HandlerError, Job, JobContext, JobHandler, JobTypeRegistry, MetricsSink, Settings,
    SystemMetricsSource, SystemSnapshot, WorkerPool,
};

struct CountingHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn run(
        &self,
        payload: &serde_json::Value,
        _ctx: &JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"echo": payload}))
    }
}

struct BlockingHandler;

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn run(
        &self,
        payload: &serde_json::Value,
        _ctx: &JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(payload.clone())
    }
}

#[derive(Debug)]
struct CalmSystem;

impl SystemMetricsSource for CalmSystem {
    fn sample(&self) -> io::Result<SystemSnapshot> {
        Ok(SystemSnapshot {
            cpu_usage: 0.3,
            memory_usage: 0.3,
            load_average: 0.5,
            cpu_cores: 8,
        })
    }
}

fn fast_settings() -> Settings {
    // RUST_LOG=loadshift=debug surfaces worker and scaler activity.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mut settings = Settings::default();
    settings.poll_interval = Duration::from_millis(50);
    settings.shutdown_timeout = Duration::from_secs(5);
    settings
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn identical_jobs_share_one_cached_execution() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = JobTypeRegistry::new();
    registry
        .register(
            JobTypeSpec::new(
                "deep_research",
                Arc::new(CountingHandler {
                    calls: Arc::clone(&calls),
                }),
            )
            .with_cache_key(|payload| {
                payload
                    .get("topic")
                    .and_then(|t| t.as_str())
                    .map(|t| format!("research:{t}"))
            })
            .with_ttl(Duration::from_secs(3600)),
        )
        .expect("register type");

    let pool = Arc::new(
        WorkerPool::new(
            fast_settings(),
            registry,
            Arc::new(MemoryCache::new()),
            Arc::new(MetricsSink::new().expect("sink")),
        )
        .expect("pool"),
    );
    let queue = MemoryJobQueue::new("research");
    pool.register_queue(Arc::new(queue.clone()))
        .await
        .expect("register queue");

    // Same topic twice: the second execution must come from the cache.
    queue
        .enqueue(Job::new("research", "deep_research", json!({"topic": "rust"})))
        .await
        .expect("enqueue");
    wait_until(|| async {
        queue
            .job_counts()
            .await
            .map(|c| c.completed == 1)
            .unwrap_or(false)
    })
    .await;

    queue
        .enqueue(Job::new("research", "deep_research", json!({"topic": "rust"})))
        .await
        .expect("enqueue");
    wait_until(|| async {
        queue
            .job_counts()
            .await
            .map(|c| c.completed == 2)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn backlogged_queue_scales_up_through_the_control_loop() {
    let mut registry = JobTypeRegistry::new();
    registry
        .register(JobTypeSpec::new("hold", Arc::new(BlockingHandler)))
        .expect("register type");

    let mut settings = fast_settings();
    settings.breaker.call_timeout = Duration::from_secs(60);
    settings.scaling.check_interval = Duration::from_millis(50);

    let metrics = Arc::new(MetricsSink::new().expect("sink"));
    let pool = Arc::new(
        WorkerPool::new(
            settings.clone(),
            registry,
            Arc::new(MemoryCache::new()),
            Arc::clone(&metrics),
        )
        .expect("pool"),
    );
    let queue = MemoryJobQueue::new("research");
    pool.register_queue(Arc::new(queue.clone()))
        .await
        .expect("register queue");

    let scaler = Arc::new(AutoScaler::new(
        settings.scaling.clone(),
        Arc::clone(&pool),
        Arc::new(CalmSystem),
        Arc::clone(&metrics),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scaler_task = Arc::clone(&scaler).spawn(shutdown_rx);

    // A deep backlog of jobs that have already waited 45s: queue size and
    // average wait both fire, independent of tick alignment.
    for _ in 0..60 {
        let mut job = Job::new("research", "hold", json!({}));
        job.enqueued_at = chrono::Utc::now() - chrono::Duration::seconds(45);
        queue.enqueue(job).await.expect("enqueue");
    }

    wait_until(|| async { pool.worker_count("research").unwrap_or(0) == 3 }).await;

    // The exported metrics reflect the action.
    let exported = metrics.export();
    assert!(exported.contains("loadshift_scaling_actions_total"));

    shutdown_tx.send(true).expect("signal scaler");
    scaler_task.await.expect("scaler task");
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn recommendations_surface_without_acting() {
    let mut registry = JobTypeRegistry::new();
    registry
        .register(JobTypeSpec::new("hold", Arc::new(BlockingHandler)))
        .expect("register type");

    let mut settings = fast_settings();
    settings.breaker.call_timeout = Duration::from_secs(60);

    let pool = Arc::new(
        WorkerPool::new(
            settings.clone(),
            registry,
            Arc::new(MemoryCache::new()),
            Arc::new(MetricsSink::new().expect("sink")),
        )
        .expect("pool"),
    );
    pool.register_queue(Arc::new(MemoryJobQueue::new("writer")))
        .await
        .expect("register queue");

    let scaler = AutoScaler::new(
        settings.scaling.clone(),
        Arc::clone(&pool),
        Arc::new(CalmSystem),
        Arc::new(MetricsSink::new().expect("sink")),
    );

    let recs = scaler.recommendations().await;
    assert_eq!(recs.queues.len(), 1);
    assert_eq!(recs.queues[0].queue, "writer");
    assert!(recs.warnings.is_empty());
    // Advisory only: the pool is untouched.
    assert_eq!(pool.worker_count("writer").expect("count"), 1);

    pool.shutdown().await.expect("shutdown");
}
