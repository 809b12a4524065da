//! Host resource sampling for the auto-scaler's system gate.
//!
//! Sampling is synchronous and cheap (three small `/proc` reads). When it
//! fails the scaler substitutes [`SystemSnapshot::conservative`], which
//! reads as a fully loaded host and therefore blocks scale-ups rather
//! than risking a runaway.

use std::io;
use std::sync::Mutex;

/// Point-in-time view of host resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSnapshot {
    /// CPU usage as a ratio in `0.0..=1.0`.
    pub cpu_usage: f64,
    /// Memory usage as a ratio in `0.0..=1.0`.
    pub memory_usage: f64,
    /// 1-minute load average.
    pub load_average: f64,
    /// Number of logical CPU cores.
    pub cpu_cores: usize,
}

impl SystemSnapshot {
    /// The high-load fallback used when sampling fails.
    ///
    /// Reports full CPU and memory so the scale-up gate stays shut until
    /// real measurements return.
    pub fn conservative() -> Self {
        let cores = num_cpus::get();
        Self {
            cpu_usage: 1.0,
            memory_usage: 1.0,
            load_average: cores as f64 * 2.0,
            cpu_cores: cores,
        }
    }
}

/// Source of [`SystemSnapshot`]s, injected into the auto-scaler.
pub trait SystemMetricsSource: Send + Sync + std::fmt::Debug {
    /// Samples current host resources.
    fn sample(&self) -> io::Result<SystemSnapshot>;
}

/// Aggregate CPU times from one `/proc/stat` read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// `/proc`-backed metrics source for Linux hosts.
///
/// CPU usage is computed from the delta between consecutive samples; the
/// first sample has no delta and reports full usage, which the scaler's
/// minimum-sample requirement absorbs before any decision is made.
#[derive(Debug, Default)]
pub struct ProcSystemMetrics {
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcSystemMetrics {
    /// Creates a sampler with no CPU baseline yet.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemMetricsSource for ProcSystemMetrics {
    fn sample(&self) -> io::Result<SystemSnapshot> {
        let stat = std::fs::read_to_string("/proc/stat")?;
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let loadavg = std::fs::read_to_string("/proc/loadavg")?;

        let current = parse_cpu_times(&stat)?;
        let cpu_usage = {
            let mut last = self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
            let usage = match *last {
                Some(previous) => cpu_usage_between(previous, current),
                None => 1.0,
            };
            *last = Some(current);
            usage
        };

        Ok(SystemSnapshot {
            cpu_usage,
            memory_usage: parse_memory_usage(&meminfo)?,
            load_average: parse_load_average(&loadavg)?,
            cpu_cores: num_cpus::get(),
        })
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_times(stat: &str) -> io::Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| invalid("no aggregate cpu line in /proc/stat"))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().map_err(|_| invalid("non-numeric cpu field")))
        .collect::<io::Result<_>>()?;
    if fields.len() < 5 {
        return Err(invalid("too few cpu fields in /proc/stat"));
    }

    // idle + iowait count as idle time.
    let idle = fields[3] + fields[4];
    let total = fields.iter().sum();
    Ok(CpuTimes { idle, total })
}

fn cpu_usage_between(previous: CpuTimes, current: CpuTimes) -> f64 {
    let total_delta = current.total.saturating_sub(previous.total);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = current.idle.saturating_sub(previous.idle);
    (1.0 - idle_delta as f64 / total_delta as f64).clamp(0.0, 1.0)
}

/// Computes memory usage from `MemTotal` and `MemAvailable`.
fn parse_memory_usage(meminfo: &str) -> io::Result<f64> {
    let field = |name: &str| -> io::Result<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| invalid("missing field in /proc/meminfo"))
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return Err(invalid("MemTotal is zero"));
    }
    Ok((1.0 - available as f64 / total as f64).clamp(0.0, 1.0))
}

fn parse_load_average(loadavg: &str) -> io::Result<f64> {
    loadavg
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| invalid("unparseable /proc/loadavg"))
}
