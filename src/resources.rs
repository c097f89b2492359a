//! Process resource monitoring and threshold-triggered cleanup.
//!
//! [`ResourceManager`] owns a [`ResourceSampler`] (process memory/cpu/file
//! descriptor readings via `sysinfo`), a connection registry, and a file
//! handle registry. A monitoring timer samples metrics, delivers them to
//! subscribers, and reclaims idle connections whenever a configured threshold
//! is crossed. Overlapping cleanup passes coalesce into one.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, get_current_pid};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Connections inactive for this long are reclaimed by a cleanup pass.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Fallback soft limit when the OS does not expose one.
const DEFAULT_FD_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to resolve current pid: {0}")]
    PidUnavailable(String),
    #[error("current process not visible to the sampler")]
    ProcessNotFound,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryMetrics {
    /// System-wide used memory, in bytes.
    pub heap_used: u64,
    /// System-wide total memory, in bytes.
    pub heap_total: u64,
    /// Resident set size of this process, in bytes.
    pub rss: u64,
    pub heap_used_percent: f64,
    pub rss_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FdMetrics {
    pub allocated: usize,
    pub limit: usize,
    pub percent_used: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub active: usize,
    pub idle: usize,
}

/// Point-in-time snapshot, recomputed on each sample and never persisted.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceMetrics {
    pub memory: MemoryMetrics,
    pub cpu: CpuMetrics,
    pub file_descriptors: FdMetrics,
    pub connections: ConnectionCounts,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryThresholds {
    pub heap_used_percent: f64,
    pub rss_percent: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct FdThresholds {
    pub percent_used: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionThresholds {
    pub max_active: usize,
    pub max_idle: usize,
}

/// Pressure limits; any breach triggers a cleanup pass.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub memory: MemoryThresholds,
    pub file_descriptors: FdThresholds,
    pub connections: ConnectionThresholds,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory: MemoryThresholds {
                heap_used_percent: 90.0,
                rss_percent: 80.0,
            },
            file_descriptors: FdThresholds { percent_used: 90.0 },
            connections: ConnectionThresholds {
                max_active: 100,
                max_idle: 50,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryThresholdsUpdate {
    pub heap_used_percent: Option<f64>,
    pub rss_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FdThresholdsUpdate {
    pub percent_used: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionThresholdsUpdate {
    pub max_active: Option<usize>,
    pub max_idle: Option<usize>,
}

/// Partial threshold change, deep-merged per group: touching one field of a
/// group preserves its siblings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdsUpdate {
    pub memory: Option<MemoryThresholdsUpdate>,
    pub file_descriptors: Option<FdThresholdsUpdate>,
    pub connections: Option<ConnectionThresholdsUpdate>,
}

impl Thresholds {
    fn merge(&mut self, update: ThresholdsUpdate) {
        if let Some(memory) = update.memory {
            if let Some(value) = memory.heap_used_percent {
                self.memory.heap_used_percent = value;
            }
            if let Some(value) = memory.rss_percent {
                self.memory.rss_percent = value;
            }
        }
        if let Some(fds) = update.file_descriptors {
            if let Some(value) = fds.percent_used {
                self.file_descriptors.percent_used = value;
            }
        }
        if let Some(connections) = update.connections {
            if let Some(value) = connections.max_active {
                self.connections.max_active = value;
            }
            if let Some(value) = connections.max_idle {
                self.connections.max_idle = value;
            }
        }
    }
}

/// Reads process-level metrics into a snapshot. Keeps the `sysinfo::System`
/// and pid cached between samples.
pub struct ResourceSampler {
    system: System,
    pid: Pid,
}

impl ResourceSampler {
    pub fn new() -> Result<Self, SampleError> {
        let pid = get_current_pid().map_err(|e| SampleError::PidUnavailable(e.to_string()))?;
        let mut system = System::new();
        system.refresh_memory();
        Ok(Self { system, pid })
    }

    /// Samples memory, cpu, and descriptor readings. `fd_fallback` stands in
    /// for the descriptor count on platforms without `/proc`; only relative
    /// pressure matters.
    pub fn sample(
        &mut self,
        fd_fallback: usize,
    ) -> Result<(MemoryMetrics, CpuMetrics, FdMetrics), SampleError> {
        self.system.refresh_memory();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let process = self
            .system
            .process(self.pid)
            .ok_or(SampleError::ProcessNotFound)?;

        let heap_total = self.system.total_memory().max(1);
        let heap_used = self.system.used_memory();
        let rss = process.memory();
        let memory = MemoryMetrics {
            heap_used,
            heap_total,
            rss,
            heap_used_percent: heap_used as f64 / heap_total as f64 * 100.0,
            rss_percent: rss as f64 / heap_total as f64 * 100.0,
        };
        let cpu = CpuMetrics {
            usage_percent: f64::from(process.cpu_usage()),
        };

        let (allocated, limit) = descriptor_usage(fd_fallback);
        let fds = FdMetrics {
            allocated,
            limit,
            percent_used: allocated as f64 / limit.max(1) as f64 * 100.0,
        };
        Ok((memory, cpu, fds))
    }
}

#[cfg(target_os = "linux")]
fn descriptor_usage(fallback: usize) -> (usize, usize) {
    let allocated = std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(fallback);
    let limit = std::fs::read_to_string("/proc/self/limits")
        .ok()
        .and_then(|limits| {
            limits
                .lines()
                .find(|line| line.starts_with("Max open files"))
                .and_then(|line| line.split_whitespace().nth(3))
                .and_then(|soft| soft.parse().ok())
        })
        .unwrap_or(DEFAULT_FD_LIMIT);
    (allocated, limit)
}

#[cfg(not(target_os = "linux"))]
fn descriptor_usage(fallback: usize) -> (usize, usize) {
    (fallback, DEFAULT_FD_LIMIT)
}

/// Hook invoked once per reclaimed connection, before it leaves the registry.
/// A failure is logged and the cleanup pass continues with the rest.
#[async_trait]
pub trait ConnectionReaper: Send + Sync {
    async fn reclaim(&self, id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct ConnectionState {
    is_active: bool,
    last_activity: Instant,
}

#[derive(Default)]
struct Registries {
    connections: HashMap<String, ConnectionState>,
    file_handles: HashSet<String>,
}

impl Registries {
    fn connection_counts(&self) -> ConnectionCounts {
        let active = self
            .connections
            .values()
            .filter(|state| state.is_active)
            .count();
        ConnectionCounts {
            active,
            idle: self.connections.len() - active,
        }
    }
}

/// Identifies a metrics subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type MetricsCallback = Box<dyn Fn(&ResourceMetrics) + Send + Sync>;

struct ManagerInner {
    registries: RwLock<Registries>,
    thresholds: RwLock<Thresholds>,
    sampler: std::sync::Mutex<ResourceSampler>,
    subscribers: std::sync::RwLock<Vec<(SubscriptionId, MetricsCallback)>>,
    next_subscriber: AtomicU64,
    latest: std::sync::RwLock<Option<ResourceMetrics>>,
    reaper: std::sync::RwLock<Option<Arc<dyn ConnectionReaper>>>,
    /// Pass guard + generation: overlapping cleanup callers wait here, then
    /// discover a pass already ran and attach to its outcome.
    cleanup_pass: Mutex<()>,
    cleanup_generation: AtomicU64,
    last_reclaimed: AtomicU64,
    idle_timeout: Duration,
}

/// Orchestrates the sampler and registries: periodic sampling, metric
/// delivery, and threshold-triggered, coalesced cleanup.
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new(thresholds: Thresholds) -> Result<Self, SampleError> {
        Self::with_idle_timeout(thresholds, IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        thresholds: Thresholds,
        idle_timeout: Duration,
    ) -> Result<Self, SampleError> {
        let sampler = ResourceSampler::new()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                registries: RwLock::new(Registries::default()),
                thresholds: RwLock::new(thresholds),
                sampler: std::sync::Mutex::new(sampler),
                subscribers: std::sync::RwLock::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                latest: std::sync::RwLock::new(None),
                reaper: std::sync::RwLock::new(None),
                cleanup_pass: Mutex::new(()),
                cleanup_generation: AtomicU64::new(0),
                last_reclaimed: AtomicU64::new(0),
                idle_timeout,
            }),
            monitor: std::sync::Mutex::new(None),
        })
    }

    /// Begins periodic sampling. A second call while running is a no-op.
    /// Each tick samples, emits a snapshot to subscribers, then checks
    /// thresholds; failures inside a tick are logged and never stop the loop.
    pub fn start_monitoring(&self, interval: Duration) {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            tracing::debug!("resource monitor already running");
            return;
        }
        tracing::info!(?interval, "starting resource monitor");
        let inner = Arc::clone(&self.inner);
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.tick().await;
            }
        }));
    }

    /// Cancels the monitoring timer; safe to call when never started.
    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
            tracing::info!("resource monitor stopped");
        }
    }

    fn is_monitoring(&self) -> bool {
        self.monitor.lock().unwrap().is_some()
    }

    /// Latest snapshot while monitoring; computed on demand otherwise.
    pub async fn get_metrics(&self) -> Result<ResourceMetrics, SampleError> {
        if self.is_monitoring() {
            if let Some(latest) = *self.inner.latest.read().unwrap() {
                return Ok(latest);
            }
        }
        self.inner.collect_metrics().await
    }

    /// Adds `id` to the tracked handle set; duplicates are no-ops.
    pub async fn register_file_handle(&self, id: impl Into<String>) {
        self.inner
            .registries
            .write()
            .await
            .file_handles
            .insert(id.into());
    }

    /// Removes `id` from the tracked handle set; unknown ids are no-ops.
    pub async fn unregister_file_handle(&self, id: &str) {
        self.inner.registries.write().await.file_handles.remove(id);
    }

    pub async fn register_connection(&self, id: impl Into<String>, is_active: bool) {
        self.inner.registries.write().await.connections.insert(
            id.into(),
            ConnectionState {
                is_active,
                last_activity: Instant::now(),
            },
        );
    }

    /// Flips a known connection's activity state and refreshes its activity
    /// timestamp. Unknown ids are ignored.
    pub async fn update_connection(&self, id: &str, is_active: bool) {
        let mut registries = self.inner.registries.write().await;
        if let Some(state) = registries.connections.get_mut(id) {
            state.is_active = is_active;
            state.last_activity = Instant::now();
        } else {
            tracing::trace!(connection = id, "update for unregistered connection ignored");
        }
    }

    pub async fn unregister_connection(&self, id: &str) {
        self.inner.registries.write().await.connections.remove(id);
    }

    pub async fn connection_counts(&self) -> ConnectionCounts {
        self.inner.registries.read().await.connection_counts()
    }

    /// Reclaims connections idle past the idle timeout and returns how many
    /// were removed. With `force`, runs regardless of current pressure.
    /// Overlapping callers coalesce onto a single underlying pass and never
    /// double-evict. Per-connection reclaim failures are logged and skipped;
    /// the call itself never fails.
    pub async fn cleanup(&self, force: bool) -> u64 {
        self.inner.run_cleanup(force).await
    }

    /// Compares a fresh snapshot against the thresholds and triggers a
    /// cleanup pass on any breach. Sampling errors are logged, never raised.
    pub async fn check_thresholds(&self) {
        match self.inner.collect_metrics().await {
            Ok(metrics) => {
                if let Some(reason) = self.inner.breached(&metrics).await {
                    tracing::info!(reason, "resource threshold exceeded");
                    self.inner.run_cleanup(false).await;
                }
            }
            Err(err) => tracing::warn!(%err, "threshold check skipped: sampling failed"),
        }
    }

    /// Deep-merges a partial threshold change per group, preserving
    /// untouched sibling fields.
    pub async fn update_thresholds(&self, update: ThresholdsUpdate) {
        self.inner.thresholds.write().await.merge(update);
    }

    pub async fn thresholds(&self) -> Thresholds {
        *self.inner.thresholds.read().await
    }

    /// Subscribes to `metrics` snapshots emitted by the monitoring timer.
    /// One subscriber panicking never suppresses delivery to the others.
    pub fn on_metrics(
        &self,
        callback: impl Fn(&ResourceMetrics) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .unwrap()
            .push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .subscribers
            .write()
            .unwrap()
            .retain(|(subscriber, _)| *subscriber != id);
    }

    /// Installs the hook run for each connection a cleanup pass reclaims.
    pub fn set_reaper(&self, reaper: Arc<dyn ConnectionReaper>) {
        *self.inner.reaper.write().unwrap() = Some(reaper);
    }

    /// Stops monitoring, removes all subscribers, and clears both
    /// registries. Safe to call repeatedly or before any start.
    pub async fn destroy(&self) {
        self.stop_monitoring();
        self.inner.subscribers.write().unwrap().clear();
        let mut registries = self.inner.registries.write().await;
        registries.connections.clear();
        registries.file_handles.clear();
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl ManagerInner {
    async fn tick(&self) {
        let metrics = match self.collect_metrics().await {
            Ok(metrics) => metrics,
            Err(err) => {
                tracing::warn!(%err, "resource sampling failed; monitor stays alive");
                return;
            }
        };
        *self.latest.write().unwrap() = Some(metrics);
        self.emit(&metrics);
        if let Some(reason) = self.breached(&metrics).await {
            tracing::info!(reason, "resource threshold exceeded");
            self.run_cleanup(false).await;
        }
    }

    async fn collect_metrics(&self) -> Result<ResourceMetrics, SampleError> {
        let (connections, handle_count) = {
            let registries = self.registries.read().await;
            (
                registries.connection_counts(),
                registries.file_handles.len(),
            )
        };
        let (memory, cpu, file_descriptors) = {
            let mut sampler = self.sampler.lock().unwrap();
            sampler.sample(handle_count)?
        };
        Ok(ResourceMetrics {
            memory,
            cpu,
            file_descriptors,
            connections,
        })
    }

    fn emit(&self, metrics: &ResourceMetrics) {
        let subscribers = self.subscribers.read().unwrap();
        for (id, callback) in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(metrics))).is_err() {
                tracing::warn!(subscriber = id.0, "metrics subscriber panicked");
            }
        }
    }

    async fn breached(&self, metrics: &ResourceMetrics) -> Option<&'static str> {
        let thresholds = self.thresholds.read().await;
        if metrics.memory.heap_used_percent > thresholds.memory.heap_used_percent {
            return Some("memory.heap_used_percent");
        }
        if metrics.memory.rss_percent > thresholds.memory.rss_percent {
            return Some("memory.rss_percent");
        }
        if metrics.file_descriptors.percent_used > thresholds.file_descriptors.percent_used {
            return Some("file_descriptors.percent_used");
        }
        if metrics.connections.active > thresholds.connections.max_active {
            return Some("connections.max_active");
        }
        if metrics.connections.idle > thresholds.connections.max_idle {
            return Some("connections.max_idle");
        }
        None
    }

    async fn run_cleanup(&self, force: bool) -> u64 {
        let generation = self.cleanup_generation.load(Ordering::Acquire);
        let _pass = self.cleanup_pass.lock().await;
        if self.cleanup_generation.load(Ordering::Acquire) != generation {
            // A pass finished while we waited; attach to its outcome.
            return self.last_reclaimed.load(Ordering::Acquire);
        }

        let stale: Vec<String> = {
            let registries = self.registries.read().await;
            registries
                .connections
                .iter()
                .filter(|(_, state)| {
                    !state.is_active && state.last_activity.elapsed() >= self.idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        let reaper = self.reaper.read().unwrap().clone();
        let mut reclaimed = 0u64;
        for id in stale {
            if let Some(reaper) = reaper.as_ref() {
                if let Err(err) = reaper.reclaim(&id).await {
                    tracing::warn!(connection = %id, %err, "reclaim hook failed; dropping registration anyway");
                }
            }
            if self.registries.write().await.connections.remove(&id).is_some() {
                reclaimed += 1;
            }
        }
        tracing::debug!(reclaimed, force, "cleanup pass finished");
        self.last_reclaimed.store(reclaimed, Ordering::Release);
        self.cleanup_generation.fetch_add(1, Ordering::AcqRel);
        reclaimed
    }
}
