//! Orthogonal resource monitor. Samples process/system readings on a
//! periodic tick and invokes a caller-registered callback when a hard cap
//! is breached. The limiter knows nothing about the crawler: "trigger
//! shutdown" means calling the callback, nothing more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::config::ResourceLimiterConfig;

pub type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// One sample of the monitored readings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub system_memory_percent: f32,
    pub cpu_percent: f32,
    pub process_memory_mb: u64,
    pub alive_tasks: usize,
}

/// Which hard cap a sample breached. Checks run in this order; the first
/// breach wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    SystemMemory,
    Cpu,
    ProcessMemory,
    Tasks,
}

impl Breach {
    fn as_str(&self) -> &'static str {
        match self {
            Breach::SystemMemory => "system memory",
            Breach::Cpu => "cpu",
            Breach::ProcessMemory => "process memory",
            Breach::Tasks => "alive tasks",
        }
    }
}

/// Evaluate a sample against the caps. A cap of zero disables its check.
fn evaluate(cfg: &ResourceLimiterConfig, sample: &ResourceSample) -> Option<Breach> {
    if cfg.max_system_memory_percent > 0.0
        && sample.system_memory_percent > cfg.max_system_memory_percent
    {
        return Some(Breach::SystemMemory);
    }
    if cfg.max_cpu_percent > 0.0 && sample.cpu_percent > cfg.max_cpu_percent {
        return Some(Breach::Cpu);
    }
    if cfg.max_process_memory_mb > 0 && sample.process_memory_mb > cfg.max_process_memory_mb {
        return Some(Breach::ProcessMemory);
    }
    if cfg.max_alive_tasks > 0 && sample.alive_tasks > cfg.max_alive_tasks {
        return Some(Breach::Tasks);
    }
    None
}

/// Dimensions sitting above their warning fraction. Same order and
/// zero-disables rule as [`evaluate`]; a disabled cap never warns.
fn pressure_warnings(cfg: &ResourceLimiterConfig, sample: &ResourceSample) -> Vec<Breach> {
    let frac = cfg.warning_fraction as f32;
    let mut pressured = Vec::new();
    if cfg.max_system_memory_percent > 0.0
        && sample.system_memory_percent > cfg.max_system_memory_percent * frac
    {
        pressured.push(Breach::SystemMemory);
    }
    if cfg.max_cpu_percent > 0.0 && sample.cpu_percent > cfg.max_cpu_percent * frac {
        pressured.push(Breach::Cpu);
    }
    if cfg.max_process_memory_mb > 0
        && sample.process_memory_mb as f64 > cfg.max_process_memory_mb as f64 * cfg.warning_fraction
    {
        pressured.push(Breach::ProcessMemory);
    }
    if cfg.max_alive_tasks > 0
        && sample.alive_tasks as f64 > cfg.max_alive_tasks as f64 * cfg.warning_fraction
    {
        pressured.push(Breach::Tasks);
    }
    pressured
}

/// Log-only warnings at a fraction of each cap.
fn warn_on_pressure(cfg: &ResourceLimiterConfig, sample: &ResourceSample) {
    for dimension in pressure_warnings(cfg, sample) {
        match dimension {
            Breach::SystemMemory => warn!(
                system_memory_percent = sample.system_memory_percent,
                cap = cfg.max_system_memory_percent,
                "system memory approaching cap"
            ),
            Breach::Cpu => warn!(
                cpu_percent = sample.cpu_percent,
                cap = cfg.max_cpu_percent,
                "cpu approaching cap"
            ),
            Breach::ProcessMemory => warn!(
                process_memory_mb = sample.process_memory_mb,
                cap = cfg.max_process_memory_mb,
                "process memory approaching cap"
            ),
            Breach::Tasks => warn!(
                alive_tasks = sample.alive_tasks,
                cap = cfg.max_alive_tasks,
                "task count approaching cap"
            ),
        }
    }
}

pub struct ResourceLimiter {
    cfg: ResourceLimiterConfig,
    callback: std::sync::RwLock<Option<ShutdownCallback>>,
    running: AtomicBool,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResourceLimiter {
    pub fn new(cfg: ResourceLimiterConfig) -> Self {
        Self {
            cfg,
            callback: std::sync::RwLock::new(None),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Register the shutdown callback invoked on a breach.
    pub fn set_shutdown_callback(&self, cb: ShutdownCallback) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = Some(cb);
        }
    }

    /// Start the periodic monitor. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        let limiter = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(limiter.cfg.check_interval_secs.max(1));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would sample before CPU counters
            // have a baseline; skip it.
            ticker.tick().await;

            let mut sys = System::new();
            let pid = sysinfo::get_current_pid().ok();
            let mut last_breach: Option<Breach> = None;

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = collect_sample(&mut sys, pid);
                        debug!(?sample, "resource sample");
                        match evaluate(&limiter.cfg, &sample) {
                            Some(breach) => {
                                if last_breach != Some(breach) {
                                    error!(kind = breach.as_str(), ?sample, "resource cap breached, triggering shutdown");
                                    limiter.trigger();
                                }
                                last_breach = Some(breach);
                            }
                            None => {
                                warn_on_pressure(&limiter.cfg, &sample);
                                last_breach = None;
                            }
                        }
                    }
                }
            }
        });

        *self.task.lock().await = Some((token, handle));
    }

    /// Stop the monitor. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((token, handle)) = self.task.lock().await.take() {
            token.cancel();
            let _ = handle.await;
        }
    }

    fn trigger(&self) {
        let cb = self
            .callback
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().cloned());
        if let Some(cb) = cb {
            cb();
        }
    }
}

fn collect_sample(sys: &mut System, pid: Option<Pid>) -> ResourceSample {
    sys.refresh_memory();
    sys.refresh_cpu_usage();
    if let Some(pid) = pid {
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    }

    let total = sys.total_memory();
    let system_memory_percent = if total > 0 {
        (sys.used_memory() as f64 / total as f64 * 100.0) as f32
    } else {
        0.0
    };
    let process_memory_mb = pid
        .and_then(|p| sys.process(p))
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0);
    let alive_tasks = tokio::runtime::Handle::try_current()
        .map(|h| h.metrics().num_alive_tasks())
        .unwrap_or(0);

    ResourceSample {
        system_memory_percent,
        cpu_percent: sys.global_cpu_usage(),
        process_memory_mb,
        alive_tasks,
    }
}
