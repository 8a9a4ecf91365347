//! Process memory monitoring.
//!
//! A background task samples resident memory on a fixed interval. When the
//! sample crosses either threshold, every registered callback runs in
//! registration order. Callbacks typically clear caches.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// How long `stop` waits for the sampling task to finish.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    /// Resident set size of this process.
    pub rss_bytes: u64,
    /// Physical memory of the machine, when known.
    pub total_bytes: Option<u64>,
}

impl MemorySample {
    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / BYTES_PER_MB
    }

    /// Resident memory as a percentage of system memory.
    pub fn percent(&self) -> Option<f64> {
        self.total_bytes
            .filter(|total| *total > 0)
            .map(|total| self.rss_bytes as f64 / total as f64 * 100.0)
    }
}

/// Source of memory readings.
pub trait MemorySampler: Send + Sync {
    /// `None` when the platform cannot report memory usage.
    fn sample(&self) -> Option<MemorySample>;
}

/// Reads `/proc/self/status` and `/proc/meminfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemorySampler;

/// Value in bytes of a `Key:   1234 kB` line.
fn parse_kb_field(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

impl MemorySampler for ProcMemorySampler {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> Option<MemorySample> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let rss_bytes = parse_kb_field(&status, "VmRSS")?;
        let total_bytes = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_kb_field(&meminfo, "MemTotal"));
        Some(MemorySample {
            rss_bytes,
            total_bytes,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> Option<MemorySample> {
        None
    }
}

/// Memory pressure thresholds. Crossing either one is pressure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryThresholds {
    pub threshold_mb: f64,
    pub threshold_percent: f64,
}

impl MemoryThresholds {
    pub fn is_pressure(&self, sample: &MemorySample) -> bool {
        sample.rss_mb() > self.threshold_mb
            || sample
                .percent()
                .is_some_and(|percent| percent > self.threshold_percent)
    }
}

impl From<&MemoryConfig> for MemoryThresholds {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            threshold_mb: config.threshold_mb,
            threshold_percent: config.threshold_percent,
        }
    }
}

/// Callback run on memory pressure.
pub type PressureCallback = Box<dyn Fn(&MemorySample) -> anyhow::Result<()> + Send + Sync>;

/// Result of one sample-and-dispatch round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryCheck {
    pub sample: MemorySample,
    pub under_pressure: bool,
    /// Callbacks that returned `Ok`.
    pub callbacks_succeeded: usize,
    /// Callbacks that returned an error or panicked.
    pub callbacks_failed: usize,
}

struct MonitorInner {
    sampler: Box<dyn MemorySampler>,
    thresholds: MemoryThresholds,
    callbacks: RwLock<Vec<(String, PressureCallback)>>,
    pressure_events: AtomicU64,
}

impl MonitorInner {
    fn check(&self) -> Option<MemoryCheck> {
        let sample = self.sampler.sample()?;
        let under_pressure = self.thresholds.is_pressure(&sample);
        let mut check = MemoryCheck {
            sample,
            under_pressure,
            callbacks_succeeded: 0,
            callbacks_failed: 0,
        };
        if !under_pressure {
            return Some(check);
        }

        self.pressure_events.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Memory pressure: rss={:.1}MB ({}), running cleanup callbacks",
            sample.rss_mb(),
            sample
                .percent()
                .map_or_else(|| "unknown share".to_string(), |p| format!("{p:.1}%"))
        );

        let callbacks = self.callbacks.read();
        for (name, callback) in callbacks.iter() {
            match catch_unwind(AssertUnwindSafe(|| callback(&sample))) {
                Ok(Ok(())) => {
                    debug!("Memory callback {name} completed");
                    check.callbacks_succeeded += 1;
                }
                Ok(Err(e)) => {
                    error!("Memory callback {name} failed: {e:#}");
                    check.callbacks_failed += 1;
                }
                Err(_) => {
                    error!("Memory callback {name} panicked");
                    check.callbacks_failed += 1;
                }
            }
        }
        Some(check)
    }
}

/// Background memory monitor.
pub struct MemoryMonitor {
    inner: Arc<MonitorInner>,
    interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MemoryMonitor {
    /// Monitor backed by `/proc`.
    pub fn new(thresholds: MemoryThresholds, interval: Duration) -> Self {
        Self::with_sampler(thresholds, interval, ProcMemorySampler)
    }

    pub fn with_sampler(
        thresholds: MemoryThresholds,
        interval: Duration,
        sampler: impl MemorySampler + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                sampler: Box::new(sampler),
                thresholds,
                callbacks: RwLock::new(Vec::new()),
                pressure_events: AtomicU64::new(0),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            config.into(),
            Duration::from_secs(config.check_interval_secs),
        )
    }

    /// Add a callback. Callbacks must not register further callbacks.
    pub fn register_callback(&self, name: impl Into<String>, callback: PressureCallback) {
        let name = name.into();
        debug!("Registered memory callback {name}");
        self.inner.callbacks.write().push((name, callback));
    }

    /// Remove every callback, returning how many there were.
    pub fn clear_callbacks(&self) -> usize {
        let mut callbacks = self.inner.callbacks.write();
        let count = callbacks.len();
        callbacks.clear();
        count
    }

    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.read().len()
    }

    /// Total pressure events seen so far.
    pub fn pressure_events(&self) -> u64 {
        self.inner.pressure_events.load(Ordering::Relaxed)
    }

    /// Sample once and dispatch callbacks if under pressure.
    pub fn check_now(&self) -> Option<MemoryCheck> {
        self.inner.check()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Spawn the sampling task. Must be called inside a tokio runtime.
    ///
    /// Returns `false` if the monitor is already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = Arc::clone(&self.inner);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if inner.check().is_none() {
                            debug!("Memory sample unavailable on this platform");
                        }
                    }
                }
            }
            debug!("Memory monitor task exited");
        });

        info!("Memory monitor started (interval {period:?})");
        *task = Some((token, handle));
        true
    }

    /// Cancel the sampling task and wait for it to finish.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.task.lock().take() else {
            return;
        };
        token.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => info!("Memory monitor stopped"),
            Ok(Err(e)) => warn!("Memory monitor task failed: {e}"),
            Err(_) => warn!("Memory monitor did not stop within {STOP_TIMEOUT:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    struct FixedSampler(MemorySample);

    impl MemorySampler for FixedSampler {
        fn sample(&self) -> Option<MemorySample> {
            Some(self.0)
        }
    }

    const MB: u64 = 1024 * 1024;

    fn thresholds() -> MemoryThresholds {
        MemoryThresholds {
            threshold_mb: 100.0,
            threshold_percent: 50.0,
        }
    }

    fn monitor(rss_mb: u64, total_mb: Option<u64>) -> MemoryMonitor {
        MemoryMonitor::with_sampler(
            thresholds(),
            Duration::from_millis(10),
            FixedSampler(MemorySample {
                rss_bytes: rss_mb * MB,
                total_bytes: total_mb.map(|t| t * MB),
            }),
        )
    }

    #[test]
    fn test_either_threshold_is_pressure() {
        let t = thresholds();
        let sample = |rss: u64, total: Option<u64>| MemorySample {
            rss_bytes: rss * MB,
            total_bytes: total.map(|v| v * MB),
        };

        assert!(!t.is_pressure(&sample(50, Some(1000))));
        // Absolute threshold alone.
        assert!(t.is_pressure(&sample(150, Some(10_000))));
        // Relative threshold alone.
        assert!(t.is_pressure(&sample(80, Some(100))));
        assert!(!t.is_pressure(&sample(80, None)));
    }

    #[test]
    fn test_failing_callbacks_do_not_stop_others() {
        let monitor = monitor(500, None);
        let calls = Arc::new(AtomicUsize::new(0));

        monitor.register_callback(
            "error",
            Box::new(|_: &MemorySample| -> anyhow::Result<()> { anyhow::bail!("boom") }),
        );
        monitor.register_callback(
            "panic",
            Box::new(|_: &MemorySample| -> anyhow::Result<()> { panic!("callback panic") }),
        );
        let counter = Arc::clone(&calls);
        monitor.register_callback(
            "count",
            Box::new(move |_: &MemorySample| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let check = monitor.check_now().unwrap();
        assert!(check.under_pressure);
        assert_eq!(check.callbacks_failed, 2);
        assert_eq!(check.callbacks_succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.pressure_events(), 1);
    }

    #[test]
    fn test_no_callbacks_without_pressure() {
        let monitor = monitor(10, Some(1000));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        monitor.register_callback(
            "count",
            Box::new(move |_: &MemorySample| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let check = monitor.check_now().unwrap();
        assert!(!check.under_pressure);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.clear_callbacks(), 1);
        assert_eq!(monitor.callback_count(), 0);
    }

    #[test]
    fn test_parse_kb_field() {
        let status = "Name:\tragcore\nVmPeak:\t  2048 kB\nVmRSS:\t  1024 kB\n";
        assert_eq!(parse_kb_field(status, "VmRSS"), Some(1024 * 1024));
        assert_eq!(parse_kb_field(status, "MemTotal"), None);
    }

    #[tokio::test]
    async fn test_background_task_runs_and_stops() {
        let monitor = monitor(500, None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        monitor.register_callback(
            "count",
            Box::new(move |_: &MemorySample| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(monitor.start());
        assert!(!monitor.start());
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;

        assert!(!monitor.is_running());
        let seen = calls.load(Ordering::SeqCst);
        assert!(seen >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
