//! Background monitor
//!
//! A long-lived task that samples the host on a fixed cadence, logs
//! threshold breaches and enforces retention. It is a two-state machine:
//!
//! - `Running`: run one cycle, then pause for the interval.
//! - `ErrorBackoff`: a cycle failed; the failure is logged as a
//!   `BACKGROUND_MONITOR_ERROR` record and the monitor pauses for the
//!   backoff period before returning to `Running`.
//!
//! The monitor only stops when its cancellation token fires. Every pause
//! goes through a [`Pacer`] and is raced against that token.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{MonitorConfig, StorageConfig};
use crate::diagnostics::category;
use crate::error::{EngineError, Result};
use crate::instrument::Engine;
use crate::records::ErrorLevel;

/// Operation name on breach records written by the monitor
pub const BACKGROUND_OPERATION: &str = "background_monitor";

/// Operation name on records of failed cycles
pub const BACKGROUND_FAILURE_OPERATION: &str = "background_monitoring";

/// Sleep abstraction for the monitor's cadence
pub trait Pacer: Send + Sync {
    fn pause(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// Pacer backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPacer;

impl Pacer for TokioPacer {
    fn pause(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Running,
    ErrorBackoff,
    Stopped,
}

/// Cadence and retention limits for the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub backoff: Duration,
    pub check_disk: bool,
    pub max_history_records: usize,
    pub max_error_records: Option<usize>,
}

impl MonitorSettings {
    pub fn from_config(monitor: &MonitorConfig, storage: &StorageConfig) -> Self {
        Self {
            interval: Duration::from_secs(monitor.interval_secs),
            backoff: Duration::from_secs(monitor.backoff_secs),
            check_disk: monitor.check_disk,
            max_history_records: storage.max_history_records,
            max_error_records: storage.max_error_records,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default(), &StorageConfig::default())
    }
}

/// Outcome of one successful cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub breaches: usize,
    pub metrics_evicted: usize,
    pub errors_evicted: usize,
}

/// The background monitor task
pub struct BackgroundMonitor {
    engine: Engine,
    settings: MonitorSettings,
    pacer: Arc<dyn Pacer>,
    cancel: CancellationToken,
    state: watch::Sender<MonitorState>,
}

/// Handle to a spawned monitor
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    state: watch::Receiver<MonitorState>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.clone()
    }

    /// Cancel the monitor and wait for its task to finish
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| EngineError::Monitor(e.to_string()))
    }
}

impl BackgroundMonitor {
    pub fn new(engine: Engine, settings: MonitorSettings, pacer: Arc<dyn Pacer>, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(MonitorState::Running);
        Self {
            engine,
            settings,
            pacer,
            cancel,
            state,
        }
    }

    /// Spawn the monitor on the current runtime
    pub fn spawn(self) -> MonitorHandle {
        let cancel = self.cancel.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());
        MonitorHandle { cancel, state, task }
    }

    /// Drive the state machine until cancelled
    pub async fn run(self) {
        tracing::info!(
            interval = ?self.settings.interval,
            backoff = ?self.settings.backoff,
            "Background monitoring started"
        );

        loop {
            self.state.send_replace(MonitorState::Running);

            let pause = match self.cycle().await {
                Ok(report) => {
                    tracing::debug!(?report, "Background cycle completed");
                    self.settings.interval
                }
                Err(e) => {
                    self.state.send_replace(MonitorState::ErrorBackoff);
                    self.report_failure(&e).await;
                    self.settings.backoff
                }
            };

            let cancelled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => true,
                _ = self.pacer.pause(pause) => false,
            };
            if cancelled {
                break;
            }
        }

        self.state.send_replace(MonitorState::Stopped);
        tracing::info!("Background monitoring stopped");
    }

    /// Run one cycle on the blocking pool. A panic inside the cycle is
    /// reported as a cycle failure.
    async fn cycle(&self) -> Result<CycleReport> {
        let engine = self.engine.clone();
        let settings = self.settings.clone();

        let report = tokio::task::spawn_blocking(move || run_cycle(&engine, &settings))
            .await
            .map_err(|e| EngineError::Monitor(join_error_message(e)))??;

        self.engine.counters().background_cycles.inc();
        Ok(report)
    }

    async fn report_failure(&self, error: &EngineError) {
        self.engine.counters().background_cycles_failed.inc();
        tracing::error!(error = %error, backoff = ?self.settings.backoff, "Background monitor cycle failed");

        let engine = self.engine.clone();
        let message = error.to_string();
        let logged = tokio::task::spawn_blocking(move || {
            engine.log_error(
                category::BACKGROUND_MONITOR_ERROR,
                &message,
                BACKGROUND_FAILURE_OPERATION,
                ErrorLevel::Error,
                None,
            )
        })
        .await;

        match logged {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Could not record background monitor failure"),
            Err(e) => tracing::error!(error = %join_error_message(e), "Could not record background monitor failure"),
        }
    }
}

fn join_error_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("cycle panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("cycle panicked: {}", message)
    } else {
        "cycle panicked".to_string()
    }
}

/// One sample-check-evict pass
pub fn run_cycle(engine: &Engine, settings: &MonitorSettings) -> Result<CycleReport> {
    let snapshot = engine.sample();
    let thresholds = engine.thresholds().snapshot();
    let mut report = CycleReport::default();

    if snapshot.cpu_usage > thresholds.cpu {
        engine.record_breach(
            category::HIGH_CPU_USAGE,
            &format!("System CPU: {:.2}%", snapshot.cpu_usage),
            BACKGROUND_OPERATION,
            None,
        )?;
        report.breaches += 1;
    }

    if snapshot.memory_usage > thresholds.memory {
        engine.record_breach(
            category::HIGH_MEMORY_USAGE,
            &format!("System Memory: {:.2}%", snapshot.memory_usage),
            BACKGROUND_OPERATION,
            None,
        )?;
        report.breaches += 1;
    }

    if settings.check_disk && snapshot.disk_usage > thresholds.disk {
        engine.record_breach(
            category::DISK_SPACE_LOW,
            &format!("System Disk: {:.2}%", snapshot.disk_usage),
            BACKGROUND_OPERATION,
            None,
        )?;
        report.breaches += 1;
    }

    let store = engine.store();
    report.metrics_evicted = store.evict_excess_metrics(settings.max_history_records)?;
    if let Some(max_errors) = settings.max_error_records {
        report.errors_evicted = store.evict_excess_errors(max_errors)?;
    }
    engine
        .counters()
        .record_eviction(report.metrics_evicted + report.errors_evicted);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EngineCounters;
    use crate::sampler::{FixedSampler, SystemSnapshot};
    use crate::storage::RetentionStore;
    use crate::thresholds::ThresholdHandle;

    fn engine(snapshot: SystemSnapshot) -> Engine {
        Engine::new(
            Arc::new(RetentionStore::open_in_memory().unwrap()),
            Arc::new(FixedSampler::new(snapshot)),
            ThresholdHandle::default(),
            EngineCounters::new().unwrap(),
        )
    }

    #[test]
    fn test_cycle_logs_breaches() {
        let engine = engine(SystemSnapshot {
            cpu_usage: 95.0,
            memory_usage: 85.0,
            disk_usage: 95.0,
            ..SystemSnapshot::default()
        });

        let settings = MonitorSettings {
            check_disk: true,
            ..MonitorSettings::default()
        };
        let report = run_cycle(&engine, &settings).unwrap();
        assert_eq!(report.breaches, 3);

        let errors = engine.store().query_errors(10, Some("warning"), None).unwrap();
        let categories: Vec<_> = errors.iter().map(|e| e.category.as_str()).collect();
        assert_eq!(
            categories,
            vec![category::DISK_SPACE_LOW, category::HIGH_MEMORY_USAGE, category::HIGH_CPU_USAGE]
        );
        assert!(errors.iter().all(|e| e.operation_name == BACKGROUND_OPERATION));
        assert_eq!(errors[2].message, "System CPU: 95.00%");
    }

    #[test]
    fn test_cycle_skips_disk_by_default() {
        let engine = engine(SystemSnapshot {
            disk_usage: 99.0,
            ..SystemSnapshot::default()
        });
        let settings = MonitorSettings::default();
        assert!(!settings.check_disk);

        let report = run_cycle(&engine, &settings).unwrap();
        assert_eq!(report.breaches, 0);
        assert_eq!(engine.store().count_errors().unwrap(), 0);
    }

    #[test]
    fn test_cycle_enforces_retention() {
        let engine = engine(SystemSnapshot::default());
        for i in 0..12 {
            let _: std::result::Result<(), String> = engine.instrument(&format!("op{}", i), None, || Ok(()));
        }
        for _ in 0..4 {
            engine.log_error("TEST_ERROR", "manual", "test_error", ErrorLevel::Info, None).unwrap();
        }

        let settings = MonitorSettings {
            max_history_records: 5,
            max_error_records: Some(1),
            ..MonitorSettings::default()
        };
        let report = run_cycle(&engine, &settings).unwrap();
        assert_eq!(report.metrics_evicted, 7);
        assert_eq!(report.errors_evicted, 3);
        assert_eq!(engine.store().count_metrics().unwrap(), 5);
        assert_eq!(engine.store().count_errors().unwrap(), 1);
        assert_eq!(engine.counters().stats().rows_evicted, 10);
    }

    #[test]
    fn test_uncapped_errors_are_kept() {
        let engine = engine(SystemSnapshot::default());
        for _ in 0..4 {
            engine.log_error("TEST_ERROR", "manual", "test_error", ErrorLevel::Info, None).unwrap();
        }
        let report = run_cycle(&engine, &MonitorSettings::default()).unwrap();
        assert_eq!(report.errors_evicted, 0);
        assert_eq!(engine.store().count_errors().unwrap(), 4);
    }
}
