//! Service facade
//!
//! [`PerformanceMonitor`] is what a transport layer talks to. It owns the
//! store, the engine and the background monitor, and exposes the
//! operations a request handler needs: authenticate, instrument, read
//! history, read or change thresholds and log manual errors.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::diagnostics::category;
use crate::error::{EngineError, Result};
use crate::instrument::{Engine, FailureKind};
use crate::metrics::EngineCounters;
use crate::monitor::{BackgroundMonitor, MonitorHandle, MonitorSettings, MonitorState, Pacer, TokioPacer};
use crate::records::{ErrorLevel, ErrorRecord, MetricRecord};
use crate::sampler::{HostSampler, Sampler, SystemSnapshot};
use crate::storage::RetentionStore;
use crate::thresholds::{ThresholdHandle, ThresholdSet, ThresholdUpdate};

pub const DEFAULT_METRICS_LIMIT: usize = 100;
pub const DEFAULT_ERRORS_LIMIT: usize = 50;

/// Category written when logging a manual error fails
pub const MANUAL_ERROR_FAILURE: &str = "TEST_ERROR_FAILURE";

const MANUAL_ERROR_OPERATION: &str = "test_error";
const MANUAL_ERROR_MESSAGE: &str = "This is a test error";
const THRESHOLD_OPERATION: &str = "manage_thresholds";
const LOAD_OPERATION: &str = "simulate_load";

/// Longest load simulation a caller may request
pub const MAX_LOAD_DURATION: Duration = Duration::from_secs(10);

/// Values appended per step of a memory-heavy simulation
const MEMORY_LOAD_STEP: usize = 100_000;
/// Squares computed per step of a CPU-heavy simulation
const CPU_LOAD_STEP: u64 = 10_000;
const LOAD_STEP_PAUSE: Duration = Duration::from_millis(10);

/// Liveness report, available without a credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Resource a load simulation exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadKind {
    CpuIntensive,
    MemoryIntensive,
}

/// Outcome of [`PerformanceMonitor::simulate_load`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub message: String,
    pub duration_secs: f64,
    pub kind: LoadKind,
}

/// An authenticated caller. Records written on its behalf carry an owner
/// key derived from the credential id, so two keys sharing a name never
/// see each other's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub credential_id: i64,
    pub name: String,
    owner_key: String,
}

impl Caller {
    pub fn new(credential_id: i64, name: impl Into<String>) -> Self {
        Self {
            credential_id,
            name: name.into(),
            owner_key: format!("key-{}", credential_id),
        }
    }

    pub fn owner_key(&self) -> Option<&str> {
        Some(&self.owner_key)
    }
}

/// The perfwatch service
pub struct PerformanceMonitor {
    config: EngineConfig,
    engine: Engine,
    cancel: CancellationToken,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("database_path", &self.config.storage.database_path)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl PerformanceMonitor {
    /// Open the configured database and sample the real host
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = RetentionStore::open(&config.storage.database_path, config.storage.write_retry.clone())?;
        let sampler = HostSampler::new(Duration::from_millis(config.monitor.cpu_sample_interval_ms));
        Self::with_parts(config, Arc::new(store), Arc::new(sampler))
    }

    /// Assemble from an existing store and sampler
    pub fn with_parts(config: EngineConfig, store: Arc<RetentionStore>, sampler: Arc<dyn Sampler>) -> Result<Self> {
        let thresholds = ThresholdHandle::new(config.thresholds);
        let counters = EngineCounters::new()?;
        let engine = Engine::new(store, sampler, thresholds, counters);

        Ok(Self {
            config,
            engine,
            cancel: CancellationToken::new(),
            monitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<RetentionStore> {
        self.engine.store()
    }

    /// Start the background monitor on the tokio timer
    pub async fn start(&self) -> Result<()> {
        self.start_with_pacer(Arc::new(TokioPacer)).await
    }

    /// Start the background monitor with a custom pacer. Does nothing when
    /// monitoring is disabled or already running.
    pub async fn start_with_pacer(&self, pacer: Arc<dyn Pacer>) -> Result<()> {
        if !self.config.monitor.enabled {
            tracing::info!("Background monitoring disabled");
            return Ok(());
        }

        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return Ok(());
        }

        let settings = MonitorSettings::from_config(&self.config.monitor, &self.config.storage);
        let background = BackgroundMonitor::new(self.engine.clone(), settings, pacer, self.cancel.child_token());
        *monitor = Some(background.spawn());
        Ok(())
    }

    /// Stop the background monitor and wait for it
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.monitor.lock().await.take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    /// Current monitor state, or `None` when it was never started
    pub async fn monitor_state(&self) -> Option<MonitorState> {
        self.monitor.lock().await.as_ref().map(MonitorHandle::state)
    }

    /// Check a presented credential. Missing and invalid credentials are
    /// logged as WARNING `AUTHENTICATION_ERROR` records and denied.
    pub fn authenticate(&self, token: Option<&str>, operation_name: &str) -> Result<Caller> {
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let Some(token) = token else {
            return Err(self.deny("Missing API key", operation_name));
        };

        match self.store().authenticate_credential(token)? {
            Some((id, name)) => Ok(Caller::new(id, name)),
            None => Err(self.deny("Invalid API key", operation_name)),
        }
    }

    fn deny(&self, reason: &str, operation_name: &str) -> EngineError {
        if let Err(e) = self.engine.log_error(
            category::AUTHENTICATION_ERROR,
            reason,
            operation_name,
            ErrorLevel::Warning,
            None,
        ) {
            tracing::error!(error = %e, "Failed to record authentication failure");
        }
        EngineError::AuthenticationDenied {
            reason: reason.to_string(),
        }
    }

    /// Run `body` as an instrumented operation on behalf of `caller`
    pub fn instrument<T, E, F>(&self, operation_name: &str, caller: Option<&Caller>, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: FailureKind + fmt::Display + fmt::Debug,
    {
        self.engine
            .instrument(operation_name, caller.and_then(Caller::owner_key), body)
    }

    pub fn get_system_metrics(&self) -> SystemSnapshot {
        self.engine.sample()
    }

    pub fn get_metrics_history(&self, limit: Option<usize>, caller: Option<&Caller>) -> Result<Vec<MetricRecord>> {
        let limit = limit.unwrap_or(DEFAULT_METRICS_LIMIT);
        Ok(self
            .store()
            .query_metrics(limit, caller.and_then(Caller::owner_key))?)
    }

    pub fn get_errors_history(
        &self,
        limit: Option<usize>,
        level: Option<&str>,
        caller: Option<&Caller>,
    ) -> Result<Vec<ErrorRecord>> {
        let limit = limit.unwrap_or(DEFAULT_ERRORS_LIMIT);
        Ok(self
            .store()
            .query_errors(limit, level, caller.and_then(Caller::owner_key))?)
    }

    pub fn get_thresholds(&self) -> ThresholdSet {
        self.engine.thresholds().snapshot()
    }

    /// Merge a partial update into the live thresholds. A rejected update
    /// leaves every limit unchanged and is logged as a WARNING
    /// `THRESHOLD_UPDATE_ERROR` record.
    pub fn set_thresholds(&self, update: &ThresholdUpdate, caller: Option<&Caller>) -> Result<ThresholdSet> {
        self.engine.thresholds().update(update).map_err(|e| {
            self.record_threshold_failure(&e, caller);
            e
        })
    }

    /// [`Self::set_thresholds`] from loosely typed name/value pairs
    pub fn set_threshold_pairs<'a, I>(&self, pairs: I, caller: Option<&Caller>) -> Result<ThresholdSet>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let update = ThresholdUpdate::from_pairs(pairs).map_err(|e| {
            self.record_threshold_failure(&e, caller);
            e
        })?;
        self.set_thresholds(&update, caller)
    }

    fn record_threshold_failure(&self, error: &EngineError, caller: Option<&Caller>) {
        if let Err(e) = self.engine.log_error(
            category::THRESHOLD_UPDATE_ERROR,
            &error.to_string(),
            THRESHOLD_OPERATION,
            ErrorLevel::Warning,
            caller.and_then(Caller::owner_key),
        ) {
            tracing::error!(error = %e, "Failed to record threshold update failure");
        }
    }

    /// Log an INFO record on demand, defaulting to category `TEST_ERROR`
    pub fn log_manual_error(
        &self,
        category: Option<&str>,
        message: Option<&str>,
        caller: Option<&Caller>,
    ) -> Result<i64> {
        let category = category
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(category::TEST_ERROR);
        let message = message.unwrap_or(MANUAL_ERROR_MESSAGE);
        let owner_key = caller.and_then(Caller::owner_key);

        self.engine
            .log_error(category, message, MANUAL_ERROR_OPERATION, ErrorLevel::Info, owner_key)
            .map_err(|e| {
                if let Err(inner) = self.engine.log_error(
                    MANUAL_ERROR_FAILURE,
                    &e.to_string(),
                    MANUAL_ERROR_OPERATION,
                    ErrorLevel::Error,
                    owner_key,
                ) {
                    tracing::error!(error = %inner, "Failed to record manual error failure");
                }
                e
            })
    }

    /// Put deliberate load on the host for up to [`MAX_LOAD_DURATION`], so
    /// that threshold breaches can be provoked on demand. Runs as the
    /// instrumented operation `simulate_load`; a failure is recorded under
    /// `LOAD_SIMULATION_ERROR`.
    pub fn simulate_load(&self, duration: Duration, kind: LoadKind, caller: Option<&Caller>) -> Result<LoadReport> {
        let duration = capped_load_duration(duration);
        self.engine
            .instrument(LOAD_OPERATION, caller.and_then(Caller::owner_key), || {
                generate_load(duration, kind)
            })?;

        Ok(LoadReport {
            message: "Load simulation completed".to_string(),
            duration_secs: duration.as_secs_f64(),
            kind,
        })
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "healthy".to_string(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Engine counters as Prometheus text or JSON
    pub fn export_counters(&self, format: &str) -> Result<String> {
        Ok(self.engine.counters().export(format)?)
    }
}

fn capped_load_duration(requested: Duration) -> Duration {
    requested.min(MAX_LOAD_DURATION)
}

fn generate_load(duration: Duration, kind: LoadKind) -> Result<()> {
    let started = Instant::now();
    let mut retained: Vec<u32> = Vec::new();

    while started.elapsed() < duration {
        match kind {
            LoadKind::CpuIntensive => {
                let sum = (0..CPU_LOAD_STEP).map(|x| x.wrapping_mul(x)).fold(0u64, u64::wrapping_add);
                std::hint::black_box(sum);
            }
            LoadKind::MemoryIntensive => {
                retained
                    .try_reserve(MEMORY_LOAD_STEP)
                    .map_err(|e| EngineError::LoadSimulation { reason: e.to_string() })?;
                retained.extend(0..MEMORY_LOAD_STEP as u32);
            }
        }
        std::thread::sleep(LOAD_STEP_PAUSE);
    }

    tracing::debug!(?kind, retained = retained.len(), "Load simulation finished");
    Ok(())
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
