//! Instrumentation engine
//!
//! [`Engine::instrument`] wraps an operation in an [`InstrumentationWindow`].
//! The window samples the host when it opens and again when it closes,
//! checks the closing snapshot against the thresholds captured at open,
//! and persists exactly one metric row. Closing happens in `Drop`, so the
//! row is written on every exit path: normal return, returned error, or
//! unwinding panic.
//!
//! Record writes never alter what the body returned. A write that still
//! fails after the store's retries is logged and counted.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::diagnostics::{self, category};
use crate::error::{EngineError, Result};
use crate::metrics::EngineCounters;
use crate::records::{ErrorLevel, NewError, NewMetric, PerformanceImpact, NO_TRACE_AVAILABLE};
use crate::sampler::{Sampler, SystemSnapshot};
use crate::storage::RetentionStore;
use crate::thresholds::{ThresholdHandle, ThresholdSet};

/// Category used when an operation panics inside a window
pub const PANIC_CATEGORY: &str = "PANIC";

/// Classification of a failure returned by an instrumented body.
///
/// The default is the bare type name in upper case, so
/// `std::num::ParseIntError` becomes `PARSEINTERROR`.
pub trait FailureKind {
    fn failure_kind(&self) -> String {
        kind_from_type_name(std::any::type_name::<Self>())
    }
}

fn kind_from_type_name(name: &str) -> String {
    let without_generics = name.split('<').next().unwrap_or(name);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_uppercase()
}

impl FailureKind for EngineError {
    fn failure_kind(&self) -> String {
        self.category().to_string()
    }
}

impl FailureKind for anyhow::Error {
    fn failure_kind(&self) -> String {
        // anyhow erases the concrete type.
        "ERROR".to_string()
    }
}

impl FailureKind for std::io::Error {}
impl FailureKind for std::fmt::Error {}
impl FailureKind for std::num::ParseIntError {}
impl FailureKind for std::num::ParseFloatError {}
impl FailureKind for std::str::Utf8Error {}
impl FailureKind for String {
    fn failure_kind(&self) -> String {
        "ERROR".to_string()
    }
}
impl FailureKind for serde_json::Error {}
impl FailureKind for rusqlite::Error {}

/// Error entry as handed to [`Engine::record_error`]
#[derive(Debug, Clone)]
pub struct ErrorEntry<'a> {
    pub category: &'a str,
    pub message: &'a str,
    pub operation_name: &'a str,
    pub level: ErrorLevel,
    pub owner_key: Option<&'a str>,
    pub trace_context: Option<String>,
}

/// Wraps operations with timing, sampling, threshold checks and
/// persistence
#[derive(Clone)]
pub struct Engine {
    store: Arc<RetentionStore>,
    sampler: Arc<dyn Sampler>,
    thresholds: ThresholdHandle,
    counters: EngineCounters,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("thresholds", &self.thresholds.snapshot())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        store: Arc<RetentionStore>,
        sampler: Arc<dyn Sampler>,
        thresholds: ThresholdHandle,
        counters: EngineCounters,
    ) -> Self {
        Self {
            store,
            sampler,
            thresholds,
            counters,
        }
    }

    pub fn store(&self) -> &Arc<RetentionStore> {
        &self.store
    }

    pub fn thresholds(&self) -> &ThresholdHandle {
        &self.thresholds
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Current host snapshot. Failures are logged, counted and replaced by
    /// zeros.
    pub fn sample(&self) -> SystemSnapshot {
        match self.sampler.try_sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.counters.sample_failures.inc();
                tracing::error!(error = %e, "Error getting system metrics");
                SystemSnapshot::default()
            }
        }
    }

    /// Run `body` inside an instrumentation window and return its result
    /// unchanged. A returned error is logged as an `ERROR` record
    /// classified by its [`FailureKind`].
    pub fn instrument<T, E, F>(&self, operation_name: &str, owner_key: Option<&str>, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: FailureKind + fmt::Display + fmt::Debug,
    {
        let window = self.open_window(operation_name, owner_key);
        let result = body();
        if let Err(e) = &result {
            window.fail(e);
        }
        window.close();
        result
    }

    /// Async form of [`Self::instrument`] for callers on the runtime. The
    /// body and both samples run on the blocking pool; a panicking body
    /// is resumed on the caller after its metric row has been written.
    pub async fn instrument_blocking<T, E, F>(
        &self,
        operation_name: impl Into<String>,
        owner_key: Option<String>,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: FailureKind + fmt::Display + fmt::Debug + Send + 'static,
    {
        let engine = self.clone();
        let operation_name = operation_name.into();
        let joined = tokio::task::spawn_blocking(move || {
            engine.instrument(&operation_name, owner_key.as_deref(), body)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // Blocking tasks are never aborted; only runtime shutdown gets here.
            Err(e) => panic!("instrumented task did not complete: {}", e),
        }
    }

    /// Open a window by hand, for operations that do not fit a closure
    pub fn open_window(&self, operation_name: &str, owner_key: Option<&str>) -> InstrumentationWindow<'_> {
        let started = Instant::now();
        let thresholds = self.thresholds.snapshot();
        let start_snapshot = self.sample();
        InstrumentationWindow {
            engine: self,
            operation_name: operation_name.to_string(),
            owner_key: owner_key.map(str::to_string),
            thresholds,
            start_snapshot,
            started,
            closed: false,
        }
    }

    /// Log an error record with catalog explanation and fix. Unknown
    /// categories get the generic fallback text.
    pub fn log_error(
        &self,
        category: &str,
        message: &str,
        operation_name: &str,
        level: ErrorLevel,
        owner_key: Option<&str>,
    ) -> Result<i64> {
        self.record_error(ErrorEntry {
            category,
            message,
            operation_name,
            level,
            owner_key,
            trace_context: None,
        })
    }

    /// Write an error record. Impact scores come from a fresh sample taken
    /// now.
    pub fn record_error(&self, entry: ErrorEntry<'_>) -> Result<i64> {
        let snapshot = self.sample();
        let impact = PerformanceImpact::from_snapshot(&snapshot);

        match entry.level {
            ErrorLevel::Error => tracing::error!(
                category = entry.category,
                operation = entry.operation_name,
                "{}: {}",
                entry.category,
                entry.message
            ),
            ErrorLevel::Warning => tracing::warn!(
                category = entry.category,
                operation = entry.operation_name,
                "{}: {}",
                entry.category,
                entry.message
            ),
            ErrorLevel::Info => tracing::info!(
                category = entry.category,
                operation = entry.operation_name,
                "{}: {}",
                entry.category,
                entry.message
            ),
        }

        let record = NewError {
            timestamp: chrono::Utc::now(),
            level: entry.level,
            category: entry.category.to_string(),
            message: entry.message.to_string(),
            trace_context: entry
                .trace_context
                .unwrap_or_else(|| NO_TRACE_AVAILABLE.to_string()),
            operation_name: entry.operation_name.to_string(),
            cpu_impact: impact.cpu_impact,
            memory_impact: impact.memory_impact,
            severity: impact.severity,
            explanation: diagnostics::explain(entry.category).into_owned(),
            suggested_fix: diagnostics::suggest_fix(entry.category).into_owned(),
            owner_key: entry.owner_key.map(str::to_string),
        };

        match self.store.insert_error(&record) {
            Ok(id) => {
                self.counters.record_error(entry.level);
                tracing::debug!(record_id = id, category = entry.category, "Error record written");
                Ok(id)
            }
            Err(e) => {
                self.counters.storage_write_failures.inc();
                Err(e.into())
            }
        }
    }

    /// Log a threshold breach as a WARNING record
    pub(crate) fn record_breach(
        &self,
        category: &str,
        message: &str,
        operation_name: &str,
        owner_key: Option<&str>,
    ) -> Result<i64> {
        self.counters.record_breach(category);
        self.log_error(category, message, operation_name, ErrorLevel::Warning, owner_key)
    }

    fn write_metric(&self, metric: &NewMetric, elapsed: Duration) -> Result<i64> {
        match self.store.insert_metric(metric) {
            Ok(id) => {
                self.counters.record_metric(elapsed);
                Ok(id)
            }
            Err(e) => {
                self.counters.storage_write_failures.inc();
                Err(e.into())
            }
        }
    }
}

/// Open instrumentation window. Dropping it writes the metric row.
#[must_use = "dropping the window immediately records a zero-length operation"]
pub struct InstrumentationWindow<'a> {
    engine: &'a Engine,
    operation_name: String,
    owner_key: Option<String>,
    thresholds: ThresholdSet,
    start_snapshot: SystemSnapshot,
    started: Instant,
    closed: bool,
}

impl InstrumentationWindow<'_> {
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log the failure of the wrapped operation as an ERROR record
    pub fn fail<E>(&self, error: &E)
    where
        E: FailureKind + fmt::Display + fmt::Debug + ?Sized,
    {
        let kind = error.failure_kind();
        let message = error.to_string();
        if let Err(e) = self.engine.record_error(ErrorEntry {
            category: &kind,
            message: &message,
            operation_name: &self.operation_name,
            level: ErrorLevel::Error,
            owner_key: self.owner_key.as_deref(),
            trace_context: Some(format!("{:?}", error)),
        }) {
            tracing::error!(error = %e, operation = %self.operation_name, "Failed to record operation failure");
        }
    }

    /// Close the window now, returning the metric row id if it was written
    pub fn close(mut self) -> Option<i64> {
        self.finish()
    }

    fn finish(&mut self) -> Option<i64> {
        if self.closed {
            return None;
        }
        self.closed = true;

        if std::thread::panicking() {
            if let Err(e) = self.engine.record_error(ErrorEntry {
                category: PANIC_CATEGORY,
                message: "operation panicked",
                operation_name: &self.operation_name,
                level: ErrorLevel::Error,
                owner_key: self.owner_key.as_deref(),
                trace_context: None,
            }) {
                tracing::error!(error = %e, operation = %self.operation_name, "Failed to record panic");
            }
        }

        let elapsed = self.started.elapsed();
        let end = self.engine.sample();
        let execution_time = elapsed.as_secs_f64();

        tracing::debug!(
            operation = %self.operation_name,
            cpu_delta = end.cpu_usage - self.start_snapshot.cpu_usage,
            memory_delta = end.memory_usage - self.start_snapshot.memory_usage,
            execution_time,
            "Instrumentation window closed"
        );

        let owner_key = self.owner_key.as_deref();

        if end.cpu_usage > self.thresholds.cpu {
            let message = format!("CPU usage: {:.2}% exceeds threshold", end.cpu_usage);
            if let Err(e) =
                self.engine
                    .record_breach(category::HIGH_CPU_USAGE, &message, &self.operation_name, owner_key)
            {
                tracing::error!(error = %e, operation = %self.operation_name, "Failed to record CPU breach");
            }
        }

        if execution_time > self.thresholds.response_time {
            let message = format!("Execution time: {:.2}s exceeds threshold", execution_time);
            if let Err(e) =
                self.engine
                    .record_breach(category::SLOW_RESPONSE, &message, &self.operation_name, owner_key)
            {
                tracing::error!(error = %e, operation = %self.operation_name, "Failed to record slow response");
            }
        }

        let metric = NewMetric::completed(
            self.operation_name.as_str(),
            &end,
            execution_time,
            self.owner_key.clone(),
        );
        match self.engine.write_metric(&metric, elapsed) {
            Ok(id) => {
                tracing::trace!(record_id = id, operation = %self.operation_name, "Metric recorded");
                Some(id)
            }
            Err(e) => {
                tracing::error!(error = %e, operation = %self.operation_name, "Failed to record metric");
                None
            }
        }
    }
}

impl Drop for InstrumentationWindow<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::FixedSampler;

    #[derive(Debug)]
    struct QuotaExceeded;

    impl fmt::Display for QuotaExceeded {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("quota exceeded")
        }
    }

    impl FailureKind for QuotaExceeded {}

    fn engine_with(sampler: Arc<FixedSampler>) -> Engine {
        Engine::new(
            Arc::new(RetentionStore::open_in_memory().unwrap()),
            sampler,
            ThresholdHandle::default(),
            EngineCounters::new().unwrap(),
        )
    }

    #[test]
    fn test_kind_from_type_name() {
        assert_eq!(kind_from_type_name("std::num::ParseIntError"), "PARSEINTERROR");
        assert_eq!(kind_from_type_name("my_crate::Wrapper<alloc::string::String>"), "WRAPPER");
        assert_eq!(kind_from_type_name("Plain"), "PLAIN");
        assert_eq!(QuotaExceeded.failure_kind(), "QUOTAEXCEEDED");
    }

    #[test]
    fn test_engine_error_kind_is_category() {
        let denied = EngineError::AuthenticationDenied { reason: "Missing API key".to_string() };
        assert_eq!(denied.failure_kind(), "AUTHENTICATION_ERROR");
    }

    #[test]
    fn test_successful_body_records_one_metric() {
        let engine = engine_with(Arc::new(FixedSampler::with_usage(10.0, 10.0)));
        let value: std::result::Result<u32, QuotaExceeded> = engine.instrument("add", Some("alice"), || Ok(2 + 2));
        assert_eq!(value.unwrap(), 4);

        let metrics = engine.store().query_metrics(10, None).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].operation_name, "add");
        assert_eq!(metrics[0].owner_key.as_deref(), Some("alice"));
        assert!(metrics[0].execution_time >= 0.0);
        assert!(engine.store().query_errors(10, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_failing_body_is_logged_and_returned() {
        let engine = engine_with(Arc::new(FixedSampler::with_usage(10.0, 10.0)));
        let result: std::result::Result<(), QuotaExceeded> = engine.instrument("charge", None, || Err(QuotaExceeded));
        assert!(matches!(result, Err(QuotaExceeded)));

        let errors = engine.store().query_errors(10, None, None).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].level, ErrorLevel::Error);
        assert_eq!(errors[0].category, "QUOTAEXCEEDED");
        assert_eq!(errors[0].message, "quota exceeded");
        assert_eq!(errors[0].trace_context, "QuotaExceeded");
        assert_eq!(engine.store().count_metrics().unwrap(), 1);
    }

    #[test]
    fn test_breach_written_before_metric() {
        let engine = engine_with(Arc::new(FixedSampler::with_usage(85.0, 10.0)));
        let _: std::result::Result<(), QuotaExceeded> = engine.instrument("busy", None, || Ok(()));

        let errors = engine.store().query_errors(10, None, None).unwrap();
        let metrics = engine.store().query_metrics(10, None).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, category::HIGH_CPU_USAGE);
        assert_eq!(errors[0].message, "CPU usage: 85.00% exceeds threshold");
        assert!(errors[0].inserted_at < metrics[0].inserted_at);
    }

    #[test]
    fn test_slow_response_uses_threshold_from_window_open() {
        let engine = engine_with(Arc::new(FixedSampler::with_usage(10.0, 10.0)));
        engine.thresholds().replace(ThresholdSet {
            response_time: 0.0,
            ..ThresholdSet::default()
        }).unwrap();

        let window = engine.open_window("sleepy", None);
        engine.thresholds().replace(ThresholdSet::default()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(window.close().is_some());

        let errors = engine.store().query_errors(10, Some("WARNING"), None).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, category::SLOW_RESPONSE);
    }

    #[test]
    fn test_panicking_body_still_records_metric() {
        let engine = engine_with(Arc::new(FixedSampler::with_usage(10.0, 10.0)));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: std::result::Result<(), QuotaExceeded> = engine.instrument("boom", None, || panic!("boom"));
        }));
        assert!(outcome.is_err());

        assert_eq!(engine.store().count_metrics().unwrap(), 1);
        let errors = engine.store().query_errors(10, None, None).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, PANIC_CATEGORY);
    }

    #[test]
    fn test_log_error_fills_catalog_text() {
        let engine = engine_with(Arc::new(FixedSampler::with_usage(60.0, 50.0)));
        engine
            .log_error("FOO_BAR", "something odd", "manual", ErrorLevel::Info, None)
            .unwrap();

        let errors = engine.store().query_errors(1, None, None).unwrap();
        assert_eq!(errors[0].explanation, diagnostics::explain("FOO_BAR"));
        assert_eq!(errors[0].suggested_fix, diagnostics::suggest_fix("FOO_BAR"));
        assert_eq!(errors[0].trace_context, NO_TRACE_AVAILABLE);
        assert_eq!(errors[0].cpu_impact, 40.0);
        assert_eq!(errors[0].memory_impact, 20.0);
        assert_eq!(errors[0].severity, 5.5);
    }

    #[tokio::test]
    async fn test_instrument_blocking_returns_body_result() {
        let engine = engine_with(Arc::new(FixedSampler::with_usage(10.0, 10.0)));
        let result: std::result::Result<&str, QuotaExceeded> =
            engine.instrument_blocking("async_op", None, || Ok("done")).await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(engine.store().count_metrics().unwrap(), 1);
    }

    #[test]
    fn test_failed_metric_write_keeps_body_result() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("perfwatch.db");
        let retry = crate::config::RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            backoff_multiplier: 1.0,
            busy_timeout_ms: 10,
        };
        let engine = Engine::new(
            Arc::new(RetentionStore::open(&path, retry).unwrap()),
            Arc::new(FixedSampler::with_usage(10.0, 10.0)),
            ThresholdHandle::default(),
            EngineCounters::new().unwrap(),
        );

        let blocker = rusqlite::Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let result: std::result::Result<u32, QuotaExceeded> = engine.instrument("blocked", None, || Ok(42));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(engine.counters().stats().storage_write_failures, 1);
        assert_eq!(engine.counters().stats().metrics_recorded, 0);

        blocker.execute_batch("COMMIT").unwrap();
        assert_eq!(engine.store().count_metrics().unwrap(), 0);
    }
}
