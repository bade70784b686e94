//! Process counters for the perfwatch engine
//!
//! These are in-process Prometheus counters describing what the engine
//! itself has done (rows written, breaches seen, cycles failed). They are
//! separate from the metric rows persisted in the retention store.

use std::time::{Duration, Instant};

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, MetricsResult};
use crate::records::ErrorLevel;

/// Counters registered in a private registry
#[derive(Clone)]
pub struct EngineCounters {
    registry: Registry,
    start_time: Instant,

    pub metrics_recorded: IntCounter,
    pub errors_recorded: IntCounterVec,
    pub threshold_breaches: IntCounterVec,
    pub rows_evicted: IntCounter,
    pub storage_write_failures: IntCounter,
    pub sample_failures: IntCounter,
    pub background_cycles: IntCounter,
    pub background_cycles_failed: IntCounter,
    pub execution_time: Histogram,
}

/// Plain snapshot of the counters, used for the JSON export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub metrics_recorded: u64,
    pub errors_info: u64,
    pub errors_warning: u64,
    pub errors_error: u64,
    pub threshold_breaches: u64,
    pub rows_evicted: u64,
    pub storage_write_failures: u64,
    pub sample_failures: u64,
    pub background_cycles: u64,
    pub background_cycles_failed: u64,

    /// Mean execution time of instrumented operations in milliseconds
    pub avg_execution_time_ms: f64,

    pub uptime_secs: u64,
}

fn registration_failed(e: prometheus::Error) -> MetricsError {
    MetricsError::RegistrationFailed { name: e.to_string() }
}

fn register<C>(registry: &Registry, collector: C) -> MetricsResult<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(registration_failed)?;
    Ok(collector)
}

impl EngineCounters {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new_custom(Some("perfwatch".to_string()), None)
            .map_err(registration_failed)?;

        let metrics_recorded = register(
            &registry,
            IntCounter::new("metrics_recorded_total", "Metric rows written")
                .map_err(registration_failed)?,
        )?;

        let errors_recorded = register(
            &registry,
            IntCounterVec::new(
                Opts::new("errors_recorded_total", "Error rows written by level"),
                &["level"],
            )
            .map_err(registration_failed)?,
        )?;

        let threshold_breaches = register(
            &registry,
            IntCounterVec::new(
                Opts::new("threshold_breaches_total", "Threshold breaches by category"),
                &["category"],
            )
            .map_err(registration_failed)?,
        )?;

        let rows_evicted = register(
            &registry,
            IntCounter::new("rows_evicted_total", "Rows removed by retention eviction")
                .map_err(registration_failed)?,
        )?;

        let storage_write_failures = register(
            &registry,
            IntCounter::new("storage_write_failures_total", "Writes that failed after retries")
                .map_err(registration_failed)?,
        )?;

        let sample_failures = register(
            &registry,
            IntCounter::new("sample_failures_total", "Host samples replaced by zeros")
                .map_err(registration_failed)?,
        )?;

        let background_cycles = register(
            &registry,
            IntCounter::new("background_cycles_total", "Completed background monitor cycles")
                .map_err(registration_failed)?,
        )?;

        let background_cycles_failed = register(
            &registry,
            IntCounter::new("background_cycles_failed_total", "Failed background monitor cycles")
                .map_err(registration_failed)?,
        )?;

        let execution_time = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("execution_time_seconds", "Instrumented operation duration")
                    .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            )
            .map_err(registration_failed)?,
        )?;

        Ok(Self {
            registry,
            start_time: Instant::now(),
            metrics_recorded,
            errors_recorded,
            threshold_breaches,
            rows_evicted,
            storage_write_failures,
            sample_failures,
            background_cycles,
            background_cycles_failed,
            execution_time,
        })
    }

    pub fn record_metric(&self, execution_time: Duration) {
        self.metrics_recorded.inc();
        self.execution_time.observe(execution_time.as_secs_f64());
    }

    pub fn record_error(&self, level: ErrorLevel) {
        self.errors_recorded.with_label_values(&[level.as_str()]).inc();
    }

    pub fn record_breach(&self, category: &str) {
        self.threshold_breaches.with_label_values(&[category]).inc();
    }

    pub fn record_eviction(&self, rows: usize) {
        self.rows_evicted.inc_by(rows as u64);
    }

    pub fn stats(&self) -> EngineStats {
        let errors = |level: ErrorLevel| self.errors_recorded.with_label_values(&[level.as_str()]).get();
        let breaches = self
            .registry
            .gather()
            .iter()
            .filter(|family| family.get_name().ends_with("threshold_breaches_total"))
            .flat_map(|family| family.get_metric().iter())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum();

        let count = self.execution_time.get_sample_count();
        let avg_execution_time_ms = if count > 0 {
            self.execution_time.get_sample_sum() / count as f64 * 1000.0
        } else {
            0.0
        };

        EngineStats {
            metrics_recorded: self.metrics_recorded.get(),
            errors_info: errors(ErrorLevel::Info),
            errors_warning: errors(ErrorLevel::Warning),
            errors_error: errors(ErrorLevel::Error),
            threshold_breaches: breaches,
            rows_evicted: self.rows_evicted.get(),
            storage_write_failures: self.storage_write_failures.get(),
            sample_failures: self.sample_failures.get(),
            background_cycles: self.background_cycles.get(),
            background_cycles_failed: self.background_cycles_failed.get(),
            avg_execution_time_ms,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Export the counters as Prometheus text or as JSON
    pub fn export(&self, format: &str) -> MetricsResult<String> {
        match format {
            "prometheus" => {
                let encoder = TextEncoder::new();
                let metric_families = self.registry.gather();
                let mut buffer = Vec::new();
                encoder
                    .encode(&metric_families, &mut buffer)
                    .map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })?;
                String::from_utf8(buffer)
                    .map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })
            }
            "json" => {
                let combined = serde_json::json!({
                    "engine_stats": self.stats(),
                    "timestamp": chrono::Utc::now().timestamp(),
                });
                serde_json::to_string_pretty(&combined)
                    .map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })
            }
            _ => Err(MetricsError::ExportFailed {
                reason: format!("Unsupported format: {}", format),
            }),
        }
    }
}

impl std::fmt::Debug for EngineCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCounters").field("stats", &self.stats()).finish()
    }
}
