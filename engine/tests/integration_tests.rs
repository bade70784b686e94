//! Integration tests for the perfwatch engine

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use perfwatch_engine::{
    diagnostics::{self, category},
    error::SamplerResult,
    instrument::FailureKind,
    monitor::{BACKGROUND_FAILURE_OPERATION, BACKGROUND_OPERATION},
    BackgroundMonitor, EngineConfig, EngineError, ErrorLevel, FixedSampler, MetricStatus,
    MonitorSettings, MonitorState, Pacer, PerformanceMonitor, RetentionStore, Sampler,
    SystemSnapshot, ThresholdUpdate,
};

/// Create a service on an on-disk database in a temporary directory
fn create_test_service(sampler: Arc<dyn Sampler>) -> (PerformanceMonitor, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.storage.database_path = temp_dir.path().join("perfwatch.db");

    let store = RetentionStore::open(&config.storage.database_path, config.storage.write_retry.clone()).unwrap();
    let service = PerformanceMonitor::with_parts(config, Arc::new(store), sampler).unwrap();
    (service, temp_dir)
}

fn idle_sampler() -> Arc<FixedSampler> {
    Arc::new(FixedSampler::with_usage(10.0, 20.0))
}

#[derive(Debug, PartialEq)]
struct PaymentDeclined {
    code: u32,
}

impl fmt::Display for PaymentDeclined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payment declined with code {}", self.code)
    }
}

impl FailureKind for PaymentDeclined {}

/// Pacer that records requested pauses without sleeping. The `limit`-th
/// pause never completes, so the test can inspect and shut down.
struct RecordingPacer {
    pauses: Mutex<Vec<Duration>>,
    limit: usize,
}

impl RecordingPacer {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            pauses: Mutex::new(Vec::new()),
            limit,
        })
    }

    fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().unwrap().clone()
    }

    async fn wait_for_limit(&self) {
        timeout(Duration::from_secs(10), async {
            while self.pauses().len() < self.limit {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("monitor did not reach the expected number of pauses");
    }
}

impl Pacer for RecordingPacer {
    fn pause(&self, duration: Duration) -> BoxFuture<'_, ()> {
        let mut pauses = self.pauses.lock().unwrap();
        pauses.push(duration);
        if pauses.len() >= self.limit {
            return Box::pin(future::pending());
        }
        Box::pin(future::ready(()))
    }
}

enum Step {
    Panic,
    Snapshot(SystemSnapshot),
}

/// Sampler that replays a script, then reports an idle host
struct ScriptedSampler {
    steps: Mutex<VecDeque<Step>>,
}

impl ScriptedSampler {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
        })
    }
}

impl Sampler for ScriptedSampler {
    fn try_sample(&self) -> SamplerResult<SystemSnapshot> {
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Panic) => panic!("sensor driver crashed"),
            Some(Step::Snapshot(snapshot)) => Ok(snapshot),
            None => Ok(SystemSnapshot::default()),
        }
    }
}

#[tokio::test]
async fn test_instrumented_calls_record_one_metric_each() {
    let (service, _temp_dir) = create_test_service(idle_sampler());

    for i in 0..10 {
        let result: Result<usize, PaymentDeclined> = service.instrument(&format!("op_{}", i), None, || Ok(i));
        assert_eq!(result.unwrap(), i);
    }

    let metrics = service.get_metrics_history(Some(100), None).unwrap();
    assert_eq!(metrics.len(), 10);
    assert!(metrics.iter().all(|m| m.status == MetricStatus::Completed));
    assert!(metrics.iter().all(|m| m.execution_time >= 0.0));
    assert_eq!(metrics[0].operation_name, "op_9");
    assert!(service.get_errors_history(None, None, None).unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_operation_returns_identical_failure() {
    let (service, _temp_dir) = create_test_service(idle_sampler());

    let result: Result<(), PaymentDeclined> =
        service.instrument("charge_card", None, || Err(PaymentDeclined { code: 51 }));
    assert_eq!(result, Err(PaymentDeclined { code: 51 }));

    let errors = service.get_errors_history(None, None, None).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].level, ErrorLevel::Error);
    assert_eq!(errors[0].category, "PAYMENTDECLINED");
    assert_eq!(errors[0].message, "payment declined with code 51");
    assert_eq!(errors[0].operation_name, "charge_card");
    assert!(errors[0].trace_context.contains("51"));

    assert_eq!(service.store().count_metrics().unwrap(), 1);
}

#[tokio::test]
async fn test_cpu_threshold_breach() {
    let sampler = Arc::new(FixedSampler::with_usage(85.0, 20.0));
    let (service, _temp_dir) = create_test_service(sampler.clone());

    let _: Result<(), PaymentDeclined> = service.instrument("hot_path", None, || Ok(()));
    let warnings = service.get_errors_history(None, Some("WARNING"), None).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].category, category::HIGH_CPU_USAGE);
    assert_eq!(warnings[0].cpu_impact, 65.0);

    sampler.set(SystemSnapshot {
        cpu_usage: 75.0,
        memory_usage: 20.0,
        ..SystemSnapshot::default()
    });
    let _: Result<(), PaymentDeclined> = service.instrument("warm_path", None, || Ok(()));
    assert_eq!(service.get_errors_history(None, Some("WARNING"), None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_threshold_update_visible_to_later_calls() {
    let (service, _temp_dir) = create_test_service(Arc::new(FixedSampler::with_usage(60.0, 20.0)));

    let _: Result<(), PaymentDeclined> = service.instrument("before", None, || Ok(()));
    assert_eq!(service.store().count_errors().unwrap(), 0);

    let update = ThresholdUpdate {
        cpu: Some(50.0),
        ..ThresholdUpdate::default()
    };
    assert_eq!(service.set_thresholds(&update, None).unwrap().cpu, 50.0);

    let _: Result<(), PaymentDeclined> = service.instrument("after", None, || Ok(()));
    let warnings = service.get_errors_history(None, Some("warning"), None).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].operation_name, "after");
}

#[tokio::test]
async fn test_eviction_keeps_newest_rows() {
    let (service, _temp_dir) = create_test_service(idle_sampler());

    for i in 0..150 {
        let _: Result<(), PaymentDeclined> = service.instrument(&format!("op_{}", i), None, || Ok(()));
    }

    let store = service.store();
    assert_eq!(store.evict_excess_metrics(100).unwrap(), 50);
    assert_eq!(store.count_metrics().unwrap(), 100);

    let remaining = store.query_metrics(1000, None).unwrap();
    assert_eq!(remaining.first().unwrap().operation_name, "op_149");
    assert_eq!(remaining.last().unwrap().operation_name, "op_50");

    assert_eq!(store.evict_excess_metrics(100).unwrap(), 0);
    assert_eq!(store.count_metrics().unwrap(), 100);
}

#[tokio::test]
async fn test_error_query_filters_level() {
    let (service, _temp_dir) = create_test_service(idle_sampler());
    let engine = service.engine();

    for (i, level) in [
        ErrorLevel::Warning,
        ErrorLevel::Error,
        ErrorLevel::Warning,
        ErrorLevel::Error,
        ErrorLevel::Warning,
    ]
    .into_iter()
    .enumerate()
    {
        engine
            .log_error("TEST_ERROR", &format!("entry {}", i), "test", level, None)
            .unwrap();
    }

    let warnings = service.get_errors_history(Some(2), Some("warning"), None).unwrap();
    assert_eq!(warnings.len(), 2);
    assert!(warnings.iter().all(|e| e.level == ErrorLevel::Warning));
    assert_eq!(warnings[0].message, "entry 4");
    assert_eq!(warnings[1].message, "entry 2");
}

#[tokio::test]
async fn test_unknown_category_gets_fallback_text() {
    let (service, _temp_dir) = create_test_service(idle_sampler());
    service.log_manual_error(Some("FOO_BAR"), Some("odd"), None).unwrap();

    let errors = service.get_errors_history(None, None, None).unwrap();
    assert_eq!(errors[0].category, "FOO_BAR");
    assert!(!errors[0].explanation.is_empty());
    assert!(!errors[0].suggested_fix.is_empty());
    assert_eq!(errors[0].explanation, diagnostics::explain("FOO_BAR"));
    assert_eq!(errors[0].suggested_fix, diagnostics::suggest_fix("FOO_BAR"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers() {
    let (service, _temp_dir) = create_test_service(idle_sampler());
    let engine = service.engine();

    let calls = (0..50).map(|i| {
        engine.instrument_blocking(format!("concurrent_{}", i), None, move || -> Result<usize, PaymentDeclined> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(i)
        })
    });
    let results = future::join_all(calls).await;
    assert!(results.iter().all(Result::is_ok));

    let metrics = service.get_metrics_history(Some(1000), None).unwrap();
    assert_eq!(metrics.len(), 50);

    let mut ids: Vec<i64> = metrics.iter().map(|m| m.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 50);
}

#[tokio::test]
async fn test_authentication_flow() {
    let (service, _temp_dir) = create_test_service(idle_sampler());
    let token = service.store().create_credential("dashboard").unwrap();

    let caller = service.authenticate(Some(&token), "get_metrics").unwrap();
    assert_eq!(caller.name, "dashboard");

    let _: Result<(), PaymentDeclined> = service.instrument("scoped", Some(&caller), || Ok(()));
    let _: Result<(), PaymentDeclined> = service.instrument("unscoped", None, || Ok(()));
    let scoped = service.get_metrics_history(None, Some(&caller)).unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].operation_name, "scoped");

    service.store().revoke_credential("dashboard").unwrap();
    let denied = service.authenticate(Some(&token), "get_metrics").unwrap_err();
    assert!(matches!(denied, EngineError::AuthenticationDenied { .. }));

    let warnings = service.get_errors_history(None, Some("WARNING"), None).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].category, category::AUTHENTICATION_ERROR);
    assert_eq!(warnings[0].message, "Invalid API key");
}

#[tokio::test]
async fn test_background_monitor_recovers_after_failed_cycle() {
    let hot = SystemSnapshot {
        cpu_usage: 95.0,
        memory_usage: 20.0,
        ..SystemSnapshot::default()
    };
    let sampler = ScriptedSampler::new(vec![
        Step::Panic,
        Step::Snapshot(SystemSnapshot::default()),
        Step::Snapshot(hot),
    ]);
    let (service, _temp_dir) = create_test_service(sampler);

    let settings = MonitorSettings::default();
    let pacer = RecordingPacer::new(2);
    let monitor = BackgroundMonitor::new(
        service.engine().clone(),
        settings.clone(),
        pacer.clone(),
        CancellationToken::new(),
    );
    let handle = monitor.spawn();
    let mut states = handle.subscribe();

    pacer.wait_for_limit().await;
    assert_eq!(pacer.pauses(), vec![settings.backoff, settings.interval]);

    handle.shutdown().await.unwrap();
    assert_eq!(*states.borrow_and_update(), MonitorState::Stopped);

    let failures = service.get_errors_history(None, Some("ERROR"), None).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].category, category::BACKGROUND_MONITOR_ERROR);
    assert_eq!(failures[0].operation_name, BACKGROUND_FAILURE_OPERATION);
    assert!(failures[0].message.contains("sensor driver crashed"));

    let warnings = service.get_errors_history(None, Some("WARNING"), None).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].category, category::HIGH_CPU_USAGE);
    assert_eq!(warnings[0].operation_name, BACKGROUND_OPERATION);

    let stats = service.engine().counters().stats();
    assert_eq!(stats.background_cycles_failed, 1);
    assert_eq!(stats.background_cycles, 1);
}

#[tokio::test]
async fn test_service_start_and_shutdown() {
    let (service, _temp_dir) = create_test_service(idle_sampler());
    let pacer = RecordingPacer::new(1);

    service.start_with_pacer(pacer.clone()).await.unwrap();
    pacer.wait_for_limit().await;
    assert_eq!(service.monitor_state().await, Some(MonitorState::Running));

    timeout(Duration::from_secs(5), service.shutdown())
        .await
        .expect("shutdown timed out")
        .unwrap();
    assert_eq!(service.monitor_state().await, None);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("perfwatch.db");
    let mut config = EngineConfig::default();
    config.storage.database_path = path.clone();

    {
        let service = PerformanceMonitor::with_parts(
            config.clone(),
            Arc::new(RetentionStore::open(&path, config.storage.write_retry.clone()).unwrap()),
            idle_sampler(),
        )
        .unwrap();
        let _: Result<(), PaymentDeclined> = service.instrument("persisted", None, || Ok(()));
    }

    let store = RetentionStore::open(&path, config.storage.write_retry.clone()).unwrap();
    let metrics = store.query_metrics(10, None).unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].operation_name, "persisted");
}
