//! Perfwatch engine library
//!
//! This library provides the recording and retention engine of the
//! perfwatch service: it wraps operations with timing and host sampling,
//! turns failures and threshold breaches into diagnostic records, and
//! keeps both in a bounded SQLite store maintained by a background
//! monitor.

pub mod auth;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod instrument;
pub mod metrics;
pub mod monitor;
pub mod records;
pub mod sampler;
pub mod service;
pub mod storage;
pub mod thresholds;

// Re-export commonly used types
pub use auth::{CredentialInfo, CredentialValidator};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use instrument::{Engine, FailureKind, InstrumentationWindow};
pub use metrics::EngineCounters;
pub use monitor::{BackgroundMonitor, MonitorHandle, MonitorSettings, MonitorState, Pacer, TokioPacer};
pub use records::{ErrorLevel, ErrorRecord, MetricRecord, MetricStatus};
pub use sampler::{FixedSampler, HostSampler, Sampler, SystemSnapshot};
pub use service::{Caller, HealthStatus, LoadKind, LoadReport, PerformanceMonitor};
pub use storage::RetentionStore;
pub use thresholds::{ThresholdHandle, ThresholdSet, ThresholdUpdate};
