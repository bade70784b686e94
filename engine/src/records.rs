//! Persisted record types
//!
//! `New*` structs are what the engine hands to the retention store;
//! `*Record` structs are what comes back, carrying the identity and the
//! insertion sequence assigned on write.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::sampler::SystemSnapshot;

/// Trace context stored when nothing was captured at logging time
pub const NO_TRACE_AVAILABLE: &str = "No traceback available";

/// Severity level of an error record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
}

impl ErrorLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLevel::Info => "INFO",
            ErrorLevel::Warning => "WARNING",
            ErrorLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(ErrorLevel::Info),
            "WARNING" | "WARN" => Ok(ErrorLevel::Warning),
            "ERROR" => Ok(ErrorLevel::Error),
            other => Err(EngineError::Generic(format!("unknown error level: {}", other))),
        }
    }
}

/// Outcome recorded for an instrumented operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum MetricStatus {
    /// The instrumentation window closed, whatever the body returned
    Completed,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Completed => "completed",
        }
    }
}

impl FromStr for MetricStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(MetricStatus::Completed),
            other => Err(EngineError::Generic(format!("unknown metric status: {}", other))),
        }
    }
}

/// Metric sample ready to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMetric {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_sent: u64,
    pub network_recv: u64,
    pub execution_time: f64,
    pub operation_name: String,
    pub status: MetricStatus,
    pub owner_key: Option<String>,
}

impl NewMetric {
    /// Completed metric built from the closing snapshot of a window
    pub fn completed(
        operation_name: impl Into<String>,
        snapshot: &SystemSnapshot,
        execution_time: f64,
        owner_key: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_usage: snapshot.cpu_usage,
            memory_usage: snapshot.memory_usage,
            disk_usage: snapshot.disk_usage,
            network_sent: snapshot.network_sent,
            network_recv: snapshot.network_recv,
            execution_time: execution_time.max(0.0),
            operation_name: operation_name.into(),
            status: MetricStatus::Completed,
            owner_key,
        }
    }
}

/// Persisted metric row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_sent: u64,
    pub network_recv: u64,
    pub execution_time: f64,
    pub operation_name: String,
    pub status: MetricStatus,
    pub owner_key: Option<String>,
    pub inserted_at: i64,
}

/// Error/diagnostic entry ready to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewError {
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
    pub category: String,
    pub message: String,
    pub trace_context: String,
    pub operation_name: String,
    pub cpu_impact: f64,
    pub memory_impact: f64,
    pub severity: f64,
    pub explanation: String,
    pub suggested_fix: String,
    pub owner_key: Option<String>,
}

/// Persisted error row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
    pub category: String,
    pub message: String,
    pub trace_context: String,
    pub operation_name: String,
    pub cpu_impact: f64,
    pub memory_impact: f64,
    pub severity: f64,
    pub explanation: String,
    pub suggested_fix: String,
    pub owner_key: Option<String>,
    pub inserted_at: i64,
}

/// Derived impact scores for an error logged under a given snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceImpact {
    pub cpu_impact: f64,
    pub memory_impact: f64,
    pub severity: f64,
}

impl PerformanceImpact {
    /// Fixed policy: CPU above 20% and memory above 30% count as impact,
    /// severity is the combined load over 20, capped at 10.
    pub fn from_snapshot(snapshot: &SystemSnapshot) -> Self {
        Self {
            cpu_impact: (snapshot.cpu_usage - 20.0).max(0.0),
            memory_impact: (snapshot.memory_usage - 30.0).max(0.0),
            severity: ((snapshot.cpu_usage + snapshot.memory_usage) / 20.0).clamp(0.0, 10.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing_is_case_insensitive() {
        assert_eq!("warning".parse::<ErrorLevel>().unwrap(), ErrorLevel::Warning);
        assert_eq!(" Error ".parse::<ErrorLevel>().unwrap(), ErrorLevel::Error);
        assert_eq!("INFO".parse::<ErrorLevel>().unwrap(), ErrorLevel::Info);
        assert!("fatal".parse::<ErrorLevel>().is_err());
    }

    #[test]
    fn test_level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&ErrorLevel::Warning).unwrap(), "\"WARNING\"");
        assert_eq!(serde_json::to_string(&MetricStatus::Completed).unwrap(), "\"completed\"");
    }

    #[test]
    fn test_impact_formula() {
        let impact = PerformanceImpact::from_snapshot(&SystemSnapshot {
            cpu_usage: 85.0,
            memory_usage: 60.0,
            ..SystemSnapshot::default()
        });
        assert_eq!(impact.cpu_impact, 65.0);
        assert_eq!(impact.memory_impact, 30.0);
        assert_eq!(impact.severity, 7.25);
    }

    #[test]
    fn test_impact_floors_and_caps() {
        let idle = PerformanceImpact::from_snapshot(&SystemSnapshot::default());
        assert_eq!(idle.cpu_impact, 0.0);
        assert_eq!(idle.memory_impact, 0.0);
        assert_eq!(idle.severity, 0.0);

        let saturated = PerformanceImpact::from_snapshot(&SystemSnapshot {
            cpu_usage: 120.0,
            memory_usage: 100.0,
            ..SystemSnapshot::default()
        });
        assert_eq!(saturated.severity, 10.0);
    }

    #[test]
    fn test_completed_metric_never_negative() {
        let metric = NewMetric::completed("op", &SystemSnapshot::default(), -0.5, None);
        assert_eq!(metric.execution_time, 0.0);
        assert_eq!(metric.status, MetricStatus::Completed);
    }
}
