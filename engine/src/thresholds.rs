//! Alert thresholds shared between the instrumentation engine and the
//! background monitor.
//!
//! The set lives for the process lifetime behind a [`ThresholdHandle`].
//! Updates become visible to operations that start afterwards; calls
//! already in flight keep the snapshot they read.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Numeric limits keyed by metric name
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSet {
    /// CPU usage percentage
    pub cpu: f64,

    /// Memory usage percentage
    pub memory: f64,

    /// Disk usage percentage
    pub disk: f64,

    /// Execution time in seconds
    pub response_time: f64,
}

/// Partial update; absent fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory: 80.0,
            disk: 90.0,
            response_time: 5.0,
        }
    }
}

impl ThresholdSet {
    /// Name/value pairs in a stable order
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("disk", self.disk),
            ("response_time", self.response_time),
        ]
    }

    /// Look up a limit by metric name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries()
            .into_iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Copy of this set with the update applied, after validating every
    /// supplied value
    pub fn merged(&self, update: &ThresholdUpdate) -> Result<Self> {
        let mut next = *self;
        for (name, value, slot) in [
            ("cpu", update.cpu, &mut next.cpu),
            ("memory", update.memory, &mut next.memory),
            ("disk", update.disk, &mut next.disk),
            ("response_time", update.response_time, &mut next.response_time),
        ] {
            if let Some(value) = value {
                check_limit(name, value)?;
                *slot = value;
            }
        }
        Ok(next)
    }
}

impl ThresholdUpdate {
    /// Build an update from loosely typed name/value pairs, rejecting
    /// unknown metric names
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut update = ThresholdUpdate::default();
        for (name, value) in pairs {
            let slot = match name {
                "cpu" => &mut update.cpu,
                "memory" => &mut update.memory,
                "disk" => &mut update.disk,
                "response_time" => &mut update.response_time,
                other => {
                    return Err(EngineError::InvalidThreshold {
                        name: other.to_string(),
                        value: value.to_string(),
                    })
                }
            };
            *slot = Some(value);
        }
        Ok(update)
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none()
            && self.memory.is_none()
            && self.disk.is_none()
            && self.response_time.is_none()
    }
}

fn check_limit(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidThreshold {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

/// Cloneable, synchronized handle to the process-wide threshold set
#[derive(Debug, Clone, Default)]
pub struct ThresholdHandle {
    inner: Arc<RwLock<ThresholdSet>>,
}

impl ThresholdHandle {
    pub fn new(initial: ThresholdSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Current values. A poisoned lock still holds a complete set since
    /// writers only ever store whole values.
    pub fn snapshot(&self) -> ThresholdSet {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace every limit at once
    pub fn replace(&self, next: ThresholdSet) -> Result<ThresholdSet> {
        for (name, value) in next.entries() {
            check_limit(name, value)?;
        }
        self.store(next);
        Ok(next)
    }

    /// Merge a partial update and return the resulting set
    pub fn update(&self, update: &ThresholdUpdate) -> Result<ThresholdSet> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = guard.merged(update)?;
        *guard = next;
        tracing::info!(
            cpu = next.cpu,
            memory = next.memory,
            disk = next.disk,
            response_time = next.response_time,
            "thresholds updated"
        );
        Ok(next)
    }

    fn store(&self, next: ThresholdSet) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = next;
        tracing::info!(?next, "thresholds replaced");
    }
}
