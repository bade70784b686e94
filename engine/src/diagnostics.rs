//! Static catalog of explanations and remediation hints per error category

use std::borrow::Cow;

/// Category codes the engine itself emits
pub mod category {
    pub const HIGH_CPU_USAGE: &str = "HIGH_CPU_USAGE";
    pub const HIGH_MEMORY_USAGE: &str = "HIGH_MEMORY_USAGE";
    pub const DISK_SPACE_LOW: &str = "DISK_SPACE_LOW";
    pub const SLOW_RESPONSE: &str = "SLOW_RESPONSE";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const AUTHENTICATION_ERROR: &str = "AUTHENTICATION_ERROR";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const BACKGROUND_MONITOR_ERROR: &str = "BACKGROUND_MONITOR_ERROR";
    pub const THRESHOLD_UPDATE_ERROR: &str = "THRESHOLD_UPDATE_ERROR";
    pub const TEST_ERROR: &str = "TEST_ERROR";
    pub const LOAD_SIMULATION_ERROR: &str = "LOAD_SIMULATION_ERROR";
}

struct Entry {
    category: &'static str,
    explanation: &'static str,
    fix: &'static str,
}

const CATALOG: &[Entry] = &[
    Entry {
        category: category::HIGH_CPU_USAGE,
        explanation: "CPU usage has exceeded the threshold, indicating intensive processing that may slow down the system.",
        fix: "Consider optimizing algorithms, reducing computational complexity, or scaling horizontally.",
    },
    Entry {
        category: category::HIGH_MEMORY_USAGE,
        explanation: "Memory usage is critically high, which can lead to system instability and slower performance.",
        fix: "Review memory allocation, release unused buffers, or increase available RAM.",
    },
    Entry {
        category: category::DISK_SPACE_LOW,
        explanation: "Available disk space is running low, which can cause write operations to fail.",
        fix: "Clean up temporary files, archive old logs, or expand storage capacity.",
    },
    Entry {
        category: category::SLOW_RESPONSE,
        explanation: "Operation execution time exceeded acceptable limits, indicating a performance bottleneck.",
        fix: "Optimize database queries, implement caching, or consider asynchronous processing.",
    },
    Entry {
        category: category::NETWORK_ERROR,
        explanation: "Network connectivity issue detected, which may affect external API calls or data transfers.",
        fix: "Check network connectivity, implement retry logic, or use a circuit breaker.",
    },
    Entry {
        category: category::DATABASE_ERROR,
        explanation: "Database operation failed, potentially due to connection issues or query problems.",
        fix: "Check that the database file is writable, has free space, and is not locked by another process.",
    },
    Entry {
        category: category::AUTHENTICATION_ERROR,
        explanation: "Authentication failed, indicating a potential security breach or expired credentials.",
        fix: "Verify the API key is valid and has not been revoked.",
    },
    Entry {
        category: category::RATE_LIMIT_EXCEEDED,
        explanation: "Too many requests received in a short time period.",
        fix: "Reduce request frequency or upgrade to a higher rate limit tier.",
    },
    Entry {
        category: category::BACKGROUND_MONITOR_ERROR,
        explanation: "A background monitoring cycle failed; sampling resumes after the backoff interval.",
        fix: "Inspect the message and service logs; repeated failures usually point at the storage backend.",
    },
];

fn lookup(category: &str) -> Option<&'static Entry> {
    CATALOG.iter().find(|entry| entry.category == category)
}

/// Human readable explanation for a category. Unknown categories get a
/// generic text naming the code.
pub fn explain(category: &str) -> Cow<'static, str> {
    match lookup(category) {
        Some(entry) => Cow::Borrowed(entry.explanation),
        None => Cow::Owned(format!("An error of type '{}' occurred.", category)),
    }
}

/// Suggested remediation for a category. Unknown categories get a
/// generic text naming the code.
pub fn suggest_fix(category: &str) -> Cow<'static, str> {
    match lookup(category) {
        Some(entry) => Cow::Borrowed(entry.fix),
        None => Cow::Owned(format!(
            "Review the error details and implement appropriate error handling for '{}'.",
            category
        )),
    }
}

/// Whether the catalog has a dedicated entry for the category
pub fn is_known(category: &str) -> bool {
    lookup(category).is_some()
}
