//! Error handling for the perfwatch engine
//!
//! This module provides the error types for every engine concern:
//! host sampling, the retention store, credentials, configuration and
//! the instrumentation facade that ties them together.

use std::io;

use thiserror::Error;

/// The main error type for the perfwatch engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Retention store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Host sampling errors
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// Credential handling errors
    #[error("Credential error: {0}")]
    Auth(#[from] AuthError),

    /// The caller presented no credential or an invalid one
    #[error("Authentication denied: {reason}")]
    AuthenticationDenied { reason: String },

    /// A threshold update was rejected
    #[error("Invalid threshold: {name} = {value}")]
    InvalidThreshold { name: String, value: String },

    /// Process counter errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// A requested load simulation could not run to completion
    #[error("Load simulation failed: {reason}")]
    LoadSimulation { reason: String },

    /// The background monitor task could not be joined
    #[error("Background monitor error: {0}")]
    Monitor(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Retention store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("write to {table} failed after {attempts} attempts: {reason}")]
    WriteFailed {
        table: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("directory creation failed: {path}")]
    DirectoryCreationFailed { path: String },

    #[error("invalid limit: {0}")]
    InvalidLimit(usize),
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration file permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// Host sampling errors. These never escape the sampler's public
/// `sample` method; they are logged and replaced by a zeroed snapshot.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("platform is not supported by the host sampler")]
    Unsupported,

    #[error("sampler state lock poisoned")]
    LockPoisoned,

    #[error("host reported no {resource}")]
    ResourceUnavailable { resource: &'static str },
}

/// Credential errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("credential name must not be empty")]
    EmptyName,

    #[error("credential hashing failed: {reason}")]
    HashingFailed { reason: String },

    #[error("no active credential named {name}")]
    UnknownCredential { name: String },
}

/// Process counter errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics export failed: {reason}")]
    ExportFailed { reason: String },

    #[error("Metric registration failed: {name}")]
    RegistrationFailed { name: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

/// A specialized result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for sampling operations
pub type SamplerResult<T> = std::result::Result<T, SamplerError>;

/// A specialized result type for credential operations
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// A specialized result type for counter operations
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

impl EngineError {
    /// Check if this error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Storage(StorageError::Sqlite(err)) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            EngineError::Storage(StorageError::LockPoisoned) => false,
            EngineError::Sampler(_) => true,
            EngineError::AuthenticationDenied { .. } => false,
            EngineError::InvalidThreshold { .. } => false,
            EngineError::LoadSimulation { .. } => false,
            EngineError::Config(_) => false,
            EngineError::Io(io_error) => {
                matches!(io_error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => true,
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Storage(_) => "DATABASE_ERROR",
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::Sampler(_) => "SAMPLER_ERROR",
            EngineError::Auth(_) => "CREDENTIAL_ERROR",
            EngineError::AuthenticationDenied { .. } => "AUTHENTICATION_ERROR",
            EngineError::InvalidThreshold { .. } => "THRESHOLD_UPDATE_ERROR",
            EngineError::Metrics(_) => "METRICS_ERROR",
            EngineError::LoadSimulation { .. } => "LOAD_SIMULATION_ERROR",
            EngineError::Monitor(_) => "BACKGROUND_MONITOR_ERROR",
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
            EngineError::Generic(_) => "GENERIC_ERROR",
        }
    }
}

impl From<String> for EngineError {
    fn from(msg: String) -> Self {
        EngineError::Generic(msg)
    }
}

impl From<&str> for EngineError {
    fn from(msg: &str) -> Self {
        EngineError::Generic(msg.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(StorageError::Sqlite(err))
    }
}
