//! Core error types for watertracker-core.
//!
//! This module defines the error hierarchy using thiserror. Ad failures
//! never surface to the user: they degrade to "no ad shown" and are only
//! logged, but they are still typed so the service can report them.

use std::path::PathBuf;
use thiserror::Error;

use crate::ads::AdKind;

/// Core error type for watertracker-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Ad lifecycle errors
    #[error("Ad error: {0}")]
    Ad(#[from] AdError),

    /// The ad service task is gone (shut down or panicked)
    #[error("Ad service is not running")]
    ServiceClosed,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Ad lifecycle errors.
///
/// None of these are fatal. Each one maps to an outcome the UI layer sees
/// as "no ad".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdError {
    /// A single provider in the waterfall failed to fill
    #[error("Provider '{provider_id}' failed to load a {kind} ad: {reason}")]
    ProviderFetchFailed {
        kind: AdKind,
        provider_id: String,
        reason: String,
    },

    /// The daily show or click limit has been reached
    #[error("Daily ad limit reached ({show_count} shows, {click_count} clicks)")]
    RateLimited { show_count: u32, click_count: u32 },

    /// No placement configuration for this slot
    #[error("No ad configuration for {0} placement")]
    ConfigMissing(AdKind),
}

/// Errors reported by an ad network SDK.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The network returned no ad for the unit
    #[error("No fill for unit '{0}'")]
    NoFill(String),

    /// The request itself failed
    #[error("Request for unit '{unit_id}' failed: {message}")]
    RequestFailed { unit_id: String, message: String },

    /// The ad could not be put on screen
    #[error("Failed to present ad: {0}")]
    PresentFailed(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
