//! Key-value persistence port.
//!
//! The ad subsystem persists two small records (the cached placement config
//! and the daily limit counters). Both go through [`KeyValueStore`] as JSON
//! text, so any backend that can hold strings will do.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CoreError, DatabaseError};

/// String-keyed, string-valued storage.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    fn set(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    fn remove(&self, key: &str) -> Result<(), DatabaseError>;
}

/// Typed JSON records on top of any [`KeyValueStore`].
pub trait ModelStore: KeyValueStore {
    /// Decode the record under `key`.
    ///
    /// Missing, unreadable and undecodable records all read as `None`.
    fn model<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read record");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable record");
                None
            }
        }
    }

    /// Encode and store `value`, or delete the record when `None`.
    ///
    /// # Errors
    /// Returns an error if encoding or the underlying write fails.
    fn set_model<T: Serialize>(&self, key: &str, value: Option<&T>) -> Result<(), CoreError> {
        match value {
            Some(value) => {
                let encoded = serde_json::to_string(value)?;
                self.set(key, &encoded)?;
            }
            None => self.remove(key)?,
        }
        Ok(())
    }
}

impl<S: KeyValueStore + ?Sized> ModelStore for S {}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Box<S> {
    fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), DatabaseError> {
        (**self).remove(key)
    }
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, DatabaseError> {
        self.entries.lock().map_err(|_| DatabaseError::Locked)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), DatabaseError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
