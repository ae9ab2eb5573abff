//! Backend trait - the storage seam shared by all persistence media.
//!
//! A backend stores one [`StoredRecord`] per cell name. The contract is
//! deliberately fail-soft: a backend never surfaces an error to the engine.
//! Read failures (missing file, malformed payload, platform error) report the
//! record as absent; write and delete failures are logged and dropped. The
//! engine cannot distinguish "never persisted" from "failed to read", which
//! is exactly the degradation the cells promise their callers.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Maximum cell name length in bytes.
pub const MAX_NAME_LENGTH: usize = 256;

/// The logical persisted-record format written to every backend.
///
/// `previous_value` may lag the in-memory previous value by at most one
/// write; it is `None` when no prior value was ever known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// The persisted value.
    pub value: Value,
    /// The value immediately before the last persisted write.
    #[serde(default)]
    pub previous_value: Option<Value>,
}

impl StoredRecord {
    /// Build a record from typed values.
    pub fn encode<T: Serialize>(value: &T, previous: Option<&T>) -> Result<Self> {
        Ok(Self {
            value: serde_json::to_value(value)?,
            previous_value: previous.map(serde_json::to_value).transpose()?,
        })
    }

    /// Deserialize the persisted value.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone()).map_err(Into::into)
    }

    /// Deserialize the persisted previous value, if any.
    ///
    /// A previous value that no longer deserializes is dropped rather than
    /// failing the read; only the current value gates acceptance.
    pub fn previous_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.previous_value
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Validate that a cell name is well-formed.
///
/// Names key records in every backend, including as file names, so they are
/// restricted to a filesystem-safe character set.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(StoreError::InvalidName(format!(
            "name exceeds maximum length of {} bytes",
            MAX_NAME_LENGTH
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(StoreError::InvalidName(format!(
            "name {:?} contains characters outside [A-Za-z0-9._-]",
            name
        )));
    }
    Ok(())
}

/// The storage backend trait.
///
/// All persistence media (SQLite, local file, secure store) implement this
/// trait. The router hands the engine a backend; the engine never knows
/// which medium it is talking to.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read the record for a cell name.
    ///
    /// Returns `None` when the record is absent *or* unreadable.
    async fn read(&self, name: &str) -> Option<StoredRecord>;

    /// Write the record for a cell name.
    ///
    /// Failures are logged and dropped.
    async fn write(&self, name: &str, record: StoredRecord);

    /// Delete the record for a cell name, if present.
    async fn delete(&self, name: &str);
}
