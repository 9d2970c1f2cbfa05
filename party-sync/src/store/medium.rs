//! Durable key/value media behind the [`Store`](super::Store).

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backing database failure (quota, permission, corruption)
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Medium refused the operation
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::SerializationError(e.to_string())
    }
}

/// A durable string-keyed, string-valued medium.
///
/// Implementations are shared by every [`Store`](super::Store) context on
/// one device, so they must be usable from several threads.
pub trait DurableMedium: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically replace the value at `key`.
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Identifies the medium instance in logs.
    fn id(&self) -> Uuid;
}

/// Volatile medium for tests and single-run sessions.
pub struct MemoryMedium {
    id: Uuid,
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableMedium for MemoryMedium {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn id(&self) -> Uuid {
        self.id
    }
}
