//! Device identity and ownership checks.
//!
//! One identifier per device, generated on first use and persisted. Every
//! player created on the device carries it as `owner_device_id`. The store
//! itself performs no access control; callers gate "my own records"
//! actions through [`DeviceIdentity::owns`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::model::Player;
use crate::store::{Store, DEVICE_KEY};

/// Identity used when the medium can neither provide nor keep one.
pub const UNKNOWN_DEVICE: &str = "unknown-device";

/// Stable per-device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// This device's identity, loaded once per session.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    id: DeviceId,
}

impl DeviceIdentity {
    /// Load the persisted identifier, creating and persisting one if absent.
    ///
    /// Falls back to [`UNKNOWN_DEVICE`] when the new identifier cannot be
    /// persisted, so ownership stays consistent across restarts.
    pub fn load_or_create(store: &Store) -> Self {
        let existing: Option<String> = store.read_record(DEVICE_KEY, None);
        if let Some(id) = existing.filter(|id| !id.is_empty()) {
            return Self { id: DeviceId(id) };
        }

        let fresh = Uuid::new_v4().to_string();
        match store.write_record(DEVICE_KEY, &fresh) {
            Ok(()) => {
                log::info!("Created device identity {fresh}");
                Self { id: DeviceId(fresh) }
            }
            Err(e) => {
                log::warn!("Could not persist device identity: {e}");
                Self {
                    id: DeviceId(UNKNOWN_DEVICE.to_string()),
                }
            }
        }
    }

    /// Fixed identity, for tests and embedding.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Whether this device created `player`.
    pub fn owns(&self, player: &Player) -> bool {
        player.owner_device_id == self.id.0
    }
}
