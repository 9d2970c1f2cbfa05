//! Replication protocol messages.
//!
//! Two logical channels per room:
//! ```text
//! sync    { "type": "REQUEST" }
//!         { "type": "RESPONSE", "players": [...], "rolls": [...] }
//! update  { "type": "PLAYERS", "payload": [player] }
//!         { "type": "ROLLS",   "payload": [roll] }
//! ```
//!
//! Messages are JSON so any transport can carry them verbatim. There is
//! no acknowledgement, retry or versioning at this layer. Malformed
//! records inside a list are dropped one by one; the rest still decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::model::{Player, Roll};

/// Logical channel within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Full-snapshot request/response
    Sync,
    /// Single-record delta broadcast
    Update,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Sync => "sync",
            Channel::Update => "update",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "sync" => Ok(Channel::Sync),
            "update" => Ok(Channel::Update),
            other => Err(ProtocolError::UnknownChannel(other.to_string())),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message on the `sync` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum SyncMessage {
    /// Ask a peer for its full snapshot.
    Request,
    /// Full snapshot of the responder's namespace.
    Response {
        #[serde(default, deserialize_with = "lenient_list")]
        players: Vec<Player>,
        #[serde(default, deserialize_with = "lenient_list")]
        rolls: Vec<Roll>,
    },
}

/// Message on the `update` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum UpdateMessage {
    Players {
        #[serde(deserialize_with = "lenient_list")]
        payload: Vec<Player>,
    },
    Rolls {
        #[serde(deserialize_with = "lenient_list")]
        payload: Vec<Roll>,
    },
}

/// Decode a JSON array element by element, skipping entries that do not
/// fit `T`.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    let total = raw.len();
    let list: Vec<T> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping malformed record: {e}");
                None
            }
        })
        .collect();
    if list.len() < total {
        log::warn!("Dropped {} of {total} record(s)", total - list.len());
    }
    Ok(list)
}

impl SyncMessage {
    pub fn response(players: Vec<Player>, rolls: Vec<Roll>) -> Self {
        SyncMessage::Response { players, rolls }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl UpdateMessage {
    /// Delta carrying one new or changed player.
    pub fn player(player: Player) -> Self {
        UpdateMessage::Players {
            payload: vec![player],
        }
    }

    /// Delta carrying one new roll.
    pub fn roll(roll: Roll) -> Self {
        UpdateMessage::Rolls {
            payload: vec![roll],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnknownChannel(String),
    InvalidFrame(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownChannel(name) => write!(f, "Unknown channel: {name}"),
            Self::InvalidFrame(e) => write!(f, "Invalid frame: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
