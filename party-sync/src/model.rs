//! Replicated records and the namespace they live in.
//!
//! Every persisted and replicated list is keyed by a [`Namespace`]: the pair
//! of an [`EntityKind`] and a [`PartyCode`]. Field names serialize in
//! camelCase so records are exchanged verbatim with other devices.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::merge::{self, MergeOutcome};
use crate::subscription::{Registry, Subscribers};

/// Glyph reserved for the session leader.
pub const CROWN: &str = "👑";

/// Glyph substituted when a player picks the crown.
pub const DEFAULT_EMOJI: &str = "🎀";

/// Party code sentinel for single-device, non-replicated sessions.
pub const LOCAL_CODE: &str = "local";

const PARTY_CODE_LEN: usize = 6;
const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Namespace key identifying one shared game session.
///
/// Codes are trimmed and upper-cased; an empty code (or any casing of
/// `local`) normalizes to the [`LOCAL_CODE`] sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyCode(String);

impl PartyCode {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(LOCAL_CODE) {
            Self::local()
        } else {
            Self(trimmed.to_uppercase())
        }
    }

    pub fn local() -> Self {
        Self(LOCAL_CODE.to_string())
    }

    /// Whether this code disables networking.
    pub fn is_local(&self) -> bool {
        self.0 == LOCAL_CODE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a random 6-character base-36 code.
    pub fn generate() -> Self {
        let mut n = Uuid::new_v4().as_u128();
        let mut code = String::with_capacity(PARTY_CODE_LEN);
        for _ in 0..PARTY_CODE_LEN {
            code.push(BASE36[(n % 36) as usize] as char);
            n /= 36;
        }
        Self(code)
    }
}

impl Default for PartyCode {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Display for PartyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two replicated entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Players,
    Rolls,
}

impl EntityKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            EntityKind::Players => "players",
            EntityKind::Rolls => "rolls",
        }
    }
}

/// `(entity kind, party code)`, the key of one persisted list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub kind: EntityKind,
    pub code: PartyCode,
}

impl Namespace {
    pub fn new(kind: EntityKind, code: PartyCode) -> Self {
        Self { kind, code }
    }

    /// Storage key, `kind:CODE`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.prefix(), self.code)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.code)
    }
}

/// A participant in a party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub highest_total: u32,
    #[serde(default)]
    pub highest_dice_values: Vec<u8>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub owner_device_id: String,
    #[serde(default)]
    pub party_code: PartyCode,
}

/// One submitted dice roll. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Roll {
    pub id: String,
    /// `None` for guest rolls with no player attached.
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub dice_count: u32,
    #[serde(default)]
    pub dice_values: Vec<u8>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub round_number: u32,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub party_code: PartyCode,
}

/// Caller-supplied fields of a roll; the rest is derived on save.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRoll {
    pub player_id: Option<String>,
    pub player_name: String,
    pub dice_values: Vec<u8>,
    pub session_id: String,
    pub round_number: u32,
}

/// A replicated record kind with its own merge policy.
pub trait Entity: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Combine a local list with remote records.
    fn merge(local: Vec<Self>, remote: &[Self]) -> MergeOutcome<Self>;

    #[doc(hidden)]
    fn registry(subscribers: &Subscribers) -> &Registry<Self>;
}

impl Entity for Player {
    const KIND: EntityKind = EntityKind::Players;

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(local: Vec<Self>, remote: &[Self]) -> MergeOutcome<Self> {
        merge::merge_players(local, remote)
    }

    fn registry(subscribers: &Subscribers) -> &Registry<Self> {
        &subscribers.players
    }
}

impl Entity for Roll {
    const KIND: EntityKind = EntityKind::Rolls;

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(local: Vec<Self>, remote: &[Self]) -> MergeOutcome<Self> {
        merge::merge_rolls(local, remote)
    }

    fn registry(subscribers: &Subscribers) -> &Registry<Self> {
        &subscribers.rolls
    }
}

/// Replace a crown pick with the default glyph.
pub fn sanitize_emoji(emoji: &str) -> String {
    let trimmed = emoji.trim();
    if trimmed.contains(CROWN) {
        DEFAULT_EMOJI.to_string()
    } else {
        trimmed.to_string()
    }
}

/// The player holding the crown: highest `highest_total`, first wins ties.
pub fn leader(players: &[Player]) -> Option<&Player> {
    players
        .iter()
        .reduce(|a, b| if a.highest_total >= b.highest_total { a } else { b })
}

/// Case-insensitive, whitespace-trimmed name comparison key.
pub(crate) fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}
