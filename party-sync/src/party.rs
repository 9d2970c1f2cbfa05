//! Public mutation API: one explicit party session per device context.
//!
//! A [`Party`] binds together the store, this device's identity and the
//! room manager for the active party code. Mutations always write locally
//! first and then, when the room is joined, broadcast a single-record
//! delta. Removals are local only and never replicated; a peer holding the
//! removed records may bring them back on the next sync.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::identity::{DeviceId, DeviceIdentity};
use crate::merge::sort_newest_first;
use crate::model::{name_key, sanitize_emoji, NewRoll, PartyCode, Player, Roll};
use crate::protocol::UpdateMessage;
use crate::room::{RoomManager, RoomState};
use crate::store::{Store, PARTY_KEY};
use crate::subscription::Subscription;
use crate::transport::Transport;

/// Default application id; rooms are keyed `app_id:CODE`.
pub const DEFAULT_APP_ID: &str = "dice-party-v1";

/// Party session configuration.
#[derive(Debug, Clone)]
pub struct PartyConfig {
    /// Namespaces rooms so different applications never meet
    pub app_id: String,
    /// Party code to start with, overriding the persisted one
    pub party_code: Option<String>,
    /// Delay between joining a room and broadcasting a sync request
    pub sync_request_delay: Duration,
}

impl Default for PartyConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            party_code: None,
            sync_request_delay: Duration::from_secs(1),
        }
    }
}

impl PartyConfig {
    /// Short sync delay for tests.
    pub fn for_testing(party_code: impl Into<String>) -> Self {
        Self {
            app_id: "dice-party-test".to_string(),
            party_code: Some(party_code.into()),
            sync_request_delay: Duration::from_millis(20),
        }
    }
}

/// Rejected mutation input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyError {
    EmptyName,
    EmptyDice,
    /// Die face outside 1..=6
    InvalidDie(u8),
}

impl fmt::Display for PartyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "Player name is empty"),
            Self::EmptyDice => write!(f, "Roll has no dice"),
            Self::InvalidDie(v) => write!(f, "Invalid die face: {v}"),
        }
    }
}

impl std::error::Error for PartyError {}

/// A device's session in a party.
pub struct Party {
    store: Store,
    identity: DeviceIdentity,
    clock: Arc<dyn Clock>,
    code: RwLock<PartyCode>,
    rooms: RoomManager,
}

impl Party {
    /// Open a session using the system clock.
    pub fn open(store: Store, transport: Arc<dyn Transport>, config: PartyConfig) -> Self {
        Self::with_clock(store, transport, config, Arc::new(SystemClock))
    }

    /// Open a session with an explicit clock for `createdAt` stamps.
    pub fn with_clock(
        store: Store,
        transport: Arc<dyn Transport>,
        config: PartyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let identity = DeviceIdentity::load_or_create(&store);
        let code = match &config.party_code {
            Some(raw) => {
                let code = PartyCode::new(raw);
                persist_code(&store, &code);
                code
            }
            None => store.read_record(PARTY_KEY, PartyCode::local()),
        };

        let rooms = RoomManager::new(
            store.clone(),
            transport,
            config.app_id,
            config.sync_request_delay,
        );
        rooms.enter(&code);
        log::info!("Party session opened for {code} as device {}", identity.id());

        Self {
            store,
            identity,
            clock,
            code: RwLock::new(code),
            rooms,
        }
    }

    // ─── Session ──────────────────────────────────────────────────────

    pub fn party_code(&self) -> PartyCode {
        self.code
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Switch to another party. The code is normalized and persisted, the
    /// previous room is left and the new one joined. Setting the code that
    /// is already active keeps the current room.
    ///
    /// Existing subscriptions stay bound to the namespace they were made for.
    pub fn set_party_code(&self, raw: &str) -> PartyCode {
        let code = PartyCode::new(raw);
        persist_code(&self.store, &code);
        *self
            .code
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = code.clone();
        self.rooms.enter(&code);
        code
    }

    pub fn room_state(&self) -> RoomState {
        self.rooms.state()
    }

    /// Leave the room but keep the party code. Mutations stay local until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.rooms.leave();
    }

    /// Rejoin the room for the current party code. No-op while the room
    /// is joined or joining.
    pub fn reconnect(&self) {
        self.rooms.enter(&self.party_code());
    }

    pub fn device_id(&self) -> &DeviceId {
        self.identity.id()
    }

    /// Whether this device may act on `player`'s behalf.
    pub fn can_act_for(&self, player: &Player) -> bool {
        self.identity.owns(player)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Create a player owned by this device.
    pub fn add_player(&self, name: &str, emoji: &str) -> Result<Player, PartyError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PartyError::EmptyName);
        }

        let code = self.party_code();
        let player = Player {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            emoji: sanitize_emoji(emoji),
            highest_total: 0,
            highest_dice_values: Vec::new(),
            created_at: self.clock.now_millis(),
            owner_device_id: self.identity.id().to_string(),
            party_code: code.clone(),
        };

        self.store
            .modify(&code, |players: &mut Vec<Player>| players.push(player.clone()));
        self.rooms
            .broadcast_update(&code, &UpdateMessage::player(player.clone()));
        Ok(player)
    }

    /// Store a roll, newest first, and broadcast it.
    pub fn save_roll(&self, entry: NewRoll) -> Result<Roll, PartyError> {
        if entry.dice_values.is_empty() {
            return Err(PartyError::EmptyDice);
        }
        if let Some(bad) = entry.dice_values.iter().find(|v| !(1..=6).contains(*v)) {
            return Err(PartyError::InvalidDie(*bad));
        }

        let code = self.party_code();
        let roll = Roll {
            id: Uuid::new_v4().to_string(),
            player_id: entry.player_id,
            player_name: entry.player_name,
            dice_count: entry.dice_values.len() as u32,
            total: entry.dice_values.iter().map(|v| u32::from(*v)).sum(),
            dice_values: entry.dice_values,
            session_id: entry.session_id,
            round_number: entry.round_number,
            created_at: self.clock.now_millis(),
            party_code: code.clone(),
        };

        self.store.modify(&code, |rolls: &mut Vec<Roll>| {
            rolls.insert(0, roll.clone());
            sort_newest_first(rolls);
        });
        self.rooms
            .broadcast_update(&code, &UpdateMessage::roll(roll.clone()));
        Ok(roll)
    }

    /// Raise a player's best roll.
    ///
    /// Applies only when `total` is strictly greater than the current
    /// `highest_total`; returns the updated player, or `None` if the player
    /// is unknown or the total is not an improvement.
    pub fn update_player_highest(&self, player_id: &str, total: u32, dice_values: Vec<u8>) -> Option<Player> {
        let code = self.party_code();
        let updated = self.store.modify(&code, |players: &mut Vec<Player>| {
            let player = players.iter_mut().find(|p| p.id == player_id)?;
            if total <= player.highest_total {
                return None;
            }
            player.highest_total = total;
            player.highest_dice_values = dice_values;
            Some(player.clone())
        })?;

        self.rooms
            .broadcast_update(&code, &UpdateMessage::player(updated.clone()));
        Some(updated)
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn players_once(&self, code: Option<&PartyCode>) -> Vec<Player> {
        self.store.read(&self.resolve(code))
    }

    pub fn rolls_once(&self, code: Option<&PartyCode>) -> Vec<Roll> {
        self.store.read(&self.resolve(code))
    }

    /// Observe players of `code`, or of the current party when `None`.
    pub fn subscribe_players<F>(&self, callback: F, code: Option<&PartyCode>) -> Subscription
    where
        F: Fn(&[Player]) + Send + Sync + 'static,
    {
        self.store.subscribe(&self.resolve(code), callback)
    }

    /// Observe rolls of `code`, or of the current party when `None`.
    pub fn subscribe_rolls<F>(&self, callback: F, code: Option<&PartyCode>) -> Subscription
    where
        F: Fn(&[Roll]) + Send + Sync + 'static,
    {
        self.store.subscribe(&self.resolve(code), callback)
    }

    // ─── Local-only removals ──────────────────────────────────────────

    /// Drop every roll of the current party. Returns how many were removed.
    pub fn clear_rolls(&self) -> usize {
        self.store
            .modify(&self.party_code(), |rolls: &mut Vec<Roll>| std::mem::take(rolls).len())
    }

    /// Drop every player of the current party. Returns how many were removed.
    pub fn clear_players(&self) -> usize {
        self.store
            .modify(&self.party_code(), |players: &mut Vec<Player>| std::mem::take(players).len())
    }

    /// Remove one player by id. Rolls referencing it are kept.
    pub fn remove_player(&self, player_id: &str) -> bool {
        self.store.modify(&self.party_code(), |players: &mut Vec<Player>| {
            let before = players.len();
            players.retain(|p| p.id != player_id);
            players.len() != before
        })
    }

    /// Remove this device's players whose name matches, ignoring case and
    /// surrounding whitespace.
    pub fn remove_player_by_name(&self, name: &str) -> usize {
        self.remove_players_matching(name, "")
    }

    /// Like [`remove_player_by_name`](Self::remove_player_by_name), also
    /// requiring an exact emoji match when `emoji` is not blank.
    pub fn remove_player_by_name_emoji(&self, name: &str, emoji: &str) -> usize {
        self.remove_players_matching(name, emoji)
    }

    /// Remove the rolls of this device's players matching name and emoji.
    pub fn clear_my_rolls_by_name_emoji(&self, name: &str, emoji: &str) -> usize {
        let code = self.party_code();
        let filter = PlayerFilter::new(name, emoji);
        let mine: HashSet<String> = self
            .store
            .read::<Player>(&code)
            .into_iter()
            .filter(|p| filter.matches(p) && self.identity.owns(p))
            .map(|p| p.id)
            .collect();
        self.remove_rolls_of(&code, &mine)
    }

    /// Remove the rolls of every player this device owns.
    pub fn clear_device_rolls(&self) -> usize {
        let code = self.party_code();
        let mine: HashSet<String> = self
            .store
            .read::<Player>(&code)
            .into_iter()
            .filter(|p| self.identity.owns(p))
            .map(|p| p.id)
            .collect();
        self.remove_rolls_of(&code, &mine)
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn resolve(&self, code: Option<&PartyCode>) -> PartyCode {
        code.cloned().unwrap_or_else(|| self.party_code())
    }

    fn remove_players_matching(&self, name: &str, emoji: &str) -> usize {
        let filter = PlayerFilter::new(name, emoji);
        self.store.modify(&self.party_code(), |players: &mut Vec<Player>| {
            let before = players.len();
            players.retain(|p| !(filter.matches(p) && self.identity.owns(p)));
            before - players.len()
        })
    }

    fn remove_rolls_of(&self, code: &PartyCode, player_ids: &HashSet<String>) -> usize {
        if player_ids.is_empty() {
            return 0;
        }
        self.store.modify(code, |rolls: &mut Vec<Roll>| {
            let before = rolls.len();
            rolls.retain(|r| {
                r.player_id
                    .as_ref()
                    .map_or(true, |id| !player_ids.contains(id))
            });
            before - rolls.len()
        })
    }
}

fn persist_code(store: &Store, code: &PartyCode) {
    if let Err(e) = store.write_record(PARTY_KEY, code) {
        log::warn!("Could not persist party code {code}: {e}");
    }
}

/// Name (case-insensitive, trimmed) plus optional exact emoji.
struct PlayerFilter {
    name: String,
    emoji: String,
}

impl PlayerFilter {
    fn new(name: &str, emoji: &str) -> Self {
        Self {
            name: name_key(name),
            emoji: emoji.trim().to_string(),
        }
    }

    fn matches(&self, player: &Player) -> bool {
        name_key(&player.name) == self.name
            && (self.emoji.is_empty() || player.emoji.trim() == self.emoji)
    }
}
