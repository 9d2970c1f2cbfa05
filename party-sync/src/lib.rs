//! # party-sync: Local-first, peer-replicated party state
//!
//! Players and dice rolls live in a namespaced local store and replicate
//! between devices of the same party over peer-to-peer rooms. There is no
//! authoritative server: every device holds a full copy and converges by
//! merging snapshots and deltas.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  mutate   ┌─────────────┐  notify   ┌──────────────┐
//! │ Party (API) │ ────────► │ Store       │ ────────► │ Subscribers  │
//! └──────┬──────┘           │ kind:CODE   │           └──────────────┘
//!        │ delta            └──────▲──────┘
//!        ▼                         │ merge
//! ┌─────────────┐  sync/update  ┌──┴──────────┐
//! │ RoomManager │ ◄───────────► │ Transport   │ ◄──► other devices
//! └─────────────┘               │ (mem / ws)  │
//!                               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Player, Roll, party codes and namespaces
//! - [`merge`]: Player (wholesale overwrite) and Roll (append-only) reducers
//! - [`store`]: Namespaced persistence over RocksDB or memory
//! - [`subscription`]: Per-namespace change observers
//! - [`bus`]: Cross-context storage signals
//! - [`identity`]: Device identity and ownership
//! - [`protocol`]: JSON sync/update messages
//! - [`room`]: Room lifecycle and replication routing
//! - [`transport`]: Room-join capability: in-process hub, WebSocket client
//! - [`relay`]: Stateless WebSocket relay server
//! - [`party`]: Public mutation API

pub mod bus;
pub mod clock;
pub mod identity;
pub mod merge;
pub mod model;
pub mod party;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod store;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use bus::{SignalBus, StorageSignal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{DeviceId, DeviceIdentity, UNKNOWN_DEVICE};
pub use merge::{merge_players, merge_rolls, MergeOutcome};
pub use model::{leader, sanitize_emoji, Entity, EntityKind, Namespace, NewRoll, PartyCode, Player, Roll};
pub use party::{Party, PartyConfig, PartyError};
pub use protocol::{Channel, ProtocolError, SyncMessage, UpdateMessage};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use room::{RoomManager, RoomState};
pub use store::{DurableMedium, MemoryMedium, RocksMedium, Store, StoreConfig, StoreError};
pub use subscription::Subscription;
pub use transport::{MemoryHub, MemoryTransport, RoomEvent, Transport, TransportError, WsTransport};
