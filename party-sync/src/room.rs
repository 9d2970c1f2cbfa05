//! Room lifecycle and replication routing.
//!
//! State machine:
//! ```text
//!            enter(code)                Joined event
//!   Idle ─────────────────► Joining ─────────────────► Joined
//!    ▲   (code not local)      │                          │
//!    │                         │ join failed / Closed     │ Closed / enter()
//!    └─────────────────────────┴──────────────────────────┘
//! ```
//!
//! One session exists at a time. Entering a new code leaves the previous
//! room first; leave failures are logged and ignored. Each session runs a
//! task that routes inbound messages to the merge reducers, always into
//! the namespace of the code the session was opened for.
//!
//! Join handshake:
//! - a `PeerJoined` event triggers a sync `REQUEST` sent to that peer
//! - a fixed delay after `Joined`, a `REQUEST` is broadcast to everyone
//! - a `REQUEST` is answered with a `RESPONSE` sent only to the requester

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::model::{PartyCode, Player, Roll};
use crate::protocol::{Channel, SyncMessage, UpdateMessage};
use crate::store::Store;
use crate::transport::{PeerId, RoomEvent, RoomHandle, Transport, TransportError};

/// Connection state of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// No networking: local code, join failure, or room lost
    Idle,
    /// Room requested, channels not yet confirmed
    Joining,
    /// Room established; updates are broadcast
    Joined,
}

struct Session {
    state: RoomState,
    code: PartyCode,
    handle: Option<Arc<dyn RoomHandle>>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every enter/leave so stale tasks can tell they are stale
    generation: u64,
}

type SharedSession = Arc<Mutex<Session>>;

fn lock(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the peer-to-peer session for the active party code.
pub struct RoomManager {
    store: Store,
    transport: Arc<dyn Transport>,
    app_id: String,
    sync_delay: Duration,
    session: SharedSession,
}

impl RoomManager {
    pub fn new(store: Store, transport: Arc<dyn Transport>, app_id: impl Into<String>, sync_delay: Duration) -> Self {
        Self {
            store,
            transport,
            app_id: app_id.into(),
            sync_delay,
            session: Arc::new(Mutex::new(Session {
                state: RoomState::Idle,
                code: PartyCode::local(),
                handle: None,
                task: None,
                generation: 0,
            })),
        }
    }

    /// Switch the session to `code`.
    ///
    /// Leaves any previous room, then requests a room for `code` unless it
    /// is the local sentinel. Transport failures leave the session `Idle`.
    /// Entering the code of a live session (`Joining` or `Joined`) is a no-op.
    pub fn enter(&self, code: &PartyCode) {
        let mut session = lock(&self.session);
        if session.code == *code && session.state != RoomState::Idle {
            log::debug!("Already in room for party {code}");
            return;
        }
        Self::teardown(&mut session);
        session.code = code.clone();

        if code.is_local() {
            log::debug!("Party code is local; networking disabled");
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("No tokio runtime; party {code} stays offline");
                return;
            }
        };

        let link = match self.transport.join(&self.app_id, code) {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Could not join room for party {code}: {e}");
                return;
            }
        };

        let ctx = SessionContext {
            store: self.store.clone(),
            handle: link.handle.clone(),
            code: code.clone(),
            generation: session.generation,
            session: self.session.clone(),
            sync_delay: self.sync_delay,
        };
        session.state = RoomState::Joining;
        session.handle = Some(link.handle);
        session.task = Some(runtime.spawn(run_session(ctx, link.events)));
        log::info!("Joining room for party {code}");
    }

    /// Leave the current room, if any.
    pub fn leave(&self) {
        let mut session = lock(&self.session);
        Self::teardown(&mut session);
    }

    pub fn state(&self) -> RoomState {
        lock(&self.session).state
    }

    /// Code of the current session.
    pub fn code(&self) -> PartyCode {
        lock(&self.session).code.clone()
    }

    /// Broadcast a delta for `code` on the update channel.
    ///
    /// Sent only when the session is `Joined` to that same code. Returns
    /// whether the message was handed to the transport.
    pub fn broadcast_update(&self, code: &PartyCode, update: &UpdateMessage) -> bool {
        let session = lock(&self.session);
        if session.state != RoomState::Joined || session.code != *code {
            return false;
        }
        let Some(handle) = session.handle.as_ref() else {
            return false;
        };

        let body = match update.encode() {
            Ok(body) => body,
            Err(e) => {
                log::error!("Could not encode update: {e}");
                return false;
            }
        };
        match handle.send(Channel::Update, body, None) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Update broadcast for party {code} failed: {e}");
                false
            }
        }
    }

    fn teardown(session: &mut Session) {
        session.generation += 1;
        if let Some(handle) = session.handle.take() {
            if let Err(e) = handle.leave() {
                log::warn!("Leaving room for party {} failed: {e}", session.code);
            }
        }
        if let Some(task) = session.task.take() {
            task.abort();
        }
        session.state = RoomState::Idle;
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        self.leave();
    }
}

struct SessionContext {
    store: Store,
    handle: Arc<dyn RoomHandle>,
    code: PartyCode,
    generation: u64,
    session: SharedSession,
    sync_delay: Duration,
}

impl SessionContext {
    /// Update the shared state if this session is still the current one.
    fn set_state(&self, state: RoomState) -> bool {
        let mut session = lock(&self.session);
        if session.generation != self.generation {
            return false;
        }
        session.state = state;
        true
    }

    fn send_sync(&self, msg: &SyncMessage, to: Option<PeerId>) {
        let result = msg
            .encode()
            .map_err(TransportError::from)
            .and_then(|body| self.handle.send(Channel::Sync, body, to));
        if let Err(e) = result {
            log::warn!("Sync send for party {} failed: {e}", self.code);
        }
    }

    fn on_sync(&self, from: PeerId, body: &[u8]) {
        match SyncMessage::decode(body) {
            Ok(SyncMessage::Request) => {
                let players: Vec<Player> = self.store.read(&self.code);
                let rolls: Vec<Roll> = self.store.read(&self.code);
                log::debug!(
                    "Answering sync request from {from} with {} player(s), {} roll(s)",
                    players.len(),
                    rolls.len()
                );
                self.send_sync(&SyncMessage::response(players, rolls), Some(from));
            }
            Ok(SyncMessage::Response { players, rolls }) => {
                self.store.merge(&self.code, &players);
                self.store.merge(&self.code, &rolls);
            }
            Err(e) => log::warn!("Ignoring sync message from {from}: {e}"),
        }
    }

    fn on_update(&self, from: PeerId, body: &[u8]) {
        match UpdateMessage::decode(body) {
            Ok(UpdateMessage::Players { payload }) => {
                self.store.merge(&self.code, &payload);
            }
            Ok(UpdateMessage::Rolls { payload }) => {
                self.store.merge(&self.code, &payload);
            }
            Err(e) => log::warn!("Ignoring update from {from}: {e}"),
        }
    }
}

async fn run_session(ctx: SessionContext, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
    let ctx = Arc::new(ctx);

    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::Joined => {
                if !ctx.set_state(RoomState::Joined) {
                    break;
                }
                log::info!("Joined room for party {}", ctx.code);

                let delayed = ctx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delayed.sync_delay).await;
                    let current = {
                        let session = lock(&delayed.session);
                        session.generation == delayed.generation && session.state == RoomState::Joined
                    };
                    if current {
                        delayed.send_sync(&SyncMessage::Request, None);
                    }
                });
            }
            RoomEvent::PeerJoined(peer) => {
                log::debug!("Peer {peer} joined party {}", ctx.code);
                ctx.send_sync(&SyncMessage::Request, Some(peer));
            }
            RoomEvent::PeerLeft(peer) => {
                log::debug!("Peer {peer} left party {}", ctx.code);
            }
            RoomEvent::Message { channel, from, body } => match channel {
                Channel::Sync => ctx.on_sync(from, &body),
                Channel::Update => ctx.on_update(from, &body),
            },
            RoomEvent::Closed => break,
        }
    }

    if ctx.set_state(RoomState::Idle) {
        log::warn!("Room for party {} closed; continuing offline", ctx.code);
    }
}
