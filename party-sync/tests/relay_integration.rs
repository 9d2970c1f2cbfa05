//! Integration tests for replication through the WebSocket relay.
//!
//! These tests start a real relay and connect real transports, verifying
//! the full pipeline from one device's store to another's.

use party_sync::clock::ManualClock;
use party_sync::model::{NewRoll, PartyCode};
use party_sync::party::{Party, PartyConfig};
use party_sync::protocol::Channel;
use party_sync::relay::{RelayConfig, RelayServer};
use party_sync::room::RoomState;
use party_sync::store::Store;
use party_sync::transport::{RoomEvent, RoomLink, Transport, WsTransport};

use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};

/// Start a relay on a free port, return it with its URL.
async fn start_test_relay() -> (RelayServer, String) {
    let server = RelayServer::new(RelayConfig::for_testing());
    let listener = server.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, url)
}

async fn next_event(link: &mut RoomLink) -> RoomEvent {
    timeout(Duration::from_secs(2), link.events.recv())
        .await
        .expect("event within timeout")
        .expect("room still open")
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn ws_party(url: &str, code: &str) -> Party {
    Party::with_clock(
        Store::in_memory(),
        Arc::new(WsTransport::new(url)),
        PartyConfig::for_testing(code),
        Arc::new(ManualClock::new(1000)),
    )
}

// ─── Transport level ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_is_acknowledged() {
    let (server, url) = start_test_relay().await;
    let transport = WsTransport::new(&url);
    let mut link = transport.join("app", &PartyCode::new("ABCD")).unwrap();

    assert_eq!(next_event(&mut link).await, RoomEvent::Joined);
    assert_eq!(server.rooms().room_count().await, 1);
    assert!(server.stats().await.total_connections >= 1);
}

#[tokio::test]
async fn test_peers_see_each_other_and_exchange_data() {
    let (_server, url) = start_test_relay().await;
    let transport = WsTransport::new(&url);
    let code = PartyCode::new("ABCD");

    let mut a = transport.join("app", &code).unwrap();
    assert_eq!(next_event(&mut a).await, RoomEvent::Joined);
    let mut b = transport.join("app", &code).unwrap();
    assert_eq!(next_event(&mut b).await, RoomEvent::Joined);

    let (pa, pb) = (a.handle.local_peer(), b.handle.local_peer());
    assert_eq!(next_event(&mut b).await, RoomEvent::PeerJoined(pa));
    assert_eq!(next_event(&mut a).await, RoomEvent::PeerJoined(pb));

    a.handle.send(Channel::Update, b"hello".to_vec(), None).unwrap();
    assert_eq!(
        next_event(&mut b).await,
        RoomEvent::Message {
            channel: Channel::Update,
            from: pa,
            body: b"hello".to_vec(),
        }
    );

    b.handle.send(Channel::Sync, b"direct".to_vec(), Some(pa)).unwrap();
    assert_eq!(
        next_event(&mut a).await,
        RoomEvent::Message {
            channel: Channel::Sync,
            from: pb,
            body: b"direct".to_vec(),
        }
    );

    b.handle.leave().unwrap();
    assert_eq!(next_event(&mut a).await, RoomEvent::PeerLeft(pb));
}

#[tokio::test]
async fn test_rooms_do_not_leak() {
    let (server, url) = start_test_relay().await;
    let transport = WsTransport::new(&url);

    let mut a = transport.join("app", &PartyCode::new("ABCD")).unwrap();
    let mut b = transport.join("app", &PartyCode::new("WXYZ")).unwrap();
    assert_eq!(next_event(&mut a).await, RoomEvent::Joined);
    assert_eq!(next_event(&mut b).await, RoomEvent::Joined);

    a.handle.send(Channel::Update, b"x".to_vec(), None).unwrap();
    assert!(timeout(Duration::from_millis(200), b.events.recv()).await.is_err());

    a.handle.leave().unwrap();
    b.handle.leave().unwrap();
    let rooms = server.rooms().clone();
    let deadline = Instant::now() + Duration::from_secs(2);
    while rooms.room_count().await > 0 {
        assert!(Instant::now() < deadline, "empty rooms were not removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─── Full pipeline ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_parties_replicate_through_relay() {
    let (_server, url) = start_test_relay().await;

    let d1 = ws_party(&url, "ABCD");
    eventually("D1 joined", || d1.room_state() == RoomState::Joined).await;
    let mo = d1.add_player("Mo", "🎲").unwrap();

    let d2 = ws_party(&url, "ABCD");
    eventually("snapshot on D2", || d2.players_once(None).len() == 1).await;
    assert_eq!(d2.players_once(None)[0].id, mo.id);

    // Live delta once both are joined.
    eventually("D2 joined", || d2.room_state() == RoomState::Joined).await;
    d1.save_roll(NewRoll {
        player_id: Some(mo.id.clone()),
        player_name: mo.name.clone(),
        dice_values: vec![6, 6],
        session_id: "s".into(),
        round_number: 1,
    })
    .unwrap();
    eventually("roll on D2", || d2.rolls_once(None).len() == 1).await;
    assert_eq!(d2.rolls_once(None)[0].total, 12);
}

#[tokio::test]
async fn test_relay_unreachable_stays_local() {
    let party = ws_party("ws://127.0.0.1:1", "ABCD");
    eventually("room closed", || party.room_state() == RoomState::Idle).await;
    assert!(party.add_player("Mo", "").is_ok());
    assert_eq!(party.players_once(None).len(), 1);
}
