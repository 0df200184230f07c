//! End-to-end relay flow over in-process transports.
//!
//! Run with: cargo test --test relay_flow
//!
//! Master and followers share one `ChannelTransport`, so publish, dispatch
//! and handler delivery are exercised without a Redis server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arena_relay::bus::{ChannelTransport, MockTransport, PubSubTransport};
use arena_relay::config::RelaySettings;
use arena_relay::dispatcher::{DispatcherState, Inbox};
use arena_relay::envelope::{Envelope, MessageType};
use arena_relay::handler::{MessageHandler, ScopedBroadcastHandler, SessionRuntime};
use arena_relay::peers::{PeerConfig, PeerRegistry};
use arena_relay::relay::Relay;

const WAIT: Duration = Duration::from_secs(2);

fn settings(name: &str, master: bool, peers: Vec<PeerConfig>) -> RelaySettings {
    RelaySettings {
        enabled: true,
        master,
        server_name: name.to_string(),
        peers: PeerRegistry::new(peers).expect("valid peers"),
        ..Default::default()
    }
}

async fn master(transport: Arc<dyn PubSubTransport>, peers: Vec<PeerConfig>) -> Relay {
    let (relay, _inbox) = Relay::new(settings("lobby", true, peers)).unwrap();
    assert!(relay.start_with(transport).await);
    relay
}

async fn follower(transport: &ChannelTransport, settings: RelaySettings) -> (Relay, Inbox) {
    let (relay, inbox) = Relay::new(settings).unwrap();
    assert!(relay.start_with(Arc::new(transport.clone())).await);

    let mut states = relay.dispatcher().watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == DispatcherState::Listening))
        .await
        .expect("follower never started listening")
        .unwrap();

    (relay, inbox)
}

async fn next(inbox: &mut Inbox) -> Envelope {
    tokio::time::timeout(WAIT, inbox.recv())
        .await
        .expect("no envelope arrived")
        .expect("inbox closed")
}

/// Session runtime where each scope holds a fixed set of players.
#[derive(Default)]
struct Players {
    scopes: HashMap<String, Vec<String>>,
    delivered: Vec<(String, String)>,
    broadcasts: Vec<String>,
}

impl SessionRuntime for Players {
    type Session = String;

    fn sessions_in_scope(&self, scope: &str) -> Option<Vec<String>> {
        self.scopes.get(scope).cloned()
    }

    fn send(&mut self, session: &String, text: &str) {
        self.delivered.push((session.clone(), text.to_string()));
    }

    fn broadcast(&mut self, text: &str) {
        self.broadcasts.push(text.to_string());
    }
}

#[tokio::test]
async fn test_only_enabled_peer_is_published_to() {
    let transport = Arc::new(MockTransport::new());
    let relay = master(
        transport.clone(),
        vec![
            PeerConfig::new("A", true, vec![]),
            PeerConfig::new("B", false, vec![]),
        ],
    )
    .await;

    for task in relay.publish_message(MessageType::Announcement, "hello", None) {
        task.await.unwrap();
    }

    let published = transport.published().await;
    assert_eq!(published.len(), 1);
    let (channel, payload) = &published[0];
    assert_eq!(channel, "arena:A");
    assert!(payload.contains(r#""targetServer":"A""#));
    assert!(payload.contains(r#""message":"hello""#));
    assert!(payload.contains(r#""sourceServer":"lobby""#));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_scoped_message_reaches_players_in_scope() {
    let transport = ChannelTransport::new();
    let (survival, mut inbox) = follower(&transport, settings("survival", false, vec![])).await;
    let lobby = master(
        Arc::new(transport.clone()),
        vec![PeerConfig::new(
            "survival",
            true,
            vec!["arena".to_string(), "arena_nether".to_string()],
        )],
    )
    .await;

    let tasks = lobby.publish_message(
        MessageType::GameStarting,
        "Game starting in 30s",
        Some("g-42"),
    );
    assert_eq!(tasks.len(), 1);

    let envelope = next(&mut inbox).await;
    assert_eq!(envelope.kind(), &MessageType::GameStarting);
    assert_eq!(envelope.source_server(), "lobby");
    assert_eq!(envelope.correlation_id(), Some("g-42"));

    let mut players = Players::default();
    players.scopes.insert("arena".into(), vec!["alex".into()]);
    players.scopes.insert("arena_nether".into(), vec!["kim".into()]);
    players.scopes.insert("spawn".into(), vec!["lee".into()]);
    let mut handler = ScopedBroadcastHandler::new(players);
    handler.handle(&envelope);

    let players = handler.into_runtime();
    let recipients: Vec<&str> = players.delivered.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(recipients, vec!["alex", "kim"]);
    assert!(players.broadcasts.is_empty());

    lobby.shutdown().await;
    survival.shutdown().await;
}

#[tokio::test]
async fn test_foreign_target_never_reaches_handler() {
    let transport = ChannelTransport::new();
    let (survival, mut inbox) = follower(&transport, settings("survival", false, vec![])).await;

    // Misrouted: addressed to creative but sent on survival's channel.
    let foreign = Envelope::new(MessageType::Announcement, "lobby", "creative", "not for you")
        .unwrap()
        .to_json()
        .unwrap();
    transport.publish("arena:survival", &foreign).await.unwrap();
    transport.publish("arena:survival", "{not json").await.unwrap();

    let own = Envelope::new(MessageType::Announcement, "lobby", "survival", "for you")
        .unwrap()
        .to_json()
        .unwrap();
    transport.publish("arena:survival", &own).await.unwrap();

    let envelope = next(&mut inbox).await;
    assert_eq!(envelope.payload(), "for you");

    // Deliveries are processed in order, so both discards happened already.
    let stats = survival.dispatcher().stats();
    assert_eq!(stats.foreign, 1);
    assert_eq!(stats.malformed, 1);

    survival.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_channel_is_opt_in() {
    let transport = ChannelTransport::new();

    let mut listening = settings("survival", false, vec![]);
    listening.listen_broadcast = true;
    let (survival, mut survival_inbox) = follower(&transport, listening).await;
    let (creative, mut creative_inbox) =
        follower(&transport, settings("creative", false, vec![])).await;

    let lobby = master(Arc::new(transport.clone()), vec![]).await;
    lobby
        .broadcast_message(MessageType::GameEnded, "Alex won", None)
        .expect("master publishes broadcasts")
        .await
        .unwrap();

    let envelope = next(&mut survival_inbox).await;
    assert_eq!(envelope.payload(), "Alex won");
    assert!(!envelope.is_scoped());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut seen = 0;
    creative_inbox.drain(&mut |_: &Envelope| seen += 1);
    assert_eq!(seen, 0);

    lobby.shutdown().await;
    survival.shutdown().await;
    creative.shutdown().await;
}

#[tokio::test]
async fn test_follower_does_not_publish() {
    let transport = ChannelTransport::new();
    let (survival, _inbox) = follower(
        &transport,
        settings("survival", false, vec![PeerConfig::new("creative", true, vec![])]),
    )
    .await;

    assert!(survival
        .publish_message(MessageType::Announcement, "hello", None)
        .is_empty());

    survival.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_inbox_run() {
    let transport = ChannelTransport::new();
    let (survival, inbox) = follower(&transport, settings("survival", false, vec![])).await;
    let lobby = master(
        Arc::new(transport.clone()),
        vec![PeerConfig::new("survival", true, vec![])],
    )
    .await;

    let runner = tokio::spawn(async move {
        let mut handler = ScopedBroadcastHandler::new(Players::default());
        inbox.run(&mut handler).await;
        handler.into_runtime()
    });

    for task in lobby.publish_message(MessageType::PlayerDied, "Sam was eliminated", None) {
        task.await.unwrap();
    }
    // Let the listener deliver before unsubscribing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    survival.shutdown().await;
    assert!(!survival.is_enabled());
    survival.shutdown().await;

    let players = tokio::time::timeout(WAIT, runner)
        .await
        .expect("inbox run did not stop")
        .unwrap();
    assert_eq!(players.broadcasts, vec!["Sam was eliminated"]);

    lobby.shutdown().await;
}

#[tokio::test]
async fn test_dropped_subscription_can_be_resubscribed() {
    let transport = ChannelTransport::new();
    let (survival, mut inbox) = follower(&transport, settings("survival", false, vec![])).await;

    let mut states = survival.dispatcher().watch_state();
    transport.sever();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == DispatcherState::Idle))
        .await
        .expect("dispatcher never went idle")
        .unwrap();

    // The worker may still be finishing; retry until the slot frees up.
    let mut resubscribed = false;
    for _ in 0..100 {
        if survival.resubscribe().await.is_ok() {
            resubscribed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(resubscribed);

    tokio::time::timeout(WAIT, states.wait_for(|s| *s == DispatcherState::Listening))
        .await
        .expect("dispatcher never resumed")
        .unwrap();

    let own = Envelope::new(MessageType::Announcement, "lobby", "survival", "back")
        .unwrap()
        .to_json()
        .unwrap();
    transport.publish("arena:survival", &own).await.unwrap();
    assert_eq!(next(&mut inbox).await.payload(), "back");

    survival.shutdown().await;
}
