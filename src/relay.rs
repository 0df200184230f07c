//! Relay facade.
//!
//! Wires settings, the bus connection, the publisher and the dispatcher
//! together. A master only publishes; every other process listens on its
//! own channel.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::bus::{BusConnection, BusError, PubSubTransport, PublishTask, Result};
use crate::config::{ConfigError, RelaySettings};
use crate::dispatcher::{Dispatcher, DispatcherState, Inbox};
use crate::envelope::MessageType;
use crate::publisher::Publisher;

/// One process's end of the cross-server relay.
pub struct Relay {
    settings: RelaySettings,
    connection: Arc<BusConnection>,
    publisher: Publisher,
    dispatcher: Arc<Dispatcher>,
}

impl Relay {
    /// Validate `settings` and assemble an unconnected relay.
    ///
    /// The returned [`Inbox`] is where accepted envelopes arrive once the
    /// relay is started as a follower.
    pub fn new(settings: RelaySettings) -> std::result::Result<(Self, Inbox), ConfigError> {
        settings.validate()?;

        let connection = Arc::new(BusConnection::new(settings.master));
        let publisher = Publisher::new(
            Arc::clone(&connection),
            Arc::new(settings.peers.clone()),
            settings.server_name.as_str(),
            settings.channel_prefix.as_str(),
        );
        let (dispatcher, inbox) = Dispatcher::new(
            settings.server_name.as_str(),
            &settings.channel_prefix,
            settings.listen_broadcast,
        );

        let relay = Self {
            settings,
            connection,
            publisher,
            dispatcher,
        };
        Ok((relay, inbox))
    }

    /// Connect to the configured Redis server.
    ///
    /// Returns `false` when the relay is disabled in configuration or the
    /// connection failed. Safe to call again after a failure.
    #[cfg(feature = "redis")]
    pub async fn start(&self) -> bool {
        if !self.settings.enabled {
            info!("Cross-server relay disabled in configuration");
            return false;
        }
        let connected = self.connection.initialize(&self.settings.redis).await;
        self.after_connect(connected).await
    }

    /// Like [`Relay::start`], over an already constructed transport.
    pub async fn start_with(&self, transport: Arc<dyn PubSubTransport>) -> bool {
        if !self.settings.enabled {
            info!("Cross-server relay disabled in configuration");
            return false;
        }
        let connected = self.connection.initialize_with(transport).await;
        self.after_connect(connected).await
    }

    async fn after_connect(&self, connected: bool) -> bool {
        if !connected {
            return false;
        }

        if self.settings.master {
            info!(
                server = %self.settings.server_name,
                peers = self.settings.peers.len(),
                "Cross-server relay publishing"
            );
            return true;
        }

        if self.dispatcher.state() == DispatcherState::Idle {
            if let Err(e) = self.dispatcher.start(&self.connection).await {
                error!(error = %e, "Failed to start cross-server listener");
            }
        }
        true
    }

    /// Re-establish a subscription that dropped.
    ///
    /// Never happens on its own; the host decides when to call this.
    pub async fn resubscribe(&self) -> Result<()> {
        if !self.connection.is_enabled() {
            return Err(BusError::NotEnabled);
        }
        if self.settings.master {
            debug!("Master does not listen, nothing to resubscribe");
            return Ok(());
        }
        self.dispatcher.start(&self.connection).await
    }

    /// Fan `payload` out to every enabled peer. See [`Publisher::publish_message`].
    pub fn publish_message(
        &self,
        kind: MessageType,
        payload: &str,
        correlation_id: Option<&str>,
    ) -> Vec<PublishTask> {
        self.publisher.publish_message(kind, payload, correlation_id)
    }

    /// Send `payload` on the shared broadcast channel.
    pub fn broadcast_message(
        &self,
        kind: MessageType,
        payload: &str,
        correlation_id: Option<&str>,
    ) -> Option<PublishTask> {
        self.publisher.broadcast_message(kind, payload, correlation_id)
    }

    pub fn is_enabled(&self) -> bool {
        self.connection.is_enabled()
    }

    pub fn is_master(&self) -> bool {
        self.settings.master
    }

    pub fn server_name(&self) -> &str {
        &self.settings.server_name
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<BusConnection> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Unsubscribe, close the bus and end any [`Inbox::run`] loop.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
        self.dispatcher.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelTransport, MockTransport};
    use crate::peers::{PeerConfig, PeerRegistry};

    fn settings(master: bool, name: &str) -> RelaySettings {
        RelaySettings {
            enabled: true,
            master,
            server_name: name.to_string(),
            peers: PeerRegistry::new(vec![PeerConfig::new("survival", true, vec![])]).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_validates_settings() {
        let invalid = RelaySettings {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(Relay::new(invalid), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_disabled_relay_stays_uninitialized() {
        let (relay, _inbox) = Relay::new(RelaySettings::default()).unwrap();

        assert!(!relay.start_with(Arc::new(MockTransport::new())).await);
        assert!(!relay.is_enabled());
        assert!(relay
            .publish_message(MessageType::Announcement, "hi", None)
            .is_empty());
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_master_does_not_listen() {
        let (relay, _inbox) = Relay::new(settings(true, "lobby")).unwrap();

        assert!(relay.start_with(Arc::new(MockTransport::new())).await);
        assert!(relay.is_enabled());
        assert_eq!(relay.dispatcher().state(), DispatcherState::Idle);
        assert!(relay.resubscribe().await.is_ok());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_listens_on_own_channel() {
        let transport = ChannelTransport::new();
        let (relay, _inbox) = Relay::new(settings(false, "survival")).unwrap();

        assert!(relay.start_with(Arc::new(transport.clone())).await);
        assert!(relay.connection().is_subscribed().await);
        assert_eq!(relay.dispatcher().channels(), &["arena:survival".to_string()]);

        relay.shutdown().await;
        assert!(!relay.is_enabled());
        assert_eq!(relay.dispatcher().state(), DispatcherState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let transport = Arc::new(MockTransport::unreachable());
        let (relay, _inbox) = Relay::new(settings(true, "lobby")).unwrap();

        assert!(!relay.start_with(transport.clone()).await);
        assert!(!relay.is_enabled());

        transport.set_fail_on_ping(false).await;
        assert!(relay.start_with(transport).await);
        assert!(relay.is_enabled());
    }

    #[tokio::test]
    async fn test_resubscribe_requires_connection() {
        let (relay, _inbox) = Relay::new(settings(false, "survival")).unwrap();
        assert!(matches!(
            relay.resubscribe().await,
            Err(BusError::NotEnabled)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_twice() {
        let (relay, _inbox) = Relay::new(settings(false, "survival")).unwrap();
        assert!(relay.start_with(Arc::new(ChannelTransport::new())).await);

        relay.shutdown().await;
        relay.shutdown().await;
        assert!(!relay.is_enabled());
    }
}
