//! Outbound fan-out.
//!
//! One application event becomes one envelope per enabled peer, each sent on
//! that peer's own channel. Scopes travel with the envelope and are applied
//! by the receiver; nothing is filtered here.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::{channel_name, BusConnection, PublishTask, BROADCAST_IDENTITY};
use crate::envelope::{Envelope, MessageType};
use crate::peers::PeerRegistry;

/// Builds and publishes envelopes on behalf of the local server.
pub struct Publisher {
    connection: Arc<BusConnection>,
    registry: Arc<PeerRegistry>,
    local_identity: String,
    channel_prefix: String,
}

impl Publisher {
    pub fn new(
        connection: Arc<BusConnection>,
        registry: Arc<PeerRegistry>,
        local_identity: impl Into<String>,
        channel_prefix: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            registry,
            local_identity: local_identity.into(),
            channel_prefix: channel_prefix.into(),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    fn can_publish(&self) -> bool {
        if !self.connection.is_enabled() {
            debug!("Bus not enabled, skipping cross-server publish");
            return false;
        }
        if !self.connection.is_master() {
            debug!("Not master, skipping cross-server publish");
            return false;
        }
        true
    }

    /// Publish `payload` to every enabled peer, in registry order.
    ///
    /// Returns one task per peer actually published to. Empty when the bus
    /// is not enabled or this process is not master.
    pub fn publish_message(
        &self,
        kind: MessageType,
        payload: &str,
        correlation_id: Option<&str>,
    ) -> Vec<PublishTask> {
        if !self.can_publish() {
            return Vec::new();
        }

        let mut tasks = Vec::new();
        for peer in self.registry.enabled() {
            let scopes = (!peer.scopes().is_empty()).then(|| peer.scopes().to_vec());

            let envelope =
                Envelope::builder(kind.clone(), self.local_identity.as_str(), peer.identity())
                    .payload(payload)
                    .target_scopes(scopes)
                    .correlation_id(correlation_id.map(str::to_string))
                    .build();

            let envelope = match envelope {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(peer = %peer.identity(), error = %e, "Skipping peer, invalid envelope");
                    continue;
                }
            };

            let channel = channel_name(&self.channel_prefix, peer.identity());
            if let Some(task) = self.connection.publish(channel, &envelope) {
                tasks.push(task);
            }
        }

        debug!(kind = %kind, peers = tasks.len(), "Fanned out cross-server message");
        tasks
    }

    /// Publish one envelope on the shared broadcast channel.
    ///
    /// Only followers started with broadcast listening receive it.
    pub fn broadcast_message(
        &self,
        kind: MessageType,
        payload: &str,
        correlation_id: Option<&str>,
    ) -> Option<PublishTask> {
        if !self.can_publish() {
            return None;
        }

        let envelope = Envelope::builder(kind, self.local_identity.as_str(), BROADCAST_IDENTITY)
            .payload(payload)
            .correlation_id(correlation_id.map(str::to_string))
            .build();

        match envelope {
            Ok(envelope) => self
                .connection
                .publish(channel_name(&self.channel_prefix, BROADCAST_IDENTITY), &envelope),
            Err(e) => {
                warn!(error = %e, "Invalid broadcast envelope");
                None
            }
        }
    }
}
