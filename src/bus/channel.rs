//! In-memory channel-based transport for standalone mode.
//!
//! Uses a tokio broadcast channel to emulate pub/sub within a single process.
//! Ideal for local development and testing without a Redis server.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use super::{BusError, MessageListener, PubSubTransport, Result};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Delivery {
    channel: String,
    payload: String,
}

/// In-process [`PubSubTransport`] backed by a tokio broadcast channel.
///
/// Every listener sees every publish and keeps only payloads for the
/// channels it subscribed to. Clones share the same underlying channel, so
/// one clone can act as the master and another as a follower.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: broadcast::Sender<Arc<Delivery>>,
    /// Flips to `true` to simulate the broker dropping every subscription.
    severed: Arc<watch::Sender<bool>>,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (severed, _) = watch::channel(false);

        info!("Channel transport initialized");

        Self {
            sender,
            severed: Arc::new(severed),
        }
    }

    /// Drop every active subscription as if the broker connection was lost.
    ///
    /// Listeners return an error; later subscriptions work normally.
    pub fn sever(&self) {
        self.severed.send_replace(true);
        self.severed.send_replace(false);
    }

    /// Number of listeners currently attached.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl PubSubTransport for ChannelTransport {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let delivery = Arc::new(Delivery {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });

        // No receivers is fine for publish-only scenarios.
        match self.sender.send(delivery) {
            Ok(receivers) => debug!(channel = %channel, receivers, "Published to channel"),
            Err(_) => debug!(channel = %channel, "Published to channel (no receivers)"),
        }
        Ok(())
    }

    async fn listen(
        &self,
        channels: &[String],
        listener: Arc<dyn MessageListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut receiver = self.sender.subscribe();
        let mut severed = self.severed.subscribe();

        for channel in channels {
            listener.on_subscribe(channel);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = severed.changed() => {
                    return Err(BusError::Subscribe("Channel transport severed".to_string()));
                }
                received = receiver.recv() => match received {
                    Ok(delivery) => {
                        if channels.iter().any(|c| *c == delivery.channel) {
                            listener.on_message(&delivery.channel, &delivery.payload);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel listener lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BusError::Subscribe("Channel closed".to_string()));
                    }
                },
            }
        }

        for channel in channels {
            listener.on_unsubscribe(channel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, String)>>,
        unsubscribed: Mutex<Vec<String>>,
    }

    impl MessageListener for Recorder {
        fn on_message(&self, channel: &str, payload: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.to_string()));
        }

        fn on_unsubscribe(&self, channel: &str) {
            self.unsubscribed.lock().unwrap().push(channel.to_string());
        }
    }

    async fn wait_for_listener(transport: &ChannelTransport) {
        for _ in 0..100 {
            if transport.listener_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("listener never attached");
    }

    #[tokio::test]
    async fn test_publish_no_receivers() {
        let transport = ChannelTransport::new();
        assert!(transport.publish("arena:lobby", "{}").await.is_ok());
    }

    #[tokio::test]
    async fn test_listen_filters_by_channel() {
        let transport = ChannelTransport::new();
        let recorder = Arc::new(Recorder::default());
        let (stop, stop_rx) = watch::channel(false);

        let worker = {
            let transport = transport.clone();
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                transport
                    .listen(&["arena:survival".to_string()], recorder, stop_rx)
                    .await
            })
        };
        wait_for_listener(&transport).await;

        transport.publish("arena:survival", "mine").await.unwrap();
        transport.publish("arena:creative", "not mine").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop.send(true).unwrap();
        worker.await.unwrap().unwrap();

        let messages = recorder.messages.lock().unwrap().clone();
        assert_eq!(
            messages,
            vec![("arena:survival".to_string(), "mine".to_string())]
        );
        assert_eq!(
            recorder.unsubscribed.lock().unwrap().clone(),
            vec!["arena:survival".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sever_ends_listener_with_error() {
        let transport = ChannelTransport::new();
        let recorder = Arc::new(Recorder::default());
        let (_stop, stop_rx) = watch::channel(false);

        let worker = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .listen(&["arena:survival".to_string()], recorder, stop_rx)
                    .await
            })
        };
        wait_for_listener(&transport).await;

        transport.sever();

        let result = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(matches!(result, Err(BusError::Subscribe(_))));
    }
}
