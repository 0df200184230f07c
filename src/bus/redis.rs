//! Redis pub/sub transport.
//!
//! Publishing goes through a multiplexed `ConnectionManager`, which is cheap
//! to clone and safe to share between any number of concurrent publish tasks.
//! Each subscription opens its own dedicated pub/sub connection, since Redis
//! puts a subscribed connection into a mode where it can only receive.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{BusError, Credentials, MessageListener, PubSubTransport, RedisConfig, Result};

/// Redis-backed [`PubSubTransport`].
pub struct RedisTransport {
    client: Client,
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisTransport {
    /// Open a connection using host, port, credentials and database index.
    ///
    /// Connecting is bounded by the configured timeout. No ping is issued
    /// here; `BusConnection` pings before declaring the bus usable.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let credentials = config.credentials();
        let client = Client::open(connection_info(config))?;
        let timeout = config.timeout();

        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                BusError::Connection(format!(
                    "Timed out after {:?} connecting to {}:{}",
                    timeout, config.host, config.port
                ))
            })?
            .map_err(|e| {
                BusError::Connection(format!(
                    "Failed to connect to {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;

        info!(
            host = %config.host,
            port = config.port,
            database = config.database,
            auth = credentials.kind(),
            "Connected to Redis"
        );

        Ok(Self {
            client,
            conn,
            timeout,
        })
    }
}

/// Translate configuration into redis connection parameters.
fn connection_info(config: &RedisConfig) -> ConnectionInfo {
    let (username, password) = match config.credentials() {
        Credentials::UserPassword { username, password } => (Some(username), Some(password)),
        Credentials::Password(password) => (None, Some(password)),
        Credentials::Anonymous => (None, None),
    };

    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            db: config.database,
            username,
            password,
            ..Default::default()
        },
    }
}

/// Await one pub/sub command, bounded by `limit`.
///
/// Both failure and timeout surface as `BusError::Subscribe`, so a stalled
/// server ends the listen call instead of leaving it waiting.
async fn subscribe_step<T, F>(limit: Duration, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BusError::Subscribe(format!("Failed to {}: {}", step, e))),
        Err(_) => Err(BusError::Subscribe(format!(
            "Timed out after {:?} trying to {}",
            limit, step
        ))),
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let pong: String = tokio::time::timeout(self.timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| {
                BusError::Connection(format!("PING timed out after {:?}", self.timeout))
            })??;

        debug!(reply = %pong, "Redis ping");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        debug!(channel = %channel, receivers, "Published to Redis channel");
        Ok(())
    }

    async fn listen(
        &self,
        channels: &[String],
        listener: Arc<dyn MessageListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut pubsub = subscribe_step(
            self.timeout,
            "open pub/sub connection",
            self.client.get_async_pubsub(),
        )
        .await?;

        subscribe_step(self.timeout, "subscribe", pubsub.subscribe(channels.to_vec())).await?;

        for channel in channels {
            listener.on_subscribe(channel);
        }

        let outcome = {
            let messages = pubsub.on_message();
            tokio::pin!(messages);

            loop {
                if *shutdown.borrow() {
                    break Ok(());
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            // Owner dropped without signalling; treat as shutdown.
                            break Ok(());
                        }
                    }
                    msg = messages.next() => match msg {
                        Some(msg) => match msg.get_payload::<String>() {
                            Ok(payload) => listener.on_message(msg.get_channel_name(), &payload),
                            Err(e) => warn!(
                                channel = %msg.get_channel_name(),
                                error = %e,
                                "Discarding non-text Redis payload"
                            ),
                        },
                        None => {
                            break Err(BusError::Subscribe(
                                "Redis subscription stream ended".to_string(),
                            ))
                        }
                    },
                }
            }
        };

        outcome?;

        subscribe_step(self.timeout, "unsubscribe", pubsub.unsubscribe(channels.to_vec())).await?;

        for channel in channels {
            listener.on_unsubscribe(channel);
        }

        Ok(())
    }
}
