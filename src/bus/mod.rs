//! Cross-server pub/sub bus.
//!
//! This module contains:
//! - `PubSubTransport` trait: the capabilities the relay needs from a broker
//! - `MessageListener` trait: callback surface the transport drives
//! - `BusConnection`: owns the transport and its lifecycle
//! - Bus configuration types
//! - Implementations: Redis, in-process channel, Mock

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::envelope::Envelope;

// Implementation modules
pub mod channel;
pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

// Re-exports
pub use channel::ChannelTransport;
pub use mock::MockTransport;
#[cfg(feature = "redis")]
pub use self::redis::RedisTransport;

/// Channel prefix used when configuration does not set one.
pub const DEFAULT_CHANNEL_PREFIX: &str = "arena:";

/// Reserved identity addressing every peer at once.
pub const BROADCAST_IDENTITY: &str = "broadcast";

/// How long shutdown waits for the listener worker to unsubscribe.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Channel a peer with `identity` subscribes to.
pub fn channel_name(prefix: &str, identity: &str) -> String {
    format!("{}{}", prefix, identity)
}

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] crate::envelope::EnvelopeError),

    #[error("Bus is not enabled")]
    NotEnabled,

    #[error("A subscription is already active on {0:?}")]
    AlreadySubscribed(Vec<String>),

    #[error("Subscribe not supported for this transport")]
    SubscribeNotSupported,

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Receives inbound traffic from a subscription.
///
/// Implementations are called on the transport's listener worker and must
/// return quickly; anything slow belongs on the host's own context.
pub trait MessageListener: Send + Sync {
    /// One inbound payload on `channel`.
    fn on_message(&self, channel: &str, payload: &str);

    /// The transport confirmed the subscription to `channel`.
    fn on_subscribe(&self, _channel: &str) {}

    /// The transport confirmed an explicit unsubscribe from `channel`.
    fn on_unsubscribe(&self, _channel: &str) {}

    /// The subscription ended because of a transport error.
    fn on_error(&self, _error: &BusError) {}
}

/// Broker capabilities the relay depends on.
///
/// Implementations:
/// - `RedisTransport`: Redis pub/sub
/// - `ChannelTransport`: tokio broadcast channel, single process
/// - `MockTransport`: records publishes for tests
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Round-trip liveness check.
    async fn ping(&self) -> Result<()>;

    /// Send one payload on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channels` and feed every payload to `listener`.
    ///
    /// Runs until `shutdown` flips to `true` (explicit unsubscribe, returns
    /// `Ok`) or the connection fails (returns `Err`).
    async fn listen(
        &self,
        channels: &[String],
        listener: Arc<dyn MessageListener>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;

    /// Release pooled connections.
    async fn close(&self) {}
}

// ============================================================================
// Configuration
// ============================================================================

/// Redis connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Server host name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Connect and ping timeout in milliseconds.
    pub timeout_ms: u64,
    /// ACL username (Redis 6+). Ignored without a password.
    pub username: Option<String>,
    /// Password for AUTH.
    pub password: Option<String>,
    /// Logical database index.
    pub database: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            timeout_ms: 2000,
            username: None,
            password: None,
            database: 0,
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the authentication mode.
    ///
    /// Username and password win over password-only, which wins over
    /// anonymous. Blank strings count as unset.
    pub fn credentials(&self) -> Credentials {
        let present = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        match (present(&self.username), present(&self.password)) {
            (Some(username), Some(password)) => Credentials::UserPassword { username, password },
            (None, Some(password)) => Credentials::Password(password),
            _ => Credentials::Anonymous,
        }
    }
}

/// Authentication mode derived from [`RedisConfig`].
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    UserPassword { username: String, password: String },
    Password(String),
    Anonymous,
}

impl Credentials {
    /// Label safe for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserPassword { .. } => "username+password",
            Self::Password(_) => "password",
            Self::Anonymous => "anonymous",
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Lifecycle of a [`BusConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    /// Initialization failed; `initialize` may be called again.
    Failed,
    /// Shut down. Terminal.
    Closed,
}

/// Handle for a spawned publish task.
///
/// Awaiting it is optional; publish failures are logged inside the task.
pub type PublishTask = JoinHandle<()>;

struct Subscription {
    channels: Vec<String>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

/// Owns the transport connection and its lifecycle.
///
/// Shared by `Arc` between the publisher path and the dispatcher; only this
/// type changes the connection state.
pub struct BusConnection {
    /// Publisher-capable ("master") process.
    master: bool,
    state: watch::Sender<ConnectionState>,
    transport: Arc<RwLock<Option<Arc<dyn PubSubTransport>>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl BusConnection {
    pub fn new(master: bool) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            master,
            state,
            transport: Arc::new(RwLock::new(None)),
            subscription: Mutex::new(None),
        }
    }

    /// Connect to Redis and ping it.
    ///
    /// Returns `false` and leaves the connection `Failed` on any error. There
    /// is no internal retry; the host may call this again.
    #[cfg(feature = "redis")]
    pub async fn initialize(&self, config: &RedisConfig) -> bool {
        self.establish(async {
            let transport = RedisTransport::connect(config).await?;
            Ok(Arc::new(transport) as Arc<dyn PubSubTransport>)
        })
        .await
    }

    /// Adopt an already constructed transport, pinging it first.
    pub async fn initialize_with(&self, transport: Arc<dyn PubSubTransport>) -> bool {
        self.establish(async { Ok(transport) }).await
    }

    async fn establish<F>(&self, connect: F) -> bool
    where
        F: Future<Output = Result<Arc<dyn PubSubTransport>>>,
    {
        let mut previous = ConnectionState::Uninitialized;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            match state {
                ConnectionState::Uninitialized | ConnectionState::Failed => {
                    *state = ConnectionState::Connecting;
                    true
                }
                _ => false,
            }
        });

        if !started {
            return match previous {
                ConnectionState::Connected => true,
                ConnectionState::Closed => {
                    warn!("Cannot initialize a bus connection that was shut down");
                    false
                }
                _ => {
                    warn!("Bus connection is already initializing");
                    false
                }
            };
        }

        let transport = match connect.await {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "Failed to connect to pub/sub server");
                self.fail_connecting();
                return false;
            }
        };

        if let Err(e) = transport.ping().await {
            error!(error = %e, "Pub/sub server did not answer ping");
            transport.close().await;
            self.fail_connecting();
            return false;
        }

        *self.transport.write().await = Some(Arc::clone(&transport));

        let connected = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });

        if !connected {
            // Shut down while we were pinging.
            if let Some(transport) = self.transport.write().await.take() {
                transport.close().await;
            }
            return false;
        }

        info!(master = self.master, "Successfully connected to pub/sub server");
        true
    }

    fn fail_connecting(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Failed;
                true
            } else {
                false
            }
        });
    }

    /// True only after a successful initialize and before shutdown.
    pub fn is_enabled(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Serialize `envelope` and send it on `channel` from a spawned task.
    ///
    /// No-op (returns `None`) unless the connection is enabled and this
    /// process is master. Failures are logged and the message is dropped.
    /// Must be called from within a tokio runtime.
    pub fn publish(&self, channel: impl Into<String>, envelope: &Envelope) -> Option<PublishTask> {
        if !self.master {
            debug!("Not master, skipping publish");
            return None;
        }
        if !self.is_enabled() {
            debug!(state = ?self.state(), "Bus not enabled, skipping publish");
            return None;
        }

        let channel = channel.into();
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to serialize cross-server message");
                return None;
            }
        };

        let transport = Arc::clone(&self.transport);
        let span = tracing::debug_span!(
            "bus.publish",
            channel = %channel,
            kind = %envelope.kind()
        );

        Some(tokio::spawn(
            async move {
                let transport = transport.read().await.clone();
                let Some(transport) = transport else {
                    debug!("Bus closed before publish ran, dropping message");
                    return;
                };

                match transport.publish(&channel, &payload).await {
                    Ok(()) => debug!("Published cross-server message"),
                    Err(e) => warn!(error = %e, "Failed to publish cross-server message"),
                }
            }
            .instrument(span),
        ))
    }

    /// Start the listener worker on `channels`.
    ///
    /// Only one subscription may be active. A subscription whose worker
    /// already exited (connection lost) is replaced.
    pub async fn subscribe(
        &self,
        channels: Vec<String>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Err(BusError::NotEnabled);
        }

        let mut slot = self.subscription.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.worker.is_finished() {
                return Err(BusError::AlreadySubscribed(active.channels.clone()));
            }
        }

        let transport = self
            .transport
            .read()
            .await
            .clone()
            .ok_or(BusError::NotEnabled)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_channels = channels.clone();

        let worker = tokio::spawn(async move {
            info!(channels = ?worker_channels, "Starting cross-server message listener");
            match transport
                .listen(&worker_channels, Arc::clone(&listener), shutdown_rx)
                .await
            {
                Ok(()) => debug!(channels = ?worker_channels, "Listener stopped"),
                Err(e) => {
                    warn!(
                        channels = ?worker_channels,
                        error = %e,
                        "Cross-server message listener error"
                    );
                    listener.on_error(&e);
                }
            }
        });

        *slot = Some(Subscription {
            channels,
            shutdown: shutdown_tx,
            worker,
        });

        Ok(())
    }

    /// Whether a listener worker is currently running.
    pub async fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.worker.is_finished())
    }

    /// Unsubscribe, close the transport and move to `Closed`.
    ///
    /// Idempotent, and safe to call from any task, including when the
    /// connection was never initialized.
    pub async fn shutdown(&self) {
        let previous = self.state.send_replace(ConnectionState::Closed);

        // Taken in its own statement so the lock is free while we wait.
        let taken = self.subscription.lock().await.take();
        if let Some(subscription) = taken {
            // The worker may already be gone; nothing to signal then.
            let _ = subscription.shutdown.send(true);

            let mut worker = subscription.worker;
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Listener worker ended abnormally"),
                Err(_) => {
                    warn!("Listener did not unsubscribe in time, aborting worker");
                    worker.abort();
                }
            }
        }

        if let Some(transport) = self.transport.write().await.take() {
            transport.close().await;
        }

        if previous != ConnectionState::Closed {
            info!("Cross-server bus closed");
        }
    }
}
