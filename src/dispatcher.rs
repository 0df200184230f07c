//! Inbound message dispatch.
//!
//! The dispatcher is the [`MessageListener`] for this process's own channel.
//! It runs on the transport's listener worker, so it only decodes, filters
//! and queues. Accepted envelopes are handed to the host through an
//! [`Inbox`], which the host drains on its own single-threaded context.
//!
//! ```text
//! [listener worker] --on_message--> Dispatcher --mpsc--> Inbox --drain/run--> MessageHandler
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::{
    channel_name, BusConnection, BusError, MessageListener, Result, BROADCAST_IDENTITY,
};
use crate::envelope::Envelope;
use crate::handler::MessageHandler;

/// Lifecycle of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Subscribing,
    Listening,
    /// Explicitly unsubscribed. Terminal.
    Unsubscribed,
}

/// Outcome of dispatching one raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Queued for the host handler.
    Accepted,
    /// Addressed to another server.
    Foreign,
    /// Could not be decoded.
    Malformed,
    /// Accepted, but the host inbox is gone.
    Undeliverable,
}

/// Running totals of dispatch outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub accepted: u64,
    pub foreign: u64,
    pub malformed: u64,
    pub undeliverable: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    foreign: AtomicU64,
    malformed: AtomicU64,
    undeliverable: AtomicU64,
}

/// Filters inbound traffic and forwards matches to the host.
pub struct Dispatcher {
    local_identity: String,
    accept_broadcast: bool,
    channels: Vec<String>,
    outbox: mpsc::UnboundedSender<Envelope>,
    state: watch::Sender<DispatcherState>,
    counters: Counters,
}

impl Dispatcher {
    /// Create a dispatcher for `local_identity` and the host-side inbox.
    ///
    /// With `accept_broadcast`, the dispatcher also listens on the shared
    /// broadcast channel and accepts envelopes addressed to the reserved
    /// broadcast identity.
    pub fn new(
        local_identity: impl Into<String>,
        channel_prefix: &str,
        accept_broadcast: bool,
    ) -> (Arc<Self>, Inbox) {
        let local_identity = local_identity.into();

        let mut channels = vec![channel_name(channel_prefix, &local_identity)];
        if accept_broadcast {
            channels.push(channel_name(channel_prefix, BROADCAST_IDENTITY));
        }

        let (outbox, receiver) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(DispatcherState::Idle);

        let dispatcher = Arc::new(Self {
            local_identity,
            accept_broadcast,
            channels,
            outbox,
            state,
            counters: Counters::default(),
        });

        let inbox = Inbox {
            receiver,
            state: state_rx,
        };

        (dispatcher, inbox)
    }

    /// Subscribe to this process's channel(s) on `connection`.
    ///
    /// Only valid from `Idle`. A subscription that dropped puts the
    /// dispatcher back in `Idle`, so the host may call this again.
    pub async fn start(self: &Arc<Self>, connection: &BusConnection) -> Result<()> {
        let mut previous = DispatcherState::Idle;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == DispatcherState::Idle {
                *state = DispatcherState::Subscribing;
                true
            } else {
                false
            }
        });

        if !started {
            return match previous {
                DispatcherState::Unsubscribed => Err(BusError::Subscribe(
                    "Dispatcher was already unsubscribed".to_string(),
                )),
                _ => Err(BusError::AlreadySubscribed(self.channels.clone())),
            };
        }

        let listener: Arc<dyn MessageListener> = Arc::clone(self) as Arc<dyn MessageListener>;
        if let Err(e) = connection.subscribe(self.channels.clone(), listener).await {
            self.state.send_replace(DispatcherState::Idle);
            return Err(e);
        }

        info!(
            identity = %self.local_identity,
            channels = ?self.channels,
            "Dispatcher subscribing"
        );
        Ok(())
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// Channels this dispatcher subscribes to.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            foreign: self.counters.foreign.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            undeliverable: self.counters.undeliverable.load(Ordering::Relaxed),
        }
    }

    fn is_addressed_here(&self, envelope: &Envelope) -> bool {
        envelope.target_server() == self.local_identity
            || (self.accept_broadcast && envelope.target_server() == BROADCAST_IDENTITY)
    }

    /// Decode, filter and queue one raw payload.
    pub fn dispatch(&self, channel: &str, payload: &str) -> Disposition {
        let Some(envelope) = Envelope::from_json(payload) else {
            warn!(channel = %channel, "Discarding malformed cross-server message");
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return Disposition::Malformed;
        };

        if !self.is_addressed_here(&envelope) {
            debug!(
                channel = %channel,
                target = %envelope.target_server(),
                "Discarding message addressed to another server"
            );
            self.counters.foreign.fetch_add(1, Ordering::Relaxed);
            return Disposition::Foreign;
        }

        debug!(
            channel = %channel,
            source = %envelope.source_server(),
            kind = %envelope.kind(),
            "Queued cross-server message for handler"
        );

        if self.outbox.send(envelope).is_err() {
            warn!(channel = %channel, "Host inbox closed, dropping cross-server message");
            self.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
            return Disposition::Undeliverable;
        }

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Disposition::Accepted
    }

    /// Move to `Unsubscribed`, which also ends [`Inbox::run`].
    ///
    /// Called on explicit unsubscribe, and by the relay at shutdown for
    /// dispatchers that never subscribed.
    pub fn close(&self) {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == DispatcherState::Unsubscribed {
                false
            } else {
                *state = DispatcherState::Unsubscribed;
                true
            }
        });

        if transitioned {
            let stats = self.stats();
            info!(
                accepted = stats.accepted,
                foreign = stats.foreign,
                malformed = stats.malformed,
                undeliverable = stats.undeliverable,
                "Dispatcher stopped"
            );
        }
    }
}

impl MessageListener for Dispatcher {
    fn on_message(&self, channel: &str, payload: &str) {
        self.dispatch(channel, payload);
    }

    fn on_subscribe(&self, channel: &str) {
        info!(channel = %channel, "Subscribed to cross-server channel");
        self.state.send_if_modified(|state| {
            if *state == DispatcherState::Subscribing {
                *state = DispatcherState::Listening;
                true
            } else {
                false
            }
        });
    }

    fn on_unsubscribe(&self, channel: &str) {
        info!(channel = %channel, "Unsubscribed from cross-server channel");
        self.close();
    }

    fn on_error(&self, error: &BusError) {
        warn!(error = %error, "Subscription lost, dispatcher idle");
        self.state.send_if_modified(|state| match state {
            DispatcherState::Subscribing | DispatcherState::Listening => {
                *state = DispatcherState::Idle;
                true
            }
            _ => false,
        });
    }
}

/// Host end of the dispatch hand-off.
///
/// Handlers run wherever the host drains this, never on the bus worker.
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    state: watch::Receiver<DispatcherState>,
}

impl Inbox {
    /// Run every queued envelope through `handler` without waiting.
    ///
    /// Suited to a tick loop. Returns the number handled.
    pub fn drain<H: MessageHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.receiver.try_recv() {
            handler.handle(&envelope);
            handled += 1;
        }
        handled
    }

    /// Wait for the next envelope.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Feed envelopes to `handler` until the dispatcher unsubscribes or is
    /// dropped. Whatever is still queued at that point is handled first.
    pub async fn run<H: MessageHandler + ?Sized>(mut self, handler: &mut H) {
        loop {
            tokio::select! {
                biased;
                received = self.receiver.recv() => match received {
                    Some(envelope) => handler.handle(&envelope),
                    None => break,
                },
                changed = self.state.changed() => {
                    if changed.is_err() || *self.state.borrow() == DispatcherState::Unsubscribed {
                        self.drain(handler);
                        break;
                    }
                }
            }
        }
    }
}
