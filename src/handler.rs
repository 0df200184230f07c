//! Host-side handling of accepted envelopes.
//!
//! [`MessageHandler`] is what the host plugs into [`crate::dispatcher::Inbox`].
//! Closures taking `&Envelope` implement it directly. For the common case of
//! relaying the payload as chat text, [`ScopedBroadcastHandler`] maps
//! `target_scopes` onto a [`SessionRuntime`].

use tracing::{debug, info};

use crate::envelope::Envelope;

/// Applies the local side effects of one accepted envelope.
///
/// Runs on whichever context drains the inbox, never on the bus worker.
pub trait MessageHandler {
    fn handle(&mut self, envelope: &Envelope);
}

impl<F> MessageHandler for F
where
    F: FnMut(&Envelope),
{
    fn handle(&mut self, envelope: &Envelope) {
        self(envelope)
    }
}

/// The host's view of its connected sessions.
pub trait SessionRuntime {
    type Session;

    /// Sessions currently in `scope`, or `None` if the scope is unknown here.
    fn sessions_in_scope(&self, scope: &str) -> Option<Vec<Self::Session>>;

    /// Deliver `text` to one session.
    fn send(&mut self, session: &Self::Session, text: &str);

    /// Deliver `text` to every session.
    fn broadcast(&mut self, text: &str);
}

/// Sends each payload to the sessions in its target scopes, or to everyone
/// when the envelope carries no scopes.
pub struct ScopedBroadcastHandler<R> {
    runtime: R,
    processed: u64,
}

impl<R: SessionRuntime> ScopedBroadcastHandler<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            processed: 0,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn into_runtime(self) -> R {
        self.runtime
    }

    /// Envelopes handled so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl<R: SessionRuntime> MessageHandler for ScopedBroadcastHandler<R> {
    fn handle(&mut self, envelope: &Envelope) {
        if envelope.is_scoped() {
            for scope in envelope.target_scopes() {
                let Some(sessions) = self.runtime.sessions_in_scope(scope) else {
                    debug!(scope = %scope, "Skipping unknown scope");
                    continue;
                };
                for session in &sessions {
                    self.runtime.send(session, envelope.payload());
                }
            }
        } else {
            self.runtime.broadcast(envelope.payload());
        }

        self.processed += 1;
        info!(
            source = %envelope.source_server(),
            kind = %envelope.kind(),
            "Processed cross-server message"
        );
    }
}
