//! arena-relay: Cross-server relay endpoint
//!
//! Runs one end of the relay from the command line.
//!
//! ## Architecture
//! ```text
//! master:   stdin --(announcement)--> [Redis arena:<peer>] ...
//! follower: [Redis arena:<self>] --> Dispatcher --> Inbox --> stdout
//! ```
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - ARENA_RELAY_CONFIG: path to a YAML config file (optional)
//! - ARENA_RELAY__*: overrides, e.g. ARENA_RELAY__REDIS__HOST
//! - ARENA_RELAY_LOG: tracing filter (default: info)
//!
//! As master, each stdin line is published to every enabled peer. Lines
//! starting with `!` go to the shared broadcast channel instead.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use arena_relay::bus::BusError;
use arena_relay::config::RelaySettings;
use arena_relay::dispatcher::{DispatcherState, Inbox};
use arena_relay::envelope::{new_correlation_id, MessageType};
use arena_relay::handler::{ScopedBroadcastHandler, SessionRuntime};
use arena_relay::relay::Relay;
use arena_relay::utils::bootstrap::init_tracing;
use arena_relay::utils::retry::{connection_backoff, resubscribe_backoff};

/// Prints relayed text to stdout, one pseudo-session per scope.
struct StdoutRuntime;

impl SessionRuntime for StdoutRuntime {
    type Session = String;

    fn sessions_in_scope(&self, scope: &str) -> Option<Vec<String>> {
        Some(vec![scope.to_string()])
    }

    fn send(&mut self, session: &String, text: &str) {
        println!("[{}] {}", session, text);
    }

    fn broadcast(&mut self, text: &str) {
        println!("{}", text);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let settings = RelaySettings::load(config_path.as_deref())?;
    if !settings.enabled {
        info!("Cross-server relay disabled in configuration, exiting");
        return Ok(());
    }

    let (relay, inbox) = Relay::new(settings)?;
    let relay = Arc::new(relay);

    let starter = Arc::clone(&relay);
    (move || {
        let relay = Arc::clone(&starter);
        async move {
            if relay.start().await {
                Ok(())
            } else {
                Err(BusError::Connection("relay did not start".to_string()))
            }
        }
    })
    .retry(connection_backoff())
    .notify(|err: &BusError, dur: Duration| {
        warn!(error = %err, delay = ?dur, "Relay start failed, retrying");
    })
    .await?;

    info!(
        server = %relay.server_name(),
        master = relay.is_master(),
        "arena-relay started"
    );

    if relay.is_master() {
        run_master(&relay).await?;
        relay.shutdown().await;
    } else {
        run_follower(Arc::clone(&relay), inbox).await?;
    }

    Ok(())
}

/// Publish stdin lines until EOF or Ctrl-C.
async fn run_master(relay: &Relay) -> Result<(), Box<dyn std::error::Error>> {
    let game_id = new_correlation_id();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if let Some(text) = line.strip_prefix('!') {
                    relay.broadcast_message(
                        MessageType::Announcement,
                        text.trim(),
                        Some(game_id.as_str()),
                    );
                } else {
                    let sent = relay.publish_message(
                        MessageType::Announcement,
                        line,
                        Some(game_id.as_str()),
                    );
                    info!(peers = sent.len(), "Announcement relayed");
                }
            }
        }
    }

    Ok(())
}

/// Print inbound messages until Ctrl-C, re-subscribing when the
/// subscription drops.
async fn run_follower(
    relay: Arc<Relay>,
    inbox: Inbox,
) -> Result<(), Box<dyn std::error::Error>> {
    let printer = tokio::spawn(async move {
        let mut handler = ScopedBroadcastHandler::new(StdoutRuntime);
        inbox.run(&mut handler).await;
        handler.processed()
    });

    let watchdog = tokio::spawn(watch_subscription(Arc::clone(&relay)));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    relay.shutdown().await;

    let processed = printer.await?;
    watchdog.abort();
    info!(processed, "arena-relay stopped");
    Ok(())
}

async fn watch_subscription(relay: Arc<Relay>) {
    let mut states = relay.dispatcher().watch_state();

    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        match state {
            DispatcherState::Unsubscribed => break,
            DispatcherState::Idle => {
                let target = Arc::clone(&relay);
                let result = (move || {
                    let relay = Arc::clone(&target);
                    async move { relay.resubscribe().await }
                })
                .retry(resubscribe_backoff())
                .when(|e: &BusError| !matches!(e, BusError::NotEnabled))
                .notify(|err: &BusError, dur: Duration| {
                    warn!(error = %err, delay = ?dur, "Resubscribe failed, retrying");
                })
                .await;

                if let Err(e) = result {
                    error!(error = %e, "Giving up on resubscribe");
                    break;
                }
            }
            DispatcherState::Subscribing | DispatcherState::Listening => {}
        }
    }
}
