//! Cross-server message envelope.
//!
//! One envelope describes one notification addressed to one peer. The JSON
//! wire shape is shared with every process on the bus:
//!
//! ```json
//! {
//!   "type": "game_started",
//!   "sourceServer": "lobby",
//!   "targetServer": "survival",
//!   "targetWorlds": ["arena"],
//!   "message": "The battle has begun!",
//!   "timestamp": 1760000000000,
//!   "gameId": "6f1c..."
//! }
//! ```
//!
//! `targetWorlds` and `gameId` are omitted when absent. Unknown fields are
//! ignored on read so newer publishers can add fields without breaking older
//! followers.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result type for envelope construction.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors raised while building or encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope {field} must not be empty")]
    EmptyIdentity { field: &'static str },

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Kind of notification carried by an envelope.
///
/// Serialized as its snake_case tag. Tags not known to this build are kept
/// verbatim in [`MessageType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    GameStarting,
    GameStarted,
    GameEnded,
    PlayerJoined,
    PlayerDied,
    NewKiller,
    Announcement,
    Other(String),
}

impl MessageType {
    /// Wire tag for this type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::GameStarting => "game_starting",
            Self::GameStarted => "game_started",
            Self::GameEnded => "game_ended",
            Self::PlayerJoined => "player_joined",
            Self::PlayerDied => "player_died",
            Self::NewKiller => "new_killer",
            Self::Announcement => "announcement",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "game_starting" => Self::GameStarting,
            "game_started" => Self::GameStarted,
            "game_ended" => Self::GameEnded,
            "player_joined" => Self::PlayerJoined,
            "player_died" => Self::PlayerDied,
            "new_killer" => Self::NewKiller,
            "announcement" => Self::Announcement,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable cross-server notification.
///
/// Fields are private; an envelope is built once and only read afterwards.
/// The timestamp is stamped at construction and is informative only:
/// receivers never order messages by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    source_server: String,
    target_server: String,
    #[serde(
        rename = "targetWorlds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    target_scopes: Option<Vec<String>>,
    #[serde(rename = "message")]
    payload: String,
    timestamp: i64,
    #[serde(rename = "gameId", default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl Envelope {
    /// Create an envelope with no scope filter and no correlation id.
    pub fn new(
        kind: impl Into<MessageType>,
        source_server: impl Into<String>,
        target_server: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<Self> {
        Self::builder(kind, source_server, target_server)
            .payload(payload)
            .build()
    }

    /// Start building an envelope with optional fields.
    pub fn builder(
        kind: impl Into<MessageType>,
        source_server: impl Into<String>,
        target_server: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            kind: kind.into(),
            source_server: source_server.into(),
            target_server: target_server.into(),
            target_scopes: None,
            payload: String::new(),
            correlation_id: None,
        }
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn source_server(&self) -> &str {
        &self.source_server
    }

    pub fn target_server(&self) -> &str {
        &self.target_server
    }

    /// Scopes (worlds) the side effect is restricted to.
    ///
    /// Empty when the envelope applies globally, whether the field was
    /// absent or an empty list on the wire.
    pub fn target_scopes(&self) -> &[String] {
        self.target_scopes.as_deref().unwrap_or(&[])
    }

    /// Whether the side effect is restricted to specific scopes.
    pub fn is_scoped(&self) -> bool {
        !self.target_scopes().is_empty()
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Creation time in epoch milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope from the JSON wire format.
    ///
    /// Returns `None` for malformed input, including envelopes with an empty
    /// source or target identity. Never panics.
    pub fn from_json(json: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(json) {
            Ok(envelope)
                if !envelope.source_server.is_empty() && !envelope.target_server.is_empty() =>
            {
                Some(envelope)
            }
            Ok(_) => {
                debug!("Envelope rejected: empty routing identity");
                None
            }
            Err(e) => {
                debug!(error = %e, "Envelope rejected: malformed JSON");
                None
            }
        }
    }
}

/// Builder for [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    kind: MessageType,
    source_server: String,
    target_server: String,
    target_scopes: Option<Vec<String>>,
    payload: String,
    correlation_id: Option<String>,
}

impl EnvelopeBuilder {
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Restrict the side effect to these scopes. An empty list is stored
    /// as-is and still means "no filter".
    pub fn target_scopes(mut self, scopes: Option<Vec<String>>) -> Self {
        self.target_scopes = scopes;
        self
    }

    pub fn correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    /// Validate identities and stamp the creation time.
    pub fn build(self) -> Result<Envelope> {
        if self.source_server.is_empty() {
            return Err(EnvelopeError::EmptyIdentity {
                field: "source_server",
            });
        }
        if self.target_server.is_empty() {
            return Err(EnvelopeError::EmptyIdentity {
                field: "target_server",
            });
        }

        Ok(Envelope {
            kind: self.kind,
            source_server: self.source_server,
            target_server: self.target_server,
            target_scopes: self.target_scopes,
            payload: self.payload,
            timestamp: Utc::now().timestamp_millis(),
            correlation_id: self.correlation_id,
        })
    }
}

/// Generate a correlation id for a new game instance.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
