//! Static peer registry.
//!
//! Peers are the servers a master publishes to. The registry is loaded once
//! from configuration and never mutated afterwards, so it is shared through
//! `Arc` without locking.
//!
//! Configuration shape (order is preserved and drives fan-out order):
//!
//! ```yaml
//! peers:
//!   survival:
//!     enabled: true
//!     worlds: [arena, arena_nether]
//!   creative:
//!     enabled: false
//! ```
//!
//! `scopes` is accepted in place of `worlds`, but not next to it.

use std::collections::HashSet;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

/// Errors raised while building a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate peer identity: {0}")]
    DuplicateIdentity(String),

    #[error("Peer identity must not be empty")]
    EmptyIdentity,
}

/// Reachability settings for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    identity: String,
    enabled: bool,
    scopes: Vec<String>,
}

impl PeerConfig {
    pub fn new(identity: impl Into<String>, enabled: bool, scopes: Vec<String>) -> Self {
        Self {
            identity: identity.into(),
            enabled,
            scopes,
        }
    }

    /// Identity, which is also the suffix of the peer's channel.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Scopes this peer is restricted to. Empty means all scopes.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

/// Per-peer body as it appears in configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PeerEntry {
    enabled: bool,
    worlds: Option<Vec<String>>,
    scopes: Option<Vec<String>>,
}

impl PeerEntry {
    /// `worlds` and `scopes` name the same list; at most one may be set.
    fn into_peer<E>(self, identity: String) -> Result<PeerConfig, E>
    where
        E: serde::de::Error,
    {
        let scopes = match (self.worlds, self.scopes) {
            (Some(_), Some(_)) => {
                return Err(E::custom(format!(
                    "peer '{}' sets both 'worlds' and 'scopes', use only one",
                    identity
                )))
            }
            (worlds, scopes) => worlds.or(scopes).unwrap_or_default(),
        };
        Ok(PeerConfig {
            identity,
            enabled: self.enabled,
            scopes,
        })
    }
}

/// Ordered, read-only set of peers keyed by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRegistry {
    peers: Vec<PeerConfig>,
}

impl PeerRegistry {
    /// Build a registry, keeping the given order.
    pub fn new(peers: Vec<PeerConfig>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for peer in &peers {
            if peer.identity.is_empty() {
                return Err(RegistryError::EmptyIdentity);
            }
            if !seen.insert(peer.identity.as_str()) {
                return Err(RegistryError::DuplicateIdentity(peer.identity.clone()));
            }
        }
        Ok(Self { peers })
    }

    /// All configured peers in configuration order.
    pub fn all(&self) -> &[PeerConfig] {
        &self.peers
    }

    /// Enabled peers in configuration order.
    pub fn enabled(&self) -> impl Iterator<Item = &PeerConfig> {
        self.peers.iter().filter(|p| p.enabled)
    }

    pub fn get(&self, identity: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether `peer` accepts messages for `scope`.
    ///
    /// A disabled peer never does. A peer without scope restrictions accepts
    /// everything, including `None`. A restricted peer accepts only a scope
    /// it lists. The publisher does not consult this: it fans out to every
    /// enabled peer and scope filtering happens on the receiving side.
    pub fn is_reachable(peer: &PeerConfig, scope: Option<&str>) -> bool {
        if !peer.enabled {
            return false;
        }
        if peer.scopes.is_empty() {
            return true;
        }
        scope.is_some_and(|s| peer.scopes.iter().any(|p| p == s))
    }
}

impl<'de> Deserialize<'de> for PeerRegistry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RegistryVisitor;

        impl<'de> Visitor<'de> for RegistryVisitor {
            type Value = PeerRegistry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of peer identity to peer settings")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(PeerRegistry::default())
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(PeerRegistry::default())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut peers = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((identity, entry)) = map.next_entry::<String, PeerEntry>()? {
                    peers.push(entry.into_peer::<A::Error>(identity)?);
                }
                PeerRegistry::new(peers).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(RegistryVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_preserves_order() {
        let yaml = r#"
zeta:
  enabled: true
alpha:
  enabled: true
  worlds: [arena]
mid:
  enabled: false
"#;
        let registry: PeerRegistry = serde_yaml::from_str(yaml).unwrap();
        let ids: Vec<&str> = registry.all().iter().map(|p| p.identity()).collect();

        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.get("alpha").unwrap().scopes(), &["arena".to_string()]);
    }

    #[test]
    fn test_enabled_defaults_to_false() {
        let yaml = r#"
survival:
  worlds: [arena]
"#;
        let registry: PeerRegistry = serde_yaml::from_str(yaml).unwrap();
        assert!(!registry.get("survival").unwrap().is_enabled());
        assert_eq!(registry.enabled().count(), 0);
    }

    #[test]
    fn test_scopes_alias() {
        let yaml = r#"
survival:
  enabled: true
  scopes: [arena]
"#;
        let registry: PeerRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.get("survival").unwrap().scopes(), &["arena".to_string()]);
    }

    #[test]
    fn test_worlds_and_scopes_together_rejected() {
        let yaml = r#"
survival:
  enabled: true
  worlds: [arena]
  scopes: [lobby]
"#;
        let err = serde_yaml::from_str::<PeerRegistry>(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("survival"), "{}", message);
        assert!(message.contains("both 'worlds' and 'scopes'"), "{}", message);
    }

    #[test]
    fn test_empty_section() {
        let registry: PeerRegistry = serde_yaml::from_str("~").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_enabled_keeps_order() {
        let registry = PeerRegistry::new(vec![
            PeerConfig::new("a", true, vec![]),
            PeerConfig::new("b", false, vec![]),
            PeerConfig::new("c", true, vec![]),
        ])
        .unwrap();

        let ids: Vec<&str> = registry.enabled().map(|p| p.identity()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let result = PeerRegistry::new(vec![
            PeerConfig::new("a", true, vec![]),
            PeerConfig::new("a", false, vec![]),
        ]);
        assert!(matches!(result, Err(RegistryError::DuplicateIdentity(id)) if id == "a"));
    }

    #[test]
    fn test_empty_identity_rejected() {
        let result = PeerRegistry::new(vec![PeerConfig::new("", true, vec![])]);
        assert!(matches!(result, Err(RegistryError::EmptyIdentity)));
    }

    #[test]
    fn test_reachable_unrestricted() {
        let peer = PeerConfig::new("a", true, vec![]);
        assert!(PeerRegistry::is_reachable(&peer, None));
        assert!(PeerRegistry::is_reachable(&peer, Some("arena")));
    }

    #[test]
    fn test_reachable_restricted() {
        let peer = PeerConfig::new("a", true, scopes(&["arena", "lobby"]));
        assert!(PeerRegistry::is_reachable(&peer, Some("arena")));
        assert!(!PeerRegistry::is_reachable(&peer, Some("nether")));
        assert!(!PeerRegistry::is_reachable(&peer, None));
    }

    #[test]
    fn test_disabled_never_reachable() {
        let peer = PeerConfig::new("a", false, vec![]);
        assert!(!PeerRegistry::is_reachable(&peer, None));
        assert!(!PeerRegistry::is_reachable(&peer, Some("arena")));
    }
}
