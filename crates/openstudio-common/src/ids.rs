//! Process-unique identifiers used across every OpenStudio crate.
//!
//! Peer ids are caller-supplied (a browser tab picks its own id on join) so
//! we model them as plain strings rather than `Uuid` — the hub only needs
//! byte-lexicographic ordering (for Perfect Negotiation's polite/impolite
//! assignment) and equality, both of which `String` gives for free. Room ids
//! are generated server-side from a CSPRNG when the caller doesn't supply
//! one.

use std::fmt;

/// A peer's self-chosen identity for the lifetime of one control session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Perfect Negotiation's stable polite/impolite assignment: the peer
    /// with the lexicographically smaller id is polite toward the other.
    pub fn is_polite_toward(&self, remote: &PeerId) -> bool {
        self.0 < remote.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A room's identity — caller-supplied or generated with a 128-bit random
/// source (a v4 UUID) so concurrently-created rooms never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polite_assignment_is_symmetric_and_stable() {
        let a = PeerId::from("aaaaaaaa");
        let b = PeerId::from("bbbbbbbb");
        assert!(a.is_polite_toward(&b));
        assert!(!b.is_polite_toward(&a));
    }

    #[test]
    fn generated_room_ids_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(RoomId::generate().0));
        }
    }
}
