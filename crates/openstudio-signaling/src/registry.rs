//! Peer registration: maps a caller-chosen peer id to the live session that
//! owns it, and back again for cleanup on disconnect.
//!
//! Dual-indexed the same way a gateway tracks sessions by both session id
//! and user id: here a `SessionId` (one per live socket) is the primary key
//! so a peer that reconnects before its old socket notices isn't blocked by
//! a registration it no longer holds, while `by_peer` gives O(1) lookup for
//! relay delivery.

use openstudio_common::ids::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A registered peer's outbound channel — the session task reads from the
/// receiving half and forwards frames to the socket.
pub struct PeerSession {
    pub peer_id: PeerId,
    pub outbox: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("peer id {0:?} is already registered")]
    AlreadyRegistered(String),
}

/// Tracks every currently-registered peer.
pub struct PeerRegistry {
    by_peer: Arc<RwLock<HashMap<PeerId, SessionId>>>,
    by_session: Arc<RwLock<HashMap<SessionId, PeerSession>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            by_peer: Arc::new(RwLock::new(HashMap::new())),
            by_session: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `peer_id` under a fresh session. Fails if the id is already
    /// claimed by a still-open session.
    pub async fn register(
        &self,
        peer_id: PeerId,
        session_id: SessionId,
        outbox: mpsc::UnboundedSender<Message>,
    ) -> Result<(), RegisterError> {
        let mut by_peer = self.by_peer.write().await;
        if by_peer.contains_key(&peer_id) {
            return Err(RegisterError::AlreadyRegistered(peer_id.as_str().to_string()));
        }
        by_peer.insert(peer_id.clone(), session_id);
        self.by_session
            .write()
            .await
            .insert(session_id, PeerSession { peer_id, outbox });
        Ok(())
    }

    /// Remove whatever peer a given session owns, if any. Returns the freed
    /// peer id so the caller can drive room cleanup.
    pub async fn unregister_by_session(&self, session_id: SessionId) -> Option<PeerId> {
        let session = self.by_session.write().await.remove(&session_id)?;
        self.by_peer.write().await.remove(&session.peer_id);
        Some(session.peer_id)
    }

    /// Resolve a peer id to its live outbound channel, for unicast relay.
    pub async fn resolve(&self, peer_id: &PeerId) -> Option<mpsc::UnboundedSender<Message>> {
        let session_id = *self.by_peer.read().await.get(peer_id)?;
        self.by_session
            .read()
            .await
            .get(&session_id)
            .map(|s| s.outbox.clone())
    }

    pub async fn is_registered(&self, peer_id: &PeerId) -> bool {
        self.by_peer.read().await.contains_key(peer_id)
    }

    pub async fn active_count(&self) -> usize {
        self.by_session.read().await.len()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::UnboundedSender<Message>, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = channel();
        registry
            .register(PeerId::from("a"), SessionId::generate(), tx.clone())
            .await
            .unwrap();

        let err = registry
            .register(PeerId::from("a"), SessionId::generate(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::AlreadyRegistered(id) if id == "a"));
    }

    #[tokio::test]
    async fn unregister_frees_the_id_for_reuse() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = channel();
        let session = SessionId::generate();
        registry
            .register(PeerId::from("a"), session, tx.clone())
            .await
            .unwrap();

        let freed = registry.unregister_by_session(session).await;
        assert_eq!(freed, Some(PeerId::from("a")));
        assert!(!registry.is_registered(&PeerId::from("a")).await);

        registry
            .register(PeerId::from("a"), SessionId::generate(), tx)
            .await
            .expect("id should be free after unregister");
    }

    #[tokio::test]
    async fn resolve_delivers_to_the_registered_outbox() {
        let registry = PeerRegistry::new();
        let (tx, mut rx) = channel();
        registry
            .register(PeerId::from("a"), SessionId::generate(), tx)
            .await
            .unwrap();

        let outbox = registry.resolve(&PeerId::from("a")).await.unwrap();
        outbox.send(Message::Welcome).unwrap();
        assert!(matches!(rx.recv().await, Some(Message::Welcome)));
    }
}
