//! `ConnectionCoordinator`: per local peer, owns one `MediaTransport` per
//! remote peer and drives Perfect Negotiation.

use crate::transport::{ConnectionState as TransportState, MediaTransport, TrackKind, TransportEvent};
use openstudio_common::ids::PeerId;
use openstudio_signaling::protocol::{Message, SdpPayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use str0m::media::Mid;
use tokio::sync::{mpsc, watch, Mutex};

pub const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(2);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const LOCAL_STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const LOCAL_STREAM_POLL_CAP: Duration = Duration::from_secs(10);

/// `min(initial * 2^(n-1), max)`, n starting at 1 for the first retry.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Perfect Negotiation's stable role: the peer with the lexicographically
/// smaller id is polite and never overrides its own outstanding offer.
pub fn is_polite(local: &PeerId, remote: &PeerId) -> bool {
    local.is_polite_toward(remote)
}

/// What to do when an offer arrives while one is already outstanding
/// locally (an offer collision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionAction {
    /// Impolite: keep the local offer, mark the incoming one to be ignored.
    IgnoreIncoming,
    /// Polite: accept the incoming offer, yielding the local one.
    AcceptIncoming,
}

pub fn resolve_collision(polite: bool) -> CollisionAction {
    if polite { CollisionAction::AcceptIncoming } else { CollisionAction::IgnoreIncoming }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Disconnected,
    Waiting,
    Connecting,
    Connected,
    Failed,
    FailedPermanent,
}

pub enum CoordinatorEvent {
    RemoteStatusChanged(PeerId, RemoteStatus),
    /// First `remote_stream` for this peer, per the ordering convention.
    /// Carries the `Mid` its `MediaData` arrives tagged with.
    RemoteMicrophone(PeerId, Mid),
    /// Second `remote_stream` for this peer, same tagging.
    RemoteReturnFeed(PeerId, Mid),
    /// One received, still-encoded payload for `mid` on this peer's
    /// transport — tagged with whichever `Mid` the prior `RemoteMicrophone`
    /// or `RemoteReturnFeed` event named, for the owner to route to the
    /// matching decode bridge.
    MediaData(PeerId, Mid, bytes::Bytes),
}

struct RemotePeer {
    transport: MediaTransport,
    polite: bool,
    making_offer: bool,
    ignore_offer: bool,
    status: RemoteStatus,
    retry_count: u32,
    microphone_received: bool,
    return_feed_received: bool,
    /// This pair's outbound microphone `Mid`, once added — the target of
    /// `set_self_mute`'s track-enabled toggle. Self-muting one's own
    /// outbound audio is a transport operation, distinct from
    /// `MuteController`'s remote-graph gain ramp. A bidirectional `SendRecv`
    /// line, so this doubles as the `Mid` the remote's microphone `MediaData`
    /// arrives tagged with.
    local_mic_mid: Option<Mid>,
    /// The `Mid` the remote's return feed arrives tagged with, once its
    /// `remote_stream` event (the second one for this peer) has fired.
    return_feed_mid: Option<Mid>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no connection state for remote peer {0}")]
    UnknownRemote(String),
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
    #[error("signaling link closed")]
    LinkClosed,
}

/// State shared between the `ConnectionCoordinator` handle and the
/// per-remote `drive_transport_events` tasks, so a task observing
/// `Failed` can tear down and re-initiate on its own rather than routing
/// back through a method call on a handle it doesn't own.
struct Shared {
    local_peer: PeerId,
    bind_ip: std::net::IpAddr,
    signaling_out: mpsc::UnboundedSender<Message>,
    remotes: Mutex<HashMap<PeerId, RemotePeer>>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    local_mic_ready: watch::Receiver<bool>,
}

/// Owns every outgoing peer connection for one local peer. Talks to the
/// signaling hub over `signaling_out`/`signaling_in` exactly like any
/// other peer — the studio's own coordinator is not a privileged client.
pub struct ConnectionCoordinator {
    shared: Arc<Shared>,
}

impl ConnectionCoordinator {
    pub fn new(
        local_peer: PeerId,
        bind_ip: std::net::IpAddr,
        signaling_out: mpsc::UnboundedSender<Message>,
        local_mic_ready: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local_peer,
            bind_ip,
            signaling_out,
            remotes: Mutex::new(HashMap::new()),
            events,
            local_mic_ready,
        });
        (Self { shared }, events_rx)
    }

    /// Feed every signaling frame relevant to this peer through here; the
    /// hub has already validated `from`/room co-membership.
    pub async fn handle_signaling(&self, message: Message) -> Result<(), CoordinatorError> {
        match message {
            Message::RoomJoined { participants, .. } => {
                for participant in participants {
                    let remote = PeerId::from(participant.peer_id);
                    if remote != self.shared.local_peer {
                        on_peer_seen(&self.shared, remote).await?;
                    }
                }
                Ok(())
            }
            Message::PeerJoined { peer_id, .. } => on_peer_seen(&self.shared, PeerId::from(peer_id)).await,
            Message::PeerLeft { peer_id } => {
                self.shared.remotes.lock().await.remove(&PeerId::from(peer_id));
                Ok(())
            }
            Message::Offer { from, sdp, .. } => on_offer(&self.shared, PeerId::from(from), sdp).await,
            Message::Answer { from, sdp, .. } => on_answer(&self.shared, PeerId::from(from), sdp).await,
            Message::IceCandidate { from, candidate, .. } => {
                on_candidate(&self.shared, PeerId::from(from), candidate).await
            }
            _ => Ok(()),
        }
    }

    /// Called once the local `AudioGraph` has a mix-minus bus ready for a
    /// connected remote: adds the return-feed track and renegotiates.
    pub async fn add_return_feed(&self, remote: PeerId) -> Result<(), CoordinatorError> {
        let transport = {
            let remotes = self.shared.remotes.lock().await;
            remotes
                .get(&remote)
                .map(|r| r.transport.clone())
                .ok_or_else(|| CoordinatorError::UnknownRemote(remote.to_string()))?
        };
        transport.add_local_track(TrackKind::ReturnFeed).await?;
        set_making_offer(&self.shared, &remote, true).await;
        let sdp = transport.create_offer().await?;
        send(&self.shared, Message::Offer {
            from: self.shared.local_peer.to_string(),
            to: remote.to_string(),
            sdp: SdpPayload(sdp),
        })?;
        Ok(())
    }

    /// Self-mute of one's *own* outbound microphone, across every connected
    /// remote at once: a transport-level track-enable toggle, not a gain
    /// ramp. A UI's "mute mic" control calls this; muting a *remote*
    /// participant's audio in the local mix goes through
    /// `openstudio_audio::MuteController` instead, which this never touches.
    pub async fn set_self_mute(&self, enabled: bool) -> Result<(), CoordinatorError> {
        let remotes = self.shared.remotes.lock().await;
        for state in remotes.values() {
            if let Some(mid) = state.local_mic_mid {
                state.transport.set_local_track_enabled(mid, enabled)?;
            }
        }
        Ok(())
    }

    /// Drops every remote's `MediaTransport` handle, closing that actor's
    /// command channel so its task (and the `drive_transport_events` task
    /// reading its events) wind down on their own. Used by graceful
    /// shutdown's "tear down all MediaTransports" step.
    pub async fn shutdown(&self) {
        self.shared.remotes.lock().await.clear();
    }
}

/// A remote is newly visible (present on join, or just joined): decide
/// whether we initiate, per Perfect Negotiation's polite/impolite rule.
async fn on_peer_seen(shared: &Arc<Shared>, remote: PeerId) -> Result<(), CoordinatorError> {
    let polite = is_polite(&shared.local_peer, &remote);
    let transport = ensure_transport(shared, remote.clone(), polite).await?;

    if polite {
        set_status(shared, &remote, RemoteStatus::Waiting).await;
        return Ok(());
    }

    initiate(shared, &remote, &transport).await
}

/// The impolite side's half of negotiation: wait for the local mic, add
/// the track, create and send an offer. Shared by the initial join path
/// and by post-retry re-initiation.
async fn initiate(shared: &Arc<Shared>, remote: &PeerId, transport: &MediaTransport) -> Result<(), CoordinatorError> {
    wait_for_local_stream(shared).await;

    transport.add_local_track(TrackKind::Microphone).await?;
    let sdp = transport.create_offer().await?;
    set_making_offer(shared, remote, true).await;
    set_status(shared, remote, RemoteStatus::Connecting).await;
    send(shared, Message::Offer {
        from: shared.local_peer.to_string(),
        to: remote.to_string(),
        sdp: SdpPayload(sdp),
    })?;
    Ok(())
}

async fn on_offer(shared: &Arc<Shared>, remote: PeerId, sdp: SdpPayload) -> Result<(), CoordinatorError> {
    let polite = is_polite(&shared.local_peer, &remote);
    let transport = ensure_transport(shared, remote.clone(), polite).await?;

    let collision = {
        let remotes = shared.remotes.lock().await;
        let state = remotes.get(&remote).ok_or_else(|| CoordinatorError::UnknownRemote(remote.to_string()))?;
        state.making_offer || !transport.is_stable().await
    };

    if collision {
        match resolve_collision(polite) {
            CollisionAction::IgnoreIncoming => {
                set_ignore_offer(shared, &remote, true).await;
                return Ok(());
            }
            CollisionAction::AcceptIncoming => {
                // str0m's offer/answer state machine accepts a fresh
                // offer over an outstanding local one directly; no
                // separate rollback call is required.
            }
        }
    }

    let answer_sdp = transport.apply_remote_offer(sdp.as_str().to_string()).await?;
    set_making_offer(shared, &remote, false).await;
    set_ignore_offer(shared, &remote, false).await;
    send(shared, Message::Answer {
        from: shared.local_peer.to_string(),
        to: remote.to_string(),
        sdp: SdpPayload(answer_sdp),
    })?;
    Ok(())
}

async fn on_answer(shared: &Arc<Shared>, remote: PeerId, sdp: SdpPayload) -> Result<(), CoordinatorError> {
    let transport = {
        let remotes = shared.remotes.lock().await;
        remotes
            .get(&remote)
            .map(|r| r.transport.clone())
            .ok_or_else(|| CoordinatorError::UnknownRemote(remote.to_string()))?
    };
    transport.apply_remote_answer(sdp.as_str().to_string()).await?;
    set_making_offer(shared, &remote, false).await;
    set_ignore_offer(shared, &remote, false).await;
    Ok(())
}

async fn on_candidate(shared: &Arc<Shared>, remote: PeerId, candidate: serde_json::Value) -> Result<(), CoordinatorError> {
    let transport = {
        let remotes = shared.remotes.lock().await;
        remotes
            .get(&remote)
            .map(|r| r.transport.clone())
            .ok_or_else(|| CoordinatorError::UnknownRemote(remote.to_string()))?
    };
    let candidate_str = candidate.as_str().map(str::to_string).unwrap_or_else(|| candidate.to_string());
    transport.add_remote_candidate(candidate_str)?;
    Ok(())
}

async fn ensure_transport(shared: &Arc<Shared>, remote: PeerId, polite: bool) -> Result<MediaTransport, CoordinatorError> {
    let mut remotes = shared.remotes.lock().await;
    if let Some(existing) = remotes.get(&remote) {
        return Ok(existing.transport.clone());
    }
    let (transport, transport_events) = MediaTransport::spawn(shared.bind_ip).await?;
    remotes.insert(
        remote.clone(),
        RemotePeer {
            transport: transport.clone(),
            polite,
            making_offer: false,
            ignore_offer: false,
            status: RemoteStatus::Disconnected,
            retry_count: 0,
            microphone_received: false,
            return_feed_received: false,
            local_mic_mid: None,
            return_feed_mid: None,
        },
    );
    drop(remotes);

    tokio::spawn(drive_transport_events(remote, transport_events, Arc::clone(shared)));
    Ok(transport)
}

async fn wait_for_local_stream(shared: &Arc<Shared>) {
    let deadline = tokio::time::Instant::now() + LOCAL_STREAM_POLL_CAP;
    let mut rx = shared.local_mic_ready.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("local microphone not ready after 10s, proceeding without it");
            return;
        }
        let _ = tokio::time::timeout(LOCAL_STREAM_POLL_INTERVAL, rx.changed()).await;
    }
}

async fn set_status(shared: &Arc<Shared>, remote: &PeerId, status: RemoteStatus) {
    if let Some(state) = shared.remotes.lock().await.get_mut(remote) {
        state.status = status;
        let _ = shared.events.send(CoordinatorEvent::RemoteStatusChanged(remote.clone(), status));
    }
}

async fn set_making_offer(shared: &Arc<Shared>, remote: &PeerId, value: bool) {
    if let Some(state) = shared.remotes.lock().await.get_mut(remote) {
        state.making_offer = value;
    }
}

async fn set_ignore_offer(shared: &Arc<Shared>, remote: &PeerId, value: bool) {
    if let Some(state) = shared.remotes.lock().await.get_mut(remote) {
        state.ignore_offer = value;
    }
}

fn send(shared: &Arc<Shared>, message: Message) -> Result<(), CoordinatorError> {
    shared.signaling_out.send(message).map_err(|_| CoordinatorError::LinkClosed)
}

/// Relays transport-level events into status/stream bookkeeping and drives
/// the retry loop on `failed`; one task per remote peer transport. A
/// successful retry replaces this peer's transport and spawns a fresh
/// instance of this same task for it, then returns, so there is always
/// exactly one task reading a given remote's live transport events.
async fn drive_transport_events(
    remote: PeerId,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    shared: Arc<Shared>,
) {
    while let Some(event) = transport_events.recv().await {
        match event {
            TransportEvent::StateChanged(TransportState::Connected) => {
                let mut guard = shared.remotes.lock().await;
                if let Some(state) = guard.get_mut(&remote) {
                    state.status = RemoteStatus::Connected;
                    state.retry_count = 0;
                }
                drop(guard);
                let _ = shared
                    .events
                    .send(CoordinatorEvent::RemoteStatusChanged(remote.clone(), RemoteStatus::Connected));
            }
            TransportEvent::StateChanged(TransportState::Failed) => {
                let (retry_count, polite) = {
                    let mut guard = shared.remotes.lock().await;
                    let Some(state) = guard.get_mut(&remote) else { return };
                    state.retry_count += 1;
                    (state.retry_count, state.polite)
                };

                if retry_count > RETRY_MAX_ATTEMPTS {
                    if let Some(state) = shared.remotes.lock().await.get_mut(&remote) {
                        state.status = RemoteStatus::FailedPermanent;
                    }
                    let _ = shared.events.send(CoordinatorEvent::RemoteStatusChanged(
                        remote.clone(),
                        RemoteStatus::FailedPermanent,
                    ));
                    return;
                }

                if let Some(state) = shared.remotes.lock().await.get_mut(&remote) {
                    state.status = RemoteStatus::Failed;
                }
                let delay = backoff_delay(retry_count, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
                let _ = shared
                    .events
                    .send(CoordinatorEvent::RemoteStatusChanged(remote.clone(), RemoteStatus::Failed));
                tokio::time::sleep(delay).await;

                // Retry: tear down the failed transport, spin up a new one,
                // and re-initiate if we're the impolite side of this pair.
                // If the peer left while we were sleeping, there's nothing
                // left to retry.
                if !shared.remotes.lock().await.contains_key(&remote) {
                    return;
                }

                match MediaTransport::spawn(shared.bind_ip).await {
                    Ok((new_transport, new_events)) => {
                        {
                            let mut guard = shared.remotes.lock().await;
                            let Some(state) = guard.get_mut(&remote) else { return };
                            state.transport = new_transport.clone();
                            state.making_offer = false;
                            state.ignore_offer = false;
                            state.microphone_received = false;
                            state.return_feed_received = false;
                            state.local_mic_mid = None;
                            state.return_feed_mid = None;
                            state.status = RemoteStatus::Connecting;
                        }
                        let _ = shared.events.send(CoordinatorEvent::RemoteStatusChanged(
                            remote.clone(),
                            RemoteStatus::Connecting,
                        ));

                        tokio::spawn(drive_transport_events(remote.clone(), new_events, Arc::clone(&shared)));

                        if !polite {
                            if let Err(err) = initiate(&shared, &remote, &new_transport).await {
                                tracing::warn!(peer = %remote, error = %err, "retry re-initiation failed");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(peer = %remote, error = %err, "failed to spawn replacement transport on retry");
                        if let Some(state) = shared.remotes.lock().await.get_mut(&remote) {
                            state.status = RemoteStatus::FailedPermanent;
                        }
                        let _ = shared.events.send(CoordinatorEvent::RemoteStatusChanged(
                            remote.clone(),
                            RemoteStatus::FailedPermanent,
                        ));
                    }
                }
                // Either way, this task's transport is gone — a replacement
                // task (or a terminal state) has already been dispatched.
                return;
            }
            TransportEvent::StateChanged(TransportState::Disconnected | TransportState::Connecting) => {}
            TransportEvent::RemoteStream(mid) => {
                let mut guard = shared.remotes.lock().await;
                let Some(state) = guard.get_mut(&remote) else { continue };
                if !state.microphone_received {
                    state.microphone_received = true;
                    // The first stream on a pair's transport is the shared
                    // bidirectional microphone `Mid`; this is also the mid we
                    // write our own outbound mic audio to, so it doubles as
                    // the target for `set_self_mute`.
                    state.local_mic_mid = Some(mid);
                    drop(guard);
                    let _ = shared.events.send(CoordinatorEvent::RemoteMicrophone(remote.clone(), mid));
                } else if !state.return_feed_received {
                    state.return_feed_received = true;
                    state.return_feed_mid = Some(mid);
                    drop(guard);
                    let _ = shared.events.send(CoordinatorEvent::RemoteReturnFeed(remote.clone(), mid));
                }
            }
            TransportEvent::MediaData { mid, payload } => {
                let _ = shared.events.send(CoordinatorEvent::MediaData(remote.clone(), mid, payload));
            }
            TransportEvent::LocalCandidate(_candidate) => {
                // Trickle ICE is optional for a Sans-IO host-candidate-only
                // setup; candidates gathered up front are enough for a LAN
                // studio deployment. Left for a future STUN/TURN pass.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY), Duration::from_secs(8));
        assert_eq!(backoff_delay(4, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY), Duration::from_secs(8));
    }

    #[test]
    fn polite_assignment_matches_lexicographic_order() {
        let a = PeerId::from("aaaaaaaa");
        let b = PeerId::from("bbbbbbbb");
        assert!(is_polite(&a, &b));
        assert!(!is_polite(&b, &a));
    }

    #[test]
    fn collision_resolution_favors_impolite_offer() {
        assert_eq!(resolve_collision(false), CollisionAction::IgnoreIncoming);
        assert_eq!(resolve_collision(true), CollisionAction::AcceptIncoming);
    }
}
