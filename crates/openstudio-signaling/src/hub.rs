//! The signaling hub: the axum WebSocket surface that accepts peer
//! sessions, tracks registration and room membership, and relays
//! offer/answer/ice-candidate/mute frames under the anti-spoofing and
//! authority rules.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use openstudio_common::error::OpenStudioError;
use openstudio_common::ids::{PeerId, RoomId};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{Authority, Message, Participant, Role};
use crate::registry::{PeerRegistry, RegisterError, SessionId};
use crate::rooms::{RoomError, RoomManager};

/// Shared, process-wide mutable state for the hub. All access is through
/// the registry's and room manager's own locks — the hub itself holds no
/// lock of its own.
#[derive(Clone)]
pub struct HubState {
    pub registry: Arc<PeerRegistry>,
    pub rooms: Arc<RoomManager>,
}

impl HubState {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(PeerRegistry::new()),
            rooms: Arc::new(RoomManager::new()),
        }
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(state))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// An in-process session that exchanges `Message`s over channels instead of
/// a WebSocket — used by the owning process itself to join the mesh as a
/// participant (the station's own studio mixer) without looping a frame
/// through the network stack to reach the same hub it's already inside.
/// Drives the identical `route`/`cleanup` path a browser session takes, so
/// there is exactly one signaling implementation, not two.
pub fn spawn_internal_session(
    state: Arc<HubState>,
) -> (mpsc::UnboundedSender<Message>, mpsc::UnboundedReceiver<Message>) {
    let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<Message>();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Message>();
    let session_id = SessionId::generate();

    tokio::spawn(async move {
        let mut peer_id: Option<PeerId> = None;
        let _ = outbox_tx.send(Message::Welcome);

        while let Some(incoming) = inbox_rx.recv().await {
            if let Err(err) = route(&state, session_id, &mut peer_id, incoming, &outbox_tx).await {
                let _ = outbox_tx.send(Message::Error { message: err.wire_message() });
            }
        }

        cleanup(&state, session_id, peer_id).await;
    });

    (inbox_tx, outbox_rx)
}

/// One task per signaling session: a receive loop over the socket and a
/// send loop drained from `outbox`, joined only at teardown.
async fn handle_connection(socket: WebSocket, state: Arc<HubState>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let session_id = SessionId::generate();
    let mut peer_id: Option<PeerId> = None;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    if outbox_tx.send(Message::Welcome).is_err() {
        send_task.abort();
        return;
    }

    while let Some(frame) = receiver.next().await {
        let ws_msg = match frame {
            Ok(m) => m,
            Err(_) => break,
        };
        let text = match ws_msg {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let incoming: Message = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(_) => {
                let _ = outbox_tx.send(Message::Error { message: "malformed frame".into() });
                continue;
            }
        };

        if let Err(err) = route(&state, session_id, &mut peer_id, incoming, &outbox_tx).await {
            let _ = outbox_tx.send(Message::Error { message: err.wire_message() });
        }
    }

    cleanup(&state, session_id, peer_id).await;
    send_task.abort();
}

async fn route(
    state: &Arc<HubState>,
    session_id: SessionId,
    peer_id: &mut Option<PeerId>,
    incoming: Message,
    outbox: &mpsc::UnboundedSender<Message>,
) -> Result<(), OpenStudioError> {
    match incoming {
        Message::Register { peer_id: requested } => {
            handle_register(state, session_id, peer_id, requested, outbox).await
        }
        Message::Ping => {
            let _ = outbox.send(Message::Pong { timestamp: chrono::Utc::now().timestamp_millis() });
            Ok(())
        }
        Message::CreateRoom => {
            let me = require_registered(peer_id)?;
            let room_id = state
                .rooms
                .create_room(me.clone(), Role::Host)
                .await
                .map_err(room_error)?;
            let _ = outbox.send(Message::RoomCreated {
                room_id: room_id.to_string(),
                host_id: me.to_string(),
                role: Role::Host,
            });
            Ok(())
        }
        Message::JoinRoom { room_id } => {
            let me = require_registered(peer_id)?;
            join_room(state, me, RoomId::from(room_id), Role::Guest, outbox).await
        }
        Message::CreateOrJoinRoom { room_id, role } => {
            let me = require_registered(peer_id)?;
            let room_id = room_id.map(RoomId::from);
            let (room_id, created) = state
                .rooms
                .create_or_join(room_id, me.clone(), role)
                .await
                .map_err(room_error)?;
            if created {
                let _ = outbox.send(Message::RoomCreated {
                    room_id: room_id.to_string(),
                    host_id: me.to_string(),
                    role,
                });
            } else {
                announce_join(state, me, &room_id, role, outbox).await;
            }
            Ok(())
        }
        Message::Offer { from, to, sdp } => {
            relay(state, peer_id, from, to.clone(), Message::Offer { from: String::new(), to, sdp }).await
        }
        Message::Answer { from, to, sdp } => {
            relay(state, peer_id, from, to.clone(), Message::Answer { from: String::new(), to, sdp }).await
        }
        Message::IceCandidate { from, to, candidate } => {
            relay(
                state,
                peer_id,
                from,
                to.clone(),
                Message::IceCandidate { from: String::new(), to, candidate },
            )
            .await
        }
        Message::Mute { from, peer_id: target, muted, authority } => {
            handle_mute(state, peer_id, from, target, muted, authority).await
        }
        Message::Registered { .. }
        | Message::RoomCreated { .. }
        | Message::RoomJoined { .. }
        | Message::PeerJoined { .. }
        | Message::PeerLeft { .. }
        | Message::Welcome
        | Message::Error { .. } => {
            Err(OpenStudioError::Protocol("server-only message type sent by client".into()))
        }
    }
}

async fn handle_register(
    state: &Arc<HubState>,
    session_id: SessionId,
    peer_id: &mut Option<PeerId>,
    requested: String,
    outbox: &mpsc::UnboundedSender<Message>,
) -> Result<(), OpenStudioError> {
    if peer_id.is_some() {
        return Err(OpenStudioError::Registration("session is already registered".into()));
    }
    let requested = PeerId::from(requested);
    state
        .registry
        .register(requested.clone(), session_id, outbox.clone())
        .await
        .map_err(|RegisterError::AlreadyRegistered(id)| {
            OpenStudioError::Registration(format!("peer id {id:?} is already registered"))
        })?;
    let _ = outbox.send(Message::Registered { peer_id: requested.to_string() });
    *peer_id = Some(requested);
    Ok(())
}

fn require_registered(peer_id: &Option<PeerId>) -> Result<PeerId, OpenStudioError> {
    peer_id
        .clone()
        .ok_or_else(|| OpenStudioError::Registration("register before using this message".into()))
}

async fn join_room(
    state: &Arc<HubState>,
    me: PeerId,
    room_id: RoomId,
    role: Role,
    outbox: &mpsc::UnboundedSender<Message>,
) -> Result<(), OpenStudioError> {
    state
        .rooms
        .join_existing(room_id.clone(), me.clone(), role)
        .await
        .map_err(room_error)?;
    announce_join(state, me, &room_id, role, outbox).await;
    Ok(())
}

/// Send `room-joined` to the joiner and `peer-joined` to every member who
/// was already present.
async fn announce_join(
    state: &Arc<HubState>,
    me: PeerId,
    room_id: &RoomId,
    role: Role,
    outbox: &mpsc::UnboundedSender<Message>,
) {
    let participants: Vec<Participant> = state.rooms.participants_of(room_id).await;
    let _ = outbox.send(Message::RoomJoined {
        room_id: room_id.to_string(),
        participants,
        role,
    });

    for other in state.rooms.other_members(room_id, &me).await {
        if let Some(their_outbox) = state.registry.resolve(&other).await {
            let _ = their_outbox.send(Message::PeerJoined { peer_id: me.to_string(), role });
        }
    }
}

/// Unicast relay for offer/answer/ice-candidate. Enforces: `from` matches
/// the sender's registered id, the target is registered, and — when both
/// sides are in rooms — they're in the same room.
async fn relay(
    state: &Arc<HubState>,
    peer_id: &Option<PeerId>,
    from: String,
    to: String,
    mut outgoing: Message,
) -> Result<(), OpenStudioError> {
    let me = require_registered(peer_id)?;
    if from != me.as_str() {
        return Err(OpenStudioError::Protocol("from does not match registered peer id".into()));
    }
    let target = PeerId::from(to.clone());
    let target_outbox = state
        .registry
        .resolve(&target)
        .await
        .ok_or_else(|| OpenStudioError::Protocol(format!("target {to:?} is not registered")))?;

    if let (Some(my_room), Some(their_room)) = (state.rooms.room_of(&me).await, state.rooms.room_of(&target).await) {
        if my_room != their_room {
            return Err(OpenStudioError::Protocol("cross-room relay rejected".into()));
        }
    }

    set_from(&mut outgoing, me.to_string());
    target_outbox
        .send(outgoing)
        .map_err(|_| OpenStudioError::Protocol(format!("target {to:?} disconnected")))
}

fn set_from(message: &mut Message, from: String) {
    match message {
        Message::Offer { from: f, .. } | Message::Answer { from: f, .. } | Message::IceCandidate { from: f, .. } => {
            *f = from;
        }
        _ => {}
    }
}

/// `mute` is a room broadcast, including back to the sender for state
/// reconciliation. `authority: producer` requires the sender's role be
/// host or ops; `authority: self` must target the sender.
async fn handle_mute(
    state: &Arc<HubState>,
    peer_id: &Option<PeerId>,
    from: String,
    target: String,
    muted: bool,
    authority: Authority,
) -> Result<(), OpenStudioError> {
    let me = require_registered(peer_id)?;
    if from != me.as_str() {
        return Err(OpenStudioError::Protocol("from does not match registered peer id".into()));
    }

    match authority {
        Authority::SelfAsserted if target != me.as_str() => {
            return Err(OpenStudioError::Protocol("self authority must target the sender".into()));
        }
        Authority::Producer => {
            let role = state.rooms.role_of(&me).await;
            if !role.is_some_and(Role::can_impose_producer_mute) {
                return Err(OpenStudioError::Protocol("producer authority requires host or ops role".into()));
            }
        }
        _ => {}
    }

    let room_id = state
        .rooms
        .room_of(&me)
        .await
        .ok_or_else(|| OpenStudioError::Room("not in a room".into()))?;

    let broadcast = Message::Mute { from: me.to_string(), peer_id: target, muted, authority };
    for participant in state.rooms.participants_of(&room_id).await {
        let member = PeerId::from(participant.peer_id);
        if let Some(outbox) = state.registry.resolve(&member).await {
            let _ = outbox.send(broadcast.clone());
        }
    }
    Ok(())
}

fn room_error(err: RoomError) -> OpenStudioError {
    match err {
        RoomError::NotFound(id) => OpenStudioError::Room(format!("room {id:?} does not exist")),
        RoomError::AlreadyInRoom(id) => OpenStudioError::Room(format!("peer {id:?} is already in a room")),
    }
}

/// Disconnection: free the registration and, if the peer was in a room,
/// remove it and broadcast `peer-left` to whoever remains.
async fn cleanup(state: &Arc<HubState>, session_id: SessionId, peer_id: Option<PeerId>) {
    let Some(freed) = state.registry.unregister_by_session(session_id).await else {
        return;
    };
    debug_assert_eq!(Some(&freed), peer_id.as_ref());

    if let Some(departure) = state.rooms.remove_peer(&freed).await {
        for member in departure.remaining_members {
            if let Some(outbox) = state.registry.resolve(&member).await {
                let _ = outbox.send(Message::PeerLeft { peer_id: freed.to_string() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Peer {
        id: Option<PeerId>,
        session: SessionId,
        tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Peer {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self { id: None, session: SessionId::generate(), tx, rx }
        }

        async fn drain(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(m) = self.rx.try_recv() {
                out.push(m);
            }
            out
        }
    }

    async fn register(state: &Arc<HubState>, peer: &mut Peer, peer_id: &str) {
        route(state, peer.session, &mut peer.id, Message::Register { peer_id: peer_id.into() }, &peer.tx)
            .await
            .unwrap();
        peer.drain().await;
    }

    #[tokio::test]
    async fn duplicate_register_across_sessions_is_rejected() {
        let state = Arc::new(HubState::new());
        let mut a = Peer::new();
        register(&state, &mut a, "aaaaaaaa").await;

        let mut b = Peer::new();
        let err = route(&state, b.session, &mut b.id, Message::Register { peer_id: "aaaaaaaa".into() }, &b.tx)
            .await
            .unwrap_err();
        assert!(matches!(err, OpenStudioError::Registration(_)));
    }

    #[tokio::test]
    async fn two_peer_handshake_relays_offer_answer_and_announces_join() {
        let state = Arc::new(HubState::new());
        let mut host = Peer::new();
        register(&state, &mut host, "aaaaaaaa").await;
        route(&state, host.session, &mut host.id, Message::CreateRoom, &host.tx).await.unwrap();
        let created = host.drain().await;
        let room_id = match &created[0] {
            Message::RoomCreated { room_id, .. } => room_id.clone(),
            other => panic!("expected RoomCreated, got {other:?}"),
        };

        let mut guest = Peer::new();
        register(&state, &mut guest, "bbbbbbbb").await;
        route(&state, guest.session, &mut guest.id, Message::JoinRoom { room_id: room_id.clone() }, &guest.tx)
            .await
            .unwrap();

        let host_events = host.drain().await;
        assert!(host_events.iter().any(|m| matches!(m, Message::PeerJoined { peer_id, .. } if peer_id == "bbbbbbbb")));
        let guest_events = guest.drain().await;
        assert!(guest_events.iter().any(|m| matches!(m, Message::RoomJoined { .. })));

        route(
            &state,
            guest.session,
            &mut guest.id,
            Message::Offer { from: "bbbbbbbb".into(), to: "aaaaaaaa".into(), sdp: crate::protocol::SdpPayload("v=0".into()) },
            &guest.tx,
        )
        .await
        .unwrap();
        let relayed = host.drain().await;
        assert!(matches!(&relayed[0], Message::Offer { from, to, .. } if from == "bbbbbbbb" && to == "aaaaaaaa"));
    }

    #[tokio::test]
    async fn spoofed_from_is_rejected() {
        let state = Arc::new(HubState::new());
        let mut a = Peer::new();
        register(&state, &mut a, "aaaaaaaa").await;
        let mut b = Peer::new();
        register(&state, &mut b, "bbbbbbbb").await;

        let err = route(
            &state,
            a.session,
            &mut a.id,
            Message::Offer { from: "bbbbbbbb".into(), to: "bbbbbbbb".into(), sdp: crate::protocol::SdpPayload("v=0".into()) },
            &a.tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OpenStudioError::Protocol(_)));
    }

    #[tokio::test]
    async fn cross_room_relay_is_rejected() {
        let state = Arc::new(HubState::new());
        let mut a = Peer::new();
        register(&state, &mut a, "aaaaaaaa").await;
        route(&state, a.session, &mut a.id, Message::CreateRoom, &a.tx).await.unwrap();
        a.drain().await;

        let mut b = Peer::new();
        register(&state, &mut b, "bbbbbbbb").await;
        route(&state, b.session, &mut b.id, Message::CreateRoom, &b.tx).await.unwrap();
        b.drain().await;

        let err = route(
            &state,
            a.session,
            &mut a.id,
            Message::Offer { from: "aaaaaaaa".into(), to: "bbbbbbbb".into(), sdp: crate::protocol::SdpPayload("v=0".into()) },
            &a.tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OpenStudioError::Protocol(_)));
    }

    #[tokio::test]
    async fn producer_mute_requires_host_or_ops_role() {
        let state = Arc::new(HubState::new());
        let mut guest = Peer::new();
        register(&state, &mut guest, "guest1").await;
        route(&state, guest.session, &mut guest.id, Message::CreateOrJoinRoom { room_id: Some("r1".into()), role: Role::Guest }, &guest.tx)
            .await
            .unwrap();
        guest.drain().await;

        let err = route(
            &state,
            guest.session,
            &mut guest.id,
            Message::Mute { from: "guest1".into(), peer_id: "guest1".into(), muted: true, authority: Authority::Producer },
            &guest.tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OpenStudioError::Protocol(_)));
    }

    #[tokio::test]
    async fn mute_broadcast_reaches_sender_for_reconciliation() {
        let state = Arc::new(HubState::new());
        let mut host = Peer::new();
        register(&state, &mut host, "host1").await;
        route(&state, host.session, &mut host.id, Message::CreateOrJoinRoom { room_id: Some("r1".into()), role: Role::Host }, &host.tx)
            .await
            .unwrap();
        host.drain().await;

        route(
            &state,
            host.session,
            &mut host.id,
            Message::Mute { from: "host1".into(), peer_id: "host1".into(), muted: true, authority: Authority::SelfAsserted },
            &host.tx,
        )
        .await
        .unwrap();

        let events = host.drain().await;
        assert!(events.iter().any(|m| matches!(m, Message::Mute { muted: true, .. })));
    }

    #[tokio::test]
    async fn disconnect_removes_room_membership_and_notifies_remaining_members() {
        let state = Arc::new(HubState::new());
        let mut host = Peer::new();
        register(&state, &mut host, "aaaaaaaa").await;
        route(&state, host.session, &mut host.id, Message::CreateRoom, &host.tx).await.unwrap();
        let room_id = match &host.drain().await[0] {
            Message::RoomCreated { room_id, .. } => room_id.clone(),
            other => panic!("unexpected: {other:?}"),
        };

        let mut guest = Peer::new();
        register(&state, &mut guest, "bbbbbbbb").await;
        route(&state, guest.session, &mut guest.id, Message::JoinRoom { room_id }, &guest.tx).await.unwrap();
        host.drain().await;
        guest.drain().await;

        cleanup(&state, guest.session, guest.id.clone()).await;

        let host_events = host.drain().await;
        assert!(host_events.iter().any(|m| matches!(m, Message::PeerLeft { peer_id } if peer_id == "bbbbbbbb")));
        assert!(!state.registry.is_registered(&PeerId::from("bbbbbbbb")).await);
    }
}
