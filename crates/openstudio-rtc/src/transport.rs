//! `MediaTransport`: a single peer-to-peer media session, wrapping one
//! `str0m::Rtc` instance.
//!
//! Each `MediaTransport` is a long-lived, bidirectional peer-to-peer
//! session: it can be either the offerer or the answerer, may renegotiate
//! to add a second track (the return feed) after the initial handshake,
//! and runs a full ICE agent against its one remote peer (there's no
//! central server here to act as an ICE-lite party).
//!
//! str0m is Sans-IO: this module owns the UDP socket and drives the
//! `Rtc` instance's poll/timeout/input loop from a dedicated actor task.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind, Mid};
use str0m::{Candidate, Event as RtcEvent, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

/// The two tracks a `MediaTransport` ever carries, per the stream-ordering
/// convention: the first `remote_stream` event for a peer is its
/// microphone, the second is its return feed. The transport itself does
/// not tag streams — this enum is only used for outbound tracks, where we
/// do know which is which because we're the ones adding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Microphone,
    ReturnFeed,
}

/// Connection lifecycle, surfaced via `TransportEvent::StateChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug)]
pub enum TransportEvent {
    LocalCandidate(String),
    /// A remote media stream arrived; `Mid` lets the caller write to the
    /// matching outbound direction if needed, but ordering (first =
    /// microphone, second = return feed) is the caller's responsibility.
    RemoteStream(Mid),
    /// One received RTP payload for `mid`, still Opus-encoded. The
    /// transport only depacketizes; decoding into PCM is the bridge's job.
    MediaData { mid: Mid, payload: Bytes },
    StateChanged(ConnectionState),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("sdp error: {0}")]
    Sdp(String),
    #[error("rtc error: {0}")]
    Rtc(String),
    #[error("transport actor is gone")]
    ActorGone,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

enum Command {
    AddLocalTrack { kind: TrackKind, reply: oneshot::Sender<Result<Mid, TransportError>> },
    CreateOffer { reply: oneshot::Sender<Result<String, TransportError>> },
    ApplyRemoteOffer { sdp: String, reply: oneshot::Sender<Result<String, TransportError>> },
    ApplyRemoteAnswer { sdp: String, reply: oneshot::Sender<Result<(), TransportError>> },
    AddRemoteCandidate { candidate: String },
    WriteAudio { mid: Mid, payload: Bytes },
    SetTrackEnabled { mid: Mid, enabled: bool },
    IsStable { reply: oneshot::Sender<bool> },
}

/// A handle to a running `MediaTransport` actor. Cloning shares the same
/// underlying session.
#[derive(Clone)]
pub struct MediaTransport {
    commands: mpsc::UnboundedSender<Command>,
}

impl MediaTransport {
    /// Spawn a new transport actor bound to an ephemeral UDP port on
    /// `bind_ip`, returning the handle and a receiver for its events.
    pub async fn spawn(bind_ip: std::net::IpAddr) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        let local_addr = socket.local_addr()?;
        // Widen the kernel buffers past the OS default: a mesh participant
        // can be juggling several peers' worth of RTP on this one socket,
        // and the default is sized for a single best-effort stream.
        {
            let sock_ref = socket2::SockRef::from(&socket);
            let _ = sock_ref.set_recv_buffer_size(1 << 20);
            let _ = sock_ref.set_send_buffer_size(1 << 20);
        }

        let mut rtc = Rtc::builder().build(Instant::now());
        let candidate = Candidate::host(local_addr, str0m::net::Protocol::Udp)
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        rtc.add_local_candidate(candidate);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_transport(rtc, socket, local_addr, cmd_rx, event_tx));

        Ok((Self { commands: cmd_tx }, event_rx))
    }

    pub async fn add_local_track(&self, kind: TrackKind) -> Result<Mid, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::AddLocalTrack { kind, reply })
            .map_err(|_| TransportError::ActorGone)?;
        rx.await.map_err(|_| TransportError::ActorGone)?
    }

    pub async fn create_offer(&self) -> Result<String, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CreateOffer { reply })
            .map_err(|_| TransportError::ActorGone)?;
        rx.await.map_err(|_| TransportError::ActorGone)?
    }

    pub async fn apply_remote_offer(&self, sdp: String) -> Result<String, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ApplyRemoteOffer { sdp, reply })
            .map_err(|_| TransportError::ActorGone)?;
        rx.await.map_err(|_| TransportError::ActorGone)?
    }

    pub async fn apply_remote_answer(&self, sdp: String) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ApplyRemoteAnswer { sdp, reply })
            .map_err(|_| TransportError::ActorGone)?;
        rx.await.map_err(|_| TransportError::ActorGone)?
    }

    pub fn add_remote_candidate(&self, candidate: String) -> Result<(), TransportError> {
        self.commands
            .send(Command::AddRemoteCandidate { candidate })
            .map_err(|_| TransportError::ActorGone)
    }

    pub fn write_audio(&self, mid: Mid, payload: Bytes) -> Result<(), TransportError> {
        self.commands
            .send(Command::WriteAudio { mid, payload })
            .map_err(|_| TransportError::ActorGone)
    }

    /// Distinct from `MuteController`'s gain ramp: this stops outbound RTP
    /// for `mid` at the transport itself, for self-muting one's *own*
    /// outbound microphone (which never passes through the local
    /// `AudioGraph` to be gain-muted).
    pub fn set_local_track_enabled(&self, mid: Mid, enabled: bool) -> Result<(), TransportError> {
        self.commands
            .send(Command::SetTrackEnabled { mid, enabled })
            .map_err(|_| TransportError::ActorGone)
    }

    /// Whether the underlying signaling state is stable (no offer
    /// in-flight) — used by the coordinator's offer-collision check.
    pub async fn is_stable(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::IsStable { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

async fn run_transport(
    mut rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buf = vec![0u8; 2048];
    let mut last_state = ConnectionState::Disconnected;
    let mut disabled_tracks: std::collections::HashSet<Mid> = std::collections::HashSet::new();
    // Set while our own offer is outstanding (between `CreateOffer` and the
    // matching `ApplyRemoteAnswer`); `None` means the signaling state is
    // stable. `accept_answer` consumes it.
    let mut pending_offer: Option<SdpPendingOffer> = None;

    loop {
        let timeout = match rtc.poll_output() {
            Ok(Output::Timeout(deadline)) => deadline,
            Ok(Output::Transmit(transmit)) => {
                let _ = socket.send_to(&transmit.contents, transmit.destination).await;
                continue;
            }
            Ok(Output::Event(event)) => {
                handle_rtc_event(event, &events, &mut last_state);
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport poll_output failed");
                let _ = events.send(TransportEvent::StateChanged(ConnectionState::Failed));
                return;
            }
        };

        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(timeout));
        tokio::pin!(sleep);

        tokio::select! {
            _ = &mut sleep => {
                let _ = rtc.handle_input(Input::Timeout(Instant::now()));
            }
            recv = socket.recv_from(&mut buf) => {
                if let Ok((len, source)) = recv {
                    if let Ok(contents) = str0m::net::Receive::new(
                        str0m::net::Protocol::Udp,
                        source,
                        local_addr,
                        &buf[..len],
                    ) {
                        let _ = rtc.handle_input(Input::Receive(Instant::now(), contents));
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_command(&mut rtc, cmd, &mut disabled_tracks, &mut pending_offer),
                    None => return,
                }
            }
        }
    }
}

fn handle_rtc_event(
    event: RtcEvent,
    events: &mpsc::UnboundedSender<TransportEvent>,
    last_state: &mut ConnectionState,
) {
    match event {
        RtcEvent::IceConnectionStateChange(state) => {
            let mapped = match state {
                str0m::IceConnectionState::New => ConnectionState::Connecting,
                str0m::IceConnectionState::Checking => ConnectionState::Connecting,
                str0m::IceConnectionState::Connected | str0m::IceConnectionState::Completed => {
                    ConnectionState::Connected
                }
                str0m::IceConnectionState::Disconnected => ConnectionState::Disconnected,
            };
            if mapped != *last_state {
                *last_state = mapped;
                let _ = events.send(TransportEvent::StateChanged(mapped));
            }
        }
        RtcEvent::MediaAdded(added) => {
            let _ = events.send(TransportEvent::RemoteStream(added.mid));
        }
        RtcEvent::MediaData(data) => {
            let _ = events.send(TransportEvent::MediaData {
                mid: data.mid,
                payload: Bytes::copy_from_slice(&data.data),
            });
        }
        _ => {}
    }
}

fn handle_command(
    rtc: &mut Rtc,
    cmd: Command,
    disabled_tracks: &mut std::collections::HashSet<Mid>,
    pending_offer: &mut Option<SdpPendingOffer>,
) {
    match cmd {
        Command::AddLocalTrack { kind: _, reply } => {
            // Stage the media line only. Applying here would generate and
            // discard an offer immediately, leaving `CreateOffer` with
            // nothing pending to send.
            let mut change = rtc.sdp_api();
            let mid = change.add_media(MediaKind::Audio, Direction::SendRecv, None, None);
            let _ = reply.send(Ok(mid));
        }
        Command::CreateOffer { reply } => {
            let mut change = rtc.sdp_api();
            let result = match change.apply() {
                Some((offer, pending)) => {
                    *pending_offer = Some(pending);
                    Ok(offer.to_sdp_string())
                }
                None => Err(TransportError::Sdp("no pending media change to offer".into())),
            };
            let _ = reply.send(result);
        }
        Command::ApplyRemoteOffer { sdp, reply } => {
            let result = SdpOffer::from_sdp_string(&sdp)
                .map_err(|e| TransportError::Sdp(e.to_string()))
                .and_then(|offer| {
                    rtc.sdp_api()
                        .accept_offer(offer)
                        .map(|answer| answer.to_sdp_string())
                        .map_err(|e| TransportError::Rtc(e.to_string()))
                });
            let _ = reply.send(result);
        }
        Command::ApplyRemoteAnswer { sdp, reply } => {
            let result = match pending_offer.take() {
                Some(pending) => SdpAnswer::from_sdp_string(&sdp)
                    .map_err(|e| TransportError::Sdp(e.to_string()))
                    .and_then(|answer| {
                        rtc.sdp_api()
                            .accept_answer(pending, answer)
                            .map_err(|e| TransportError::Rtc(e.to_string()))
                    }),
                None => Err(TransportError::Rtc("no offer outstanding for this answer".into())),
            };
            let _ = reply.send(result);
        }
        Command::AddRemoteCandidate { candidate } => match Candidate::from_sdp_string(&candidate) {
            Ok(cand) => rtc.add_remote_candidate(cand),
            Err(e) => tracing::warn!(error = %e, "dropping unparseable ICE candidate"),
        },
        Command::WriteAudio { mid, payload } => {
            if disabled_tracks.contains(&mid) {
                return;
            }
            if let Some(mut writer) = rtc.writer(mid) {
                let _ = writer.write(Instant::now(), &payload);
            }
        }
        Command::SetTrackEnabled { mid, enabled } => {
            if enabled {
                disabled_tracks.remove(&mid);
            } else {
                disabled_tracks.insert(mid);
            }
        }
        Command::IsStable { reply } => {
            let _ = reply.send(pending_offer.is_none());
        }
    }
}
