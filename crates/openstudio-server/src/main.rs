//! Main binary: the signaling hub, the station's own HTTP control surface
//! (`routes`/`station`), and the station's own participant process — the
//! mixing engine, mix-minus buses, mute controller, return-feed player, and
//! stream publisher — running together in one process.
//!
//! Everything binds to a single merged HTTP router (one listener serving
//! the signaling WebSocket and both HTTP surfaces), alongside the station's
//! own mesh participant, which talks to the hub through
//! `openstudio_signaling::spawn_internal_session` exactly like any browser
//! peer would.

mod routes;
mod station;

use axum::Router;
use clap::Parser;
use openstudio_audio::{AudioGraph, MuteAuthority, MuteController, OpusFeed, ReturnFeedPlayer};
use openstudio_common::config::{listen_port, load_manifest};
use openstudio_common::ids::PeerId;
use openstudio_publisher::{SinkConfig, StreamPublisher};
use openstudio_rtc::coordinator::{ConnectionCoordinator, CoordinatorEvent, RemoteStatus};
use openstudio_signaling::protocol::{Authority, Message, Role};
use openstudio_signaling::{build_router, spawn_internal_session, HubState};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use str0m::media::Mid;
use tokio::sync::{watch, Mutex};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "openstudio", version, about = "OpenStudio signaling hub and station process")]
struct Cli {
    /// Overrides OPENSTUDIO_CONFIG — path to the station manifest JSON.
    #[arg(long)]
    config: Option<String>,

    /// Overrides PORT — the signaling/HTTP listener's bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // SAFETY: single-threaded at this point in startup, before any other
    // task has had a chance to read these vars concurrently.
    unsafe {
        if let Some(config) = &cli.config {
            std::env::set_var("OPENSTUDIO_CONFIG", config);
        }
        if let Some(port) = cli.port {
            std::env::set_var("PORT", port.to_string());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openstudio=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let manifest = match load_manifest() {
        Ok(manifest) => manifest,
        Err(err) => {
            for line in err.to_string().lines() {
                tracing::error!("{line}");
            }
            std::process::exit(1);
        }
    };
    let manifest = Arc::new(manifest);
    tracing::info!(station_id = %manifest.station_id, name = %manifest.name, "station manifest loaded");

    let hub_state = HubState::new();
    let hub_for_station = Arc::new(hub_state.clone());

    // === Audio engine ===
    let (graph, mut mix_minus_ready) = AudioGraph::initialize();
    let context = graph.context();
    let graph = Arc::new(Mutex::new(graph));
    let (mute_controller, mut mute_changes) = MuteController::new();
    let mute_controller = Arc::new(Mutex::new(mute_controller));
    let return_feed = Arc::new(Mutex::new(ReturnFeedPlayer::new(context)));

    // Local mute-state changes never need to be re-broadcast here: every
    // change this process applies locally via `MuteController::set_mute`
    // originates from a `mute` frame the hub already broadcast to the
    // whole room (including us). This process has no local mute UI of its
    // own yet, so the channel is drained, not forwarded.
    tokio::spawn(async move { while mute_changes.recv().await.is_some() {} });

    // === Stream publisher ===
    let sink_config = SinkConfig::from_env()?;
    let (publisher, publisher_status) = StreamPublisher::new(sink_config);
    let publisher = Arc::new(Mutex::new(publisher));

    let initial_status = station::PublisherStatusDto {
        state: station::PublisherStateDto::Stopped,
        retry_count: 0,
        bitrate_kbps: publisher_status.borrow().bitrate_kbps,
    };
    let (status_dto_tx, status_dto_rx) = watch::channel(initial_status);
    tokio::spawn(bridge_publisher_status(publisher_status, status_dto_tx));

    // === The station's own signaling session ===
    let station_peer = PeerId::from(manifest.station_id.clone());
    let (signaling_out, mut signaling_in) = spawn_internal_session(Arc::clone(&hub_for_station));

    // The station process has no microphone capture device of its own; the
    // readiness gate exists for a browser peer's local mic permission
    // prompt, which doesn't apply here, so it reports ready immediately.
    let (_local_mic_ready_tx, local_mic_ready_rx) = watch::channel(true);

    let bind_ip: IpAddr = std::env::var("OPENSTUDIO_BIND_IP")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    let (coordinator, mut coordinator_events) = ConnectionCoordinator::new(
        station_peer.clone(),
        bind_ip,
        signaling_out.clone(),
        local_mic_ready_rx,
    );
    let coordinator = Arc::new(coordinator);

    signaling_out.send(Message::Register { peer_id: station_peer.to_string() })?;
    signaling_out.send(Message::CreateOrJoinRoom {
        room_id: Some(manifest.station_id.clone()),
        role: Role::Host,
    })?;

    // Frames the hub sends back to the station's session: RTC signaling
    // goes to the coordinator, `mute` broadcasts apply to the local
    // `MuteController`, everything else is logged.
    {
        let coordinator = Arc::clone(&coordinator);
        let graph = Arc::clone(&graph);
        let mute_controller = Arc::clone(&mute_controller);
        let station_peer = station_peer.clone();
        tokio::spawn(async move {
            while let Some(message) = signaling_in.recv().await {
                if let Message::Mute { peer_id, muted, authority, from } = &message {
                    if from != station_peer.as_str() {
                        let target = PeerId::from(peer_id.clone());
                        let mute_authority = match authority {
                            Authority::SelfAsserted => MuteAuthority::SelfMute,
                            Authority::Producer => MuteAuthority::Producer,
                        };
                        let mut graph = graph.lock().await;
                        let mut mute_controller = mute_controller.lock().await;
                        mute_controller.set_mute(&mut graph, &target, *muted, mute_authority);
                    }
                } else if let Message::Error { message } = &message {
                    tracing::warn!(%message, "signaling error");
                }

                if let Err(err) = coordinator.handle_signaling(message).await {
                    tracing::warn!(error = %err, "failed to handle signaling frame");
                }
            }
        });
    }

    // Mix-minus bus readiness drives return-feed renegotiation directly —
    // no fixed delay; `AudioGraph::initialize`'s receiver is the explicit
    // readiness signal this design uses instead.
    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(remote) = mix_minus_ready.recv().await {
                if let Err(err) = coordinator.add_return_feed(remote.clone()).await {
                    tracing::warn!(peer = %remote, error = %err, "failed to add return feed");
                }
            }
        });
    }

    // Connection lifecycle + stream-arrival events.
    {
        let graph = Arc::clone(&graph);
        let mute_controller = Arc::clone(&mute_controller);
        let return_feed = Arc::clone(&return_feed);
        tokio::spawn(async move {
            // One `OpusFeed` per (peer, mid) pair, keyed the same way the
            // coordinator tags `MediaData` — a peer's microphone and return
            // feed arrive as two separate `Mid`s on the same transport.
            let mut feeds: HashMap<(PeerId, Mid), OpusFeed> = HashMap::new();

            while let Some(event) = coordinator_events.recv().await {
                match event {
                    CoordinatorEvent::RemoteStatusChanged(peer, status) => {
                        tracing::info!(peer = %peer, ?status, "remote connection status changed");
                        if matches!(status, RemoteStatus::FailedPermanent) {
                            graph.lock().await.remove_participant(&peer);
                            mute_controller.lock().await.forget(&peer);
                            return_feed.lock().await.stop(&peer);
                            feeds.retain(|(p, _), _| p != &peer);
                        }
                    }
                    CoordinatorEvent::RemoteMicrophone(peer, mid) => {
                        tracing::info!(peer = %peer, "remote microphone stream available");
                        let (feed, stream) = OpusFeed::spawn();
                        feeds.insert((peer.clone(), mid), feed);
                        graph.lock().await.add_participant(peer, stream);
                    }
                    CoordinatorEvent::RemoteReturnFeed(peer, mid) => {
                        tracing::info!(peer = %peer, "remote return feed stream available");
                        let (feed, stream) = OpusFeed::spawn();
                        feeds.insert((peer.clone(), mid), feed);
                        return_feed.lock().await.play(peer, stream);
                    }
                    CoordinatorEvent::MediaData(peer, mid, payload) => {
                        if let Some(feed) = feeds.get(&(peer, mid)) {
                            feed.push(payload);
                        }
                    }
                }
            }
        });
    }

    // === HTTP surface ===
    let route_state = routes::RouteState {
        manifest: Arc::clone(&manifest),
        started_at: Instant::now(),
    };
    let station_state = station::StationState {
        hub: hub_state.clone(),
        graph: Arc::clone(&graph),
        publisher: Arc::clone(&publisher),
        publisher_status: status_dto_rx,
    };

    let app: Router = Router::new()
        .merge(build_router(hub_state))
        .merge(routes::router(route_state))
        .merge(station::router(station_state));

    let port = listen_port();
    let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "openstudio listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Graceful shutdown: close the signaling session first (the hub
    // reacts with its own room cleanup), tear down every MediaTransport,
    // destroy the AudioGraph (cascading to MixMinusEngine/StreamPublisher),
    // and stop the ReturnFeedPlayer — all under a 10s deadline, after which
    // the process exits anyway rather than hang.
    let teardown = async {
        let _ = signaling_out.send(Message::PeerLeft { peer_id: station_peer.to_string() });
        drop(signaling_out);
        coordinator.shutdown().await;
        publisher.lock().await.stop();
        return_feed.lock().await.stop_all();
        // `graph`'s last `Arc` clone drops here, taking its `AudioContext`
        // (and with it the `MixMinusEngine`) down with it.
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, teardown).await.is_err() {
        tracing::error!("graceful shutdown exceeded its 10s deadline, forcing termination");
        std::process::exit(1);
    }

    Ok(())
}

async fn bridge_publisher_status(
    mut native: watch::Receiver<openstudio_publisher::publisher::PublisherStatus>,
    dto: watch::Sender<station::PublisherStatusDto>,
) {
    loop {
        let mapped = {
            let status = *native.borrow();
            station::PublisherStatusDto {
                state: status.state.into(),
                retry_count: status.retry_count,
                bitrate_kbps: status.bitrate_kbps,
            }
        };
        if dto.send(mapped).is_err() {
            return;
        }
        if native.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining connections");
}
