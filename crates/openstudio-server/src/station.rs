//! Station control: the HTTP surface that starts/stops/reports the
//! `StreamPublisher`.
//!
//! Stream start/stop is producer-authoritative: host/ops authority is
//! enforced here at the hub layer, not just gated client-side, so a request
//! from a guest (or from a peer not in the room at all) is rejected
//! regardless of what any UI would have allowed.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use openstudio_audio::AudioGraph;
use openstudio_common::ids::PeerId;
use openstudio_publisher::encoder::{CHANNELS, FRAME_SAMPLES};
use openstudio_publisher::{PublisherState, StreamPublisher};
use openstudio_signaling::HubState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

const PUBLISHER_FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone)]
pub struct StationState {
    pub hub: HubState,
    pub graph: Arc<Mutex<AudioGraph>>,
    pub publisher: Arc<Mutex<StreamPublisher>>,
    pub publisher_status: watch::Receiver<PublisherStatusDto>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherStateDto {
    Stopped,
    Connecting,
    Streaming,
    Reconnecting,
    Error,
}

impl From<PublisherState> for PublisherStateDto {
    fn from(value: PublisherState) -> Self {
        match value {
            PublisherState::Stopped => Self::Stopped,
            PublisherState::Connecting => Self::Connecting,
            PublisherState::Streaming => Self::Streaming,
            PublisherState::Reconnecting => Self::Reconnecting,
            PublisherState::Error => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PublisherStatusDto {
    pub state: PublisherStateDto,
    pub retry_count: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    peer_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub fn router(state: StationState) -> Router {
    Router::new()
        .route("/api/stream/start", post(start))
        .route("/api/stream/stop", post(stop))
        .route("/api/stream/status", get(status))
        .with_state(state)
}

/// Host/ops only, enforced here rather than only in the UI. Spins up the
/// PCM bridge off the program bus's measurement tap and hands it to the
/// publisher.
async fn start(
    State(state): State<StationState>,
    Json(body): Json<StreamRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    require_producer_authority(&state, &body.peer_id).await?;

    let (pcm_tx, pcm_rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let graph = Arc::clone(&state.graph);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PUBLISHER_FRAME_INTERVAL);
        let mut buf = vec![0f32; FRAME_SAMPLES * CHANNELS];
        loop {
            ticker.tick().await;
            {
                let graph = graph.lock().await;
                graph.program_analyser().get_float_time_domain_data(&mut buf);
            }
            if pcm_tx.send(buf.clone()).is_err() {
                return;
            }
        }
    });

    state.publisher.lock().await.start(pcm_rx);
    Ok(StatusCode::ACCEPTED)
}

async fn stop(
    State(state): State<StationState>,
    Json(body): Json<StreamRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    require_producer_authority(&state, &body.peer_id).await?;
    state.publisher.lock().await.stop();
    Ok(StatusCode::ACCEPTED)
}

async fn status(State(state): State<StationState>) -> Json<PublisherStatusDto> {
    Json(*state.publisher_status.borrow())
}

async fn require_producer_authority(
    state: &StationState,
    peer_id: &str,
) -> Result<(), (StatusCode, Json<ErrorBody>)> {
    let peer_id = PeerId::from(peer_id.to_string());
    let role = state.hub.rooms.role_of(&peer_id).await;
    if role.is_some_and(|r| r.can_impose_producer_mute()) {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(ErrorBody {
                message: "streaming control requires host or ops role".to_string(),
            }),
        ))
    }
}
