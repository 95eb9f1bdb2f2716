//! `StreamPublisher`: encodes the program bus and pushes it to an
//! Icecast-style sink over a long-lived HTTP `PUT`, reconnecting with
//! exponential backoff on any push-side failure.
//!
//! Runs as a spawned task, the same actor shape
//! `openstudio_rtc::transport::MediaTransport` and
//! `openstudio_rtc::coordinator::ConnectionCoordinator` use: a command
//! (here just "stop") goes in over a channel, status comes out over a
//! `watch` channel the owner can poll or await changes on.

use crate::config::SinkConfig;
use crate::encoder::{EncoderError, OggOpusEncoder};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(5);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 10;

/// `min(initial · 2^(n−1), max)`, the same pure shape as
/// `openstudio_rtc::coordinator::backoff_delay`, re-parameterized for the
/// publisher's own retry bound (`5s`/`60s`/`10` vs. the coordinator's
/// `2s`/`8s`/`3`) — kept as its own function since the two retry policies
/// are independent contracts, not one mechanism shared across crates.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Stopped,
    Connecting,
    Streaming,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublisherStatus {
    pub state: PublisherState,
    pub retry_count: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone)]
pub enum PublisherEvent {
    StatusChanged(PublisherStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("http push failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected the push (HTTP {0})")]
    Rejected(u16),
    #[error("sink connection closed before the push request completed")]
    SinkClosed,
}

/// Captures the program bus (fed in as 20 ms interleaved-stereo PCM frames
/// by whatever owns the `AudioGraph`'s publisher tap) and pushes it to the
/// configured sink. `start`/`stop` may be called repeatedly — each `start`
/// begins a fresh retry sequence from `retry_count = 0`.
pub struct StreamPublisher {
    config: SinkConfig,
    status_tx: watch::Sender<PublisherStatus>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl StreamPublisher {
    pub fn new(config: SinkConfig) -> (Self, watch::Receiver<PublisherStatus>) {
        let initial = PublisherStatus {
            state: PublisherState::Stopped,
            retry_count: 0,
            bitrate_kbps: config.bitrate_kbps,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        (
            Self {
                config,
                status_tx,
                stop_tx: None,
            },
            status_rx,
        )
    }

    /// Authorization for *initiating* a stream (host role only) is enforced
    /// by the caller — `openstudio-server`'s station-control surface — before
    /// this is ever invoked; by the time `start` runs, that check has
    /// already passed.
    pub fn start(&mut self, mut pcm_frames: mpsc::UnboundedReceiver<Vec<f32>>) {
        self.stop();

        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);
        let config = self.config.clone();
        let status_tx = self.status_tx.clone();

        tokio::spawn(async move {
            let mut attempt = 0u32;

            loop {
                set_status(&status_tx, PublisherState::Connecting, attempt, config.bitrate_kbps);

                let outcome = tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        set_status(&status_tx, PublisherState::Stopped, 0, config.bitrate_kbps);
                        return;
                    }
                    result = run_session(&config, &mut pcm_frames, &status_tx) => result,
                };

                match outcome {
                    Ok(()) => {
                        // `pcm_frames` closed: the owner tore down the
                        // AudioGraph and stopped feeding us. Clean exit.
                        set_status(&status_tx, PublisherState::Stopped, 0, config.bitrate_kbps);
                        return;
                    }
                    Err(e) => {
                        attempt += 1;
                        tracing::warn!(error = %e, attempt, "stream publisher push failed");

                        if attempt >= MAX_ATTEMPTS {
                            set_status(&status_tx, PublisherState::Error, attempt, config.bitrate_kbps);
                            return;
                        }

                        set_status(&status_tx, PublisherState::Reconnecting, attempt, config.bitrate_kbps);
                        let delay = backoff_delay(attempt, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
                        tokio::select! {
                            biased;
                            _ = &mut stop_rx => {
                                set_status(&status_tx, PublisherState::Stopped, 0, config.bitrate_kbps);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
    }

    /// Status remains whatever it last was until a subsequent `start`: an
    /// `error` state sticks until an explicit restart, same as a clean
    /// `stop`.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn set_status(
    tx: &watch::Sender<PublisherStatus>,
    state: PublisherState,
    retry_count: u32,
    bitrate_kbps: u32,
) {
    let _ = tx.send(PublisherStatus {
        state,
        retry_count,
        bitrate_kbps,
    });
}

/// One connection attempt: opens a fresh encoder and a fresh push request,
/// feeding encoded chunks in until either the sink rejects/drops the
/// connection (`Err`, triggering a backoff retry) or `pcm_frames` closes
/// (`Ok`, a clean shutdown requested by the owner).
async fn run_session(
    config: &SinkConfig,
    pcm_frames: &mut mpsc::UnboundedReceiver<Vec<f32>>,
    status_tx: &watch::Sender<PublisherStatus>,
) -> Result<(), PublisherError> {
    let mut encoder = OggOpusEncoder::new(config.bitrate_kbps)?;
    let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(8);

    let chunk_stream = futures_util::stream::unfold(chunk_rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
    });
    let body = reqwest::Body::wrap_stream(chunk_stream);

    let client = reqwest::Client::new();
    let request = client
        .put(config.push_url())
        .basic_auth(&config.username, Some(&config.password))
        .header("Content-Type", "application/ogg")
        .header("ice-name", config.stream_name.clone())
        .header("ice-description", config.stream_description.clone())
        .header("ice-public", if config.is_public { "1" } else { "0" })
        .body(body)
        .send();
    tokio::pin!(request);

    set_status(status_tx, PublisherState::Streaming, 0, config.bitrate_kbps);

    loop {
        tokio::select! {
            response = &mut request => {
                let response = response?;
                return if response.status().is_success() {
                    Ok(())
                } else {
                    Err(PublisherError::Rejected(response.status().as_u16()))
                };
            }
            frame = pcm_frames.recv() => {
                let Some(pcm) = frame else { return Ok(()) };
                if let Some(chunk) = encoder.encode_frame(&pcm)? {
                    if chunk_tx.send(chunk).await.is_err() {
                        return Err(PublisherError::SinkClosed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_sequence_matches_the_scenario() {
        let d1 = backoff_delay(1, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
        let d2 = backoff_delay(2, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
        let d3 = backoff_delay(3, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
        assert_eq!(d1, Duration::from_secs(5));
        assert_eq!(d2, Duration::from_secs(10));
        assert_eq!(d3, Duration::from_secs(20));
    }

    #[test]
    fn retry_delay_is_capped_at_the_configured_max() {
        let late = backoff_delay(20, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
        assert_eq!(late, RETRY_MAX_DELAY);
    }

    #[test]
    fn retry_delay_sequence_is_monotonically_non_decreasing() {
        let mut prev = Duration::from_secs(0);
        for attempt in 1..=MAX_ATTEMPTS {
            let d = backoff_delay(attempt, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
            assert!(d >= prev);
            assert!(d <= RETRY_MAX_DELAY);
            prev = d;
        }
    }
}
