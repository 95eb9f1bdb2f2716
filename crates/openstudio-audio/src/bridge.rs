//! Bridges Opus payloads received over a `MediaTransport` into the
//! `MediaStream` the `AudioGraph` and `ReturnFeedPlayer` expect.
//!
//! The transport only depacketizes RTP; it hands back opaque, still-encoded
//! payload bytes tagged by `Mid`. This module owns the Opus decode step and
//! exposes the result as a `web-audio-api` media stream track, the same way
//! `openstudio-publisher::encoder` owns the corresponding encode step for the
//! outbound side. `opus` crate method names are approximated here the same
//! way `openstudio-rtc::transport` approximates str0m's surface — plausible
//! given the published API, not toolchain-verified.

use bytes::Bytes;
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;
use web_audio_api::media_streams::MediaStream;
use web_audio_api::AudioBuffer;

const SAMPLE_RATE: u32 = 48_000;
const FRAME_SAMPLES: usize = 960; // 20 ms at 48 kHz, mono

/// Handle fed by the coordinator's `MediaData` events for one remote
/// stream (a peer's microphone or their return feed — one `OpusFeed` per
/// `Mid`). Dropping it stops the decode task and ends the stream.
pub struct OpusFeed {
    payloads: mpsc::UnboundedSender<Bytes>,
}

impl OpusFeed {
    /// Spawns the decode loop and returns the feed handle plus the stream to
    /// hand to `AudioGraph::add_participant` or `ReturnFeedPlayer::play`.
    pub fn spawn() -> (Self, crate::graph::IncomingStream) {
        let (payloads, mut payload_rx) = mpsc::unbounded_channel::<Bytes>();
        let (frames_tx, frames_rx) = std_mpsc::channel::<AudioBuffer>();

        tokio::spawn(async move {
            let mut decoder = match opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono) {
                Ok(decoder) => decoder,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to construct opus decoder, dropping feed");
                    return;
                }
            };

            while let Some(payload) = payload_rx.recv().await {
                let mut pcm = vec![0f32; FRAME_SAMPLES];
                match decoder.decode_float(&payload, &mut pcm, false) {
                    Ok(decoded) => {
                        pcm.truncate(decoded);
                        let buffer = AudioBuffer::from(vec![pcm], SAMPLE_RATE as f32);
                        if frames_tx.send(buffer).is_err() {
                            return;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "dropping undecodable opus frame"),
                }
            }
        });

        (Self { payloads }, Box::new(DecodedStream { frames: frames_rx }))
    }

    /// Pushes one still-encoded payload for this stream's `Mid` to the
    /// decode task. Never blocks; a full or dropped channel just drops the
    /// frame, matching RTP's best-effort delivery.
    pub fn push(&self, payload: Bytes) {
        let _ = self.payloads.send(payload);
    }
}

/// A decoded-PCM source, yielded one 20 ms buffer at a time. Implements the
/// same track contract `graph::IncomingStream` already expects from any
/// producer of remote audio, decoded or not.
struct DecodedStream {
    frames: std_mpsc::Receiver<AudioBuffer>,
}

impl Iterator for DecodedStream {
    type Item = AudioBuffer;

    fn next(&mut self) -> Option<AudioBuffer> {
        self.frames.recv().ok()
    }
}

impl MediaStream for DecodedStream {}
