//! `ReturnFeedPlayer`: plays a remote peer's return feed straight to the
//! local sink, bypassing the `AudioGraph` entirely. The feed has already
//! been mixed and compressed on the far end — re-processing it locally
//! would only add latency and risk a feedback loop, so it gets a source
//! node wired directly to the context destination at fixed unity gain.

use crate::graph::IncomingStream;
use openstudio_common::ids::PeerId;
use std::collections::HashMap;
use web_audio_api::context::{AudioContext, BaseAudioContext};
use web_audio_api::node::{AudioNode, MediaStreamAudioSourceNode};

pub struct ReturnFeedPlayer {
    context: AudioContext,
    playing: HashMap<PeerId, MediaStreamAudioSourceNode>,
}

impl ReturnFeedPlayer {
    pub fn new(context: AudioContext) -> Self {
        Self {
            context,
            playing: HashMap::new(),
        }
    }

    /// Replaces any existing playback for `peer_id`.
    pub fn play(&mut self, peer_id: PeerId, stream: IncomingStream) {
        self.stop(&peer_id);
        let source = self.context.create_media_stream_source(&*stream);
        source.connect(&self.context.destination());
        self.playing.insert(peer_id, source);
    }

    pub fn stop(&mut self, peer_id: &PeerId) {
        if let Some(source) = self.playing.remove(peer_id) {
            source.disconnect();
        }
    }

    pub fn stop_all(&mut self) {
        for (_, source) in self.playing.drain() {
            source.disconnect();
        }
    }

    pub fn is_playing(&self, peer_id: &PeerId) -> bool {
        self.playing.contains_key(peer_id)
    }

    pub fn playing_count(&self) -> usize {
        self.playing.len()
    }
}
