//! `AudioGraph`: per-participant source → gain → compressor → metering
//! chains, summed into a shared program bus.
//!
//! Node ownership is one-directional: the graph owns every
//! [`ParticipantNodes`] and the program bus; [`crate::mix_minus::MixMinusEngine`]
//! only ever holds non-owning handles into the compressor outputs and the
//! program bus output, so there is no reference cycle to break on teardown
//! (mix-minus buses are dropped before participant nodes — see
//! `remove_participant`).

use openstudio_common::ids::PeerId;
use std::collections::HashMap;
use tokio::sync::mpsc;
use web_audio_api::context::{AudioContext, BaseAudioContext};
use web_audio_api::media_streams::MediaStream;
use web_audio_api::node::{
    AudioNode, DynamicsCompressorNode, GainNode, MediaStreamAudioDestinationNode,
    MediaStreamAudioSourceNode,
};

/// A remote peer's incoming audio, as handed off by whatever bridges the
/// media transport's decoded samples into a `web-audio-api` source. The
/// bridge itself (RTP → PCM) lives outside this crate — the graph only
/// needs something it can hand to `create_media_stream_source`.
pub type IncomingStream = Box<dyn MediaStream>;

const GAIN_MIN: f32 = 0.0;
const GAIN_MAX: f32 = 2.0;
const GAIN_INITIAL: f32 = 1.0;
const GAIN_RAMP_SECONDS: f64 = 0.050;

const COMPRESSOR_THRESHOLD_DB: f32 = -24.0;
const COMPRESSOR_KNEE_DB: f32 = 30.0;
const COMPRESSOR_RATIO: f32 = 12.0;
const COMPRESSOR_ATTACK_SECONDS: f32 = 0.003;
const COMPRESSOR_RELEASE_SECONDS: f32 = 0.250;

#[derive(Debug, thiserror::Error)]
pub enum AudioGraphError {
    #[error("participant {0} already connected")]
    AlreadyPresent(String),
    #[error("no such participant: {0}")]
    NotFound(String),
}

/// One remote peer's processing chain: source → gain → compressor →
/// metering analyser → program bus. Owned exclusively by the `AudioGraph`.
pub struct ParticipantNodes {
    source: MediaStreamAudioSourceNode,
    gain: GainNode,
    compressor: DynamicsCompressorNode,
    analyser: web_audio_api::node::AnalyserNode,
    current_gain: f32,
}

impl ParticipantNodes {
    /// Non-owning handle to this participant's post-compression, pre-bus
    /// output — the only thing `MixMinusEngine` is allowed to tap.
    pub fn compressor_output(&self) -> &DynamicsCompressorNode {
        &self.compressor
    }
}

/// Stereo chain shared by every participant: a summing junction (multiple
/// inputs connected to the same node sum automatically per the Web Audio
/// spec, so no explicit `ChannelMergerNode` is needed for this), a master
/// gain, a measurement analyser, and the local-monitor/publisher taps.
struct ProgramBus {
    sum: GainNode,
    master_gain: GainNode,
    analyser: web_audio_api::node::AnalyserNode,
    publisher_tap: MediaStreamAudioDestinationNode,
}

pub struct AudioGraph {
    context: AudioContext,
    program: ProgramBus,
    participants: HashMap<PeerId, ParticipantNodes>,
    mix_minus: crate::mix_minus::MixMinusEngine,
    mix_minus_ready: mpsc::UnboundedSender<PeerId>,
}

impl AudioGraph {
    /// Builds the context and the program bus. This must run before any
    /// `add_participant` call. Returns a receiver that fires
    /// the remote peer id every time that peer's mix-minus bus becomes
    /// available for renegotiation — the graph's answer to the "fixed delay
    /// vs. explicit readiness event" design question.
    pub fn initialize() -> (Self, mpsc::UnboundedReceiver<PeerId>) {
        let context = AudioContext::default();

        // Multiple nodes connected to the same input sum automatically per
        // the Web Audio mixing rule, so this summing junction is just a
        // unity gain every participant's compressor output feeds into —
        // no explicit channel-merge node is needed to combine them.
        let sum = context.create_gain();
        sum.gain().set_value(1.0);

        let master_gain = context.create_gain();
        master_gain.gain().set_value(1.0);
        sum.connect(&master_gain);

        let analyser = context.create_analyser();
        master_gain.connect(&analyser);

        let publisher_tap = context.create_media_stream_destination();
        master_gain.connect(&publisher_tap);

        // Local monitoring: the program bus also drives the context's own
        // destination (speakers/headphones), independent of the publisher
        // tap so the publisher never observes local monitor routing.
        master_gain.connect(&context.destination());

        let mix_minus = crate::mix_minus::MixMinusEngine::new(context.clone());
        let (mix_minus_ready, rx) = mpsc::unbounded_channel();

        let graph = Self {
            context,
            program: ProgramBus {
                sum,
                master_gain,
                analyser,
                publisher_tap,
            },
            participants: HashMap::new(),
            mix_minus,
            mix_minus_ready,
        };

        (graph, rx)
    }

    /// A cheap handle to this graph's audio context, shared (not
    /// duplicated) by callers that need a sibling consumer of the same
    /// device — e.g. `ReturnFeedPlayer`, which bypasses this graph's node
    /// chain entirely but must still render to the same output device.
    pub fn context(&self) -> AudioContext {
        self.context.clone()
    }

    pub fn has_participant(&self, peer_id: &PeerId) -> bool {
        self.participants.contains_key(peer_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Builds the full source → gain → compressor → analyser → program-bus
    /// chain for `peer_id`, then constructs its mix-minus bus. Adding a
    /// participant that already exists tears down the old chain first, per
    /// the invariant that there is never more than one live chain per peer.
    pub fn add_participant(&mut self, peer_id: PeerId, stream: IncomingStream) {
        if self.participants.contains_key(&peer_id) {
            self.remove_participant(&peer_id);
        }

        let source = self.context.create_media_stream_source(&*stream);

        let gain = self.context.create_gain();
        gain.gain().set_value(GAIN_INITIAL);
        source.connect(&gain);

        let compressor = self.context.create_dynamics_compressor();
        compressor.threshold().set_value(COMPRESSOR_THRESHOLD_DB);
        compressor.knee().set_value(COMPRESSOR_KNEE_DB);
        compressor.ratio().set_value(COMPRESSOR_RATIO);
        compressor.attack().set_value(COMPRESSOR_ATTACK_SECONDS);
        compressor.release().set_value(COMPRESSOR_RELEASE_SECONDS);
        gain.connect(&compressor);

        let analyser = self.context.create_analyser();
        compressor.connect(&analyser);
        compressor.connect(&self.program.sum);

        let nodes = ParticipantNodes {
            source,
            gain,
            compressor,
            analyser,
            current_gain: GAIN_INITIAL,
        };

        self.mix_minus
            .create_bus(peer_id.clone(), &self.program.master_gain, nodes.compressor_output());
        let _ = self.mix_minus_ready.send(peer_id.clone());

        self.participants.insert(peer_id, nodes);
    }

    /// Severs and releases every node for `peer_id`, destroying its
    /// mix-minus bus first: tear down the consumer before the producer
    /// it reads from.
    pub fn remove_participant(&mut self, peer_id: &PeerId) {
        self.mix_minus.destroy_bus(peer_id);

        if let Some(nodes) = self.participants.remove(peer_id) {
            nodes.compressor.disconnect();
            nodes.gain.disconnect();
            nodes.source.disconnect();
            nodes.analyser.disconnect();
        }
    }

    /// Clamps to [0, 2] and applies a 50 ms linear ramp from the node's
    /// current value — used directly both for manual level control and by
    /// `MuteController`'s mute/unmute ramps.
    pub fn set_gain(&mut self, peer_id: &PeerId, value: f32) -> Result<(), AudioGraphError> {
        let nodes = self
            .participants
            .get_mut(peer_id)
            .ok_or_else(|| AudioGraphError::NotFound(peer_id.to_string()))?;

        let clamped = value.clamp(GAIN_MIN, GAIN_MAX);
        let now = self.context.current_time();
        nodes
            .gain
            .gain()
            .linear_ramp_to_value_at_time(clamped, now + GAIN_RAMP_SECONDS);
        nodes.current_gain = clamped;
        Ok(())
    }

    pub fn gain_of(&self, peer_id: &PeerId) -> Option<f32> {
        self.participants.get(peer_id).map(|n| n.current_gain)
    }

    /// The program bus's measurement tap, polled by `ProgramMeter`'s owner
    /// at UI cadence.
    pub fn program_analyser(&self) -> &web_audio_api::node::AnalyserNode {
        &self.program.analyser
    }

    /// The capturable stream handed to the stream publisher. This tap is
    /// wired only from the master gain node — it never feeds back into any
    /// per-participant chain.
    pub fn publisher_stream(&self) -> MediaStream {
        self.program.publisher_tap.stream()
    }

    pub fn mix_minus_stream(&self, peer_id: &PeerId) -> Option<MediaStream> {
        self.mix_minus.bus(peer_id).map(|bus| bus.stream())
    }

    pub fn mix_minus_bus_count(&self) -> usize {
        self.mix_minus.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_clamps_to_contract_range() {
        // Pure clamp behavior, independent of the audio context, so this
        // is tested directly against the constant rather than through a
        // constructed graph (building a real `AudioContext` opens an audio
        // device, which is not appropriate for a unit test).
        assert_eq!((-1.0_f32).clamp(GAIN_MIN, GAIN_MAX), 0.0);
        assert_eq!((3.5_f32).clamp(GAIN_MIN, GAIN_MAX), GAIN_MAX);
        assert_eq!((1.0_f32).clamp(GAIN_MIN, GAIN_MAX), 1.0);
    }

    #[test]
    fn compressor_constants_match_the_contract() {
        assert_eq!(COMPRESSOR_THRESHOLD_DB, -24.0);
        assert_eq!(COMPRESSOR_KNEE_DB, 30.0);
        assert_eq!(COMPRESSOR_RATIO, 12.0);
        assert_eq!(COMPRESSOR_ATTACK_SECONDS, 0.003);
        assert_eq!(COMPRESSOR_RELEASE_SECONDS, 0.250);
    }
}
