//! `MixMinusEngine`: one inverter+mixer bus per participant, each producing
//! `program − participant_i` with `O(N)` work for `N` participants (every
//! bus subtracts exactly one participant from the already-summed program
//! bus — never pairwise).
//!
//! Buses hold only non-owning references into nodes the [`crate::graph::AudioGraph`]
//! owns; they are never updated in place, only constructed and destroyed.

use openstudio_common::ids::PeerId;
use std::collections::HashMap;
use web_audio_api::context::AudioContext;
use web_audio_api::media_streams::MediaStream;
use web_audio_api::node::{AudioNode, GainNode, MediaStreamAudioDestinationNode};

const INVERTER_GAIN: f32 = -1.0;

/// `(program − participant_i)`, exposed as a capturable stream. The only
/// legitimate consumer is that participant's own outbound
/// `MediaTransport` track — mixing it into anyone else's monitoring or
/// back into the program bus would create the exact feedback hazard the
/// contract warns about.
pub struct MixMinusBus {
    inverter: GainNode,
    mixer: GainNode,
    output: MediaStreamAudioDestinationNode,
}

impl MixMinusBus {
    pub fn stream(&self) -> MediaStream {
        self.output.stream()
    }
}

impl Drop for MixMinusBus {
    fn drop(&mut self) {
        self.inverter.disconnect();
        self.mixer.disconnect();
    }
}

pub struct MixMinusEngine {
    context: AudioContext,
    buses: HashMap<PeerId, MixMinusBus>,
}

impl MixMinusEngine {
    pub fn new(context: AudioContext) -> Self {
        Self {
            context,
            buses: HashMap::new(),
        }
    }

    /// Builds the bus for `peer_id`: an inverter tapping
    /// `participant_output`, a mixer that sums the inverter with
    /// `program_output`, driving a capturable stream sink.
    pub fn create_bus(
        &mut self,
        peer_id: PeerId,
        program_output: &dyn AudioNode,
        participant_output: &dyn AudioNode,
    ) -> &MixMinusBus {
        let inverter = self.context.create_gain();
        inverter.gain().set_value(INVERTER_GAIN);
        participant_output.connect(&inverter);

        let mixer = self.context.create_gain();
        mixer.gain().set_value(1.0);
        program_output.connect(&mixer);
        inverter.connect(&mixer);

        let output = self.context.create_media_stream_destination();
        mixer.connect(&output);

        self.buses.insert(
            peer_id.clone(),
            MixMinusBus {
                inverter,
                mixer,
                output,
            },
        );
        self.buses.get(&peer_id).expect("just inserted")
    }

    /// Destroyed on `AudioGraph.remove_participant`; a no-op if the bus
    /// was already gone (removing a participant that was never added is a
    /// caller error elsewhere, not this method's concern).
    pub fn destroy_bus(&mut self, peer_id: &PeerId) {
        self.buses.remove(peer_id);
    }

    pub fn bus(&self, peer_id: &PeerId) -> Option<&MixMinusBus> {
        self.buses.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.buses.contains_key(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverter_gain_is_exactly_unity_negative() {
        assert_eq!(INVERTER_GAIN, -1.0);
    }
}
