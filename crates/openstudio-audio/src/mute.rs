//! `MuteController`: authoritative mute state per participant, with
//! producer-over-self conflict resolution.
//!
//! Holds only a `PeerId`-keyed map of small mute records — no node handles
//! of its own. Every application goes through `AudioGraph::set_gain`, which
//! is also what a manual level change uses, so mute and volume share the
//! same 50 ms ramp discipline. This controller holds no owning reference
//! into the graph, so it must re-verify the participant still exists on
//! every call.

use crate::graph::AudioGraph;
use openstudio_common::ids::PeerId;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// `producer > self > none`: the priority order a conflicting mute/unmute
/// is resolved by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuteAuthority {
    None,
    SelfMute,
    Producer,
}

impl MuteAuthority {
    fn rank(self) -> u8 {
        match self {
            MuteAuthority::None => 0,
            MuteAuthority::SelfMute => 1,
            MuteAuthority::Producer => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct MuteState {
    muted: bool,
    authority: MuteAuthority,
    previous_gain: f32,
}

impl Default for MuteState {
    fn default() -> Self {
        Self {
            muted: false,
            authority: MuteAuthority::None,
            previous_gain: 1.0,
        }
    }
}

/// Forwarded by the owner to the `SignalingHub` as a room broadcast. The
/// owner is also responsible for dropping self-originated broadcasts on
/// receipt to avoid an infinite loop — this controller only emits, it
/// doesn't filter its own echo.
#[derive(Debug, Clone)]
pub struct MuteChanged {
    pub peer_id: PeerId,
    pub muted: bool,
    pub authority: MuteAuthority,
}

pub struct MuteController {
    states: HashMap<PeerId, MuteState>,
    changes: mpsc::UnboundedSender<MuteChanged>,
}

impl MuteController {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MuteChanged>) {
        let (changes, rx) = mpsc::unbounded_channel();
        (
            Self {
                states: HashMap::new(),
                changes,
            },
            rx,
        )
    }

    pub fn authority_of(&self, peer_id: &PeerId) -> MuteAuthority {
        self.states
            .get(peer_id)
            .map(|s| s.authority)
            .unwrap_or(MuteAuthority::None)
    }

    pub fn is_muted(&self, peer_id: &PeerId) -> bool {
        self.states.get(peer_id).map(|s| s.muted).unwrap_or(false)
    }

    /// Succeeds iff `authority` is >= the currently recorded authority for
    /// `peer_id`. On a successful mute, the pre-mute gain is captured and
    /// the gain is ramped to 0; on a successful unmute, the gain is ramped
    /// back to the captured value and the authority is cleared.
    pub fn set_mute(
        &mut self,
        graph: &mut AudioGraph,
        peer_id: &PeerId,
        muted: bool,
        authority: MuteAuthority,
    ) -> bool {
        if !graph.has_participant(peer_id) {
            return false;
        }

        let current_rank = self.authority_of(peer_id).rank();
        if authority.rank() < current_rank {
            return false;
        }

        let state = self.states.entry(peer_id.clone()).or_default();

        if muted {
            state.previous_gain = graph.gain_of(peer_id).unwrap_or(1.0);
            state.muted = true;
            state.authority = authority;
            let _ = graph.set_gain(peer_id, 0.0);
        } else {
            let restore_to = state.previous_gain;
            state.muted = false;
            state.authority = MuteAuthority::None;
            let _ = graph.set_gain(peer_id, restore_to);
        }

        let _ = self.changes.send(MuteChanged {
            peer_id: peer_id.clone(),
            muted: state.muted,
            authority: state.authority,
        });

        true
    }

    /// Drops all recorded state for a departed participant. Does not touch
    /// the graph — the caller is expected to have already removed the
    /// participant from the `AudioGraph`.
    pub fn forget(&mut self, peer_id: &PeerId) {
        self.states.remove(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_ordering_matches_the_contract() {
        assert!(MuteAuthority::Producer.rank() > MuteAuthority::SelfMute.rank());
        assert!(MuteAuthority::SelfMute.rank() > MuteAuthority::None.rank());
    }

    #[test]
    fn self_mute_cannot_override_an_existing_producer_mute() {
        // Pure authority-ranking check, independent of a live AudioGraph
        // (constructing one opens an audio device, inappropriate here):
        // a request only proceeds past the rank gate if its authority is
        // >= the currently recorded one.
        let current = MuteAuthority::Producer;
        let requested = MuteAuthority::SelfMute;
        assert!(requested.rank() < current.rank(), "self must not beat producer");
    }

    #[test]
    fn producer_can_override_an_existing_self_mute() {
        let current = MuteAuthority::SelfMute;
        let requested = MuteAuthority::Producer;
        assert!(requested.rank() >= current.rank());
    }

    #[test]
    fn unmute_with_equal_or_higher_authority_is_permitted() {
        let current = MuteAuthority::SelfMute;
        let requested = MuteAuthority::SelfMute;
        assert!(requested.rank() >= current.rank());
    }
}
