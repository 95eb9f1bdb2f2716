//! # openstudio-signaling
//!
//! The control-plane WebSocket surface: peer registration, room lifecycle,
//! and message relay. Handles:
//! - Peer sessions, anonymous until `register`
//! - Room creation/joining under a tri-level role model (host/ops/guest)
//! - Anti-spoofed unicast relay of offer/answer/ice-candidate
//! - Authority-checked room-wide mute broadcast
//!
//! Does not itself speak WebRTC — `openstudio-rtc` consumes the relayed
//! messages to drive Perfect Negotiation.

pub mod hub;
pub mod protocol;
pub mod registry;
pub mod rooms;

pub use hub::{build_router, spawn_internal_session, HubState};
pub use protocol::{Authority, Message, Participant, Role};
