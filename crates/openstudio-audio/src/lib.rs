//! # openstudio-audio
//!
//! The per-station mixing engine: one [`graph::AudioGraph`] per local peer,
//! holding one [`graph::ParticipantNodes`] chain per remote peer, a shared
//! program bus, and a [`mix_minus::MixMinusEngine`] that exposes one
//! subtract-yourself-from-the-program stream per participant. A
//! [`mute::MuteController`] arbitrates producer/self mute authority over the
//! same gain nodes, [`meter::ProgramMeter`] reduces the program bus tap to
//! RMS/peak-hold values, and [`return_feed::ReturnFeedPlayer`] plays incoming
//! return feeds straight to the local sink, bypassing the graph entirely.
//!
//! Built on `web-audio-api`, a pure-Rust Web Audio API implementation whose
//! control/render-thread split matches the "control event loop never blocks
//! the audio callback" model this crate is built against.

pub mod bridge;
pub mod graph;
pub mod meter;
pub mod mix_minus;
pub mod mute;
pub mod return_feed;

pub use bridge::OpusFeed;
pub use graph::{AudioGraph, AudioGraphError, IncomingStream};
pub use meter::{MeterReading, ProgramMeter};
pub use mix_minus::MixMinusEngine;
pub use mute::{MuteAuthority, MuteChanged, MuteController};
pub use return_feed::ReturnFeedPlayer;
