//! # openstudio-publisher
//!
//! Captures the program bus, encodes it to Opus-in-Ogg, and pushes it to an
//! external Icecast-style sink over a long-lived HTTP `PUT`, with
//! exponential-backoff reconnection on any push-side failure.

pub mod config;
pub mod encoder;
pub mod publisher;

pub use config::SinkConfig;
pub use publisher::{PublisherError, PublisherEvent, PublisherState, StreamPublisher};
