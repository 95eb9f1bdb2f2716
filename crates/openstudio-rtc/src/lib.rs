//! # openstudio-rtc
//!
//! Perfect Negotiation connection coordination and mesh media transport.
//! Each local peer owns one `ConnectionCoordinator`, which in turn owns one
//! `MediaTransport` (a single `str0m::Rtc` session) per remote peer —
//! full mesh, not the star/SFU topology a single-upstream voice server
//! would use.

pub mod coordinator;
pub mod transport;

pub use coordinator::{ConnectionCoordinator, CoordinatorError, CoordinatorEvent, RemoteStatus};
pub use transport::{ConnectionState, MediaTransport, TrackKind, TransportError, TransportEvent};
