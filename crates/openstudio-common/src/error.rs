//! Centralized error kinds shared by the control-plane crates.
//!
//! Each crate layers its own `thiserror::Error` enum on top of whatever it
//! needs (negotiation failures, publisher I/O, …); this one only carries the
//! kinds that cross crate boundaries or are surfaced directly over the
//! signaling wire protocol — the Protocol / Registration / Room error kinds
//! all collapse to the same `{type: "error", message}` wire shape.

/// Wire-facing error buckets. Negotiation/Media/Publisher/Configuration/Fatal
/// errors are handled entirely within their own crate and never reach a
/// client in this shape.
#[derive(Debug, thiserror::Error)]
pub enum OpenStudioError {
    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    Registration(String),

    #[error("{0}")]
    Room(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OpenStudioError {
    /// The message sent back to the client in a wire `error` frame. Never
    /// leaks `Internal` details — those only go to the server log.
    pub fn wire_message(&self) -> String {
        match self {
            Self::Protocol(m) | Self::Registration(m) | Self::Room(m) => m.clone(),
            Self::Internal(e) => {
                tracing::error!(error = %e, "internal error surfaced at client boundary");
                "internal error".to_string()
            }
        }
    }
}

pub type OpenStudioResult<T> = Result<T, OpenStudioError>;
