//! Error types for the envelope messaging layer.

use crate::peer_state::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A value passed to a mutating entry point was rejected synchronously. This is the
    ///  caller's responsibility.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        message: String,
    },

    /// There is no peer state for the destination, i.e. it was never added or it was removed
    ///  already. This points to a lifecycle ordering bug in the calling code.
    #[error("unknown destination {0:?}")]
    UnknownDestination(ConnectionId),

    /// An envelope could not be transmitted because it exceeds the transport's capacity. This
    ///  is fatal for the session: envelopes are never truncated.
    #[error("envelope for {destination:?} has {len} bytes, exceeding the maximum of {max}")]
    TransportOverflow {
        destination: ConnectionId,
        len: usize,
        max: usize,
    },

    /// Any other send failure. This is logged and swallowed, guaranteed content is
    ///  retransmitted in the next cycle.
    #[error("sending to {destination:?} failed: {message}")]
    TransportTransient {
        destination: ConnectionId,
        message: String,
    },
}

impl MessagingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MessagingError::TransportOverflow { .. })
    }
}
