use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::warn;

use crate::peer_state::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The buffer can never be sent as a single unit, e.g. because it exceeds the UDP payload
    ///  size
    #[error("payload of {len} bytes exceeds the transport's limit of {max} bytes")]
    PayloadTooLarge {
        len: usize,
        max: usize,
    },
    #[error("send failed: {0}")]
    SendFailed(anyhow::Error),
}

/// The physical transport that envelopes travel on. Implementations are expected to be
///  unreliable: envelopes may be lost, duplicated or reordered.
///
/// The transport identifies peers by the [ConnectionId]s that the session hands out when a
///  connection is added; mapping them to sockets or connection objects is up to the
///  implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: ConnectionId, buf: &[u8]) -> Result<(), TransportError>;

    /// Sends the same buffer to each of the given connections. A failed send to one
    ///  connection does not stop sending to the others; the first [TransportError::PayloadTooLarge]
    ///  is returned after all sends were attempted, other failures are logged.
    async fn broadcast_to(&self, to: &[ConnectionId], buf: &[u8]) -> Result<(), TransportError> {
        let mut overflow = None;
        for &id in to {
            match self.send(id, buf).await {
                Ok(()) => {}
                Err(e @ TransportError::PayloadTooLarge { .. }) => {
                    if overflow.is_none() {
                        overflow = Some(e);
                    }
                }
                Err(e) => warn!("broadcast to {:?} failed: {}", id, e),
            }
        }
        match overflow {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// all connections that a broadcast should go to
    fn connections(&self) -> Vec<ConnectionId>;

    fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_state::ConnectionIdArena;
    use crate::test_util::RecordingTransport;

    #[tokio::test]
    async fn test_broadcast_to_sends_to_each_destination() {
        let transport = RecordingTransport::new();
        let ids = ConnectionIdArena::default();
        let (a, b) = (ids.allocate(), ids.allocate());

        transport.broadcast_to(&[a, b], b"abc").await.unwrap();
        assert_eq!(transport.take_sent(), vec![(a, b"abc".to_vec()), (b, b"abc".to_vec())]);
    }

    #[tokio::test]
    async fn test_broadcast_to_continues_after_failure() {
        let transport = RecordingTransport::new();
        let ids = ConnectionIdArena::default();
        let (a, b) = (ids.allocate(), ids.allocate());
        transport.fail_next_sends(1);

        transport.broadcast_to(&[a, b], b"abc").await.unwrap();
        assert_eq!(transport.take_sent(), vec![(b, b"abc".to_vec())]);
    }

    #[tokio::test]
    async fn test_broadcast_to_reports_overflow() {
        let transport = RecordingTransport::with_max_payload_len(2);
        let a = ConnectionIdArena::default().allocate();

        let result = transport.broadcast_to(&[a], b"abc").await;
        assert!(matches!(result, Err(TransportError::PayloadTooLarge { len: 3, max: 2 })));
        assert!(transport.take_sent().is_empty());
    }
}
