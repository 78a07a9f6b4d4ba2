use std::sync::Arc;

use tracing::{debug, trace};

use crate::envelope::{Envelope, SequenceNumber};
use crate::error::MessagingError;
use crate::handler::{CommandHandler, HandlerRegistry};
use crate::peer_state::{ConnectionId, PeerMap, PeerReceiveState};
use crate::sender::Sender;

/// The receiving half of the protocol: it rejects stale envelopes, filters guaranteed batches
///  that were dispatched before, dispatches accepted commands to the registered handlers and
///  acknowledges envelopes with guaranteed content through its [Sender].
///
/// The receiver is constructed for the same role as its sender: for a client, the single
///  implicit peer is known from the start; for a server, connections must be added before
///  envelopes from them can be processed.
pub struct Receiver {
    sender: Arc<dyn Sender>,
    handlers: HandlerRegistry,
    peers: PeerMap<PeerReceiveState>,
}

impl Receiver {
    pub fn new(sender: Arc<dyn Sender>) -> Receiver {
        let peers = if sender.is_client() {
            PeerMap::with_peers(&[ConnectionId::IMPLICIT])
        }
        else {
            PeerMap::default()
        };

        Receiver {
            sender,
            handlers: HandlerRegistry::default(),
            peers,
        }
    }

    pub fn is_client(&self) -> bool {
        self.sender.is_client()
    }

    pub async fn register_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        self.handlers.register(handler).await;
    }

    pub async fn remove_command_handler(&self, handler: &Arc<dyn CommandHandler>) -> bool {
        self.handlers.remove(handler).await
    }

    pub async fn add_connection(&self, source: ConnectionId) {
        if self.is_client() {
            debug!("client receiver has no connection lifecycle - ignoring added connection {:?}", source);
            return;
        }
        self.peers.insert(source).await;
    }

    pub async fn remove_connection(&self, source: ConnectionId) {
        if self.is_client() {
            debug!("client receiver has no connection lifecycle - ignoring removed connection {:?}", source);
            return;
        }
        self.peers.remove(source).await;
    }

    /// Returns every known source to its initial state. Connections stay known, so a session
    ///  can be restarted without reconnecting.
    pub async fn reset(&self) {
        self.peers.reset_all().await;
    }

    /// the sequence number of the last envelope accepted from a source, `None` if none was
    ///  accepted yet
    pub async fn last_accepted(&self, source: ConnectionId) -> Result<Option<SequenceNumber>, MessagingError> {
        Ok(self.peers.lock(source).await?
            .last_accepted)
    }

    /// Processes an envelope received from `source`. The source's state stays locked for the
    ///  whole pass, so envelopes from the same source are processed one at a time, and removing
    ///  the connection waits until the pass is complete.
    pub async fn message_received(&self, source: ConnectionId, envelope: &Envelope) -> Result<(), MessagingError> {
        let mut peer = self.peers.lock(source).await?;

        // read exactly once: all decisions in this pass are based on the cursor as it was
        //  before this envelope
        let cursor = peer.last_accepted;

        if cursor.is_some_and(|c| envelope.sequence_number <= c) {
            debug!("discarding stale envelope {:?} from {:?}, already accepted {:?}", envelope.sequence_number, source, cursor);
            return Ok(());
        }
        trace!("accepting envelope {:?} from {:?}", envelope.sequence_number, source);

        let handlers = self.handlers.snapshot().await;

        for batch in &envelope.guaranteed {
            if cursor.is_some_and(|c| batch.sequence_id <= c) {
                trace!("skipping batch {:?} from {:?}: dispatched before", batch.sequence_id, source);
                continue;
            }

            for command in &batch.commands {
                for handler in &handlers {
                    handler.on_guaranteed(source, command).await;
                }
            }
        }

        peer.last_accepted = Some(envelope.sequence_number);

        for command in &envelope.unreliable {
            for handler in &handlers {
                handler.on_unreliable(source, command).await;
            }
        }

        if !envelope.guaranteed.is_empty() {
            self.sender.enqueue_ack(source, envelope.sequence_number).await?;
        }
        Ok(())
    }
}
