pub mod client_sender;
pub mod server_sender;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::{debug, error, trace, warn};

use crate::command::Command;
use crate::config::MessagingConfig;
use crate::envelope::{Envelope, SequenceNumber};
use crate::error::MessagingError;
use crate::peer_state::{ConnectionId, PeerMap, PeerSendState};
use crate::transport::{Transport, TransportError};

/// The sending half of the protocol: it collects commands per destination and flushes them as
///  one [Envelope] per destination and send cycle.
///
/// There are two roles: a [client_sender::ClientSender] talks to a single implicit peer, while
///  a [server_sender::ServerSender] keeps state for an explicit set of connections.
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    /// Enqueues a command for the sender's default audience: the implicit peer for a client,
    ///  all of the transport's connections for a server.
    async fn add_command(&self, command: Command) -> Result<(), MessagingError>;

    async fn add_command_to(&self, command: Command, destinations: &[ConnectionId]) -> Result<(), MessagingError>;

    /// Enqueues a command for a single destination. This is for responses that must not be
    ///  broadcast.
    async fn add_command_for_single(&self, command: Command, destination: ConnectionId) -> Result<(), MessagingError>;

    /// Builds the next envelope for a destination. Unconfirmed guaranteed batches remain
    ///  unconfirmed, so they are part of every envelope until they are acknowledged.
    async fn create_envelope(&self, destination: ConnectionId) -> Result<Envelope, MessagingError>;

    /// Sends an envelope to every destination that has something to send. An envelope that
    ///  is too big for the transport is a fatal error, any other failure is logged and
    ///  ignored.
    async fn send_message(&self) -> Result<(), MessagingError>;

    /// Retires all of a destination's unconfirmed batches up to and including `acknowledged`
    async fn confirm(&self, destination: ConnectionId, acknowledged: SequenceNumber) -> Result<usize, MessagingError>;

    /// Sends an ack for a received envelope back to where it came from
    async fn enqueue_ack(&self, destination: ConnectionId, acknowledged: SequenceNumber) -> Result<(), MessagingError>;

    async fn add_connection(&self, destination: ConnectionId);

    /// Drops all state for a destination, including guaranteed commands that were not sent or
    ///  not acknowledged yet.
    async fn remove_connection(&self, destination: ConnectionId);

    async fn reset(&self);

    fn is_client(&self) -> bool;

    fn is_server(&self) -> bool {
        !self.is_client()
    }
}

/// The role independent part of sending
pub struct SenderCore {
    config: Arc<MessagingConfig>,
    transport: Arc<dyn Transport>,
    peers: PeerMap<PeerSendState>,
}

impl SenderCore {
    pub fn new(config: Arc<MessagingConfig>, transport: Arc<dyn Transport>, peers: PeerMap<PeerSendState>) -> SenderCore {
        SenderCore {
            config,
            transport,
            peers,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn peers(&self) -> &PeerMap<PeerSendState> {
        &self.peers
    }

    fn check_command(&self, command: &Command) -> Result<(), MessagingError> {
        let max_len = self.config.max_command_len(command.is_guaranteed());
        if command.encoded_len() > max_len {
            return Err(MessagingError::InvalidArgument {
                message: format!("command has {} bytes and can never fit into an envelope, maximum is {}", command.encoded_len(), max_len),
            });
        }
        Ok(())
    }

    pub async fn enqueue(&self, command: Command, destination: ConnectionId) -> Result<(), MessagingError> {
        self.check_command(&command)?;
        self.peers.lock(destination).await?
            .enqueue(command);
        Ok(())
    }

    /// Enqueues the command for all destinations. Unknown destinations do not prevent
    ///  enqueueing for the others, but the first one is reported.
    pub async fn enqueue_all(&self, command: Command, destinations: &[ConnectionId]) -> Result<(), MessagingError> {
        self.check_command(&command)?;

        let mut result = Ok(());
        for &destination in destinations {
            match self.peers.lock(destination).await {
                Ok(mut peer) => peer.enqueue(command.clone()),
                Err(e) => {
                    debug!("not enqueueing command for {:?}: {}", destination, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    pub async fn create_envelope(&self, destination: ConnectionId) -> Result<Envelope, MessagingError> {
        let envelope = self.peers.lock(destination).await?
            .build_envelope();
        trace!("built envelope {:?} for {:?}: {} unreliable commands, {} guaranteed batches", envelope.sequence_number, destination, envelope.unreliable.len(), envelope.guaranteed.len());
        Ok(envelope)
    }

    pub async fn confirm(&self, destination: ConnectionId, acknowledged: SequenceNumber) -> Result<usize, MessagingError> {
        Ok(self.peers.lock(destination).await?
            .confirm(acknowledged))
    }

    pub async fn send_message(&self) -> Result<(), MessagingError> {
        if !self.transport.is_running() {
            trace!("transport is not running - skipping send cycle");
            return Ok(());
        }

        for destination in self.peers.ids().await {
            // the peer's lock is released before sending, so receiving is not held up by I/O
            let envelope = match self.peers.lock(destination).await {
                Ok(mut peer) => {
                    if !peer.needs_send() {
                        continue;
                    }
                    peer.build_envelope()
                }
                Err(_) => {
                    debug!("{:?} was removed during the send cycle", destination);
                    continue;
                }
            };

            self.transmit(destination, &envelope).await?;
        }
        Ok(())
    }

    async fn transmit(&self, destination: ConnectionId, envelope: &Envelope) -> Result<(), MessagingError> {
        let mut buf = BytesMut::with_capacity(envelope.serialized_len());
        envelope.ser(&mut buf);

        if buf.len() > self.config.max_envelope_size {
            let e = MessagingError::TransportOverflow {
                destination,
                len: buf.len(),
                max: self.config.max_envelope_size,
            };
            error!("{}", e);
            return Err(e);
        }

        trace!("sending envelope {:?} to {:?} ({} bytes)", envelope.sequence_number, destination, buf.len());
        match self.transport.send(destination, &buf).await {
            Ok(()) => Ok(()),
            Err(TransportError::PayloadTooLarge { len, max }) => {
                let e = MessagingError::TransportOverflow { destination, len, max };
                error!("{}", e);
                Err(e)
            }
            Err(TransportError::SendFailed(cause)) => {
                let e = MessagingError::TransportTransient {
                    destination,
                    message: cause.to_string(),
                };
                warn!("{} - guaranteed commands will be re-sent in the next cycle", e);
                Ok(())
            }
        }
    }
}
