use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::command::Command;
use crate::config::MessagingConfig;
use crate::envelope::{Envelope, SequenceNumber};
use crate::error::MessagingError;
use crate::peer_state::{ConnectionId, PeerMap};
use crate::sender::{Sender, SenderCore};
use crate::transport::Transport;

/// The sender for the client role: there is exactly one peer, addressed as
///  [ConnectionId::IMPLICIT], and there is no connection lifecycle.
pub struct ClientSender {
    core: SenderCore,
}

impl ClientSender {
    pub fn new(config: Arc<MessagingConfig>, transport: Arc<dyn Transport>) -> ClientSender {
        ClientSender {
            core: SenderCore::new(config, transport, PeerMap::with_peers(&[ConnectionId::IMPLICIT])),
        }
    }
}

#[async_trait]
impl Sender for ClientSender {
    async fn add_command(&self, command: Command) -> Result<(), MessagingError> {
        self.core.enqueue(command, ConnectionId::IMPLICIT).await
    }

    async fn add_command_to(&self, command: Command, destinations: &[ConnectionId]) -> Result<(), MessagingError> {
        self.core.enqueue_all(command, destinations).await
    }

    async fn add_command_for_single(&self, command: Command, destination: ConnectionId) -> Result<(), MessagingError> {
        self.core.enqueue(command, destination).await
    }

    async fn create_envelope(&self, destination: ConnectionId) -> Result<Envelope, MessagingError> {
        self.core.create_envelope(destination).await
    }

    async fn send_message(&self) -> Result<(), MessagingError> {
        self.core.send_message().await
    }

    async fn confirm(&self, destination: ConnectionId, acknowledged: SequenceNumber) -> Result<usize, MessagingError> {
        self.core.confirm(destination, acknowledged).await
    }

    async fn enqueue_ack(&self, _destination: ConnectionId, acknowledged: SequenceNumber) -> Result<(), MessagingError> {
        self.add_command(Command::ack(acknowledged)).await
    }

    async fn add_connection(&self, destination: ConnectionId) {
        debug!("client sender has no connection lifecycle - ignoring added connection {:?}", destination);
    }

    async fn remove_connection(&self, destination: ConnectionId) {
        debug!("client sender has no connection lifecycle - ignoring removed connection {:?}", destination);
    }

    async fn reset(&self) {
        self.core.peers().reset_all().await;
    }

    fn is_client(&self) -> bool {
        true
    }
}
