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

/// The sender for the server role: it keeps separate state for each connection, which must be
///  added before commands can be enqueued for it.
pub struct ServerSender {
    core: SenderCore,
}

impl ServerSender {
    pub fn new(config: Arc<MessagingConfig>, transport: Arc<dyn Transport>) -> ServerSender {
        ServerSender {
            core: SenderCore::new(config, transport, PeerMap::default()),
        }
    }

    pub async fn connections(&self) -> Vec<ConnectionId> {
        self.core.peers().ids().await
    }
}

#[async_trait]
impl Sender for ServerSender {
    async fn add_command(&self, command: Command) -> Result<(), MessagingError> {
        let destinations = self.core.transport().connections();
        self.core.enqueue_all(command, &destinations).await
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

    async fn enqueue_ack(&self, destination: ConnectionId, acknowledged: SequenceNumber) -> Result<(), MessagingError> {
        self.add_command_for_single(Command::ack(acknowledged), destination).await
    }

    async fn add_connection(&self, destination: ConnectionId) {
        debug!("adding send state for {:?}", destination);
        self.core.peers().insert(destination).await;
    }

    async fn remove_connection(&self, destination: ConnectionId) {
        if self.core.peers().remove(destination).await {
            debug!("removed send state for {:?}, discarding unsent and unacknowledged commands", destination);
        }
        else {
            debug!("removing send state for {:?} which was not registered", destination);
        }
    }

    async fn reset(&self) {
        self.core.peers().reset_all().await;
    }

    fn is_client(&self) -> bool {
        false
    }
}
