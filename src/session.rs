use std::sync::Arc;

use tokio::select;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MessagingConfig;
use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::handler::AckHandler;
use crate::peer_state::{ConnectionId, ConnectionIdArena};
use crate::receiver::Receiver;
use crate::sender::client_sender::ClientSender;
use crate::sender::server_sender::ServerSender;
use crate::sender::Sender;
use crate::transport::Transport;

/// A session is where the parts of the protocol come together: it owns a [Sender] and a
///  [Receiver] of the same role, wired to each other at construction time, and it is the
///  entry point for the hosting runtime - connection lifecycle, received envelopes, the
///  periodic send loop and resets.
///
/// Fatal errors are returned to the code owning the session, which decides whether to end the
///  session, the connection or the process.
pub struct Session {
    config: Arc<MessagingConfig>,
    connection_ids: ConnectionIdArena,
    sender: Arc<dyn Sender>,
    receiver: Arc<Receiver>,
}

impl Session {
    pub async fn client(config: Arc<MessagingConfig>, transport: Arc<dyn Transport>) -> anyhow::Result<Session> {
        config.validate()?;
        let sender = Arc::new(ClientSender::new(config.clone(), transport));
        Ok(Self::new(config, sender).await)
    }

    pub async fn server(config: Arc<MessagingConfig>, transport: Arc<dyn Transport>) -> anyhow::Result<Session> {
        config.validate()?;
        let sender = Arc::new(ServerSender::new(config.clone(), transport));
        Ok(Self::new(config, sender).await)
    }

    async fn new(config: Arc<MessagingConfig>, sender: Arc<dyn Sender>) -> Session {
        let receiver = Arc::new(Receiver::new(sender.clone()));
        receiver.register_command_handler(Arc::new(AckHandler::new(sender.clone()))).await;

        Session {
            config,
            connection_ids: ConnectionIdArena::default(),
            sender,
            receiver,
        }
    }

    pub fn sender(&self) -> &Arc<dyn Sender> {
        &self.sender
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    /// Registers a new connection, returning the id that identifies it from now on, both for
    ///  this session and for the transport. A client has a single implicit connection, which
    ///  is returned for every call.
    pub async fn on_connection_added(&self) -> ConnectionId {
        if self.sender.is_client() {
            return ConnectionId::IMPLICIT;
        }

        let id = self.connection_ids.allocate();
        info!("connection {:?} added", id);
        self.receiver.add_connection(id).await;
        self.sender.add_connection(id).await;
        id
    }

    /// Drops all state for the connection, including guaranteed commands that were not yet
    ///  delivered. Waits for envelope processing in progress for the connection to complete.
    pub async fn on_connection_removed(&self, id: ConnectionId) {
        if self.sender.is_client() {
            debug!("ignoring removal of client connection");
            return;
        }

        info!("connection {:?} removed", id);
        self.sender.remove_connection(id).await;
        self.receiver.remove_connection(id).await;
    }

    /// Decodes and processes a buffer received from the transport. Buffers that are not valid
    ///  envelopes are logged and dropped.
    pub async fn on_envelope_received(&self, source: ConnectionId, buf: &[u8]) -> Result<(), MessagingError> {
        match Envelope::try_deser(buf) {
            Ok(envelope) => self.receiver.message_received(source, &envelope).await,
            Err(e) => {
                warn!("received a buffer from {:?} that is not a valid envelope - discarding: {}", source, e);
                Ok(())
            }
        }
    }

    /// Returns all protocol state to its initial state, without touching the transport. Known
    ///  connections stay known, so the session continues without reconnecting.
    pub async fn reset(&self) {
        info!("resetting session");
        self.sender.reset().await;
        self.receiver.reset().await;
    }

    /// Flushes pending commands once per configured send interval until `shutdown` is set to
    ///  `true` (or dropped). Returns with an error if a send cycle fails fatally.
    pub async fn run_send_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MessagingError> {
        info!("starting send loop with an interval of {:?}", self.config.send_interval);

        let mut ticks = interval(self.config.send_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {
                    if let Err(e) = self.sender.send_message().await {
                        error!("send cycle failed, stopping the send loop: {}", e);
                        return Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down send loop");
                        return Ok(());
                    }
                }
            }
        }
    }
}
