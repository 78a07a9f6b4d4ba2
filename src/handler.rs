use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::command::Command;
use crate::peer_state::ConnectionId;
use crate::sender::Sender;

/// Application callback for commands that a [crate::receiver::Receiver] accepted.
///
/// Handlers are called sequentially, in registration order, from the receive path. This is a
///  blocking call holding up processing of envelopes from the same source, so handlers should
///  not wait for transport I/O; non-trivial work should be offloaded. Handlers must not remove
///  the connection they are currently handling a command for.
///
/// All accepted commands are dispatched to all handlers, including acks - handlers are
///  expected to ignore commands they are not interested in.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn on_guaranteed(&self, source: ConnectionId, command: &Command);

    async fn on_unreliable(&self, source: ConnectionId, command: &Command);
}

/// The ordered list of registered handlers. Dispatch works on a snapshot of the list, so
///  handlers may (de)register handlers while they are called - this takes effect for the next
///  dispatch pass.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn CommandHandler>>>,
}

impl HandlerRegistry {
    pub async fn register(&self, handler: Arc<dyn CommandHandler>) {
        self.handlers.write().await
            .push(handler);
    }

    /// removes the first registration of the given handler (by identity), returning `false` if
    ///  it was not registered
    pub async fn remove(&self, handler: &Arc<dyn CommandHandler>) -> bool {
        let mut handlers = self.handlers.write().await;
        match handlers.iter().position(|h| std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(handler))) {
            Some(idx) => {
                handlers.remove(idx);
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<dyn CommandHandler>> {
        self.handlers.read().await
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await
            .len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Routes acks that were received from a peer to the local [Sender], which retires the
///  acknowledged batches.
pub struct AckHandler {
    sender: Arc<dyn Sender>,
}

impl AckHandler {
    pub fn new(sender: Arc<dyn Sender>) -> AckHandler {
        AckHandler { sender }
    }
}

#[async_trait]
impl CommandHandler for AckHandler {
    async fn on_guaranteed(&self, source: ConnectionId, command: &Command) {
        if let Some(acknowledged) = command.as_ack() {
            match self.sender.confirm(source, acknowledged).await {
                Ok(num_retired) => trace!("ack {:?} from {:?} retired {} batches", acknowledged, source, num_retired),
                Err(e) => debug!("ack {:?} from {:?} could not be processed: {}", acknowledged, source, e),
            }
        }
    }

    async fn on_unreliable(&self, _source: ConnectionId, _command: &Command) {
    }
}
