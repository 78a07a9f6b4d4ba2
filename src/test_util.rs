//! Utilities for testing code built on envelope messaging: an in-memory transport that records
//!  what is sent, and a command handler that records what is dispatched. They are used by this
//!  crate's tests, but they are exported for application testing as well.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::command::Command;
use crate::envelope::Envelope;
use crate::handler::CommandHandler;
use crate::peer_state::ConnectionId;
use crate::transport::{Transport, TransportError};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A [Transport] that stores sent buffers instead of sending them. It can be configured to
///  report a payload limit or to fail a number of upcoming sends.
#[derive(Debug)]
pub struct RecordingTransport {
    running: AtomicBool,
    max_payload_len: Option<usize>,
    num_failing_sends: AtomicUsize,
    connections: Mutex<Vec<ConnectionId>>,
    sent: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> RecordingTransport {
        RecordingTransport {
            running: AtomicBool::new(true),
            max_payload_len: None,
            num_failing_sends: AtomicUsize::new(0),
            connections: Default::default(),
            sent: Default::default(),
        }
    }

    pub fn with_max_payload_len(max_payload_len: usize) -> RecordingTransport {
        RecordingTransport {
            max_payload_len: Some(max_payload_len),
            ..Self::new()
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn set_connections(&self, connections: Vec<ConnectionId>) {
        *locked(&self.connections) = connections;
    }

    /// the next `n` sends fail with [TransportError::SendFailed] without being recorded
    pub fn fail_next_sends(&self, n: usize) {
        self.num_failing_sends.store(n, Ordering::Release);
    }

    /// returns sent buffers, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        std::mem::take(&mut *locked(&self.sent))
    }

    /// returns and decodes sent envelopes, clearing the internal buffer
    pub fn take_envelopes(&self) -> anyhow::Result<Vec<(ConnectionId, Envelope)>> {
        self.take_sent()
            .into_iter()
            .map(|(to, buf)| Ok((to, Envelope::try_deser(&buf)?)))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, to: ConnectionId, buf: &[u8]) -> Result<(), TransportError> {
        if let Some(max) = self.max_payload_len {
            if buf.len() > max {
                return Err(TransportError::PayloadTooLarge { len: buf.len(), max });
            }
        }

        let should_fail = self.num_failing_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::SendFailed(anyhow::anyhow!("simulated send failure to {:?}", to)));
        }

        locked(&self.sent).push((to, buf.to_vec()));
        Ok(())
    }

    fn connections(&self) -> Vec<ConnectionId> {
        locked(&self.connections).clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Dispatched {
    Guaranteed(ConnectionId, Command),
    Unreliable(ConnectionId, Command),
}

/// A [CommandHandler] that records all application commands it is called with. Acks are not
///  recorded.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    dispatched: Mutex<Vec<Dispatched>>,
}

impl RecordingHandler {
    /// returns dispatched commands, clearing the internal buffer
    pub fn take(&self) -> Vec<Dispatched> {
        std::mem::take(&mut *locked(&self.dispatched))
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn on_guaranteed(&self, source: ConnectionId, command: &Command) {
        if command.payload().is_some() {
            locked(&self.dispatched).push(Dispatched::Guaranteed(source, command.clone()));
        }
    }

    async fn on_unreliable(&self, source: ConnectionId, command: &Command) {
        locked(&self.dispatched).push(Dispatched::Unreliable(source, command.clone()));
    }
}
