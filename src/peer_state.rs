use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::trace;

use crate::command::Command;
use crate::envelope::{Envelope, GuaranteedBatch, SequenceNumber};
use crate::error::MessagingError;

/// An opaque identity for a connection, independent of whatever object the transport uses to
///  represent it. Ids are handed out by a [ConnectionIdArena] when a connection is added and
///  never reused, so state for a dropped connection can never be confused with a new one.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// The single implicit destination of a client, which talks to exactly one server
    pub const IMPLICIT: ConnectionId = ConnectionId(0);

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == Self::IMPLICIT {
            write!(f, "conn#implicit")
        }
        else {
            write!(f, "conn#{}", self.0)
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionIdArena {
    last: AtomicU64,
}

impl ConnectionIdArena {
    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Send side bookkeeping for a single destination
#[derive(Debug, Default)]
pub struct PeerSendState {
    pub next_sequence_number: SequenceNumber,
    pub pending_unreliable: Vec<Command>,
    pub pending_guaranteed: Vec<Command>,
    /// batches that were sent but not acknowledged yet, ordered by sequence id
    pub unconfirmed_batches: Vec<GuaranteedBatch>,
    /// set when commands were enqueued since the last flush
    pub owes_send: bool,
}

impl PeerSendState {
    pub fn enqueue(&mut self, command: Command) {
        if command.is_guaranteed() {
            self.pending_guaranteed.push(command);
        }
        else {
            self.pending_unreliable.push(command);
        }
        self.owes_send = true;
    }

    /// A destination needs an envelope if something was enqueued since the last flush, or if
    ///  there are batches waiting for retransmission.
    pub fn needs_send(&self) -> bool {
        self.owes_send || !self.unconfirmed_batches.is_empty()
    }

    /// Assembles the next envelope: pending guaranteed commands become a new batch under the
    ///  envelope's sequence number and join the unconfirmed batches, all of which are sent.
    ///  Pending unreliable commands are sent exactly once.
    pub fn build_envelope(&mut self) -> Envelope {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number = sequence_number.next();

        if !self.pending_guaranteed.is_empty() {
            self.unconfirmed_batches.push(GuaranteedBatch {
                sequence_id: sequence_number,
                commands: std::mem::take(&mut self.pending_guaranteed),
            });
        }
        self.owes_send = false;

        Envelope {
            sequence_number,
            unreliable: std::mem::take(&mut self.pending_unreliable),
            guaranteed: self.unconfirmed_batches.clone(),
        }
    }

    /// retires all unconfirmed batches up to and including the acknowledged sequence number,
    ///  returning the number of retired batches
    pub fn confirm(&mut self, acknowledged: SequenceNumber) -> usize {
        let before = self.unconfirmed_batches.len();
        self.unconfirmed_batches.retain(|batch| batch.sequence_id > acknowledged);
        before - self.unconfirmed_batches.len()
    }
}

/// Receive side bookkeeping for a single destination
#[derive(Debug, Default)]
pub struct PeerReceiveState {
    /// The sequence number of the most recently accepted envelope. `None` means that nothing
    ///  was accepted yet. This only ever increases.
    pub last_accepted: Option<SequenceNumber>,
}

pub struct PeerEntry<S> {
    state: S,
    removed: bool,
}

/// Exclusive access to one destination's state, see [PeerMap::lock]
pub struct PeerGuard<S> {
    guard: OwnedMutexGuard<PeerEntry<S>>,
}

impl<S> Deref for PeerGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.guard.state
    }
}

impl<S> DerefMut for PeerGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.guard.state
    }
}

/// Per-destination state with per-destination locking: the map itself is only locked to look
///  up, insert or remove entries, while all work on an entry happens under that entry's own
///  lock. Unrelated connections never wait for each other.
///
/// Removing an entry takes the entry's lock before marking it as removed, so removal waits for
///  an operation that is in progress on that connection. Operations that looked up the entry
///  before removal but lock it afterwards see it as removed and fail with
///  [MessagingError::UnknownDestination].
pub struct PeerMap<S> {
    peers: RwLock<FxHashMap<ConnectionId, Arc<Mutex<PeerEntry<S>>>>>,
}

impl<S: Default + Send + 'static> Default for PeerMap<S> {
    fn default() -> Self {
        Self::with_peers(&[])
    }
}

impl<S: Default + Send + 'static> PeerMap<S> {
    pub fn with_peers(ids: &[ConnectionId]) -> PeerMap<S> {
        let peers = ids.iter()
            .map(|&id| (id, Self::new_entry()))
            .collect();

        PeerMap {
            peers: RwLock::new(peers),
        }
    }

    fn new_entry() -> Arc<Mutex<PeerEntry<S>>> {
        Arc::new(Mutex::new(PeerEntry {
            state: S::default(),
            removed: false,
        }))
    }

    /// Creates fresh state for a connection. If there was state for the same id, it is
    ///  replaced.
    pub async fn insert(&self, id: ConnectionId) {
        let prev = self.peers.write().await
            .insert(id, Self::new_entry());

        if let Some(prev) = prev {
            trace!("replacing existing peer state for {:?}", id);
            prev.lock().await.removed = true;
        }
    }

    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.peers.write().await
            .remove(&id);

        match removed {
            Some(entry) => {
                entry.lock().await.removed = true;
                true
            }
            None => false,
        }
    }

    pub async fn lock(&self, id: ConnectionId) -> Result<PeerGuard<S>, MessagingError> {
        let entry = self.peers.read().await
            .get(&id)
            .cloned()
            .ok_or(MessagingError::UnknownDestination(id))?;

        let guard = entry.lock_owned().await;
        if guard.removed {
            return Err(MessagingError::UnknownDestination(id));
        }
        Ok(PeerGuard { guard })
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.peers.read().await
            .contains_key(&id)
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.peers.read().await
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// returns every known entry to its initial state, keeping the entries themselves
    pub async fn reset_all(&self) {
        let entries: Vec<_> = self.peers.read().await
            .values()
            .cloned()
            .collect();

        for entry in entries {
            let mut entry = entry.lock().await;
            if !entry.removed {
                entry.state = S::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn guaranteed(s: &'static str) -> Command {
        Command::guaranteed(s.as_bytes())
    }

    fn unreliable(s: &'static str) -> Command {
        Command::unreliable(s.as_bytes())
    }

    fn batch(seq: u64, commands: Vec<Command>) -> GuaranteedBatch {
        GuaranteedBatch { sequence_id: SequenceNumber(seq), commands }
    }

    #[test]
    fn test_build_envelope_batches_everything_since_last_flush() {
        let mut state = PeerSendState::default();
        state.enqueue(guaranteed("g1"));
        state.enqueue(unreliable("u1"));
        state.enqueue(guaranteed("g2"));
        state.enqueue(unreliable("u2"));
        assert!(state.needs_send());

        let envelope = state.build_envelope();
        assert_eq!(envelope, Envelope {
            sequence_number: SequenceNumber(0),
            unreliable: vec![unreliable("u1"), unreliable("u2")],
            guaranteed: vec![batch(0, vec![guaranteed("g1"), guaranteed("g2")])],
        });

        assert!(state.pending_guaranteed.is_empty());
        assert!(state.pending_unreliable.is_empty());
        assert!(!state.owes_send);
        assert_eq!(state.unconfirmed_batches.len(), 1);
    }

    #[test]
    fn test_retransmission_until_ack() {
        let mut state = PeerSendState::default();
        state.enqueue(guaranteed("g1"));

        assert_eq!(state.build_envelope(), Envelope {
            sequence_number: SequenceNumber(0),
            unreliable: vec![],
            guaranteed: vec![batch(0, vec![guaranteed("g1")])],
        });

        assert!(state.needs_send());
        assert_eq!(state.build_envelope(), Envelope {
            sequence_number: SequenceNumber(1),
            unreliable: vec![],
            guaranteed: vec![batch(0, vec![guaranteed("g1")])],
        });

        assert_eq!(state.confirm(SequenceNumber(0)), 1);
        assert!(!state.needs_send());
        assert_eq!(state.build_envelope(), Envelope {
            sequence_number: SequenceNumber(2),
            unreliable: vec![],
            guaranteed: vec![],
        });
    }

    #[test]
    fn test_unreliable_is_never_retransmitted() {
        let mut state = PeerSendState::default();
        state.enqueue(unreliable("u1"));
        state.enqueue(guaranteed("g1"));

        assert_eq!(state.build_envelope().unreliable, vec![unreliable("u1")]);
        assert!(state.build_envelope().unreliable.is_empty());
        assert!(state.build_envelope().unreliable.is_empty());
    }

    #[test]
    fn test_confirm_retires_only_up_to_ack() {
        let mut state = PeerSendState::default();
        for name in ["g0", "g1", "g2", "g3"] {
            state.enqueue(guaranteed(name));
            state.build_envelope();
        }
        assert_eq!(state.unconfirmed_batches.len(), 4);

        assert_eq!(state.confirm(SequenceNumber(1)), 2);
        assert_eq!(state.unconfirmed_batches, vec![
            batch(2, vec![guaranteed("g2")]),
            batch(3, vec![guaranteed("g3")]),
        ]);

        // stale acks are harmless
        assert_eq!(state.confirm(SequenceNumber(0)), 0);
        assert_eq!(state.unconfirmed_batches.len(), 2);

        assert_eq!(state.confirm(SequenceNumber(17)), 2);
        assert!(state.unconfirmed_batches.is_empty());
    }

    #[test]
    fn test_sequence_numbers_increase_even_without_content() {
        let mut state = PeerSendState::default();
        let seqs: Vec<_> = (0..4).map(|_| state.build_envelope().sequence_number).collect();
        assert_eq!(seqs, vec![SequenceNumber(0), SequenceNumber(1), SequenceNumber(2), SequenceNumber(3)]);
    }

    #[test]
    fn test_arena_ids_are_unique_and_not_implicit() {
        let arena = ConnectionIdArena::default();
        let a = arena.allocate();
        let b = arena.allocate();
        assert_ne!(a, b);
        assert_ne!(a, ConnectionId::IMPLICIT);
        assert_ne!(b, ConnectionId::IMPLICIT);
    }

    #[tokio::test]
    async fn test_peer_map_lifecycle() {
        let map = PeerMap::<PeerReceiveState>::default();
        let id = ConnectionId(5);

        assert!(matches!(map.lock(id).await, Err(MessagingError::UnknownDestination(x)) if x == id));

        map.insert(id).await;
        map.lock(id).await.unwrap().last_accepted = Some(SequenceNumber(3));
        assert_eq!(map.lock(id).await.unwrap().last_accepted, Some(SequenceNumber(3)));
        assert_eq!(map.ids().await, vec![id]);

        map.reset_all().await;
        assert_eq!(map.lock(id).await.unwrap().last_accepted, None);

        assert!(map.remove(id).await);
        assert!(!map.remove(id).await);
        assert!(map.lock(id).await.is_err());
        assert!(!map.contains(id).await);
    }

    #[tokio::test]
    async fn test_peer_map_reset_all_keeps_entries() {
        let map = PeerMap::<PeerSendState>::with_peers(&[ConnectionId(1), ConnectionId(2)]);
        for id in [ConnectionId(1), ConnectionId(2)] {
            let mut peer = map.lock(id).await.unwrap();
            peer.enqueue(guaranteed("g1"));
            peer.build_envelope();
            peer.enqueue(unreliable("u1"));
        }

        map.reset_all().await;

        assert_eq!(map.ids().await, vec![ConnectionId(1), ConnectionId(2)]);
        for id in [ConnectionId(1), ConnectionId(2)] {
            let peer = map.lock(id).await.unwrap();
            assert_eq!(peer.next_sequence_number, SequenceNumber::ZERO);
            assert!(peer.pending_unreliable.is_empty());
            assert!(peer.pending_guaranteed.is_empty());
            assert!(peer.unconfirmed_batches.is_empty());
            assert!(!peer.needs_send());
        }
    }

    #[tokio::test]
    async fn test_remove_waits_for_operation_in_progress() {
        let map = Arc::new(PeerMap::<PeerReceiveState>::with_peers(&[ConnectionId(1)]));

        let guard = map.lock(ConnectionId(1)).await.unwrap();

        let removal = tokio::spawn({
            let map = map.clone();
            async move { map.remove(ConnectionId(1)).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!removal.is_finished());

        drop(guard);
        assert!(removal.await.unwrap());
        assert!(map.lock(ConnectionId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_other_connections_are_not_blocked() {
        let map = PeerMap::<PeerReceiveState>::with_peers(&[ConnectionId(1), ConnectionId(2)]);

        let _guard = map.lock(ConnectionId(1)).await.unwrap();
        let other = tokio::time::timeout(Duration::from_millis(100), map.lock(ConnectionId(2))).await;
        assert!(other.unwrap().is_ok());
    }
}
