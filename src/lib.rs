//! This is a reliable messaging layer on top of an unreliable, unordered, lossy point-to-point
//!  transport. Applications enqueue *commands*, which are either
//! * *guaranteed*: retransmitted until the peer acknowledges them, and dispatched to the
//!    peer's handlers exactly once, in the order they were sent
//! * *unreliable*: sent once, and silently lost if the envelope carrying them is lost
//!
//! Instead of sending one message per command, all commands for a destination are collected
//!  and sent as a single *envelope* once per send cycle.
//!
//! ## Envelopes
//!
//! Every envelope carries a sequence number that is strictly increasing per destination, the
//!  unreliable commands enqueued since the previous envelope, and all *guaranteed batches* that
//!  are not acknowledged yet. A guaranteed batch holds the guaranteed commands enqueued between
//!  two envelopes, and it is identified by the sequence number of the first envelope it was
//!  sent in.
//!
//! The receiver keeps a cursor per source: the sequence number of the last accepted envelope.
//! * Envelopes at or below the cursor are duplicates or arrived out of order, they are
//!    discarded without further processing
//! * Guaranteed batches with a sequence id at or below the cursor were dispatched when an
//!    earlier envelope was accepted, they are skipped
//! * Every accepted envelope with at least one guaranteed batch is acknowledged with an *ack*
//!    command carrying the envelope's sequence number. Acks are guaranteed commands themselves.
//!
//! When an ack arrives, the sender retires all batches with a sequence id up to and including
//!  the acknowledged sequence number.
//!
//! ## Roles
//!
//! A *client* talks to a single implicit peer. A *server* talks to an explicit set of
//!  connections, each identified by an opaque [peer_state::ConnectionId] that is assigned when
//!  the connection is added. All state is kept per connection and locked per connection, so
//!  connections do not block each other and adding or removing a connection never affects
//!  another connection's state.
//!
//! ## Not covered
//!
//! This is a single-hop reliability shim only: there is no congestion control, flow control,
//!  encryption or routing. The transport itself, authentication and the meaning of commands
//!  are provided by the application.

pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod peer_state;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod test_util;
pub mod transport;
