use std::time::Duration;

use anyhow::bail;

use crate::command::Command;
use crate::envelope::{Envelope, SequenceNumber};

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// The interval at which the send loop flushes pending commands. Every flush produces one
    ///  envelope per destination that has something to send, so this is also the
    ///  retransmission interval for unacknowledged guaranteed commands.
    pub send_interval: Duration,

    /// The maximum serialized size of an envelope. This should match what the transport can
    ///  send without fragmentation, e.g. the UDP payload size.
    ///
    /// Envelopes exceeding this size are never truncated: the send cycle fails with a fatal
    ///  error instead. Single commands that could never fit into an envelope are rejected when
    ///  they are enqueued.
    pub max_envelope_size: usize,
}

impl MessagingConfig {
    /// full Ethernet MTU for IP V4 without optional headers: `1500 - 20 - 8 = 1472`
    pub fn default_udp() -> MessagingConfig {
        MessagingConfig {
            send_interval: Duration::from_millis(50),
            max_envelope_size: 1472,
        }
    }

    /// the smallest envelope size that can carry a single ack
    pub fn min_envelope_size() -> usize {
        Envelope::EMPTY_LEN + Envelope::MIN_BATCH_OVERHEAD + Command::ack(SequenceNumber::ZERO).encoded_len()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_interval.is_zero() {
            bail!("send interval must not be zero");
        }
        if self.max_envelope_size < Self::min_envelope_size() {
            bail!("max envelope size {} is too small, it must be at least {}", self.max_envelope_size, Self::min_envelope_size());
        }
        Ok(())
    }

    /// The largest encoded size of a command that fits into an otherwise empty envelope
    pub fn max_command_len(&self, guaranteed: bool) -> usize {
        let overhead = if guaranteed {
            Envelope::EMPTY_LEN + Envelope::MIN_BATCH_OVERHEAD
        }
        else {
            Envelope::EMPTY_LEN
        };
        self.max_envelope_size.saturating_sub(overhead)
    }
}
