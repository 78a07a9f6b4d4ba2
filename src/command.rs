use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::envelope::{ensure_remaining, varint_len, SequenceNumber};

const KIND_PAYLOAD: u8 = 0;
const KIND_ACK: u8 = 1;

/// The content of a [Command]: either opaque application data or an acknowledgment that
///  is interpreted by the messaging layer itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandBody {
    Payload(Bytes),
    Ack(SequenceNumber),
}

/// The atomic unit that applications hand to a [crate::sender::Sender]. A command is either
///  *guaranteed* (retransmitted until the peer acknowledges it) or *unreliable* (sent at most
///  once, may be lost).
///
/// Commands are immutable once created, so they can be cloned freely into per-destination
///  queues and retransmitted batches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    guaranteed: bool,
    body: CommandBody,
}

impl Command {
    pub fn guaranteed(payload: impl Into<Bytes>) -> Command {
        Command {
            guaranteed: true,
            body: CommandBody::Payload(payload.into()),
        }
    }

    pub fn unreliable(payload: impl Into<Bytes>) -> Command {
        Command {
            guaranteed: false,
            body: CommandBody::Payload(payload.into()),
        }
    }

    /// Acks travel as guaranteed commands themselves
    pub fn ack(acknowledged: SequenceNumber) -> Command {
        Command {
            guaranteed: true,
            body: CommandBody::Ack(acknowledged),
        }
    }

    pub fn is_guaranteed(&self) -> bool {
        self.guaranteed
    }

    pub fn body(&self) -> &CommandBody {
        &self.body
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            CommandBody::Payload(payload) => Some(payload),
            CommandBody::Ack(_) => None,
        }
    }

    pub fn as_ack(&self) -> Option<SequenceNumber> {
        match self.body {
            CommandBody::Ack(seq) => Some(seq),
            CommandBody::Payload(_) => None,
        }
    }

    /// the number of bytes [Command::ser] writes for this command
    pub fn encoded_len(&self) -> usize {
        let body_len = match &self.body {
            CommandBody::Payload(payload) => varint_len(payload.len()) + payload.len(),
            CommandBody::Ack(_) => size_of::<u64>(),
        };
        2 + body_len
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match &self.body {
            CommandBody::Payload(payload) => {
                buf.put_u8(KIND_PAYLOAD);
                buf.put_u8(self.guaranteed.into());
                buf.put_usize_varint(payload.len());
                buf.put_slice(payload);
            }
            CommandBody::Ack(seq) => {
                buf.put_u8(KIND_ACK);
                buf.put_u8(self.guaranteed.into());
                buf.put_u64(seq.0);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Command> {
        ensure_remaining(&*buf, 2, "command header")?;
        let kind = buf.get_u8();
        let guaranteed = match buf.get_u8() {
            0 => false,
            1 => true,
            b => return Err(anyhow!("invalid value for a boolean: {}", b)),
        };

        match kind {
            KIND_PAYLOAD => {
                let len = buf.try_get_usize_varint()?;
                ensure_remaining(&*buf, len, "command payload")?;
                Ok(Command {
                    guaranteed,
                    body: CommandBody::Payload(buf.copy_to_bytes(len)),
                })
            }
            KIND_ACK => {
                if !guaranteed {
                    bail!("received an ack that is not flagged as guaranteed");
                }
                ensure_remaining(&*buf, size_of::<u64>(), "ack")?;
                Ok(Command::ack(SequenceNumber(buf.get_u64())))
            }
            k => Err(anyhow!("invalid command kind {}", k)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::guaranteed_empty(Command::guaranteed(Bytes::new()), vec![0,1, 0])]
    #[case::unreliable(Command::unreliable(&b"abc"[..]), vec![0,0, 3, b'a',b'b',b'c'])]
    #[case::ack(Command::ack(SequenceNumber(0x0102)), vec![1,1, 0,0,0,0,0,0,1,2])]
    fn test_ser(#[case] command: Command, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        command.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(command.encoded_len(), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(Command::try_deser(&mut b).unwrap(), command);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case(0)]
    #[case(127)]
    #[case(128)]
    #[case(20_000)]
    fn test_encoded_len_with_varint_boundaries(#[case] payload_len: usize) {
        let command = Command::guaranteed(vec![7u8; payload_len]);
        let mut buf = BytesMut::new();
        command.ser(&mut buf);
        assert_eq!(command.encoded_len(), buf.len());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::invalid_kind(vec![2,1, 0])]
    #[case::invalid_bool(vec![0,2, 0])]
    #[case::unreliable_ack(vec![1,0, 0,0,0,0,0,0,0,1])]
    #[case::truncated_payload(vec![0,1, 4, 1,2,3])]
    #[case::truncated_ack(vec![1,1, 0,0,0])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        let mut b: &[u8] = &buf;
        assert!(Command::try_deser(&mut b).is_err());
    }

    #[test]
    fn test_accessors() {
        let ack = Command::ack(SequenceNumber(5));
        assert!(ack.is_guaranteed());
        assert_eq!(ack.as_ack(), Some(SequenceNumber(5)));
        assert_eq!(ack.payload(), None);

        let cmd = Command::unreliable(&b"x"[..]);
        assert!(!cmd.is_guaranteed());
        assert_eq!(cmd.as_ack(), None);
        assert_eq!(cmd.payload().map(|p| p.as_ref()), Some(&b"x"[..]));
    }
}
