use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::{Crc, CRC_64_REDIS};

use crate::command::Command;

const CHECKSUM: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// Envelope sequence numbers are assigned per (sender, destination) pair, starting at zero and
///  strictly increasing with every envelope that is built. Guaranteed batches are identified by
///  the sequence number of the envelope they were first sent in.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}

impl Debug for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// All guaranteed commands that were enqueued for a destination between two flushes. The batch
///  is the unit of retransmission: it is re-sent in every envelope until the peer acknowledges
///  its sequence id (or a later one).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GuaranteedBatch {
    pub sequence_id: SequenceNumber,
    pub commands: Vec<Command>,
}

/// An envelope is the one message per send cycle and destination, bundling everything that is
///  due for that destination.
///
/// Wire format, all numbers in network byte order (BE):
/// ```ascii
///  0: checksum (u64) - CRC-64 of everything after the checksum
///  8: protocol version (u8)
///  9: sequence number (u64)
/// 17: number of unreliable commands (varint), followed by the commands
///  *: number of guaranteed batches (varint), each one being
///     * sequence id (u64)
///     * number of commands (varint), followed by the commands
/// ```
///
/// Commands are serialized by [Command::ser].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub sequence_number: SequenceNumber,
    pub unreliable: Vec<Command>,
    pub guaranteed: Vec<GuaranteedBatch>,
}

impl Envelope {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    /// the serialized size of an envelope without any commands
    pub const EMPTY_LEN: usize = Self::FIXED_HEADER_LEN + 2;

    /// the serialized size of a batch without its commands, assuming fewer than 128 commands
    pub const MIN_BATCH_OVERHEAD: usize = size_of::<u64>() + 1;

    const FIXED_HEADER_LEN: usize = size_of::<u64>() + 1 + size_of::<u64>();

    pub fn serialized_len(&self) -> usize {
        let unreliable_len = varint_len(self.unreliable.len())
            + self.unreliable.iter().map(Command::encoded_len).sum::<usize>();

        let guaranteed_len = varint_len(self.guaranteed.len())
            + self.guaranteed.iter()
                .map(|batch| size_of::<u64>()
                    + varint_len(batch.commands.len())
                    + batch.commands.iter().map(Command::encoded_len).sum::<usize>())
                .sum::<usize>();

        Self::FIXED_HEADER_LEN + unreliable_len + guaranteed_len
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u64(0); // patched below

        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u64(self.sequence_number.0);

        buf.put_usize_varint(self.unreliable.len());
        for command in &self.unreliable {
            command.ser(buf);
        }

        buf.put_usize_varint(self.guaranteed.len());
        for batch in &self.guaranteed {
            buf.put_u64(batch.sequence_id.0);
            buf.put_usize_varint(batch.commands.len());
            for command in &batch.commands {
                command.ser(buf);
            }
        }

        let checksum = CHECKSUM.checksum(&buf[start + size_of::<u64>()..]);
        buf[start..start + size_of::<u64>()].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn try_deser(buf: &[u8]) -> anyhow::Result<Envelope> {
        let mut buf = buf;
        ensure_remaining(&buf, Self::FIXED_HEADER_LEN, "envelope header")?;

        let checksum = buf.get_u64();
        if checksum != CHECKSUM.checksum(buf) {
            bail!("envelope checksum mismatch");
        }

        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported envelope protocol version {}", version);
        }
        let sequence_number = SequenceNumber(buf.get_u64());

        let num_unreliable = buf.try_get_usize_varint()?;
        let mut unreliable = Vec::new();
        for _ in 0..num_unreliable {
            unreliable.push(Command::try_deser(&mut buf)?);
        }

        let num_batches = buf.try_get_usize_varint()?;
        let mut guaranteed = Vec::new();
        for _ in 0..num_batches {
            ensure_remaining(&buf, size_of::<u64>(), "batch sequence id")?;
            let sequence_id = SequenceNumber(buf.get_u64());

            let num_commands = buf.try_get_usize_varint()?;
            let mut commands = Vec::new();
            for _ in 0..num_commands {
                commands.push(Command::try_deser(&mut buf)?);
            }
            guaranteed.push(GuaranteedBatch { sequence_id, commands });
        }

        if buf.has_remaining() {
            bail!("{} trailing bytes after envelope", buf.remaining());
        }

        Ok(Envelope {
            sequence_number,
            unreliable,
            guaranteed,
        })
    }
}

/// number of bytes a LEB128 style varint takes for the given value
pub(crate) fn varint_len(value: usize) -> usize {
    let bits = usize::BITS - value.leading_zeros();
    (bits as usize).div_ceil(7).max(1)
}

pub(crate) fn ensure_remaining(buf: &impl Buf, len: usize, what: &str) -> anyhow::Result<()> {
    if buf.remaining() < len {
        bail!("buffer too short for {}: {} bytes required, {} remaining", what, len, buf.remaining());
    }
    Ok(())
}
