use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;

static CRC: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_REDIS);

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    pub struct BlockFlags: u8 {
        /// the sender waits for an acknowledgement before sending the next block
        const ACK_REQUESTED = 0b0000_0001;
        const COMPRESSED    = 0b0000_0010;
        /// last block of the stream, carries no data
        const END_OF_STREAM = 0b0000_0100;
        /// the sender failed unrecoverably, this is outside the numbered sequence
        const ABORT         = 0b0000_1000;
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct BlockChecksum(pub u64);
impl Debug for BlockChecksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl BlockChecksum {
    /// covers everything that is interpreted by the receiver, i.e. all but the channel id
    pub fn new(number: u64, resend_code: i64, flags: BlockFlags, data: &[u8]) -> BlockChecksum {
        let mut digest = CRC.digest();
        digest.update(&number.to_be_bytes());
        digest.update(&resend_code.to_be_bytes());
        digest.update(&[flags.bits()]);
        digest.update(data);
        BlockChecksum(digest.finalize())
    }
}

/// One numbered chunk of a raw channel, transferred as the raw payload of a raw data message:
///
/// ```ascii
/// 0: channel id (i64 BE) - the receiving side's channel id
/// 8: block number (u64 BE), starting at 1
/// 16: checksum (u64 BE)
/// 24: resend code (i64 BE) - the most recent resend request code serviced by the sender
/// 32: flags (u8)
/// 33: data
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Block {
    pub channel_id: i64,
    pub number: u64,
    pub checksum: BlockChecksum,
    pub resend_code: i64,
    pub flags: BlockFlags,
    pub data: Bytes,
}

impl Debug for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block{{channel:{}, #{}, code:{}, {:?}, {} bytes}}", self.channel_id, self.number, self.resend_code, self.flags, self.data.len())
    }
}

impl Block {
    pub const HEADER_LEN: usize = 33;

    pub fn new(channel_id: i64, number: u64, resend_code: i64, flags: BlockFlags, data: Bytes) -> Block {
        Block {
            channel_id,
            number,
            checksum: BlockChecksum::new(number, resend_code, flags, &data),
            resend_code,
            flags,
            data,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == BlockChecksum::new(self.number, self.resend_code, self.flags, &self.data)
    }

    /// the same block stamped with a different resend code
    pub fn restamped(&self, resend_code: i64) -> Block {
        Block::new(self.channel_id, self.number, resend_code, self.flags, self.data.clone())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.reserve(Self::HEADER_LEN + self.data.len());
        buf.put_i64(self.channel_id);
        buf.put_u64(self.number);
        buf.put_u64(self.checksum.0);
        buf.put_i64(self.resend_code);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a block without verifying its checksum - corrupt blocks are a regular part of
    ///  the protocol and handled by the receiver.
    pub fn deser(mut buf: Bytes) -> anyhow::Result<Block> {
        if buf.len() < Self::HEADER_LEN {
            bail!("raw data message of {} bytes is too short for a block header", buf.len());
        }
        let channel_id = buf.get_i64();
        let number = buf.get_u64();
        let checksum = BlockChecksum(buf.get_u64());
        let resend_code = buf.get_i64();
        // unknown flags can only come from corruption, and they are covered by the checksum
        let flags = BlockFlags::from_bits_retain(buf.get_u8());

        Ok(Block {
            channel_id,
            number,
            checksum,
            resend_code,
            flags,
            data: buf,
        })
    }

    /// the channel id of a serialized block, for routing before parsing
    pub fn peek_channel_id(buf: &[u8]) -> Option<i64> {
        let mut buf = buf;
        buf.try_get_i64().ok()
    }
}
