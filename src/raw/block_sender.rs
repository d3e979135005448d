use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::raw::block::{Block, BlockFlags};

/// A receiver's request to re-send a block
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResendRequest {
    pub block_number: u64,
    /// increasing per receiver, used to recognize requests that were serviced already
    pub code: i64,
    /// all blocks before this one were received, so the sender can discard them
    pub next_expected: u64,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ResendOutcome {
    Resend(Block),
    /// a duplicate request, or one for a block that was never sent
    Ignored,
    /// the requested block is no longer retained - the channel can not recover from this
    OutOfWindow,
}

/// The sending side's bookkeeping for a raw channel: block numbering, the window of recently
///  sent blocks, and servicing of resend requests.
pub struct BlockSender {
    channel_id: i64,
    next_number: u64,
    retained: VecDeque<Block>,
    retained_capacity: usize,
    last_serviced_code: i64,
    /// the block whose loss made the channel fail
    failed_block: Option<u64>,
}

impl BlockSender {
    pub fn new(channel_id: i64, retained_capacity: usize) -> BlockSender {
        BlockSender {
            channel_id,
            next_number: 1,
            retained: VecDeque::with_capacity(retained_capacity),
            retained_capacity,
            last_serviced_code: 0,
            failed_block: None,
        }
    }

    /// The peer's channel id is only known after it answered the opening request
    pub fn set_channel_id(&mut self, channel_id: i64) {
        self.channel_id = channel_id;
    }

    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    pub fn is_failed(&self) -> bool {
        self.failed_block.is_some()
    }

    pub fn failed_block(&self) -> Option<u64> {
        self.failed_block
    }

    pub fn last_sent_number(&self) -> u64 {
        self.next_number - 1
    }

    pub fn retained_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.retained.iter().map(|b| b.number)
    }

    /// Creates the next block in sequence, retaining it for re-sending
    pub fn next_block(&mut self, flags: BlockFlags, data: Bytes) -> Block {
        let block = Block::new(self.channel_id, self.next_number, self.last_serviced_code, flags, data);
        self.next_number += 1;

        self.retained.push_back(block.clone());
        while self.retained.len() > self.retained_capacity {
            self.retained.pop_front();
        }
        trace!("sending {:?}", block);
        block
    }

    /// A block outside the numbered sequence, telling the peer that this side failed
    pub fn abort_block(&self) -> Block {
        Block::new(self.channel_id, 0, self.last_serviced_code, BlockFlags::ABORT, Bytes::new())
    }

    pub fn on_resend_request(&mut self, request: &ResendRequest) -> ResendOutcome {
        if request.code <= self.last_serviced_code {
            debug!("ignoring resend request {:?} - code {} was serviced already", request, self.last_serviced_code);
            return ResendOutcome::Ignored;
        }
        if request.block_number == 0 || request.block_number >= self.next_number {
            warn!("peer requested block {} which was never sent - ignoring", request.block_number);
            return ResendOutcome::Ignored;
        }
        self.last_serviced_code = request.code;

        while let Some(front) = self.retained.front() {
            if front.number >= request.next_expected.min(request.block_number) {
                break;
            }
            self.retained.pop_front();
        }

        match self.retained.iter().find(|b| b.number == request.block_number) {
            Some(block) => {
                debug!("re-sending block {} for request code {}", block.number, request.code);
                ResendOutcome::Resend(block.restamped(request.code))
            }
            None => {
                warn!("block {} was requested for re-sending but is no longer retained - failing the channel", request.block_number);
                self.failed_block = Some(request.block_number);
                ResendOutcome::OutOfWindow
            }
        }
    }
}
