use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::raw::block::{Block, BlockFlags};
use crate::raw::block_sender::ResendRequest;

#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// false if the block's checksum did not match
    pub valid: bool,
    /// blocks that are now complete in sequence, in order
    pub deliverable: Vec<Block>,
    pub resend: Option<ResendRequest>,
}

/// The receiving side's bookkeeping for a raw channel: it restores the sender's block order,
///  discards duplicates and corrupt blocks, and asks for missing blocks to be re-sent.
pub struct BlockReceiver {
    next_expected: u64,
    out_of_order: BTreeMap<u64, Block>,
    /// block number -> code of the resend request that is still waiting to be serviced
    pending_resends: BTreeMap<u64, i64>,
    last_code: i64,
}

impl Default for BlockReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockReceiver {
    pub fn new() -> BlockReceiver {
        BlockReceiver {
            next_expected: 1,
            out_of_order: Default::default(),
            pending_resends: Default::default(),
            last_code: 0,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn num_out_of_order(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn on_block(&mut self, block: Block) -> ReceiveOutcome {
        if !block.is_valid() {
            debug!("discarding corrupt block {}", block.number);
            // a sender waiting for acknowledgement retries on its own. The stamped code of a
            //  corrupt block can not be trusted, so there is no suppression.
            let resend = if block.flags.contains(BlockFlags::ACK_REQUESTED) || block.number < self.next_expected {
                None
            }
            else {
                Some(self.issue_resend(block.number))
            };
            return ReceiveOutcome {
                valid: false,
                deliverable: vec![],
                resend,
            };
        }

        if block.number < self.next_expected || self.out_of_order.contains_key(&block.number) {
            trace!("ignoring duplicate block {}", block.number);
            return ReceiveOutcome {
                valid: true,
                ..Default::default()
            };
        }

        if block.number > self.next_expected {
            trace!("caching out-of-order block {} while waiting for {}", block.number, self.next_expected);
            let stamped_code = block.resend_code;
            self.out_of_order.insert(block.number, block);
            let resend = self.request_resend(self.next_expected, stamped_code);
            return ReceiveOutcome {
                valid: true,
                deliverable: vec![],
                resend,
            };
        }

        let mut deliverable = vec![block];
        self.next_expected += 1;
        while let Some(cached) = self.out_of_order.remove(&self.next_expected) {
            deliverable.push(cached);
            self.next_expected += 1;
        }
        self.pending_resends = self.pending_resends.split_off(&self.next_expected);

        ReceiveOutcome {
            valid: true,
            deliverable,
            resend: None,
        }
    }

    /// A request is suppressed if an earlier request for the same block is still in flight, i.e.
    ///  the sender had not serviced it yet when it sent the block that triggered this.
    fn request_resend(&mut self, block_number: u64, stamped_code: i64) -> Option<ResendRequest> {
        if let Some(&pending_code) = self.pending_resends.get(&block_number) {
            if stamped_code < pending_code {
                trace!("resend request for block {} is pending with code {} - not repeating it", block_number, pending_code);
                return None;
            }
        }
        Some(self.issue_resend(block_number))
    }

    fn issue_resend(&mut self, block_number: u64) -> ResendRequest {
        self.last_code += 1;
        self.pending_resends.insert(block_number, self.last_code);
        debug!("requesting block {} with code {}", block_number, self.last_code);
        ResendRequest {
            block_number,
            code: self.last_code,
            next_expected: self.next_expected,
        }
    }
}
