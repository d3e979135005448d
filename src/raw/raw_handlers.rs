use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::comm::communicator::Communicator;
use crate::comm::handler::MessageHandler;
use crate::messaging::message::{Message, StructuredPayload};
use crate::messaging::system_types::SystemMessageType;
use crate::raw::block::{Block, BlockFlags};
use crate::raw::block_sender::ResendOutcome;
use crate::raw::raw_channel::{resend_request_from_message, resend_request_message, ChannelShared, KEY_CHANNEL};

/// Receives the blocks of one raw channel
pub(crate) struct RawDataHandler {
    pub shared: Arc<ChannelShared>,
}

#[async_trait]
impl MessageHandler for RawDataHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![SystemMessageType::RawData.code()]
    }

    fn accepts(&self, message: &Message) -> bool {
        message.message_type() == SystemMessageType::RawData.code() &&
            message.raw().and_then(|b| Block::peek_channel_id(b)) == Some(self.shared.local_id)
    }

    fn is_system(&self) -> bool {
        true
    }

    // blocks must be processed in the order they arrive, and a full buffer pushes back
    fn is_blocking(&self) -> bool {
        true
    }

    async fn on_message(&self, communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        let Some(raw) = message.raw() else {
            return Ok(None);
        };
        let block = Block::deser(raw.clone())?;
        let ack_requested = block.flags.contains(BlockFlags::ACK_REQUESTED);

        if block.flags.contains(BlockFlags::ABORT) {
            if block.is_valid() {
                warn!("peer aborted raw channel {}", self.shared.local_id);
                self.shared.buffer.abort("aborted by peer");
            }
            return Ok(None);
        }

        let outcome = self.shared.on_block(block);

        if let Some(request) = outcome.resend {
            let request_message = resend_request_message(self.shared.remote_id(), &request);
            if let Err(e) = communicator.queue(request_message).await {
                debug!("could not request block {}: {}", request.block_number, e);
            }
        }

        for block in outcome.deliverable {
            if let Err(e) = self.shared.deliver(block).await {
                debug!("raw channel {} can not take more data: {}", self.shared.local_id, e);
                break;
            }
        }

        if ack_requested {
            Ok(Some(Message::system(SystemMessageType::Acknowledgement, StructuredPayload::success(outcome.valid))))
        }
        else {
            Ok(None)
        }
    }
}

/// Services the peer's requests to re-send blocks of one raw channel
pub(crate) struct RawDataResendHandler {
    pub shared: Arc<ChannelShared>,
}

#[async_trait]
impl MessageHandler for RawDataResendHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![SystemMessageType::RawDataResend.code()]
    }

    fn accepts(&self, message: &Message) -> bool {
        message.message_type() == SystemMessageType::RawDataResend.code() &&
            message.get_i64(KEY_CHANNEL) == Some(self.shared.local_id)
    }

    fn is_system(&self) -> bool {
        true
    }

    fn is_blocking(&self) -> bool {
        true
    }

    async fn on_message(&self, communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        let request = resend_request_from_message(&message)?;

        let outcome = self.shared.on_resend_request(&request);
        match outcome {
            ResendOutcome::Resend(block) => {
                communicator.queue(Message::system(SystemMessageType::RawData, block.to_bytes())).await?;
            }
            ResendOutcome::Ignored => {}
            ResendOutcome::OutOfWindow => {
                let abort = self.shared.abort_block();
                communicator.queue(Message::system(SystemMessageType::RawData, abort.to_bytes())).await?;
            }
        }
        Ok(None)
    }
}
