//! Handlers implementing the protocol's own system messages. Every communicator starts with
//!  these installed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::comm::communicator::{Communicator, ConnectionState, KEY_PONG};
use crate::comm::handler::MessageHandler;
use crate::messaging::message::{Message, StructuredPayload};
use crate::messaging::system_types::SystemMessageType;
use crate::raw::raw_channel::RawChannel;

pub fn builtin_system_handlers() -> Vec<Arc<dyn MessageHandler>> {
    vec![
        Arc::new(HandshakeHandler),
        Arc::new(CloseHandler),
        Arc::new(PingPongHandler),
        Arc::new(TestConnectionHandler),
        Arc::new(RawDataConnectionHandler),
    ]
}

struct HandshakeHandler;

#[async_trait]
impl MessageHandler for HandshakeHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![SystemMessageType::Handshake.code()]
    }

    fn is_system(&self) -> bool {
        true
    }

    fn is_blocking(&self) -> bool {
        true
    }

    async fn on_message(&self, communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        communicator.on_handshake(&message).await?;
        Ok(None)
    }
}

/// Close and shutdown notice are treated alike: the peer is going away
struct CloseHandler;

#[async_trait]
impl MessageHandler for CloseHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![SystemMessageType::Close.code(), SystemMessageType::ShutdownNotice.code()]
    }

    fn is_system(&self) -> bool {
        true
    }

    fn is_blocking(&self) -> bool {
        true
    }

    async fn on_message(&self, communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        debug!("peer sent {:?}", message.system_type());
        communicator.shutdown(ConnectionState::Closed).await;
        Ok(None)
    }
}

/// Answers pings with a pong, and counts incoming pongs for liveness tracking
struct PingPongHandler;

#[async_trait]
impl MessageHandler for PingPongHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![SystemMessageType::PingPong.code()]
    }

    fn is_system(&self) -> bool {
        true
    }

    async fn on_message(&self, communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        if message.get_bool(KEY_PONG).unwrap_or(false) {
            communicator.record_pong();
            return Ok(None);
        }
        Ok(Some(Message::system(SystemMessageType::PingPong, StructuredPayload::new()
            .with(KEY_PONG, true))))
    }
}

struct TestConnectionHandler;

#[async_trait]
impl MessageHandler for TestConnectionHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![SystemMessageType::TestConnection.code()]
    }

    fn is_system(&self) -> bool {
        true
    }

    async fn on_message(&self, _communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        Ok(Some(Message::acknowledgement(&message, StructuredPayload::success(true))))
    }
}

/// Accepts a peer's request to open a raw channel
struct RawDataConnectionHandler;

#[async_trait]
impl MessageHandler for RawDataConnectionHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![SystemMessageType::RawDataConnection.code()]
    }

    fn is_system(&self) -> bool {
        true
    }

    // inline, so the new channel's handlers are in place before any of its blocks are read
    fn is_blocking(&self) -> bool {
        true
    }

    async fn on_message(&self, communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        let config = communicator.context().raw_channel_config.clone();
        match RawChannel::accept(communicator, &message, config).await {
            Ok((channel, response)) => {
                communicator.push_accepted_raw_channel(channel)?;
                Ok(Some(response))
            }
            Err(e) => {
                debug!("rejecting raw channel: {}", e);
                Ok(Some(Message::acknowledgement(&message, StructuredPayload::failure(e))))
            }
        }
    }
}
