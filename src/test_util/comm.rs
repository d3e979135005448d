use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::comm::communicator::{Communicator, Role, TransportKind};
use crate::comm::context::CommunicatorContext;
use crate::comm::handler::MessageHandler;
use crate::messaging::message::{Message, StructuredPayload};

/// A connected and established (client, server) pair over an in-memory stream
pub async fn communicator_pair() -> (Arc<Communicator>, Arc<Communicator>) {
    communicator_pair_with_transport(TransportKind::Plain).await
}

pub async fn communicator_pair_with_transport(transport: TransportKind) -> (Arc<Communicator>, Arc<Communicator>) {
    communicator_pair_in_context(&CommunicatorContext::default_context(), transport).await
}

pub async fn communicator_pair_in_context(context: &Arc<CommunicatorContext>, transport: TransportKind) -> (Arc<Communicator>, Arc<Communicator>) {
    let (client_stream, server_stream) = tokio::io::duplex(64*1024);

    // the responder replies to the handshake only after it is established itself
    let (client, server) = tokio::join!(
        Communicator::start(client_stream, Role::Initiator, transport, context),
        Communicator::start(server_stream, Role::Responder, transport, context),
    );
    (client.unwrap(), server.unwrap())
}

/// Replies to every message of one type with a message of another type and the same payload
pub struct EchoHandler {
    pub message_type: i32,
    pub response_type: i32,
}

#[async_trait]
impl MessageHandler for EchoHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![self.message_type]
    }

    async fn on_message(&self, _communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>> {
        let payload = message.structured()
            .cloned()
            .unwrap_or_else(StructuredPayload::new);
        Ok(Some(message.response_to(self.response_type, payload)?))
    }
}

/// Signals when it starts handling a message, and then waits to be released
pub struct SlowHandler {
    message_type: i32,
    blocking: bool,
    pub started: Notify,
    pub release: Notify,
}

impl SlowHandler {
    pub fn new(message_type: i32, blocking: bool) -> SlowHandler {
        SlowHandler {
            message_type,
            blocking,
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl MessageHandler for SlowHandler {
    fn accepted_types(&self) -> Vec<i32> {
        vec![self.message_type]
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    async fn on_message(&self, _communicator: &Arc<Communicator>, _message: Message) -> anyhow::Result<Option<Message>> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(None)
    }
}
