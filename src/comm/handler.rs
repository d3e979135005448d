use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::comm::communicator::Communicator;
use crate::messaging::message::Message;

/// A unit of message processing that a [Communicator] dispatches incoming messages to.
///
/// System handlers (`is_system() == true`) see system messages (negative types) before anything
///  else; they are how the protocol itself is implemented. Application handlers claim their
///  accepted types exclusively per communicator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    fn accepted_types(&self) -> Vec<i32>;

    /// Finer grained acceptance, e.g. a handler for one specific raw channel's data messages.
    ///  Defaults to checking the message type against [MessageHandler::accepted_types].
    fn accepts(&self, message: &Message) -> bool {
        self.accepted_types().contains(&message.message_type())
    }

    fn is_system(&self) -> bool {
        false
    }

    /// Blocking handlers run inline on the communicator's reader, i.e. no further message is read
    ///  before they return. This is a guarantee of sequential processing, and at the same time
    ///  applies back pressure to the peer. Tunnel transports ignore this flag.
    fn is_blocking(&self) -> bool {
        false
    }

    /// A returned message is written back to the peer, carrying the incoming message's
    ///  correlation id if it had one.
    async fn on_message(&self, communicator: &Arc<Communicator>, message: Message) -> anyhow::Result<Option<Message>>;
}

/// Creates a fresh handler for every communicator
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn MessageHandler> + Send + Sync>;
