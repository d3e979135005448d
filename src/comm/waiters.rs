use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::trace;

use crate::messaging::message::{Message, UNSET_MESSAGE_ID};

struct Waiter {
    token: u64,
    /// `None` for waiters that match on type alone
    message_id: Option<i64>,
    /// an empty list matches every type
    message_types: Vec<i32>,
    sender: oneshot::Sender<Message>,
}

impl Waiter {
    fn matches(&self, message: &Message) -> bool {
        let type_matches = self.message_types.is_empty() || self.message_types.contains(&message.message_type());
        match self.message_id {
            Some(id) => id == message.message_id() && type_matches,
            None => !self.message_types.is_empty() && type_matches,
        }
    }
}

#[derive(Default)]
struct WaitersInner {
    next_token: u64,
    waiters: Vec<Waiter>,
}

impl WaitersInner {
    fn has_pending_id(&self, message_id: i64) -> bool {
        self.waiters
            .iter()
            .any(|w| w.message_id == Some(message_id))
    }
}

/// One-shot listeners for incoming messages, either for responses to a specific message id or
///  for the next message of a given type. The first registered matching waiter gets the message
///  and is removed.
#[derive(Default)]
pub struct Waiters {
    inner: Mutex<WaitersInner>,
}

pub struct Registration {
    pub token: u64,
    pub message_id: i64,
    pub receiver: oneshot::Receiver<Message>,
}

impl Waiters {
    fn lock(&self) -> std::sync::MutexGuard<'_, WaitersInner> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for a fresh random message id that is neither the 'unset' marker nor
    ///  the id of any other pending waiter.
    pub fn register_fresh(&self, message_types: Vec<i32>) -> Registration {
        let mut inner = self.lock();
        let message_id = loop {
            let candidate: i64 = rand::random();
            if candidate != UNSET_MESSAGE_ID && !inner.has_pending_id(candidate) {
                break candidate;
            }
        };
        Self::do_register(&mut inner, Some(message_id), message_types)
    }

    pub fn register_for_id(&self, message_id: i64, message_types: Vec<i32>) -> Registration {
        Self::do_register(&mut self.lock(), Some(message_id), message_types)
    }

    pub fn register_for_types(&self, message_types: Vec<i32>) -> Registration {
        Self::do_register(&mut self.lock(), None, message_types)
    }

    fn do_register(inner: &mut WaitersInner, message_id: Option<i64>, message_types: Vec<i32>) -> Registration {
        let token = inner.next_token;
        inner.next_token += 1;

        let (sender, receiver) = oneshot::channel();
        inner.waiters.push(Waiter {
            token,
            message_id,
            message_types,
            sender,
        });
        Registration {
            token,
            message_id: message_id.unwrap_or(UNSET_MESSAGE_ID),
            receiver,
        }
    }

    pub fn remove(&self, token: u64) {
        self.lock().waiters
            .retain(|w| w.token != token);
    }

    /// Hands the message to the first matching waiter. The message is returned if no waiter
    ///  took it.
    pub fn offer(&self, message: Message) -> Option<Message> {
        let waiter = {
            let mut inner = self.lock();
            let Some(idx) = inner.waiters.iter().position(|w| w.matches(&message)) else {
                return Some(message);
            };
            inner.waiters.remove(idx)
        };

        trace!("handing message to waiter {}", waiter.token);
        match waiter.sender.send(message) {
            Ok(()) => None,
            // the waiting caller gave up in the meantime
            Err(message) => Some(message),
        }
    }

    /// Drops all waiters, which waiting callers observe as the connection being gone
    pub fn clear(&self) {
        self.lock().waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
