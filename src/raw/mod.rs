pub mod block;
pub mod block_receiver;
pub mod block_sender;
pub mod byte_buffer;
pub mod channel_error;
pub mod raw_channel;
mod raw_handlers;
