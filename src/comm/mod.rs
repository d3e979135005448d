pub mod communicator;
pub mod context;
pub mod handler;
pub mod system_handlers;
pub mod waiters;
