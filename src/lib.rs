//! Typed, correlated messaging between two peers over a byte stream.
//!
//! A [comm::communicator::Communicator] owns one connection: it runs the handshake, dispatches
//!  incoming messages to handlers and correlates requests with their responses. Reliable byte
//!  streams ([raw::raw_channel::RawChannel]) are multiplexed over the same connection, and a
//!  [liveness::monitor::LivenessMonitor] purges peers that stop answering pings.

pub mod comm;
pub mod config;
pub mod endpoint;
pub mod liveness;
pub mod messaging;
pub mod raw;
pub mod util;

#[cfg(test)]
pub mod test_util;
