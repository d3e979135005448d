use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

pub mod monitor;
pub mod pool;

/// The view of a connection that liveness tracking needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LivenessPeer: Send + Sync + 'static {
    fn session_id(&self) -> u64;

    fn is_alive(&self) -> bool;

    /// a claimed peer is busy processing a message, and it is not pinged
    fn is_claimed(&self) -> bool;

    /// number of pongs received so far
    fn pong_count(&self) -> u64;

    async fn send_ping(&self) -> anyhow::Result<()>;

    async fn close(&self);
}
