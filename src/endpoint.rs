//! Plain TCP bootstrap: connecting creates an initiating [Communicator], accepting creates
//!  responding ones.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::comm::communicator::{Communicator, Role, TransportKind};
use crate::comm::context::CommunicatorContext;
use crate::liveness::pool::PeerPool;

/// Opens a TCP connection and returns once the handshake is complete
#[instrument(skip_all)]
pub async fn connect(addr: impl ToSocketAddrs, context: &Arc<CommunicatorContext>) -> anyhow::Result<Arc<Communicator>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!("connected to {:?}", stream.peer_addr());

    Communicator::start(stream, Role::Initiator, TransportKind::Plain, context).await
}

pub struct Acceptor {
    listener: TcpListener,
    context: Arc<CommunicatorContext>,
    pool: Arc<PeerPool<Communicator>>,
}

impl Acceptor {
    pub async fn bind(addr: impl ToSocketAddrs, context: Arc<CommunicatorContext>) -> anyhow::Result<Acceptor> {
        Ok(Acceptor {
            listener: TcpListener::bind(addr).await?,
            context,
            pool: Arc::new(PeerPool::new()),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The communicators of all accepted connections that are still open
    pub fn pool(&self) -> &Arc<PeerPool<Communicator>> {
        &self.pool
    }

    /// Accepts connections until a cancel signal arrives. Closing the accepted communicators
    ///  is up to the caller.
    pub async fn accept_loop(&self, mut cancel: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!("accepting connections on {:?}", self.listener.local_addr());
        loop {
            let (stream, addr) = select! {
                accepted = self.listener.accept() => accepted?,
                _ = cancel.recv() => break,
            };

            let context = self.context.clone();
            let pool = self.pool.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection_request(addr, stream, context, pool).await {
                    warn!("connection from {} could not be set up: {}", addr, e);
                }
            });
        }
        info!("stopped accepting connections");
        Ok(())
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = format!("{:?}", _addr)))]
async fn handle_connection_request(
    _addr: SocketAddr,
    stream: TcpStream,
    context: Arc<CommunicatorContext>,
    pool: Arc<PeerPool<Communicator>>,
) -> anyhow::Result<()> {
    debug!("received connection request");
    stream.set_nodelay(true)?;

    let communicator = Communicator::start(stream, Role::Responder, TransportKind::Plain, &context)
        .instrument(Span::current())
        .await?;

    if let Err(e) = pool.add(communicator.clone()) {
        communicator.close().await;
        return Err(e);
    }
    let weak_pool = Arc::downgrade(&pool);
    communicator.on_close(move |session_id| {
        if let Some(pool) = weak_pool.upgrade() {
            pool.remove(session_id);
        }
    });
    Ok(())
}
