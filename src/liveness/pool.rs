use std::sync::Arc;

use rustc_hash::FxHashMap;
use anyhow::bail;
use tracing::{debug, warn};

use crate::comm::communicator::Communicator;
use crate::liveness::LivenessPeer;
use crate::messaging::message::Message;
use crate::util::atomic_map::AtomicMap;

/// The set of live connections, keyed by session id. Iteration works on snapshots, so the pool
///  can be modified concurrently.
pub struct PeerPool<P: LivenessPeer> {
    peers: AtomicMap<u64, Arc<P>>,
}

impl <P: LivenessPeer> Default for PeerPool<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl <P: LivenessPeer> PeerPool<P> {
    pub fn new() -> PeerPool<P> {
        PeerPool {
            peers: AtomicMap::new(),
        }
    }

    /// Fails if the pool already holds a peer with the same session id. Session ids are unique
    ///  per [crate::comm::context::CommunicatorContext], so a pool should hold peers of a single
    ///  context.
    pub fn add(&self, peer: Arc<P>) -> anyhow::Result<()> {
        let session_id = peer.session_id();
        let added = self.peers.update(|m| {
            if m.contains_key(&session_id) {
                return false;
            }
            m.insert(session_id, peer);
            true
        });
        if !added {
            warn!("session {} is already in the pool", session_id);
            bail!("duplicate session id {}", session_id);
        }
        debug!("added session {} to pool", session_id);
        Ok(())
    }

    pub fn remove(&self, session_id: u64) -> Option<Arc<P>> {
        self.peers.update(|m| m.remove(&session_id))
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<P>> {
        self.peers.get(&session_id)
    }

    pub fn snapshot(&self) -> Arc<FxHashMap<u64, Arc<P>>> {
        self.peers.load()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerPool<Communicator> {
    /// Queues a message to every live connection, returning the number of connections it was
    ///  written to
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut num_sent = 0;
        for communicator in self.snapshot().values() {
            if !communicator.is_alive() {
                continue;
            }
            match communicator.queue(message.clone()).await {
                Ok(()) => num_sent += 1,
                Err(e) => debug!("broadcast to session {} failed: {}", communicator.session_id(), e),
            }
        }
        num_sent
    }

    pub async fn send_direct(&self, session_id: u64, message: Message) -> anyhow::Result<()> {
        match self.get(session_id) {
            Some(communicator) => communicator.queue(message).await,
            None => anyhow::bail!("no session {} in pool", session_id),
        }
    }
}
