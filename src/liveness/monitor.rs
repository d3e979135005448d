use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::LivenessConfig;
use crate::liveness::pool::PeerPool;
use crate::liveness::LivenessPeer;

/// Periodically pings the peers in a pool, closing and removing those that do not answer.
///
/// Each cycle runs up to `max_rounds` rounds of pinging every peer that did not answer yet and
///  waiting for their pongs. Peers that are busy with a message are not pinged. A peer is purged
///  only if it was pinged in every round and never answered, so being busy never gets a peer
///  purged.
pub struct LivenessMonitor<P: LivenessPeer> {
    pool: Arc<PeerPool<P>>,
    config: Arc<LivenessConfig>,
}

impl <P: LivenessPeer> LivenessMonitor<P> {
    pub fn new(pool: Arc<PeerPool<P>>, config: Arc<LivenessConfig>) -> anyhow::Result<LivenessMonitor<P>> {
        config.validate()?;
        Ok(LivenessMonitor {
            pool,
            config,
        })
    }

    pub async fn run(&self, mut cancel: broadcast::Receiver<()>) {
        info!("starting liveness monitor");
        loop {
            select! {
                _ = self.run_cycle() => {}
                _ = cancel.recv() => break,
            }
            select! {
                _ = tokio::time::sleep(self.config.cycle_interval) => {}
                _ = cancel.recv() => break,
            }
        }
        info!("liveness monitor stopped");
    }

    /// returns the session ids of purged peers
    pub async fn run_cycle(&self) -> Vec<u64> {
        let mut purged = self.purge_dead();

        let candidates = self.pool.snapshot();
        let mut responded = FxHashSet::default();
        let mut missed_rounds: FxHashMap<u64, usize> = FxHashMap::default();

        for round in 0..self.config.max_rounds {
            let mut pinged_now = FxHashMap::default();
            for (&session_id, peer) in candidates.iter() {
                if responded.contains(&session_id) || !peer.is_alive() {
                    continue;
                }
                if peer.is_claimed() {
                    debug!("session {} is busy - not pinging it", session_id);
                    continue;
                }

                let baseline = peer.pong_count();
                if let Err(e) = peer.send_ping().await {
                    debug!("could not ping session {}: {}", session_id, e);
                }
                pinged_now.insert(session_id, baseline);
            }
            if pinged_now.is_empty() {
                break;
            }

            debug!("liveness round {}: pinged {} peers", round+1, pinged_now.len());
            tokio::time::sleep(self.config.ping_window).await;

            for (session_id, baseline) in pinged_now {
                if let Some(peer) = candidates.get(&session_id) {
                    if peer.pong_count() > baseline {
                        responded.insert(session_id);
                    }
                    else {
                        *missed_rounds.entry(session_id).or_default() += 1;
                    }
                }
            }
        }

        for (session_id, missed) in missed_rounds {
            if missed < self.config.max_rounds || responded.contains(&session_id) {
                continue;
            }
            if let Some(peer) = self.pool.remove(session_id) {
                warn!("session {} did not answer {} pings - closing it", session_id, missed);
                peer.close().await;
                purged.push(session_id);
            }
        }
        purged
    }

    fn purge_dead(&self) -> Vec<u64> {
        let mut purged = Vec::new();
        for (&session_id, peer) in self.pool.snapshot().iter() {
            if !peer.is_alive() {
                debug!("removing dead session {} from pool", session_id);
                self.pool.remove(session_id);
                purged.push(session_id);
            }
        }
        purged
    }
}
