use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::p2p::node::PeerSetMgr;
use crate::p2p::peer::Peer;
use crate::protocol::types::NoteReq;

/// The set of active peers, keyed by remote socket address.
///
/// Fans notices out across all eligible peers and supervises the per-peer
/// workers: when a worker returns, the peer's entry is removed and the owning
/// manager is told through the [PeerSetMgr] callback supplied at
/// construction.
#[derive(Clone)]
pub struct PeerSet {
    inner: Arc<PeerSetInner>,
}

struct PeerSetInner {
    mgr: Weak<dyn PeerSetMgr>,
    entries: Mutex<FxHashMap<SocketAddr, Entry>>,
}

struct Entry {
    peer: Peer,
    notifiable: bool,
}

impl PeerSet {
    pub fn new(mgr: Weak<dyn PeerSetMgr>) -> PeerSet {
        PeerSet {
            inner: Arc::new(PeerSetInner {
                mgr,
                entries: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Adds a peer. Returns `false` if a peer with the same remote address is
    /// already present. With `notify` the peer takes part in broadcasts right
    /// away, otherwise only once it is activated.
    pub fn insert(&self, peer: Peer, notify: bool) -> bool {
        let mut entries = self.inner.entries.lock();
        if entries.contains_key(&peer.rmt_addr()) {
            return false;
        }
        entries.insert(
            peer.rmt_addr(),
            Entry {
                peer,
                notifiable: notify,
            },
        );
        true
    }

    /// Starts the peer's worker. Fast; never blocks on I/O.
    pub fn activate(&self, peer: &Peer) {
        {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(&peer.rmt_addr()) {
                Some(entry) if entry.peer == *peer => entry.notifiable = true,
                _ => {
                    warn!(peer = ?peer, "activating a peer that is not in the set");
                    return;
                }
            }
        }

        let set = self.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let result = peer.run().await;
            set.remove(&peer);
            if let Some(mgr) = set.inner.mgr.upgrade() {
                if let Err(e) = result {
                    mgr.task_failed(e);
                }
                mgr.stopped(peer).await;
            }
        });
    }

    /// Removes the peer's entry if it is still the one registered for its
    /// address. Idempotent.
    pub fn remove(&self, peer: &Peer) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(&peer.rmt_addr()) {
            if entry.peer == *peer {
                entries.remove(&peer.rmt_addr());
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Broadcasts a notice on every eligible peer. Send failures are logged
    /// and skipped; a broken peer's own worker takes care of its removal.
    pub async fn notify(&self, note: NoteReq) {
        for peer in self.notifiable_peers(None) {
            if let Err(e) = peer.notify(note).await {
                debug!(peer = ?peer, %note, error = %e, "couldn't notify peer");
            }
        }
    }

    /// Broadcasts a notice on every eligible peer except `except`, which is
    /// typically the peer the item just came from.
    pub async fn notify_except(&self, note: NoteReq, except: &Peer) {
        for peer in self.notifiable_peers(Some(except)) {
            if let Err(e) = peer.notify(note).await {
                debug!(peer = ?peer, %note, error = %e, "couldn't notify peer");
            }
        }
    }

    /// Announces to every peer but the triggering one that this node now has
    /// a path to the publisher.
    pub async fn got_path(&self, except: &Peer) {
        self.send_path_status(true, except).await;
    }

    /// Announces to every peer but the triggering one that this node no
    /// longer has a path to the publisher.
    pub async fn lost_path(&self, except: &Peer) {
        self.send_path_status(false, except).await;
    }

    async fn send_path_status(&self, pub_path: bool, except: &Peer) {
        for peer in self.notifiable_peers(Some(except)) {
            if let Err(e) = peer.send_pub_path(pub_path).await {
                debug!(peer = ?peer, error = %e, "couldn't send path status");
            }
        }
    }

    /// Halts every peer. Idempotent.
    pub async fn halt(&self) {
        let peers: Vec<Peer> = {
            let entries = self.inner.entries.lock();
            entries.values().map(|entry| entry.peer.clone()).collect()
        };
        trace!(count = peers.len(), "halting peer set");
        for peer in peers {
            peer.halt().await;
        }
    }

    fn notifiable_peers(&self, except: Option<&Peer>) -> Vec<Peer> {
        let entries = self.inner.entries.lock();
        entries
            .values()
            .filter(|entry| entry.notifiable)
            .filter(|entry| except.map_or(true, |e| entry.peer != *e))
            .map(|entry| entry.peer.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;
    use crate::error::P2pError;
    use crate::protocol::types::ProdIndex;
    use crate::test_util::{peer_pair, TestNode};

    /// Records stopped peers so supervision can be observed.
    struct RecordingMgr {
        stopped: SyncMutex<Vec<Peer>>,
        failed: SyncMutex<Vec<P2pError>>,
        changed: Notify,
    }

    impl RecordingMgr {
        fn new() -> Arc<RecordingMgr> {
            Arc::new(RecordingMgr {
                stopped: SyncMutex::new(Vec::new()),
                failed: SyncMutex::new(Vec::new()),
                changed: Notify::new(),
            })
        }

        async fn wait_for_stopped(&self, count: usize) {
            timeout(Duration::from_secs(5), async {
                loop {
                    let notified = self.changed.notified();
                    if self.stopped.lock().len() >= count {
                        return;
                    }
                    notified.await;
                }
            })
            .await
            .expect("timed out waiting for stopped peers");
        }
    }

    #[async_trait]
    impl PeerSetMgr for RecordingMgr {
        async fn stopped(&self, peer: Peer) {
            self.stopped.lock().push(peer);
            self.changed.notify_waiters();
        }

        fn task_failed(&self, err: P2pError) {
            self.failed.lock().push(err);
            self.changed.notify_waiters();
        }
    }

    fn peer_set_for(mgr: &Arc<RecordingMgr>) -> PeerSet {
        let mgr: Arc<dyn PeerSetMgr> = mgr.clone();
        let weak: Weak<dyn PeerSetMgr> = Arc::downgrade(&mgr);
        PeerSet::new(weak)
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let mgr = RecordingMgr::new();
        let set = peer_set_for(&mgr);
        let (peer, _remote) = peer_pair(TestNode::new(), TestNode::new(), false, false).await;

        assert!(set.insert(peer.clone(), false));
        assert_eq!(set.size(), 1);
        assert!(!set.insert(peer.clone(), false));
        assert_eq!(set.size(), 1);
    }

    #[tokio::test]
    async fn test_notify_reaches_eligible_peers_only() {
        let mgr = RecordingMgr::new();
        let set = peer_set_for(&mgr);

        let remote_node_a = TestNode::new();
        let remote_node_b = TestNode::new();
        let (peer_a, remote_a) =
            peer_pair(TestNode::new(), remote_node_a.clone(), false, false).await;
        let (peer_b, remote_b) =
            peer_pair(TestNode::new(), remote_node_b.clone(), false, false).await;

        // remote sides must be reading for the notices to be observed
        for remote in [remote_a, remote_b] {
            tokio::spawn(async move { remote.run().await });
        }

        assert!(set.insert(peer_a, true));
        assert!(set.insert(peer_b, false));

        set.notify(NoteReq::from(ProdIndex(7))).await;
        remote_node_a
            .wait_until(|s| s.prod_notices == vec![ProdIndex(7)])
            .await;

        // the non-notifiable peer saw nothing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(remote_node_b.received().prod_notices.is_empty());
    }

    #[tokio::test]
    async fn test_notify_except_skips_the_source() {
        let mgr = RecordingMgr::new();
        let set = peer_set_for(&mgr);

        let remote_node_a = TestNode::new();
        let remote_node_b = TestNode::new();
        let (peer_a, remote_a) =
            peer_pair(TestNode::new(), remote_node_a.clone(), false, false).await;
        let (peer_b, remote_b) =
            peer_pair(TestNode::new(), remote_node_b.clone(), false, false).await;
        for remote in [remote_a, remote_b] {
            tokio::spawn(async move { remote.run().await });
        }

        assert!(set.insert(peer_a.clone(), true));
        assert!(set.insert(peer_b, true));

        set.notify_except(NoteReq::from(ProdIndex(3)), &peer_a).await;
        remote_node_b
            .wait_until(|s| s.prod_notices == vec![ProdIndex(3)])
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(remote_node_a.received().prod_notices.is_empty());
    }

    #[tokio::test]
    async fn test_supervision_reports_stopped_peer() {
        let mgr = RecordingMgr::new();
        let set = peer_set_for(&mgr);

        let (peer, remote) = peer_pair(TestNode::new(), TestNode::new(), false, false).await;
        assert!(set.insert(peer.clone(), true));
        set.activate(&peer);

        // the remote hangs up; the worker must return and report
        remote.halt().await;
        mgr.wait_for_stopped(1).await;

        assert_eq!(set.size(), 0);
        assert_eq!(mgr.stopped.lock()[0], peer);
        assert!(mgr.failed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_halt_stops_every_worker() {
        let mgr = RecordingMgr::new();
        let set = peer_set_for(&mgr);

        let mut keep_remotes = Vec::new();
        for _ in 0..3 {
            let (peer, remote) = peer_pair(TestNode::new(), TestNode::new(), false, false).await;
            keep_remotes.push(remote);
            assert!(set.insert(peer.clone(), true));
            set.activate(&peer);
        }
        assert_eq!(set.size(), 3);

        set.halt().await;
        mgr.wait_for_stopped(3).await;
        assert_eq!(set.size(), 0);

        // repeated halt is a no-op
        set.halt().await;
    }
}
