//! The publisher- and subscriber-side P2P overlay managers.
//!
//! Both variants own the peer set, a bookkeeper, and the accept loop; the
//! subscriber additionally dials out of a [ServerPool] and balances its peers
//! between those that have a path to the publisher and those that don't. An
//! improver loop periodically culls the worst-performing peer once the set
//! is full, making room for hopefully better ones.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::select;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{P2pError, Result};
use crate::p2p::bookkeeper::{PubBookkeeper, SubBookkeeper};
use crate::p2p::node::{
    DataRcvr, NoticeRcvr, P2pSndr, P2pSub, PeerNode, PeerSetMgr, RequestRcvr,
};
use crate::p2p::peer::Peer;
use crate::p2p::peer_set::PeerSet;
use crate::p2p::server_pool::ServerPool;
use crate::protocol::types::{DataSeg, DataSegId, NoteReq, ProdIndex, ProdInfo};

/// Configuration of a P2P manager's server side.
#[derive(Clone, Copy, Debug)]
pub struct P2pInfo {
    /// Address the peer server listens on
    pub sock_addr: SocketAddr,
    /// Backlog of the listening socket
    pub listen_size: u32,
    /// Maximum number of active peers
    pub max_peers: usize,
}

const DEFAULT_TIME_PERIOD: Duration = Duration::from_secs(60);

/// Throttles the connect loop when every known peer server is unreachable.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

fn validate(p2p_info: &P2pInfo) -> Result<()> {
    if p2p_info.listen_size == 0 {
        return Err(P2pError::InvalidArgument(
            "the listen queue size must be positive".to_string(),
        ));
    }
    if p2p_info.max_peers == 0 {
        return Err(P2pError::InvalidArgument(
            "the maximum number of peers must be positive".to_string(),
        ));
    }
    Ok(())
}

fn bind_listener(p2p_info: &P2pInfo) -> Result<TcpListener> {
    let socket = match p2p_info.sock_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(p2p_info.sock_addr)?;
    Ok(socket.listen(p2p_info.listen_size)?)
}

/// State and plumbing common to both manager variants.
struct MgrShared {
    info: P2pInfo,
    lcl_addr: SocketAddr,
    state: Mutex<MgrState>,
    /// Wakes everything that waits on manager state: the improver window,
    /// the connect loop, and `run` itself.
    changed: Notify,
    /// Serializes admission, eviction, and the stopped-peer post-mortem, so
    /// a peer is in the peer set and the bookkeeper either fully or not at
    /// all.
    membership: tokio::sync::Mutex<()>,
    peer_set: PeerSet,
    listener: Mutex<Option<TcpListener>>,
}

struct MgrState {
    executing: bool,
    done: bool,
    time_period: Duration,
    task_exception: Option<P2pError>,
}

impl MgrShared {
    fn new(info: P2pInfo, lcl_addr: SocketAddr, listener: TcpListener, peer_set: PeerSet) -> MgrShared {
        MgrShared {
            info,
            lcl_addr,
            state: Mutex::new(MgrState {
                executing: false,
                done: false,
                time_period: DEFAULT_TIME_PERIOD,
                task_exception: None,
            }),
            changed: Notify::new(),
            membership: tokio::sync::Mutex::new(()),
            peer_set,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Marks the manager as executing. Returns the listener to run with, or
    /// `None` if the manager was halted before it ever ran.
    fn begin_run(&self) -> Result<Option<TcpListener>> {
        let mut state = self.state.lock();
        if state.executing {
            return Err(P2pError::Logic("run() was already called".to_string()));
        }
        state.executing = true;
        if state.done {
            return Ok(None);
        }
        drop(state);
        Ok(self.listener.lock().take())
    }

    fn is_done(&self) -> bool {
        self.state.lock().done
    }

    fn halt(&self) {
        self.state.lock().done = true;
        self.changed.notify_waiters();
    }

    /// Records the first fatal error and wakes `run` so it can shut down.
    fn set_exception(&self, err: P2pError) {
        {
            let mut state = self.state.lock();
            if state.task_exception.is_some() {
                return;
            }
            debug!(error = %err, "recording task error");
            state.task_exception = Some(err);
        }
        self.changed.notify_waiters();
    }

    fn time_period(&self) -> Duration {
        self.state.lock().time_period
    }

    fn set_time_period(&self, time_period: Duration) {
        self.state.lock().time_period = time_period;
        self.changed.notify_waiters();
    }

    async fn wait_done(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            {
                let state = self.state.lock();
                if state.done || state.task_exception.is_some() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Common tail of `run`: stop everything and surface the first recorded
    /// error, if any.
    async fn finish(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            self.set_exception(e);
        }
        self.halt();
        self.peer_set.halt().await;
        let exception = self.state.lock().task_exception.take();
        match exception {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/******************************************************************************/

/// Publisher-side P2P manager: accepts subscribing peers and serves their
/// requests. The publisher is the data source, so it always advertises a
/// path to itself.
#[derive(Clone)]
pub struct PubP2pMgr {
    inner: Arc<PubMgrInner>,
}

struct PubMgrInner {
    shared: MgrShared,
    bookkeeper: PubBookkeeper,
    sndr: Arc<dyn P2pSndr>,
}

impl PubP2pMgr {
    /// Binds the peer server. No peers are handled until [PubP2pMgr::run].
    pub fn new(p2p_info: P2pInfo, sndr: Arc<dyn P2pSndr>) -> Result<PubP2pMgr> {
        validate(&p2p_info)?;
        let listener = bind_listener(&p2p_info)?;
        let lcl_addr = listener.local_addr()?;
        let inner = Arc::new_cyclic(|weak: &Weak<PubMgrInner>| {
            let mgr: Weak<dyn PeerSetMgr> = weak.clone();
            PubMgrInner {
                shared: MgrShared::new(p2p_info, lcl_addr, listener, PeerSet::new(mgr)),
                bookkeeper: PubBookkeeper::new(),
                sndr,
            }
        });
        Ok(PubP2pMgr { inner })
    }

    /// Executes the manager until [PubP2pMgr::halt] or a fatal error.
    /// Refuses to execute twice.
    pub async fn run(&self) -> Result<()> {
        let listener = match self.inner.shared.begin_run()? {
            Some(listener) => listener,
            None => return Ok(()),
        };
        info!(addr = %self.inner.shared.lcl_addr, "publisher P2P manager running");
        let result = select! {
            result = self.inner.clone().accept_loop(listener) => result,
            result = self.inner.clone().improve_loop() => result,
            _ = self.inner.shared.wait_done() => Ok(()),
        };
        self.inner.shared.finish(result).await
    }

    /// Stops execution. Idempotent; may be called before [PubP2pMgr::run],
    /// in which case the manager never executes.
    pub fn halt(&self) {
        debug!("halting publisher P2P manager");
        self.inner.shared.halt();
    }

    /// Notifies every peer about an available item.
    pub async fn notify(&self, note: NoteReq) {
        debug!(%note, "notifying peers");
        self.inner.shared.peer_set.notify(note).await;
    }

    /// Number of active peers.
    pub fn size(&self) -> usize {
        self.inner.shared.peer_set.size()
    }

    /// Address the peer server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.shared.lcl_addr
    }

    /// Sets the improver's evaluation window.
    pub fn set_time_period(&self, time_period: Duration) {
        self.inner.shared.set_time_period(time_period);
    }
}

impl PubMgrInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, rmt_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    let e = P2pError::from(e);
                    if !e.is_fatal() {
                        debug!(error = %e, "transient accept failure");
                        continue;
                    }
                    return Err(e);
                }
            };
            trace!(%rmt_addr, "accepted connection");
            let node: Arc<dyn PeerNode> = self.clone();
            match Peer::accept(stream, node, true).await {
                Ok(peer) => {
                    self.try_add(peer).await;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!(%rmt_addr, error = %e, "handshake failed"),
            }
        }
    }

    async fn improve_loop(self: Arc<Self>) -> Result<()> {
        improve_loop(&self.shared, || self.bookkeeper.reset_counts(), || {
            self.bookkeeper.worst_peer()
        })
        .await
    }

    async fn try_add(&self, peer: Peer) -> bool {
        let _membership = self.shared.membership.lock().await;
        let num_peers = self.shared.peer_set.size();
        if num_peers < self.shared.info.max_peers {
            self.install(peer)
        } else if num_peers > self.shared.info.max_peers {
            info!(peer = ?peer, "rejecting peer, the peer set is over-full");
            false
        } else {
            // the publisher admits every newcomer and drops its current
            // worst performer to make room
            match self.bookkeeper.worst_peer() {
                Some(worst) => {
                    self.evict(worst).await;
                    self.install(peer)
                }
                None => false,
            }
        }
    }

    /// Adds the peer everywhere. The membership lock must be held.
    fn install(&self, peer: Peer) -> bool {
        self.bookkeeper.add(&peer);
        if !self.shared.peer_set.insert(peer.clone(), true) {
            self.bookkeeper.erase(&peer);
            warn!(peer = ?peer, "a peer with this address is already present");
            return false;
        }
        info!(peer = ?peer, "added peer");
        self.shared.peer_set.activate(&peer);
        self.shared.changed.notify_waiters();
        true
    }

    /// Synchronously removes a peer to make room. The membership lock must
    /// be held; the peer's worker will find its entry already gone.
    async fn evict(&self, worst: Peer) {
        info!(peer = ?worst, "evicting peer");
        worst.halt().await;
        self.shared.peer_set.remove(&worst);
        self.remove_peer(&worst);
    }

    fn remove_peer(&self, peer: &Peer) {
        self.bookkeeper.erase(peer);
        self.shared.changed.notify_waiters();
    }
}

#[async_trait]
impl PeerSetMgr for PubMgrInner {
    async fn stopped(&self, peer: Peer) {
        let _membership = self.shared.membership.lock().await;
        if self.shared.is_done() || !self.bookkeeper.contains(&peer) {
            return;
        }
        debug!(peer = ?peer, "peer stopped");
        self.remove_peer(&peer);
    }

    fn task_failed(&self, err: P2pError) {
        self.shared.set_exception(err);
    }
}

#[async_trait]
impl NoticeRcvr for PubMgrInner {
    async fn recv_pub_path_notice(&self, pub_path: bool, peer: &Peer) {
        trace!(peer = ?peer, pub_path, "path status of remote changed");
    }

    async fn recv_prod_notice(&self, prod_index: ProdIndex, peer: &Peer) -> bool {
        warn!(peer = ?peer, %prod_index, "unexpected product notice at the publisher");
        peer.halt().await;
        false
    }

    async fn recv_seg_notice(&self, seg_id: DataSegId, peer: &Peer) -> bool {
        warn!(peer = ?peer, %seg_id, "unexpected segment notice at the publisher");
        peer.halt().await;
        false
    }
}

#[async_trait]
impl RequestRcvr for PubMgrInner {
    async fn recv_prod_request(&self, prod_index: ProdIndex, peer: &Peer) -> Option<ProdInfo> {
        trace!(peer = ?peer, %prod_index, "received product information request");
        let prod_info = self.sndr.get_prod_info(prod_index).await;
        match &prod_info {
            Some(_) => self.bookkeeper.responded(peer),
            None => debug!(%prod_index, "no information on requested product"),
        }
        prod_info
    }

    async fn recv_seg_request(&self, seg_id: DataSegId, peer: &Peer) -> Option<DataSeg> {
        trace!(peer = ?peer, %seg_id, "received data segment request");
        let data_seg = self.sndr.get_mem_seg(seg_id).await;
        match &data_seg {
            Some(_) => self.bookkeeper.responded(peer),
            None => debug!(%seg_id, "requested data segment is unavailable"),
        }
        data_seg
    }
}

#[async_trait]
impl DataRcvr for PubMgrInner {
    async fn recv_prod_info(&self, prod_info: ProdInfo, peer: &Peer) {
        warn!(peer = ?peer, %prod_info, "unexpected product information at the publisher");
        peer.halt().await;
    }

    async fn recv_data_seg(&self, data_seg: DataSeg, peer: &Peer) {
        warn!(peer = ?peer, %data_seg, "unexpected data segment at the publisher");
        peer.halt().await;
    }
}

/******************************************************************************/

/// Subscriber-side P2P manager: dials peer servers from a pool, accepts
/// inbound peers, keeps the set balanced between peers with and without a
/// path to the publisher, and backfills missed data through the overlay.
#[derive(Clone)]
pub struct SubP2pMgr {
    inner: Arc<SubMgrInner>,
}

struct SubMgrInner {
    shared: MgrShared,
    bookkeeper: SubBookkeeper,
    sub: Arc<dyn P2pSub>,
    server_pool: ServerPool,
    /// Whether this node currently has a path to the publisher, i.e. whether
    /// any of its peers does.
    lcl_path_to_pub: AtomicBool,
}

impl SubP2pMgr {
    /// Binds the peer server. No peers are handled until [SubP2pMgr::run].
    pub fn new(
        p2p_info: P2pInfo,
        server_pool: ServerPool,
        sub: Arc<dyn P2pSub>,
    ) -> Result<SubP2pMgr> {
        validate(&p2p_info)?;
        let listener = bind_listener(&p2p_info)?;
        let lcl_addr = listener.local_addr()?;
        let inner = Arc::new_cyclic(|weak: &Weak<SubMgrInner>| {
            let mgr: Weak<dyn PeerSetMgr> = weak.clone();
            SubMgrInner {
                shared: MgrShared::new(p2p_info, lcl_addr, listener, PeerSet::new(mgr)),
                bookkeeper: SubBookkeeper::new(),
                sub,
                server_pool,
                lcl_path_to_pub: AtomicBool::new(false),
            }
        });
        Ok(SubP2pMgr { inner })
    }

    /// Executes the manager until [SubP2pMgr::halt] or a fatal error.
    /// Refuses to execute twice.
    pub async fn run(&self) -> Result<()> {
        let listener = match self.inner.shared.begin_run()? {
            Some(listener) => listener,
            None => return Ok(()),
        };
        info!(addr = %self.inner.shared.lcl_addr, "subscriber P2P manager running");
        let result = select! {
            result = self.inner.clone().accept_loop(listener) => result,
            result = self.inner.clone().connect_loop() => result,
            result = self.inner.clone().improve_loop() => result,
            _ = self.inner.shared.wait_done() => Ok(()),
        };
        self.inner.shared.finish(result).await
    }

    /// Stops execution. Idempotent; may be called before [SubP2pMgr::run],
    /// in which case the manager never executes.
    pub fn halt(&self) {
        debug!("halting subscriber P2P manager");
        self.inner.shared.halt();
    }

    /// Notifies every peer about an available item, typically one that
    /// arrived via multicast.
    pub async fn notify(&self, note: NoteReq) {
        debug!(%note, "notifying peers");
        self.inner.shared.peer_set.notify(note).await;
    }

    /// Number of active peers.
    pub fn size(&self) -> usize {
        self.inner.shared.peer_set.size()
    }

    /// Address the peer server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.shared.lcl_addr
    }

    /// Sets the improver's evaluation window.
    pub fn set_time_period(&self, time_period: Duration) {
        self.inner.shared.set_time_period(time_period);
    }

    /// Whether this node currently has a path to the publisher.
    pub fn is_path_to_pub(&self) -> bool {
        self.inner.lcl_path_to_pub.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn bookkeeper(&self) -> &SubBookkeeper {
        &self.inner.bookkeeper
    }
}

impl SubMgrInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, rmt_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    let e = P2pError::from(e);
                    if !e.is_fatal() {
                        debug!(error = %e, "transient accept failure");
                        continue;
                    }
                    return Err(e);
                }
            };
            trace!(%rmt_addr, "accepted connection");
            let node: Arc<dyn PeerNode> = self.clone();
            let lcl_path = self.lcl_path_to_pub.load(Ordering::SeqCst);
            match Peer::accept(stream, node, lcl_path).await {
                Ok(peer) => {
                    if !self.try_add(peer.clone()).await {
                        // the remote stays available for a later attempt
                        self.server_pool.consider(peer.rmt_addr());
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!(%rmt_addr, error = %e, "handshake failed"),
            }
        }
    }

    /// Dials peer servers from the pool whenever there is room in the set.
    async fn connect_loop(self: Arc<Self>) -> Result<()> {
        loop {
            self.wait_to_connect().await;
            let srvr_addr = self.server_pool.pop().await;
            trace!(%srvr_addr, "connecting to peer server");
            let node: Arc<dyn PeerNode> = self.clone();
            let lcl_path = self.lcl_path_to_pub.load(Ordering::SeqCst);
            match Peer::connect(srvr_addr, node, lcl_path).await {
                Ok(peer) => {
                    if !self.try_add(peer).await {
                        self.server_pool.consider(srvr_addr);
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(%srvr_addr, error = %e, "couldn't connect to peer server");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                    self.server_pool.consider(srvr_addr);
                }
            }
        }
    }

    async fn wait_to_connect(&self) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            if self.shared.peer_set.size() < self.shared.info.max_peers || self.shared.is_done()
            {
                return;
            }
            notified.await;
        }
    }

    async fn improve_loop(self: Arc<Self>) -> Result<()> {
        improve_loop(&self.shared, || self.bookkeeper.reset_counts(), || {
            self.bookkeeper.worst_peer()
        })
        .await
    }

    async fn try_add(&self, peer: Peer) -> bool {
        let _membership = self.shared.membership.lock().await;
        let num_peers = self.shared.peer_set.size();
        if num_peers < self.shared.info.max_peers {
            self.install(peer).await
        } else if num_peers > self.shared.info.max_peers {
            info!(peer = ?peer, "rejecting peer, the peer set is over-full");
            false
        } else {
            self.try_replace(peer).await
        }
    }

    /// Admission at capacity: the newcomer is admitted iff doing so reduces
    /// the imbalance between peers with and without a path to the publisher,
    /// which means replacing the worst peer of the over-represented kind.
    async fn try_replace(&self, peer: Peer) -> bool {
        let rmt_is_path_to_pub = peer.is_path_to_pub();
        let (num_path, num_no_path) = self.bookkeeper.pub_path_counts();
        if (num_path < num_no_path) != rmt_is_path_to_pub {
            debug!(peer = ?peer, "rejecting peer, it would not improve the path balance");
            return false;
        }
        match self.bookkeeper.worst_peer_with_path(!rmt_is_path_to_pub) {
            Some(worst) => {
                self.evict(worst).await;
                self.install(peer).await
            }
            None => {
                debug!(peer = ?peer, "rejecting peer, no peer of the other kind to replace");
                false
            }
        }
    }

    /// Adds the peer everywhere. The membership lock must be held.
    async fn install(&self, peer: Peer) -> bool {
        self.bookkeeper.add(&peer);
        if !self.shared.peer_set.insert(peer.clone(), true) {
            self.bookkeeper.erase(&peer);
            warn!(peer = ?peer, "a peer with this address is already present");
            return false;
        }
        info!(peer = ?peer, path_to_pub = peer.is_path_to_pub(), "added peer");
        self.shared.peer_set.activate(&peer);
        self.shared.changed.notify_waiters();
        self.update_local_path_status(&peer).await;
        true
    }

    /// Synchronously removes a peer to make room. The membership lock must
    /// be held; the peer's worker will find its entry already gone.
    async fn evict(&self, worst: Peer) {
        info!(peer = ?worst, "evicting peer");
        worst.halt().await;
        self.shared.peer_set.remove(&worst);
        self.remove_peer(&worst).await;
    }

    async fn remove_peer(&self, peer: &Peer) {
        // the remote may come back, so its address returns to the pool
        self.server_pool.consider(peer.rmt_addr());
        self.reassign_pending(peer).await;
        self.bookkeeper.erase(peer);
        self.shared.changed.notify_waiters();
        self.update_local_path_status(peer).await;
    }

    /// Moves a dead peer's outstanding requests to the best peers that also
    /// announced the items. A request nobody else announced is dropped; some
    /// remote will notify about the item again eventually.
    async fn reassign_pending(&self, peer: &Peer) {
        for note in self.bookkeeper.take_requested(peer) {
            match self.bookkeeper.pop_best_alt(note) {
                Some(alt_peer) => {
                    if let Err(e) = alt_peer.request(note).await {
                        debug!(peer = ?alt_peer, %note, error = %e, "couldn't reassign request");
                        continue;
                    }
                    if let Err(e) = self.bookkeeper.requested(&alt_peer, note) {
                        debug!(%note, error = %e, "item was re-requested concurrently");
                        continue;
                    }
                    debug!(peer = ?alt_peer, %note, "reassigned outstanding request");
                }
                None => debug!(%note, "no alternate peer for outstanding request, dropping it"),
            }
        }
    }

    /// Re-derives this node's own path status from its peers and announces
    /// transitions to everyone except the peer that caused them.
    async fn update_local_path_status(&self, trigger: &Peer) {
        let (num_path, _) = self.bookkeeper.pub_path_counts();
        let has_path = num_path > 0;
        let had_path = self.lcl_path_to_pub.swap(has_path, Ordering::SeqCst);
        if has_path && !had_path {
            info!("gained a path to the publisher");
            self.shared.peer_set.got_path(trigger).await;
        } else if !has_path && had_path {
            info!("lost the path to the publisher");
            self.shared.peer_set.lost_path(trigger).await;
        }
    }
}

#[async_trait]
impl PeerSetMgr for SubMgrInner {
    async fn stopped(&self, peer: Peer) {
        let _membership = self.shared.membership.lock().await;
        if self.shared.is_done() || !self.bookkeeper.contains(&peer) {
            return;
        }
        debug!(peer = ?peer, "peer stopped");
        self.remove_peer(&peer).await;
    }

    fn task_failed(&self, err: P2pError) {
        self.shared.set_exception(err);
    }
}

#[async_trait]
impl NoticeRcvr for SubMgrInner {
    async fn recv_pub_path_notice(&self, pub_path: bool, peer: &Peer) {
        debug!(peer = ?peer, pub_path, "path status of remote changed");
        self.update_local_path_status(peer).await;
    }

    async fn recv_prod_notice(&self, prod_index: ProdIndex, peer: &Peer) -> bool {
        self.note_noticed(NoteReq::from(prod_index), peer).await
    }

    async fn recv_seg_notice(&self, seg_id: DataSegId, peer: &Peer) -> bool {
        self.note_noticed(NoteReq::from(seg_id), peer).await
    }
}

impl SubMgrInner {
    async fn note_noticed(&self, note: NoteReq, peer: &Peer) -> bool {
        trace!(peer = ?peer, %note, "received notice");
        if !self.bookkeeper.should_request(peer, note) {
            return false;
        }
        if !self.sub.should_request(note).await {
            return false;
        }
        match self.bookkeeper.requested(peer, note) {
            Ok(()) => true,
            Err(e) => {
                // another peer's notice won a concurrent race for the item
                debug!(%note, error = %e, "not requesting");
                false
            }
        }
    }
}

#[async_trait]
impl RequestRcvr for SubMgrInner {
    async fn recv_prod_request(&self, prod_index: ProdIndex, peer: &Peer) -> Option<ProdInfo> {
        trace!(peer = ?peer, %prod_index, "received product information request");
        self.sub.get_prod_info(prod_index).await
    }

    async fn recv_seg_request(&self, seg_id: DataSegId, peer: &Peer) -> Option<DataSeg> {
        trace!(peer = ?peer, %seg_id, "received data segment request");
        self.sub.get_mem_seg(seg_id).await
    }
}

#[async_trait]
impl DataRcvr for SubMgrInner {
    async fn recv_prod_info(&self, prod_info: ProdInfo, peer: &Peer) {
        let note = NoteReq::from(prod_info.prod_index);
        if !self.bookkeeper.received(peer, note) {
            warn!(peer = ?peer, %note, "received data that was not requested from this peer");
            return;
        }
        if !self.sub.here_is_prod_info(&prod_info).await {
            trace!(%note, "data was already present");
            return;
        }
        self.bookkeeper.credit(peer);
        self.shared.peer_set.notify_except(note, peer).await;
    }

    async fn recv_data_seg(&self, data_seg: DataSeg, peer: &Peer) {
        let note = NoteReq::from(data_seg.id);
        if !self.bookkeeper.received(peer, note) {
            warn!(peer = ?peer, %note, "received data that was not requested from this peer");
            return;
        }
        if !self.sub.here_is_data_seg(&data_seg).await {
            trace!(%note, "data was already present");
            return;
        }
        self.bookkeeper.credit(peer);
        self.shared.peer_set.notify_except(note, peer).await;
    }
}

/// The improver: whenever the evaluation window elapses with a full peer set
/// and no change in its composition, the worst-performing peer is halted.
/// Any change in composition, and any window that ends with a non-full set,
/// restarts the evaluation with fresh counters.
async fn improve_loop(
    shared: &MgrShared,
    reset_counts: impl Fn(),
    worst_peer: impl Fn() -> Option<Peer>,
) -> Result<()> {
    if shared.info.max_peers <= 1 {
        std::future::pending::<()>().await;
    }
    loop {
        let woken = {
            let notified = shared.changed.notified();
            timeout(shared.time_period(), notified).await.is_ok()
        };
        if shared.is_done() {
            return Ok(());
        }
        if woken || shared.peer_set.size() < shared.info.max_peers {
            reset_counts();
            continue;
        }
        if let Some(worst) = worst_peer() {
            info!(peer = ?worst, "halting worst-performing peer");
            worst.halt().await;
        }
    }
}
