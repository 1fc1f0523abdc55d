//! Capability interfaces between the P2P core and the node that embeds it.
//!
//! The receiver traits are implemented by the P2P managers themselves and
//! drive the per-peer protocol loop; [P2pSndr] and [P2pSub] are implemented
//! by the surrounding node (typically backed by the product repository).

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::P2pError;
use crate::p2p::peer::Peer;
use crate::protocol::types::{DataSeg, DataSegId, NoteReq, ProdIndex, ProdInfo};

/// Receiver of notices from a remote peer.
#[async_trait]
pub trait NoticeRcvr: Send + Sync + 'static {
    /// The remote's path-to-publisher status changed. The peer's own path
    /// flag is updated before this is called.
    async fn recv_pub_path_notice(&self, pub_path: bool, peer: &Peer);

    /// A product became available at the remote. Returning `true` makes the
    /// peer request the product information.
    async fn recv_prod_notice(&self, prod_index: ProdIndex, peer: &Peer) -> bool;

    /// A data segment became available at the remote. Returning `true` makes
    /// the peer request the segment.
    async fn recv_seg_notice(&self, seg_id: DataSegId, peer: &Peer) -> bool;
}

/// Receiver of requests from a remote peer. A `Some` return is sent back as
/// the corresponding data PDU; `None` means the item is unavailable and
/// nothing is sent.
#[async_trait]
pub trait RequestRcvr: Send + Sync + 'static {
    async fn recv_prod_request(&self, prod_index: ProdIndex, peer: &Peer) -> Option<ProdInfo>;

    async fn recv_seg_request(&self, seg_id: DataSegId, peer: &Peer) -> Option<DataSeg>;
}

/// Receiver of data from a remote peer.
#[async_trait]
pub trait DataRcvr: Send + Sync + 'static {
    async fn recv_prod_info(&self, prod_info: ProdInfo, peer: &Peer);

    async fn recv_data_seg(&self, data_seg: DataSeg, peer: &Peer);
}

/// Everything a peer needs from its node.
pub trait PeerNode: NoticeRcvr + RequestRcvr + DataRcvr {}

impl<T: NoticeRcvr + RequestRcvr + DataRcvr> PeerNode for T {}

/// Source of data for remote peers. On the publisher this is backed by the
/// repository; on a subscriber, by whatever the node has already received.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait P2pSndr: Send + Sync + 'static {
    async fn get_prod_info(&self, prod_index: ProdIndex) -> Option<ProdInfo>;

    async fn get_mem_seg(&self, seg_id: DataSegId) -> Option<DataSeg>;
}

/// Subscriber-side sink. A subscribing node both consumes data from the
/// overlay and serves it onward, hence the [P2pSndr] supertrait.
#[async_trait]
pub trait P2pSub: P2pSndr {
    /// Whether the item is still wanted. `false` typically means the
    /// repository already has it, for example via multicast.
    async fn should_request(&self, note: NoteReq) -> bool;

    /// Delivers product information received from a peer. Returns `true` if
    /// it was new and stored.
    async fn here_is_prod_info(&self, prod_info: &ProdInfo) -> bool;

    /// Delivers a data segment received from a peer. Returns `true` if it
    /// was new and stored.
    async fn here_is_data_seg(&self, data_seg: &DataSeg) -> bool;
}

/// Callback interface through which the peer set reports worker terminations
/// to the owning manager.
#[async_trait]
pub trait PeerSetMgr: Send + Sync + 'static {
    /// The peer's worker has returned and its entry has left the set.
    async fn stopped(&self, peer: Peer);

    /// The peer's worker terminated with an error the peer level could not
    /// absorb.
    fn task_failed(&self, err: P2pError);
}
