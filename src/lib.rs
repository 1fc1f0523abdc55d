//! Hycast delivers large, numbered data products from one publisher to many
//! subscribers over a multicast firehose, with a peer-to-peer overlay that
//! backfills whatever multicast dropped. This crate is that overlay: the
//! peer protocol, the concurrent peer set, the per-peer bookkeeping, and the
//! publisher / subscriber managers that grow, balance, and prune the mesh.
//!
//! Products are identified by a [ProdIndex] and chopped into fixed-size
//! segments ([DataSeg]); peers exchange three PDU families over one TCP
//! connection each: notices advertise availability, requests ask for an
//! item, and data delivers it. The managers plug into the surrounding node
//! through small capability traits ([P2pSndr], [P2pSub]) so the overlay
//! never touches the repository or the multicast receiver directly.
//!
//! [ProdIndex]: protocol::types::ProdIndex
//! [DataSeg]: protocol::types::DataSeg
//! [P2pSndr]: p2p::node::P2pSndr
//! [P2pSub]: p2p::node::P2pSub

pub mod error;
pub mod p2p;
pub mod protocol;

#[cfg(test)]
pub mod test_util;
