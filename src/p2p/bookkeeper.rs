//! Per-peer performance tracking and the outstanding-request ledger.
//!
//! Both managers keep a bookkeeper so the improver loop can pick an eviction
//! victim: the publisher scores a peer by how many requests it answered for
//! it, a subscriber by how many useful chunks the peer delivered. The
//! subscriber variant additionally tracks which peer each outstanding request
//! was sent to, which gives global request deduplication and a pool of
//! alternate peers to fall back on when a peer dies.

use std::cmp::Reverse;
use std::net::SocketAddr;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{P2pError, Result};
use crate::p2p::peer::Peer;
use crate::protocol::types::NoteReq;

/// Publisher-side bookkeeper. Scores peers by the number of requests this
/// node has answered for them.
pub struct PubBookkeeper {
    state: Mutex<PubState>,
}

#[derive(Default)]
struct PubState {
    peers: FxHashMap<SocketAddr, PubEntry>,
    next_rank: u64,
}

struct PubEntry {
    peer: Peer,
    responded_count: u64,
    rank: u64,
}

impl PubBookkeeper {
    pub fn new() -> PubBookkeeper {
        PubBookkeeper {
            state: Mutex::new(PubState::default()),
        }
    }

    pub fn add(&self, peer: &Peer) {
        let mut state = self.state.lock();
        let rank = state.next_rank;
        state.next_rank += 1;
        state.peers.insert(
            peer.rmt_addr(),
            PubEntry {
                peer: peer.clone(),
                responded_count: 0,
                rank,
            },
        );
    }

    pub fn erase(&self, peer: &Peer) {
        self.state.lock().peers.remove(&peer.rmt_addr());
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        matches!(
            self.state.lock().peers.get(&peer.rmt_addr()),
            Some(entry) if entry.peer == *peer
        )
    }

    /// Records that a request from this peer was answered.
    pub fn responded(&self, peer: &Peer) {
        if let Some(entry) = self.state.lock().peers.get_mut(&peer.rmt_addr()) {
            entry.responded_count += 1;
        }
    }

    pub fn reset_counts(&self) {
        for entry in self.state.lock().peers.values_mut() {
            entry.responded_count = 0;
        }
    }

    /// The peer with the fewest answered requests since the last reset, ties
    /// broken by oldest insertion.
    pub fn worst_peer(&self) -> Option<Peer> {
        let state = self.state.lock();
        state
            .peers
            .values()
            .min_by_key(|entry| (entry.responded_count, entry.rank))
            .map(|entry| entry.peer.clone())
    }
}

/// Subscriber-side bookkeeper. Scores peers by delivered chunks and owns the
/// outstanding-request ledger.
pub struct SubBookkeeper {
    state: Mutex<SubState>,
}

#[derive(Default)]
struct SubState {
    peers: FxHashMap<SocketAddr, SubEntry>,
    /// Which peer each outstanding request was sent to. At most one peer per
    /// item at any time.
    pending: FxHashMap<NoteReq, SocketAddr>,
    /// Peers that notified about an item that is pending on some other peer,
    /// in notification order.
    alts: FxHashMap<NoteReq, Vec<SocketAddr>>,
    next_rank: u64,
}

struct SubEntry {
    peer: Peer,
    chunk_count: u64,
    requested: FxHashSet<NoteReq>,
    rank: u64,
}

impl SubBookkeeper {
    pub fn new() -> SubBookkeeper {
        SubBookkeeper {
            state: Mutex::new(SubState::default()),
        }
    }

    pub fn add(&self, peer: &Peer) {
        let mut state = self.state.lock();
        let rank = state.next_rank;
        state.next_rank += 1;
        state.peers.insert(
            peer.rmt_addr(),
            SubEntry {
                peer: peer.clone(),
                chunk_count: 0,
                requested: FxHashSet::default(),
                rank,
            },
        );
    }

    /// Removes the peer and everything it occurs in. Outstanding requests
    /// that should survive the peer must be drained with [take_requested]
    /// first.
    ///
    /// [take_requested]: SubBookkeeper::take_requested
    pub fn erase(&self, peer: &Peer) {
        let mut state = self.state.lock();
        let addr = peer.rmt_addr();
        if let Some(entry) = state.peers.remove(&addr) {
            for note in &entry.requested {
                state.pending.remove(note);
            }
        }
        for alt_list in state.alts.values_mut() {
            alt_list.retain(|a| *a != addr);
        }
        state.alts.retain(|_, alt_list| !alt_list.is_empty());
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        matches!(
            self.state.lock().peers.get(&peer.rmt_addr()),
            Some(entry) if entry.peer == *peer
        )
    }

    /// Whether a request for this item should go to this peer. `false` when
    /// the item is already pending on some peer; the notifying peer is then
    /// remembered as an alternate holder of the item.
    pub fn should_request(&self, peer: &Peer, note: NoteReq) -> bool {
        let mut state = self.state.lock();
        let addr = peer.rmt_addr();
        match state.pending.get(&note) {
            None => true,
            Some(owner) => {
                if *owner != addr {
                    let alt_list = state.alts.entry(note).or_default();
                    if !alt_list.contains(&addr) {
                        alt_list.push(addr);
                    }
                }
                false
            }
        }
    }

    /// Records that a request for this item was sent to this peer. Fails if
    /// any peer already has the item pending.
    pub fn requested(&self, peer: &Peer, note: NoteReq) -> Result<()> {
        let mut state = self.state.lock();
        let addr = peer.rmt_addr();
        if let Some(owner) = state.pending.get(&note) {
            return Err(P2pError::Logic(format!(
                "{} was already requested from {}",
                note, owner
            )));
        }
        state.pending.insert(note, addr);
        if let Some(entry) = state.peers.get_mut(&addr) {
            entry.requested.insert(note);
        }
        Ok(())
    }

    /// Clears the pending entry for a received item. Returns `false` if the
    /// item was not pending on this peer, in which case nothing changes.
    pub fn received(&self, peer: &Peer, note: NoteReq) -> bool {
        let mut state = self.state.lock();
        let addr = peer.rmt_addr();
        if state.pending.get(&note) != Some(&addr) {
            return false;
        }
        state.pending.remove(&note);
        state.alts.remove(&note);
        if let Some(entry) = state.peers.get_mut(&addr) {
            entry.requested.remove(&note);
        }
        true
    }

    /// Credits the peer with one useful chunk.
    pub fn credit(&self, peer: &Peer) {
        if let Some(entry) = self.state.lock().peers.get_mut(&peer.rmt_addr()) {
            entry.chunk_count += 1;
        }
    }

    /// Drains the peer's outstanding requests, clearing them from the ledger
    /// so they can be reassigned.
    pub fn take_requested(&self, peer: &Peer) -> Vec<NoteReq> {
        let mut state = self.state.lock();
        let addr = peer.rmt_addr();
        let notes = match state.peers.get_mut(&addr) {
            Some(entry) => entry.requested.drain().collect::<Vec<_>>(),
            None => return Vec::new(),
        };
        for note in &notes {
            if state.pending.get(note) == Some(&addr) {
                state.pending.remove(note);
            }
        }
        notes
    }

    /// Picks the best remaining alternate holder of the item: among the peers
    /// that notified about it but were not asked, the one with the highest
    /// chunk count. The returned peer leaves the alternate list.
    pub fn pop_best_alt(&self, note: NoteReq) -> Option<Peer> {
        let mut state = self.state.lock();

        let best_addr = {
            let alt_list = state.alts.get(&note)?;
            alt_list
                .iter()
                .filter_map(|addr| state.peers.get(addr))
                .max_by_key(|entry| (entry.chunk_count, Reverse(entry.rank)))
                .map(|entry| entry.peer.rmt_addr())?
        };

        if let Some(alt_list) = state.alts.get_mut(&note) {
            alt_list.retain(|a| *a != best_addr);
            if alt_list.is_empty() {
                state.alts.remove(&note);
            }
        }
        state
            .peers
            .get(&best_addr)
            .map(|entry| entry.peer.clone())
    }

    #[cfg(test)]
    pub(crate) fn alt_count(&self, note: NoteReq) -> usize {
        self.state
            .lock()
            .alts
            .get(&note)
            .map_or(0, |alt_list| alt_list.len())
    }

    /// Number of peers whose remote advertises a path to the publisher, and
    /// number whose remote does not.
    pub fn pub_path_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        let with_path = state
            .peers
            .values()
            .filter(|entry| entry.peer.is_path_to_pub())
            .count();
        (with_path, state.peers.len() - with_path)
    }

    pub fn reset_counts(&self) {
        for entry in self.state.lock().peers.values_mut() {
            entry.chunk_count = 0;
        }
    }

    /// The peer with the fewest useful chunks since the last reset, ties
    /// broken by oldest insertion.
    pub fn worst_peer(&self) -> Option<Peer> {
        let state = self.state.lock();
        state
            .peers
            .values()
            .min_by_key(|entry| (entry.chunk_count, entry.rank))
            .map(|entry| entry.peer.clone())
    }

    /// Like [worst_peer], restricted to peers whose remote path-to-publisher
    /// flag equals `rmt_is_path_to_pub`.
    ///
    /// [worst_peer]: SubBookkeeper::worst_peer
    pub fn worst_peer_with_path(&self, rmt_is_path_to_pub: bool) -> Option<Peer> {
        let state = self.state.lock();
        state
            .peers
            .values()
            .filter(|entry| entry.peer.is_path_to_pub() == rmt_is_path_to_pub)
            .min_by_key(|entry| (entry.chunk_count, entry.rank))
            .map(|entry| entry.peer.clone())
    }
}
