//! Helpers shared by the unit tests: in-memory nodes and repositories, plus
//! loopback sockets and hand-driven remote endpoints for protocol tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use crate::p2p::node::{DataRcvr, NoticeRcvr, P2pSndr, P2pSub, PeerNode, RequestRcvr};
use crate::p2p::peer::Peer;
use crate::protocol::codec::{FrameReader, FrameWriter, PduId, MAX_PDU_PAYLOAD};
use crate::protocol::types::{DataSeg, DataSegId, NoteReq, ProdIndex, ProdInfo};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Distinct, stable socket addresses for tests that only need keys.
pub fn test_sock_addr(n: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40_000 + n))
}

/// A connected pair of loopback TCP streams.
pub async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let srvr_addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(
        async { TcpStream::connect(srvr_addr).await.unwrap() },
        async { listener.accept().await.unwrap() },
    );
    (client, accepted.0)
}

/// A connected pair of peers. `path_a` is what the `a` side advertises, so
/// the returned `b`-side peer reports it, and vice versa.
pub async fn peer_pair(
    node_a: Arc<TestNode>,
    node_b: Arc<TestNode>,
    path_a: bool,
    path_b: bool,
) -> (Peer, Peer) {
    let (stream_a, stream_b) = socket_pair().await;
    let (peer_a, peer_b) = tokio::join!(
        Peer::accept(stream_a, node_a, path_a),
        Peer::accept(stream_b, node_b, path_b),
    );
    (peer_a.unwrap(), peer_b.unwrap())
}

/// A peer whose remote end is driven by hand: returns the peer plus the raw
/// codec halves of the remote side, with the handshake already done.
pub async fn raw_remote(
    node: Arc<TestNode>,
    lcl_path: bool,
    rmt_path: bool,
) -> (Peer, FrameReader, FrameWriter) {
    let (stream_peer, stream_raw) = socket_pair().await;
    let (rd, wr) = stream_raw.into_split();
    let mut reader = FrameReader::new(rd, MAX_PDU_PAYLOAD);
    let mut writer = FrameWriter::new(wr);

    let (peer, _) = tokio::join!(Peer::accept(stream_peer, node, lcl_path), async {
        writer
            .send(PduId::PubPathNotice, &[rmt_path as u8])
            .await
            .unwrap();
        let (pdu_id, _) = reader.read_frame().await.unwrap().expect("handshake");
        assert_eq!(pdu_id, u8::from(PduId::PubPathNotice));
    });
    (peer.unwrap(), reader, writer)
}

/// Polls a condition until it holds, panicking after a generous limit.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    timeout(WAIT_LIMIT, async {
        loop {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// A remote endpoint driven frame by frame from the test body.
pub struct ScriptedRemote {
    reader: FrameReader,
    writer: FrameWriter,
}

impl ScriptedRemote {
    /// Connects to a peer server and completes the handshake.
    pub async fn connect(srvr_addr: SocketAddr, pub_path: bool) -> ScriptedRemote {
        let stream = TcpStream::connect(srvr_addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        let (rd, wr) = stream.into_split();
        let mut reader = FrameReader::new(rd, MAX_PDU_PAYLOAD);
        let mut writer = FrameWriter::new(wr);

        writer
            .send(PduId::PubPathNotice, &[pub_path as u8])
            .await
            .unwrap();
        let (pdu_id, _) = reader.read_frame().await.unwrap().expect("handshake");
        assert_eq!(pdu_id, u8::from(PduId::PubPathNotice));
        ScriptedRemote { reader, writer }
    }

    pub async fn send(&mut self, pdu_id: PduId, payload: &[u8]) {
        self.writer.send(pdu_id, payload).await.unwrap();
    }

    /// Next frame, or `None` once the peer hung up.
    pub async fn recv(&mut self) -> Option<(u8, bytes::BytesMut)> {
        timeout(WAIT_LIMIT, self.reader.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Node-side handler that records everything it receives and can serve
/// canned data.
pub struct TestNode {
    want_notices: AtomicBool,
    state: Mutex<TestNodeState>,
    changed: Notify,
}

#[derive(Clone, Default)]
pub struct TestNodeState {
    pub serve_prod_info: Option<ProdInfo>,
    pub serve_data_seg: Option<DataSeg>,
    pub pub_path_notices: Vec<bool>,
    pub prod_notices: Vec<ProdIndex>,
    pub seg_notices: Vec<DataSegId>,
    pub prod_requests: Vec<ProdIndex>,
    pub seg_requests: Vec<DataSegId>,
    pub prod_infos: Vec<ProdInfo>,
    pub data_segs: Vec<DataSeg>,
}

impl TestNode {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<TestNode> {
        Arc::new(TestNode {
            want_notices: AtomicBool::new(false),
            state: Mutex::new(TestNodeState::default()),
            changed: Notify::new(),
        })
    }

    /// Whether notices are answered with "request it".
    pub fn set_want_notices(&self, want: bool) {
        self.want_notices.store(want, Ordering::SeqCst);
    }

    /// Canned answers for incoming requests.
    pub fn serve(&self, prod_info: Option<ProdInfo>, data_seg: Option<DataSeg>) {
        let mut state = self.state.lock();
        state.serve_prod_info = prod_info;
        state.serve_data_seg = data_seg;
    }

    pub fn received(&self) -> TestNodeState {
        self.state.lock().clone()
    }

    pub async fn wait_until(&self, pred: impl Fn(&TestNodeState) -> bool) {
        timeout(WAIT_LIMIT, async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                if pred(&self.state.lock()) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("condition was not reached in time");
    }

    fn update(&self, f: impl FnOnce(&mut TestNodeState)) {
        f(&mut self.state.lock());
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl NoticeRcvr for TestNode {
    async fn recv_pub_path_notice(&self, pub_path: bool, _peer: &Peer) {
        self.update(|s| s.pub_path_notices.push(pub_path));
    }

    async fn recv_prod_notice(&self, prod_index: ProdIndex, _peer: &Peer) -> bool {
        self.update(|s| s.prod_notices.push(prod_index));
        self.want_notices.load(Ordering::SeqCst)
    }

    async fn recv_seg_notice(&self, seg_id: DataSegId, _peer: &Peer) -> bool {
        self.update(|s| s.seg_notices.push(seg_id));
        self.want_notices.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestRcvr for TestNode {
    async fn recv_prod_request(&self, prod_index: ProdIndex, _peer: &Peer) -> Option<ProdInfo> {
        let mut served = None;
        self.update(|s| {
            s.prod_requests.push(prod_index);
            served = s.serve_prod_info.clone();
        });
        served
    }

    async fn recv_seg_request(&self, seg_id: DataSegId, _peer: &Peer) -> Option<DataSeg> {
        let mut served = None;
        self.update(|s| {
            s.seg_requests.push(seg_id);
            served = s.serve_data_seg.clone();
        });
        served
    }
}

#[async_trait]
impl DataRcvr for TestNode {
    async fn recv_prod_info(&self, prod_info: ProdInfo, _peer: &Peer) {
        self.update(|s| s.prod_infos.push(prod_info));
    }

    async fn recv_data_seg(&self, data_seg: DataSeg, _peer: &Peer) {
        self.update(|s| s.data_segs.push(data_seg));
    }
}

// TestNode implements all three receiver traits, so it is a PeerNode; this
// keeps it that way if a trait gains a method.
const _: fn() = || {
    fn assert_peer_node<T: PeerNode>() {}
    assert_peer_node::<TestNode>();
};

/// In-memory stand-in for the repository behind [P2pSndr] and [P2pSub].
pub struct TestRepo {
    state: Mutex<TestRepoState>,
    changed: Notify,
}

#[derive(Default)]
pub struct TestRepoState {
    pub prod_infos: FxHashMap<ProdIndex, ProdInfo>,
    pub data_segs: FxHashMap<DataSegId, DataSeg>,
}

impl TestRepo {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<TestRepo> {
        Arc::new(TestRepo {
            state: Mutex::new(TestRepoState::default()),
            changed: Notify::new(),
        })
    }

    pub fn insert_prod_info(&self, prod_info: ProdInfo) {
        self.state
            .lock()
            .prod_infos
            .insert(prod_info.prod_index, prod_info);
        self.changed.notify_waiters();
    }

    pub fn insert_data_seg(&self, data_seg: DataSeg) {
        self.state.lock().data_segs.insert(data_seg.id, data_seg);
        self.changed.notify_waiters();
    }

    pub fn prod_info(&self, prod_index: ProdIndex) -> Option<ProdInfo> {
        self.state.lock().prod_infos.get(&prod_index).cloned()
    }

    pub fn data_seg(&self, seg_id: DataSegId) -> Option<DataSeg> {
        self.state.lock().data_segs.get(&seg_id).cloned()
    }

    pub async fn wait_until(&self, pred: impl Fn(&TestRepoState) -> bool) {
        timeout(WAIT_LIMIT, async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                if pred(&self.state.lock()) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("condition was not reached in time");
    }
}

#[async_trait]
impl P2pSndr for TestRepo {
    async fn get_prod_info(&self, prod_index: ProdIndex) -> Option<ProdInfo> {
        self.prod_info(prod_index)
    }

    async fn get_mem_seg(&self, seg_id: DataSegId) -> Option<DataSeg> {
        self.data_seg(seg_id)
    }
}

#[async_trait]
impl P2pSub for TestRepo {
    async fn should_request(&self, note: NoteReq) -> bool {
        let state = self.state.lock();
        match note {
            NoteReq::Prod(prod_index) => !state.prod_infos.contains_key(&prod_index),
            NoteReq::Seg(seg_id) => !state.data_segs.contains_key(&seg_id),
        }
    }

    async fn here_is_prod_info(&self, prod_info: &ProdInfo) -> bool {
        let is_new = {
            let mut state = self.state.lock();
            state
                .prod_infos
                .insert(prod_info.prod_index, prod_info.clone())
                .is_none()
        };
        self.changed.notify_waiters();
        is_new
    }

    async fn here_is_data_seg(&self, data_seg: &DataSeg) -> bool {
        let is_new = {
            let mut state = self.state.lock();
            state
                .data_segs
                .insert(data_seg.id, data_seg.clone())
                .is_none()
        };
        self.changed.notify_waiters();
        is_new
    }
}
