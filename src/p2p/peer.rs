use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::error::{P2pError, Result};
use crate::p2p::node::PeerNode;
use crate::protocol::codec::{try_get_bool, FrameReader, FrameWriter, PduId, MAX_PDU_PAYLOAD};
use crate::protocol::types::{DataSeg, DataSegId, NoteReq, ProdIndex, ProdInfo};

/// The local endpoint of one bidirectional protocol session with a remote
/// node. Cheap to clone; all clones share the underlying connection.
///
/// A peer is constructed by [Peer::accept] or [Peer::connect], both of which
/// run the handshake: each side sends a path-to-publisher notice and reads
/// the remote's, so [Peer::is_path_to_pub] is meaningful from the start.
/// [Peer::run] then drives the receive loop until the connection ends or
/// [Peer::halt] is called.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    rmt_addr: SocketAddr,
    lcl_addr: SocketAddr,
    node: Arc<dyn PeerNode>,
    rmt_path_to_pub: AtomicBool,
    halted: AtomicBool,
    running: AtomicBool,
    halt_notify: Notify,
    writer: tokio::sync::Mutex<FrameWriter>,
    reader: Mutex<Option<FrameReader>>,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{{}}}", self.inner.rmt_addr)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Peer {}

impl Peer {
    /// Server-side construction from an accepted connection.
    pub async fn accept(
        stream: TcpStream,
        node: Arc<dyn PeerNode>,
        lcl_path_to_pub: bool,
    ) -> Result<Peer> {
        Self::handshake(stream, node, lcl_path_to_pub).await
    }

    /// Client-side construction: connects to a remote peer server.
    pub async fn connect(
        rmt_srvr_addr: SocketAddr,
        node: Arc<dyn PeerNode>,
        lcl_path_to_pub: bool,
    ) -> Result<Peer> {
        let stream = TcpStream::connect(rmt_srvr_addr).await?;
        Self::handshake(stream, node, lcl_path_to_pub).await
    }

    async fn handshake(
        stream: TcpStream,
        node: Arc<dyn PeerNode>,
        lcl_path_to_pub: bool,
    ) -> Result<Peer> {
        stream.set_nodelay(true)?;
        let rmt_addr = stream.peer_addr()?;
        let lcl_addr = stream.local_addr()?;
        let (rd, wr) = stream.into_split();
        let mut writer = FrameWriter::new(wr);
        let mut reader = FrameReader::new(rd, MAX_PDU_PAYLOAD);

        writer
            .send(PduId::PubPathNotice, &[lcl_path_to_pub as u8])
            .await?;

        let (pdu_id, payload) = reader.read_frame().await?.ok_or_else(|| {
            P2pError::Protocol("connection closed during handshake".to_string())
        })?;
        if pdu_id != u8::from(PduId::PubPathNotice) {
            return Err(P2pError::Protocol(format!(
                "expected a path-to-publisher notice during handshake, got PDU {}",
                pdu_id
            )));
        }
        let mut payload = payload.freeze();
        let rmt_path_to_pub = try_get_bool(&mut payload)?;
        if payload.has_remaining() {
            return Err(P2pError::Protocol(
                "trailing bytes in handshake notice".to_string(),
            ));
        }
        trace!(%rmt_addr, rmt_path_to_pub, "handshake complete");

        Ok(Peer {
            inner: Arc::new(PeerInner {
                rmt_addr,
                lcl_addr,
                node,
                rmt_path_to_pub: AtomicBool::new(rmt_path_to_pub),
                halted: AtomicBool::new(false),
                running: AtomicBool::new(false),
                halt_notify: Notify::new(),
                writer: tokio::sync::Mutex::new(writer),
                reader: Mutex::new(Some(reader)),
            }),
        })
    }

    /// Socket address of the remote endpoint. Stable for the lifetime of the
    /// peer and used as its key in all bookkeeping structures.
    pub fn rmt_addr(&self) -> SocketAddr {
        self.inner.rmt_addr
    }

    pub fn lcl_addr(&self) -> SocketAddr {
        self.inner.lcl_addr
    }

    /// Whether the remote node advertises a path to the publisher.
    pub fn is_path_to_pub(&self) -> bool {
        self.inner.rmt_path_to_pub.load(Ordering::SeqCst)
    }

    /// Notifies the remote of an available item.
    pub async fn notify(&self, note: NoteReq) -> Result<()> {
        let mut buf = BytesMut::new();
        let pdu_id = match note {
            NoteReq::Prod(prod_index) => {
                prod_index.ser(&mut buf);
                PduId::ProdInfoNotice
            }
            NoteReq::Seg(seg_id) => {
                seg_id.ser(&mut buf);
                PduId::DataSegNotice
            }
        };
        self.send_frame(pdu_id, &buf).await
    }

    /// Requests an item from the remote.
    pub async fn request(&self, note: NoteReq) -> Result<()> {
        let mut buf = BytesMut::new();
        let pdu_id = match note {
            NoteReq::Prod(prod_index) => {
                prod_index.ser(&mut buf);
                PduId::ProdInfoRequest
            }
            NoteReq::Seg(seg_id) => {
                seg_id.ser(&mut buf);
                PduId::DataSegRequest
            }
        };
        self.send_frame(pdu_id, &buf).await
    }

    /// Tells the remote whether this side has a path to the publisher.
    pub async fn send_pub_path(&self, pub_path: bool) -> Result<()> {
        self.send_frame(PduId::PubPathNotice, &[pub_path as u8])
            .await
    }

    pub async fn send_prod_info(&self, prod_info: &ProdInfo) -> Result<()> {
        let mut buf = BytesMut::new();
        prod_info.ser(&mut buf)?;
        self.send_frame(PduId::ProdInfo, &buf).await
    }

    pub async fn send_data_seg(&self, data_seg: &DataSeg) -> Result<()> {
        let mut buf = BytesMut::new();
        data_seg.ser(&mut buf);
        self.send_frame(PduId::DataSeg, &buf).await
    }

    async fn send_frame(&self, pdu_id: PduId, payload: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        writer.send(pdu_id, payload).await
    }

    /// Receives and dispatches PDUs until the connection ends.
    ///
    /// Returns `Ok` when the peer was halted, the remote hung up, the network
    /// failed transiently, or the remote violated the protocol; the last two
    /// are logged and the connection is closed either way. Only errors the
    /// manager must act on are returned.
    pub async fn run(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(P2pError::Logic(
                "the peer's receive loop was already started".to_string(),
            ));
        }
        let mut reader = self
            .inner
            .reader
            .lock()
            .take()
            .ok_or_else(|| P2pError::Logic("the peer's reader is gone".to_string()))?;

        let halted = self.inner.halt_notify.notified();
        tokio::pin!(halted);

        let result = if self.inner.halted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            select! {
                _ = &mut halted => Ok(()),
                result = self.read_loop(&mut reader) => result,
            }
        };

        let result = match result {
            Err(e) if e.is_transient() => {
                info!(peer = ?self, error = %e, "peer is offline");
                Ok(())
            }
            Err(P2pError::Protocol(msg)) => {
                warn!(peer = ?self, "closing connection: {}", msg);
                Ok(())
            }
            other => other,
        };

        self.halt().await;
        result
    }

    async fn read_loop(&self, reader: &mut FrameReader) -> Result<()> {
        loop {
            match reader.read_frame().await? {
                Some((pdu_id, payload)) => self.dispatch(pdu_id, payload).await?,
                None => {
                    debug!(peer = ?self, "remote closed the connection");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, pdu_id: u8, payload: BytesMut) -> Result<()> {
        let pdu_id = PduId::try_from(pdu_id)
            .map_err(|_| P2pError::Protocol(format!("unknown PDU id {}", pdu_id)))?;
        trace!(peer = ?self, ?pdu_id, len = payload.len(), "received PDU");

        let mut buf = payload.freeze();
        let node = &self.inner.node;
        match pdu_id {
            PduId::PubPathNotice => {
                let pub_path = try_get_bool(&mut buf)?;
                self.check_drained(&buf)?;
                self.inner
                    .rmt_path_to_pub
                    .store(pub_path, Ordering::SeqCst);
                node.recv_pub_path_notice(pub_path, self).await;
            }
            PduId::ProdInfoNotice => {
                let prod_index = ProdIndex::try_deser(&mut buf)?;
                self.check_drained(&buf)?;
                if node.recv_prod_notice(prod_index, self).await {
                    self.request(NoteReq::Prod(prod_index)).await?;
                }
            }
            PduId::DataSegNotice => {
                let seg_id = DataSegId::try_deser(&mut buf)?;
                self.check_drained(&buf)?;
                if node.recv_seg_notice(seg_id, self).await {
                    self.request(NoteReq::Seg(seg_id)).await?;
                }
            }
            PduId::ProdInfoRequest => {
                let prod_index = ProdIndex::try_deser(&mut buf)?;
                self.check_drained(&buf)?;
                if let Some(prod_info) = node.recv_prod_request(prod_index, self).await {
                    self.send_prod_info(&prod_info).await?;
                }
            }
            PduId::DataSegRequest => {
                let seg_id = DataSegId::try_deser(&mut buf)?;
                self.check_drained(&buf)?;
                if let Some(data_seg) = node.recv_seg_request(seg_id, self).await {
                    self.send_data_seg(&data_seg).await?;
                }
            }
            PduId::ProdInfo => {
                let prod_info = ProdInfo::try_deser(&mut buf)?;
                self.check_drained(&buf)?;
                node.recv_prod_info(prod_info, self).await;
            }
            PduId::DataSeg => {
                let data_seg = DataSeg::try_deser(&mut buf)?;
                node.recv_data_seg(data_seg, self).await;
            }
        }
        Ok(())
    }

    fn check_drained(&self, buf: &impl Buf) -> Result<()> {
        if buf.has_remaining() {
            return Err(P2pError::Protocol(format!(
                "{} trailing bytes in PDU payload",
                buf.remaining()
            )));
        }
        Ok(())
    }

    /// Stops the peer: shuts the connection down and wakes the receive loop.
    /// Idempotent, and safe to call before [Peer::run]. The shutdown happens
    /// before the wakeup so the remote sees the connection go down even when
    /// the halt comes from the peer's own dispatch path.
    pub async fn halt(&self) {
        if self.inner.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = ?self, "halting");
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                trace!(peer = ?self, error = %e, "connection was already down");
            }
        }
        self.inner.halt_notify.notify_waiters();
    }
}
