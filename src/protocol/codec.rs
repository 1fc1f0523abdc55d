use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{P2pError, Result};

/// Discriminator of a protocol data unit. Goes on the wire as the first byte
/// of every frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PduId {
    PubPathNotice = 1,
    ProdInfoNotice = 2,
    DataSegNotice = 3,
    ProdInfoRequest = 4,
    DataSegRequest = 5,
    ProdInfo = 6,
    DataSeg = 7,
}

/// Upper bound on a PDU payload, sized for the largest legal body: product
/// information with a maximum-length name.
pub const MAX_PDU_PAYLOAD: usize = 4 + 2 + u16::MAX as usize + 4 + 8 + 4;

const FRAME_HEADER_SIZE: usize = 1 + 4;

/// Reading side of the length-delimited stream codec. There is exactly one
/// reader per connection, owned by the peer's receive loop.
pub struct FrameReader {
    stream: OwnedReadHalf,
    max_payload: usize,
}

impl FrameReader {
    pub fn new(stream: OwnedReadHalf, max_payload: usize) -> FrameReader {
        FrameReader {
            stream,
            max_payload,
        }
    }

    /// Reads one frame. Returns `None` on a clean end-of-stream at a frame
    /// boundary; an end-of-stream in the middle of a frame is an
    /// `UnexpectedEof` I/O error. A frame whose declared payload length
    /// exceeds the configured maximum fails the connection.
    pub async fn read_frame(&mut self) -> Result<Option<(u8, BytesMut)>> {
        let mut first = [0u8; 1];
        if self.stream.read(&mut first).await? == 0 {
            return Ok(None);
        }
        let pdu_id = first[0];

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > self.max_payload {
            return Err(P2pError::Protocol(format!(
                "PDU {} declares a {}-byte payload, maximum is {}",
                pdu_id, payload_len, self.max_payload
            )));
        }

        let mut payload = BytesMut::zeroed(payload_len);
        self.stream.read_exact(&mut payload).await?;
        Ok(Some((pdu_id, payload)))
    }
}

/// Writing side of the length-delimited stream codec. The owning peer keeps
/// it behind a mutex, so a started frame is fully on the wire before another
/// begins.
pub struct FrameWriter {
    stream: OwnedWriteHalf,
}

impl FrameWriter {
    pub fn new(stream: OwnedWriteHalf) -> FrameWriter {
        FrameWriter { stream }
    }

    pub async fn send(&mut self, pdu_id: PduId, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(pdu_id.into());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Sends a FIN to the remote. Subsequent writes fail, and the remote's
    /// reader sees a clean end-of-stream once it has drained the connection.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn stream_mut(&mut self) -> &mut OwnedWriteHalf {
        &mut self.stream
    }
}

/// Decodes a wire boolean, which must be exactly 0x00 or 0x01.
pub fn try_get_bool(buf: &mut impl Buf) -> Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(P2pError::Protocol(format!(
            "invalid boolean on the wire: {:#04x}",
            n
        ))),
    }
}
