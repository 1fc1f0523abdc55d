use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{P2pError, Result};

/// Identifier of a data product. Products are numbered by the publisher in
/// increasing order, so the index doubles as a rough notion of age.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProdIndex(pub u32);

impl Display for ProdIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ProdIndex {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ProdIndex> {
        Ok(ProdIndex(buf.try_get_u32()?))
    }
}

/// Size of a product in bytes
pub type ProdSize = u32;
/// Size of a data segment in bytes
pub type SegSize = u16;
/// Offset of a data segment within its product, in bytes
pub type SegOffset = u32;

/// Canonical data-segment size: an Ethernet frame minus the IP header, the
/// TCP header, and four 4-byte protocol fields.
pub const CANON_DATASEG_SIZE: SegSize = 1500 - 20 - 20 - 4 - 4 - 4 - 4;

/// Identifier of a data segment: the product it belongs to plus its byte
/// offset within that product. The offset is a multiple of
/// [CANON_DATASEG_SIZE].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DataSegId {
    pub prod_index: ProdIndex,
    pub offset: SegOffset,
}

impl DataSegId {
    pub fn new(prod_index: ProdIndex, offset: SegOffset) -> DataSegId {
        DataSegId { prod_index, offset }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.prod_index.ser(buf);
        buf.put_u32(self.offset);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<DataSegId> {
        let prod_index = ProdIndex::try_deser(buf)?;
        let offset = buf.try_get_u32()?;
        Ok(DataSegId { prod_index, offset })
    }
}

impl Display for DataSegId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.prod_index, self.offset)
    }
}

/// Creation time of a product
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: since_epoch.as_secs(),
            nsec: since_epoch.subsec_nanos(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.sec);
        buf.put_u32(self.nsec);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Timestamp> {
        let sec = buf.try_get_u64()?;
        let nsec = buf.try_get_u32()?;
        Ok(Timestamp { sec, nsec })
    }
}

/// Metadata of a data product. The name is free-form UTF-8 chosen by the
/// publisher; its encoded length must fit in a u16.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProdInfo {
    pub prod_index: ProdIndex,
    pub name: String,
    pub prod_size: ProdSize,
    pub created: Timestamp,
}

impl ProdInfo {
    pub fn new(
        prod_index: ProdIndex,
        name: impl Into<String>,
        prod_size: ProdSize,
        created: Timestamp,
    ) -> Result<ProdInfo> {
        let name = name.into();
        if name.len() > u16::MAX as usize {
            return Err(P2pError::InvalidArgument(format!(
                "product name is {} bytes, maximum is {}",
                name.len(),
                u16::MAX
            )));
        }
        Ok(ProdInfo {
            prod_index,
            name,
            prod_size,
            created,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<()> {
        if self.name.len() > u16::MAX as usize {
            return Err(P2pError::InvalidArgument(format!(
                "product name is {} bytes, maximum is {}",
                self.name.len(),
                u16::MAX
            )));
        }
        self.prod_index.ser(buf);
        buf.put_u16(self.name.len() as u16);
        buf.put_slice(self.name.as_bytes());
        buf.put_u32(self.prod_size);
        self.created.ser(buf);
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ProdInfo> {
        let prod_index = ProdIndex::try_deser(buf)?;
        let name_len = buf.try_get_u16()? as usize;
        if buf.remaining() < name_len {
            return Err(P2pError::Protocol(format!(
                "product name is truncated: {} bytes declared, {} available",
                name_len,
                buf.remaining()
            )));
        }
        let mut name_bytes = vec![0u8; name_len];
        buf.copy_to_slice(&mut name_bytes);
        let name = String::from_utf8(name_bytes)
            .map_err(|e| P2pError::Protocol(format!("product name is not UTF-8: {}", e)))?;
        let prod_size = buf.try_get_u32()?;
        let created = Timestamp::try_deser(buf)?;
        Ok(ProdInfo {
            prod_index,
            name,
            prod_size,
            created,
        })
    }
}

impl Display for ProdInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{}, {:?}, {} bytes}}",
            self.prod_index, self.name, self.prod_size
        )
    }
}

/// One segment of a product's payload. The payload length is fully determined
/// by the product size and the segment offset: every segment is
/// [CANON_DATASEG_SIZE] bytes except possibly a shorter tail segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataSeg {
    pub id: DataSegId,
    pub prod_size: ProdSize,
    data: Bytes,
}

impl DataSeg {
    /// Payload length of the segment at `offset` in a product of `prod_size`
    /// bytes.
    pub fn size_of(prod_size: ProdSize, offset: SegOffset) -> SegSize {
        let nbytes = prod_size - offset;
        if nbytes > CANON_DATASEG_SIZE as ProdSize {
            CANON_DATASEG_SIZE
        } else {
            nbytes as SegSize
        }
    }

    pub fn new(id: DataSegId, prod_size: ProdSize, data: Bytes) -> Result<DataSeg> {
        if id.offset >= prod_size {
            return Err(P2pError::InvalidArgument(format!(
                "segment offset {} is not within a product of {} bytes",
                id.offset, prod_size
            )));
        }
        let expected = Self::size_of(prod_size, id.offset) as usize;
        if data.len() != expected {
            return Err(P2pError::InvalidArgument(format!(
                "segment {} of a {}-byte product must have {} bytes, not {}",
                id,
                prod_size,
                expected,
                data.len()
            )));
        }
        Ok(DataSeg {
            id,
            prod_size,
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> SegSize {
        self.data.len() as SegSize
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.id.ser(buf);
        buf.put_u32(self.prod_size);
        buf.put_slice(&self.data);
    }

    /// The payload length is implied rather than transmitted, so the buffer
    /// must contain exactly one segment.
    pub fn try_deser(buf: &mut impl Buf) -> Result<DataSeg> {
        let id = DataSegId::try_deser(buf)?;
        let prod_size = buf.try_get_u32()?;
        if id.offset >= prod_size {
            return Err(P2pError::Protocol(format!(
                "segment offset {} is not within a product of {} bytes",
                id.offset, prod_size
            )));
        }
        let expected = Self::size_of(prod_size, id.offset) as usize;
        if buf.remaining() != expected {
            return Err(P2pError::Protocol(format!(
                "segment {} of a {}-byte product must have {} bytes, not {}",
                id,
                prod_size,
                expected,
                buf.remaining()
            )));
        }
        let data = buf.copy_to_bytes(expected);
        Ok(DataSeg {
            id,
            prod_size,
            data,
        })
    }
}

impl Display for DataSeg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}, {} bytes}}", self.id, self.data.len())
    }
}

/// A notice or request payload. Notices and requests carry the same
/// identifiers, so a single type serves as argument for both and as key in
/// the bookkeeper's ledgers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NoteReq {
    Prod(ProdIndex),
    Seg(DataSegId),
}

impl From<ProdIndex> for NoteReq {
    fn from(prod_index: ProdIndex) -> Self {
        NoteReq::Prod(prod_index)
    }
}

impl From<DataSegId> for NoteReq {
    fn from(seg_id: DataSegId) -> Self {
        NoteReq::Seg(seg_id)
    }
}

impl Display for NoteReq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NoteReq::Prod(prod_index) => write!(f, "product {}", prod_index),
            NoteReq::Seg(seg_id) => write!(f, "segment {}", seg_id),
        }
    }
}
