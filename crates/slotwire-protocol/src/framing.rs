//! Frame headers and batch framing.
//!
//! ```text
//! +------------+----------+--------------+-----------+---------+
//! | id (4 LE)  | kind (1) | [status (1)] | size (2)  | payload |
//! +------------+----------+--------------+-----------+---------+
//! ```
//!
//! [`FrameWriter`] packs frames back-to-back into one send buffer;
//! [`FrameReader`] reassembles frames from partial socket reads.

use std::fmt;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};

use crate::codec::Writer;
use crate::error::{ProtocolError, ProtocolResult};
use crate::status::StatusCode;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Request id meaning "no response expected".
pub const NO_RESPONSE_ID: u32 = u32::MAX;

/// Fixed-size prefix of a frame.
pub trait FrameHeader: Copy + fmt::Debug {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Writes the header into `out`, which is exactly [`Self::SIZE`] bytes.
    fn encode(&self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> ProtocolResult<Self>;

    fn payload_len(&self) -> usize;

    fn set_payload_len(&mut self, len: u16);
}

fn ensure_len(bytes: &[u8], needed: usize) -> ProtocolResult<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::UnexpectedEnd {
            needed,
            remaining: bytes.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// `[id:u32][kind:u8][size:u16]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub id: u32,
    pub kind: u8,
    pub size: u16,
}

impl RequestHeader {
    /// Header with the size left for the frame writer to fill in.
    pub fn new(id: u32, kind: u8) -> Self {
        Self { id, kind, size: 0 }
    }

    /// True for fire-and-forget requests.
    pub fn expects_response(&self) -> bool {
        self.id != NO_RESPONSE_ID
    }
}

impl FrameHeader for RequestHeader {
    const SIZE: usize = 7;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4] = self.kind;
        out[5..7].copy_from_slice(&self.size.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ensure_len(bytes, Self::SIZE)?;
        Ok(Self {
            id: read_u32(&bytes[0..4]),
            kind: bytes[4],
            size: read_u16(&bytes[5..7]),
        })
    }

    fn payload_len(&self) -> usize {
        usize::from(self.size)
    }

    fn set_payload_len(&mut self, len: u16) {
        self.size = len;
    }
}

/// `[id:u32][kind:u8][status:u8][size:u16]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub id: u32,
    pub kind: u8,
    pub status: StatusCode,
    pub size: u16,
}

impl ResponseHeader {
    pub fn success(id: u32, kind: u8) -> Self {
        Self {
            id,
            kind,
            status: StatusCode::Success,
            size: 0,
        }
    }

    /// Error responses never carry a payload.
    pub fn error(id: u32, kind: u8, status: StatusCode) -> Self {
        Self {
            id,
            kind,
            status,
            size: 0,
        }
    }
}

impl FrameHeader for ResponseHeader {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4] = self.kind;
        out[5] = self.status.as_u8();
        out[6..8].copy_from_slice(&self.size.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ensure_len(bytes, Self::SIZE)?;
        Ok(Self {
            id: read_u32(&bytes[0..4]),
            kind: bytes[4],
            status: StatusCode::try_from(bytes[5])?,
            size: read_u16(&bytes[6..8]),
        })
    }

    fn payload_len(&self) -> usize {
        usize::from(self.size)
    }

    fn set_payload_len(&mut self, len: u16) {
        self.size = len;
    }
}

/// One reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<H> {
    pub header: H,
    pub payload: Bytes,
}

/// Batch send buffer.
///
/// Frames are appended until [`is_full`](Self::is_full) reports that the
/// buffer reached one maximum frame; the owner then writes the batch out and
/// calls [`clear`](Self::clear).
#[derive(Debug)]
pub struct FrameWriter<H> {
    out: Writer,
    frames: usize,
    _header: PhantomData<H>,
}

impl<H: FrameHeader> Default for FrameWriter<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: FrameHeader> FrameWriter<H> {
    /// Size at which a batch stops accepting frames.
    pub const BATCH_THRESHOLD: usize = H::SIZE + MAX_PAYLOAD_SIZE;

    pub fn new() -> Self {
        Self {
            out: Writer::with_capacity(Self::BATCH_THRESHOLD),
            frames: 0,
            _header: PhantomData,
        }
    }

    /// Appends one frame whose payload is produced by `pack`.
    ///
    /// The header's size field is filled in here. If `pack` fails or the
    /// payload exceeds [`MAX_PAYLOAD_SIZE`], the partial frame is removed and
    /// the batch is left as it was.
    pub fn push<F>(&mut self, mut header: H, pack: F) -> ProtocolResult<()>
    where
        F: FnOnce(&mut Writer) -> ProtocolResult<()>,
    {
        let start = self.out.len();
        self.out.put_zeros(H::SIZE);

        let packed = pack(&mut self.out).and_then(|()| {
            let size = self.out.len() - start - H::SIZE;
            u16::try_from(size).map_err(|_| ProtocolError::MessageTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            })
        });

        match packed {
            Ok(size) => {
                header.set_payload_len(size);
                let mut encoded = [0u8; 16];
                header.encode(&mut encoded[..H::SIZE]);
                self.out.patch(start, &encoded[..H::SIZE]);
                self.frames += 1;
                Ok(())
            }
            Err(err) => {
                self.out.truncate(start);
                Err(err)
            }
        }
    }

    /// Appends a payload-less frame.
    pub fn push_empty(&mut self, header: H) {
        // An empty payload always fits.
        let _ = self.push(header, |_| Ok(()));
    }

    pub fn is_full(&self) -> bool {
        self.out.len() >= Self::BATCH_THRESHOLD
    }

    /// Frames in the current batch.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.out.as_bytes()
    }

    pub fn clear(&mut self) {
        self.out.clear();
        self.frames = 0;
    }
}

/// Receive buffer that reassembles frames across partial reads.
#[derive(Debug)]
pub struct FrameReader<H> {
    buf: BytesMut,
    _header: PhantomData<H>,
}

impl<H: FrameHeader> Default for FrameReader<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: FrameHeader> FrameReader<H> {
    /// Capacity kept available for one maximum frame.
    pub const CAPACITY: usize = H::SIZE + MAX_PAYLOAD_SIZE;

    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(Self::CAPACITY),
            _header: PhantomData,
        }
    }

    /// Buffer to read the next chunk of socket data into.
    ///
    /// Undrained bytes are moved back to the start of the allocation when
    /// there is room, so one maximum frame always fits.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        let wanted = Self::CAPACITY.saturating_sub(self.buf.len()).max(1);
        self.buf.reserve(wanted);
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Splits off the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Frame<H>>> {
        if self.buf.len() < H::SIZE {
            return Ok(None);
        }
        let header = H::decode(&self.buf[..H::SIZE])?;
        let total = H::SIZE + header.payload_len();
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        let payload = frame.split_off(H::SIZE).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Wire;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn request_header_layout() {
        let header = RequestHeader {
            id: 0x0403_0201,
            kind: 9,
            size: 0x0201,
        };
        let mut out = [0u8; RequestHeader::SIZE];
        header.encode(&mut out);
        assert_eq!(out, [1, 2, 3, 4, 9, 1, 2]);
        assert_eq!(RequestHeader::decode(&out).unwrap(), header);
    }

    #[test]
    fn response_header_layout() {
        let header = ResponseHeader::error(7, 2, StatusCode::RemoteServiceExternalError);
        let mut out = [0u8; ResponseHeader::SIZE];
        header.encode(&mut out);
        assert_eq!(out, [7, 0, 0, 0, 2, 5, 0, 0]);
        assert_eq!(ResponseHeader::decode(&out).unwrap(), header);
    }

    #[test]
    fn response_header_rejects_unknown_status() {
        let bytes = [0, 0, 0, 0, 0, 42, 0, 0];
        assert_eq!(
            ResponseHeader::decode(&bytes),
            Err(ProtocolError::UnknownStatus(42))
        );
    }

    #[test]
    fn writer_fills_in_payload_size() {
        let mut batch = FrameWriter::<RequestHeader>::new();
        batch
            .push(RequestHeader::new(5, 0), |w| "abc".to_string().write(w))
            .unwrap();
        insta::assert_snapshot!(hex(batch.as_bytes()), @"0500000000040003616263");
        assert_eq!(batch.frames(), 1);
    }

    #[test]
    fn failed_pack_leaves_batch_untouched() {
        let mut batch = FrameWriter::<ResponseHeader>::new();
        batch.push_empty(ResponseHeader::success(1, 0));
        let before = batch.as_bytes().to_vec();

        let err = batch
            .push(ResponseHeader::success(2, 0), |w| {
                w.put_u8(1);
                Err(ProtocolError::InvalidUtf8)
            })
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8);
        assert_eq!(batch.as_bytes(), before);
        assert_eq!(batch.frames(), 1);
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let mut batch = FrameWriter::<RequestHeader>::new();
        let err = batch
            .push(RequestHeader::new(1, 0), |w| {
                vec![0u8; MAX_PAYLOAD_SIZE].write(w)
            })
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MessageTooLarge {
                size: MAX_PAYLOAD_SIZE + 4,
                max: MAX_PAYLOAD_SIZE
            }
        );
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }

    #[test]
    fn largest_payload_fits_and_fills_batch() {
        let mut batch = FrameWriter::<RequestHeader>::new();
        batch
            .push(RequestHeader::new(1, 0), |w| {
                w.put_slice(&[7u8; MAX_PAYLOAD_SIZE]);
                Ok(())
            })
            .unwrap();
        assert!(batch.is_full());
        batch.clear();
        assert!(batch.is_empty());
        assert!(!batch.is_full());
    }

    #[test]
    fn reader_reassembles_split_frames() {
        let mut batch = FrameWriter::<ResponseHeader>::new();
        batch
            .push(ResponseHeader::success(1, 3), |w| 10u32.write(w))
            .unwrap();
        batch.push_empty(ResponseHeader::error(2, 3, StatusCode::InternalError));
        batch
            .push(ResponseHeader::success(3, 3), |w| 30u32.write(w))
            .unwrap();
        let bytes = batch.as_bytes();

        let mut reader = FrameReader::<ResponseHeader>::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(5) {
            reader.extend_from_slice(chunk);
            while let Some(frame) = reader.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].header.id, 1);
        assert_eq!(&frames[0].payload[..], &10u32.to_le_bytes());
        assert_eq!(frames[1].header.status, StatusCode::InternalError);
        assert!(frames[1].payload.is_empty());
        assert_eq!(&frames[2].payload[..], &30u32.to_le_bytes());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn read_buf_keeps_room_for_a_maximum_frame() {
        let mut reader = FrameReader::<RequestHeader>::new();
        reader.extend_from_slice(&[1, 0, 0, 0, 0, 0xff, 0xff]);
        assert!(reader.next_frame().unwrap().is_none());
        let buf = reader.read_buf();
        assert!(buf.capacity() - buf.len() >= MAX_PAYLOAD_SIZE);
    }
}
