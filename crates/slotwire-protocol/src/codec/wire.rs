//! Binary writer, reader and the [`Wire`] trait.
//!
//! Integers and floats are little-endian at their natural width, `bool` is a
//! single byte, `char` is its UTF-8 encoding and strings carry a 7-bit
//! variable-length byte count. Collections carry an `i32` element count.

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::MAX_PAYLOAD_SIZE;

/// Longest accepted variable-length prefix, in bytes.
const MAX_VAR_LEN_BYTES: usize = 5;

/// Placement group of a field inside a composite.
///
/// Direct fields are packed before nested ones; the derived ordering
/// encodes that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKind {
    /// Primitives, strings and enums.
    Direct,
    /// Arrays and composites.
    Nested,
}

/// A type with a binary encoding.
pub trait Wire: Sized + Send + 'static {
    const KIND: FieldKind;

    fn write(&self, w: &mut Writer) -> ProtocolResult<()>;

    fn read(r: &mut Reader<'_>) -> ProtocolResult<Self>;

    /// Checks run-time schema invariants of this type and everything it nests.
    fn check_schema(_depth: usize) -> ProtocolResult<()> {
        Ok(())
    }

    #[doc(hidden)]
    fn write_slice(items: &[Self], w: &mut Writer) -> ProtocolResult<()> {
        items.iter().try_for_each(|item| item.write(w))
    }

    #[doc(hidden)]
    fn read_vec(r: &mut Reader<'_>, count: usize) -> ProtocolResult<Vec<Self>> {
        let mut items = Vec::with_capacity(count.min(r.remaining()));
        let before = r.remaining();
        for _ in 0..count {
            items.push(Self::read(r)?);
            // Elements that encode to nothing cannot bound the count by the
            // remaining input, so cap it at what one frame could describe.
            if items.len() == 1 && r.remaining() == before && count > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::CollectionTooLong(count));
            }
        }
        Ok(items)
    }
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Encodes `value` at the end of the buffer.
    pub fn write<T: Wire>(&mut self, value: &T) -> ProtocolResult<()> {
        value.write(self)
    }

    pub(crate) fn put_zeros(&mut self, count: usize) {
        self.buf.put_bytes(0, count);
    }

    /// Overwrites already written bytes starting at `at`.
    pub(crate) fn patch(&mut self, at: usize, bytes: &[u8]) {
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn put_var_len(&mut self, len: usize) -> ProtocolResult<()> {
        let mut value = i32::try_from(len).map_err(|_| ProtocolError::CollectionTooLong(len))? as u32;
        while value >= 0x80 {
            self.buf.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
        Ok(())
    }

    fn put_count(&mut self, len: usize) -> ProtocolResult<()> {
        let count = i32::try_from(len).map_err(|_| ProtocolError::CollectionTooLong(len))?;
        self.buf.put_i32_le(count);
        Ok(())
    }
}

/// Cursor over an encoded payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes read so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Decodes one value.
    pub fn read<T: Wire>(&mut self) -> ProtocolResult<T> {
        T::read(self)
    }

    pub fn take(&mut self, len: usize) -> ProtocolResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::UnexpectedEnd {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn take_array<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn var_len(&mut self) -> ProtocolResult<usize> {
        let mut value: u32 = 0;
        for index in 0..MAX_VAR_LEN_BYTES {
            let [byte] = self.take_array::<1>()?;
            value |= u32::from(byte & 0x7f) << (7 * index);
            if byte & 0x80 == 0 {
                return i32::try_from(value)
                    .ok()
                    .and_then(|len| usize::try_from(len).ok())
                    .ok_or(ProtocolError::BadLengthPrefix);
            }
        }
        Err(ProtocolError::BadLengthPrefix)
    }

    fn count(&mut self) -> ProtocolResult<usize> {
        let raw = i32::from_le_bytes(self.take_array()?);
        usize::try_from(raw).map_err(|_| ProtocolError::NegativeLength(raw))
    }
}

macro_rules! le_primitive {
    ($($ty:ty),* $(,)?) => {$(
        impl Wire for $ty {
            const KIND: FieldKind = FieldKind::Direct;

            fn write(&self, w: &mut Writer) -> ProtocolResult<()> {
                w.put_slice(&self.to_le_bytes());
                Ok(())
            }

            fn read(r: &mut Reader<'_>) -> ProtocolResult<Self> {
                Ok(<$ty>::from_le_bytes(r.take_array()?))
            }
        }
    )*};
}

le_primitive!(i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Wire for u8 {
    const KIND: FieldKind = FieldKind::Direct;

    fn write(&self, w: &mut Writer) -> ProtocolResult<()> {
        w.put_u8(*self);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> ProtocolResult<Self> {
        let [byte] = r.take_array::<1>()?;
        Ok(byte)
    }

    fn write_slice(items: &[Self], w: &mut Writer) -> ProtocolResult<()> {
        w.put_slice(items);
        Ok(())
    }

    fn read_vec(r: &mut Reader<'_>, count: usize) -> ProtocolResult<Vec<Self>> {
        Ok(r.take(count)?.to_vec())
    }
}

impl Wire for bool {
    const KIND: FieldKind = FieldKind::Direct;

    fn write(&self, w: &mut Writer) -> ProtocolResult<()> {
        w.put_u8(u8::from(*self));
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> ProtocolResult<Self> {
        Ok(u8::read(r)? != 0)
    }
}

impl Wire for char {
    const KIND: FieldKind = FieldKind::Direct;

    fn write(&self, w: &mut Writer) -> ProtocolResult<()> {
        let mut utf8 = [0u8; 4];
        w.put_slice(self.encode_utf8(&mut utf8).as_bytes());
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> ProtocolResult<Self> {
        let [lead] = r.take_array::<1>()?;
        let width = match lead {
            0x00..=0x7f => return Ok(char::from(lead)),
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => return Err(ProtocolError::InvalidChar),
        };
        let mut utf8 = [lead, 0, 0, 0];
        utf8[1..width].copy_from_slice(r.take(width - 1)?);
        std::str::from_utf8(&utf8[..width])
            .ok()
            .and_then(|s| s.chars().next())
            .ok_or(ProtocolError::InvalidChar)
    }
}

impl Wire for String {
    const KIND: FieldKind = FieldKind::Direct;

    fn write(&self, w: &mut Writer) -> ProtocolResult<()> {
        w.put_var_len(self.len())?;
        w.put_slice(self.as_bytes());
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> ProtocolResult<Self> {
        let len = r.var_len()?;
        let bytes = r.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl<T: Wire> Wire for Vec<T> {
    const KIND: FieldKind = FieldKind::Nested;

    fn write(&self, w: &mut Writer) -> ProtocolResult<()> {
        w.put_count(self.len())?;
        T::write_slice(self, w)
    }

    fn read(r: &mut Reader<'_>) -> ProtocolResult<Self> {
        let count = r.count()?;
        T::read_vec(r, count)
    }

    fn check_schema(depth: usize) -> ProtocolResult<()> {
        T::check_schema(depth)
    }
}

impl<T: Wire, const N: usize> Wire for [T; N] {
    const KIND: FieldKind = FieldKind::Nested;

    fn write(&self, w: &mut Writer) -> ProtocolResult<()> {
        w.put_count(N)?;
        T::write_slice(self, w)
    }

    fn read(r: &mut Reader<'_>) -> ProtocolResult<Self> {
        let count = r.count()?;
        if count != N {
            return Err(ProtocolError::ArrayLength {
                expected: N,
                actual: count,
            });
        }
        T::read_vec(r, N)?
            .try_into()
            .map_err(|items: Vec<T>| ProtocolError::ArrayLength {
                expected: N,
                actual: items.len(),
            })
    }

    fn check_schema(depth: usize) -> ProtocolResult<()> {
        T::check_schema(depth)
    }
}
