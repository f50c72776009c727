//! Active-message framing and payload encoding.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! 0       2         4        8             12             16
//! +-------+---------+--------+-------------+--------------+---------+----------+
//! | magic | handler | source | payload_len | trailing_len | payload | trailing |
//! +-------+---------+--------+-------------+--------------+---------+----------+
//! ```
//!
//! The payload is the encoded message; the trailing range is an optional
//! raw byte blob carried after it.

use thiserror::Error;

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// First two bytes of every frame.
pub const MAGIC: u16 = 0xa51d;

/// Decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("header announces {announced} bytes, frame holds {actual}")]
    LengthMismatch { announced: usize, actual: usize },
    #[error("{0} undecoded bytes after message")]
    TrailingBytes(usize),
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid option tag {0}")]
    InvalidTag(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} bytes do not fit a u32 length field")]
    TooLong(usize),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub handler: u16,
    pub source: u32,
    pub payload_len: u32,
    pub trailing_len: u32,
}

impl Header {
    /// Total frame length described by this header.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize + self.trailing_len as usize
    }

    #[inline]
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        buf[2..4].copy_from_slice(&self.handler.to_le_bytes());
        buf[4..8].copy_from_slice(&self.source.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.trailing_len.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let magic = u16_at(0);
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        Ok(Self {
            handler: u16_at(2),
            source: u32_at(4),
            payload_len: u32_at(8),
            trailing_len: u32_at(12),
        })
    }
}

/// A decoded frame borrowing from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub header: Header,
    pub payload: &'a [u8],
    pub trailing: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decodes a frame that occupies exactly `buf`.
    pub fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        let header = Header::read_from(buf)?;
        if header.frame_len() != buf.len() {
            return Err(CodecError::LengthMismatch {
                announced: header.frame_len(),
                actual: buf.len(),
            });
        }
        let body = &buf[HEADER_SIZE..];
        let (payload, trailing) = body.split_at(header.payload_len as usize);
        Ok(Self {
            header,
            payload,
            trailing,
        })
    }
}

/// Builds one frame in a single owned buffer.
#[derive(Debug)]
pub struct FrameBuilder {
    buf: Vec<u8>,
    handler: u16,
    source: u32,
}

impl FrameBuilder {
    pub fn new(handler: u16, source: u32) -> Self {
        Self::with_capacity(handler, source, 64)
    }

    pub fn with_capacity(handler: u16, source: u32, payload_hint: usize) -> Self {
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload_hint);
        buf.resize(HEADER_SIZE, 0);
        Self {
            buf,
            handler,
            source,
        }
    }

    /// Appends an encoded message to the payload.
    pub fn message<M: Wire>(mut self, msg: &M) -> Self {
        msg.encode(&mut Writer { buf: &mut self.buf });
        self
    }

    /// Appends raw bytes to the payload.
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Appends the trailing range and fills in the header.
    pub fn finish(mut self, trailing: &[u8]) -> Result<Box<[u8]>, CodecError> {
        let payload_len = self.buf.len() - HEADER_SIZE;
        self.buf.extend_from_slice(trailing);
        let header = Header {
            handler: self.handler,
            source: self.source,
            payload_len: u32::try_from(payload_len).map_err(|_| CodecError::TooLong(payload_len))?,
            trailing_len: u32::try_from(trailing.len()).map_err(|_| CodecError::TooLong(trailing.len()))?,
        };
        header.write_to(&mut self.buf[..HEADER_SIZE]);
        Ok(self.buf.into_boxed_slice())
    }

    /// Bytes written so far, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }
}

/// Output cursor for [`Wire::encode`].
pub struct Writer<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a u32 length prefix. Lengths beyond `u32::MAX` saturate and are
    /// caught as truncation on the decoding side.
    #[inline]
    pub fn put_len(&mut self, len: usize) {
        self.put(&u32::try_from(len).unwrap_or(u32::MAX).to_le_bytes());
    }
}

/// Input cursor for [`Wire::decode`].
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(CodecError::Truncated {
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    #[inline]
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    #[inline]
    pub fn take_len(&mut self) -> Result<usize, CodecError> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Types that can travel as an active-message payload.
pub trait Wire: Sized {
    fn encode(&self, w: &mut Writer<'_>);
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError>;
}

/// Encodes a message into a fresh buffer.
pub fn to_bytes<M: Wire>(msg: &M) -> Vec<u8> {
    let mut buf = Vec::new();
    msg.encode(&mut Writer::new(&mut buf));
    buf
}

/// Decodes a message that must occupy all of `bytes`.
pub fn from_bytes<M: Wire>(bytes: &[u8]) -> Result<M, CodecError> {
    let mut r = Reader::new(bytes);
    let msg = M::decode(&mut r)?;
    match r.remaining() {
        0 => Ok(msg),
        n => Err(CodecError::TrailingBytes(n)),
    }
}

macro_rules! wire_le {
    ($($t:ty),*) => {$(
        impl Wire for $t {
            #[inline]
            fn encode(&self, w: &mut Writer<'_>) {
                w.put(&self.to_le_bytes());
            }

            #[inline]
            fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
                Ok(<$t>::from_le_bytes(r.take_array()?))
            }
        }
    )*};
}

wire_le!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Wire for usize {
    fn encode(&self, w: &mut Writer<'_>) {
        (*self as u64).encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(u64::decode(r)? as usize)
    }
}

impl Wire for bool {
    fn encode(&self, w: &mut Writer<'_>) {
        w.put(&[*self as u8]);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(CodecError::InvalidBool(b)),
        }
    }
}

impl Wire for () {
    fn encode(&self, _w: &mut Writer<'_>) {}

    fn decode(_r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(())
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, w: &mut Writer<'_>) {
        match self {
            None => w.put(&[0]),
            Some(v) => {
                w.put(&[1]);
                v.encode(w);
            }
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode(r)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(r)?)),
            t => Err(CodecError::InvalidTag(t)),
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, w: &mut Writer<'_>) {
        w.put_len(self.len());
        for v in self {
            v.encode(w);
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = r.take_len()?;
        // Cap the preallocation by what the input could possibly hold.
        let mut out = Vec::with_capacity(len.min(r.remaining()));
        for _ in 0..len {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl Wire for String {
    fn encode(&self, w: &mut Writer<'_>) {
        w.put_len(self.len());
        w.put(self.as_bytes());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = r.take_len()?;
        let bytes = r.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl<A: Wire, B: Wire> Wire for (A, B) {
    fn encode(&self, w: &mut Writer<'_>) {
        self.0.encode(w);
        self.1.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok((A::decode(r)?, B::decode(r)?))
    }
}

impl<A: Wire, B: Wire, C: Wire> Wire for (A, B, C) {
    fn encode(&self, w: &mut Writer<'_>) {
        self.0.encode(w);
        self.1.encode(w);
        self.2.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok((A::decode(r)?, B::decode(r)?, C::decode(r)?))
    }
}
