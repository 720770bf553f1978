//! Binary encoding for mutations and log records.
//!
//! Everything that touches the mutation log or the tail protocol goes
//! through [`Encode`] and [`Decode`]. The encoding is stable: a log
//! written by one version of the process must replay under another.

use std::string::FromUtf8Error;
use std::{io, mem};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

/// The type used to represent sizes on the wire.
///
/// Log records are not transport-limited, and issue bodies or commit
/// messages can exceed 64KB, so we use four bytes.
pub type Size = u32;

/// Maximum size of a single variable-length value on the wire.
///
/// Anything larger is treated as a framing error rather than an
/// allocation request.
pub const MAX_SIZE: usize = 1024 * 1024 * 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("UTF-8 error: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    #[error("value size {0} exceeds maximum")]
    OversizedValue(usize),
    #[error("invalid object id length {0}")]
    InvalidOidLength(usize),
    #[error("unknown mutation type `{0}`")]
    UnknownMutationType(u8),
    #[error("unknown field tag `{0}`")]
    UnknownFieldTag(u8),
    #[error("unknown review status `{0}`")]
    UnknownReviewStatus(u8),
}

impl Error {
    /// Whether we've reached the end of the stream. This is true when we
    /// fail to decode a value because there's not enough data left.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Things that can be encoded as binary.
pub trait Encode {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Things that can be decoded from binary.
pub trait Decode: Sized {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

/// Encode an object into a vector.
pub fn serialize<T: Encode + ?Sized>(data: &T) -> Vec<u8> {
    let mut buffer = Vec::new();
    let len = data
        .encode(&mut buffer)
        .expect("in-memory writes don't error");

    debug_assert_eq!(len, buffer.len());

    buffer
}

/// Decode an object from a slice.
pub fn deserialize<T: Decode>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(data);

    T::decode(&mut cursor)
}

impl Encode for u8 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u8(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u32 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u32::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u64::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for i64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_i64::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for bool {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (*self as u8).encode(writer)
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(self)?;

        Ok(N)
    }
}

impl Encode for &str {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        debug_assert!(self.len() <= MAX_SIZE);

        let mut n = (self.len() as Size).encode(writer)?;
        writer.write_all(self.as_bytes())?;
        n += self.len();

        Ok(n)
    }
}

impl Encode for String {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            None => false.encode(writer),
            Some(value) => Ok(true.encode(writer)? + value.encode(writer)?),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = (self.len() as Size).encode(writer)?;

        for item in self {
            n += item.encode(writer)?;
        }
        Ok(n)
    }
}

impl Decode for u8 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u8()?)
    }
}

impl Decode for u32 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u32::<NetworkEndian>()?)
    }
}

impl Decode for u64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u64::<NetworkEndian>()?)
    }
}

impl Decode for i64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_i64::<NetworkEndian>()?)
    }
}

impl Decode for bool {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(u8::decode(reader)? != 0)
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let mut buf = [0; N];
        reader.read_exact(&mut buf)?;

        Ok(buf)
    }
}

impl Decode for String {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)? as usize;
        if len > MAX_SIZE {
            return Err(Error::OversizedValue(len));
        }
        let mut bytes = vec![0; len];
        reader.read_exact(&mut bytes)?;

        Ok(String::from_utf8(bytes)?)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match u8::decode(reader)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(reader)?)),
            tag => Err(Error::UnknownFieldTag(tag)),
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)? as usize;
        if len > MAX_SIZE {
            return Err(Error::OversizedValue(len));
        }
        let mut items = Vec::with_capacity(len.min(1024));

        for _ in 0..len {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}
