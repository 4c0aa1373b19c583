//! Consensus wire encoding: little-endian integers and CompactSize lengths.

use pulse_consensus::BlockHash;

/// A CompactSize larger than the default message cap can never describe a
/// sane payload, whatever the negotiated limits are.
const COMPACT_SIZE_LIMIT: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalCompactSize,
    SizeTooLarge,
    TrailingBytes,
    InvalidData(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "input ended mid-field"),
            DecodeError::NonCanonicalCompactSize => {
                write!(f, "CompactSize not in shortest form")
            }
            DecodeError::SizeTooLarge => write!(f, "CompactSize beyond message cap"),
            DecodeError::TrailingBytes => write!(f, "unconsumed bytes after decode"),
            DecodeError::InvalidData(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for DecodeError {}

macro_rules! le_accessors {
    ($($put:ident / $get:ident => $ty:ty),* $(,)?) => {
        impl Encoder {
            $(pub fn $put(&mut self, value: $ty) {
                self.out.extend_from_slice(&value.to_le_bytes());
            })*
        }

        impl<'a> Decoder<'a> {
            $(pub fn $get(&mut self) -> Result<$ty, DecodeError> {
                Ok(<$ty>::from_le_bytes(self.take_fixed()?))
            })*
        }
    };
}

le_accessors! {
    put_u16_le / get_u16_le => u16,
    put_u32_le / get_u32_le => u32,
    put_i32_le / get_i32_le => i32,
    put_u64_le / get_u64_le => u64,
    put_i64_le / get_i64_le => i64,
}

#[derive(Default)]
pub struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.out
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn put_hash(&mut self, hash: &BlockHash) {
        self.out.extend_from_slice(hash.as_bytes());
    }

    pub fn put_compact_size(&mut self, value: u64) {
        match value {
            0..=0xfc => self.put_u8(value as u8),
            0xfd..=0xffff => {
                self.put_u8(0xfd);
                self.put_u16_le(value as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.put_u8(0xfe);
                self.put_u32_le(value as u32);
            }
            _ => {
                self.put_u8(0xff);
                self.put_u64_le(value);
            }
        }
    }

    pub fn put_var_bytes(&mut self, bytes: &[u8]) {
        self.put_compact_size(bytes.len() as u64);
        self.put_bytes(bytes);
    }

    pub fn put_var_str(&mut self, value: &str) {
        self.put_var_bytes(value.as_bytes());
    }
}

/// Borrowing decoder that shrinks its view as fields are consumed.
pub struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    /// Fails unless every input byte has been consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.rest.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    fn take_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.take(N)
            .map(|bytes| bytes.try_into().expect("take length"))
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take_fixed::<1>()?[0])
    }

    pub fn get_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.take_fixed()
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_hash(&mut self) -> Result<BlockHash, DecodeError> {
        Ok(BlockHash::from_bytes(self.take_fixed::<32>()?))
    }

    pub fn get_compact_size(&mut self) -> Result<u64, DecodeError> {
        // Each wider tag has a floor below which the narrower form was
        // mandatory; one shared check covers canonicality for all three.
        let (value, floor) = match self.get_u8()? {
            tag @ 0..=0xfc => (tag as u64, 0),
            0xfd => (self.get_u16_le()? as u64, 0xfd),
            0xfe => (self.get_u32_le()? as u64, 0x1_0000),
            0xff => (self.get_u64_le()?, 0x1_0000_0000),
        };
        if value < floor {
            return Err(DecodeError::NonCanonicalCompactSize);
        }
        if value > COMPACT_SIZE_LIMIT {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(value)
    }

    pub fn get_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.get_compact_size()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::SizeTooLarge)?;
        self.get_bytes(len)
    }

    pub fn get_var_str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.get_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidData("invalid utf8 string"))
    }
}
