//! Network parameters and shared consensus types.

use std::fmt;
use std::str::FromStr;

pub mod constants;
pub mod params;

/// A 256-bit block or Merkle-root hash.
///
/// Stored in the internal (little-endian) byte order used on the wire;
/// displayed in the reversed hex convention of Bitcoin tooling.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parses the display (big-endian hex) convention.
    pub fn from_hex(input: &str) -> Result<Self, HexError> {
        let hex = input.trim();
        let hex = hex
            .strip_prefix("0x")
            .or_else(|| hex.strip_prefix("0X"))
            .unwrap_or(hex);
        if hex.len() != 64 {
            return Err(HexError::InvalidLength);
        }
        if !hex.is_ascii() {
            return Err(HexError::InvalidHex);
        }
        let mut bytes = [0u8; 32];
        for (i, byte_out) in bytes.iter_mut().enumerate() {
            let start = i * 2;
            *byte_out = u8::from_str_radix(&hex[start..start + 2], 16)
                .map_err(|_| HexError::InvalidHex)?;
        }
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for BlockHash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 64 characters"),
            HexError::InvalidHex => write!(f, "invalid hex digit in hash"),
        }
    }
}

impl std::error::Error for HexError {}
