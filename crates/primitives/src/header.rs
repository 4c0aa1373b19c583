//! The 80-byte block header.

use pulse_consensus::params::NetworkParams;
use pulse_consensus::BlockHash;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: BlockHash,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> [u8; HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.encode_into(&mut encoder);
        let bytes = encoder.into_inner();
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.put_i32_le(self.version);
        encoder.put_hash(&self.prev_hash);
        encoder.put_hash(&self.merkle_root);
        encoder.put_u32_le(self.time);
        encoder.put_u32_le(self.bits);
        encoder.put_u32_le(self.nonce);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(header)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.get_i32_le()?,
            prev_hash: decoder.get_hash()?,
            merkle_root: decoder.get_hash()?,
            time: decoder.get_u32_le()?,
            bits: decoder.get_u32_le()?,
            nonce: decoder.get_u32_le()?,
        })
    }

    /// Double SHA-256 of the canonical encoding.
    pub fn hash(&self) -> BlockHash {
        sha256d(&self.consensus_encode())
    }

    /// Reconstructs the network's genesis header from its parameters.
    pub fn genesis(params: &NetworkParams) -> Self {
        Self {
            version: params.genesis.version,
            prev_hash: BlockHash::ZERO,
            merkle_root: params.genesis.merkle_root,
            time: params.genesis.time,
            bits: params.genesis.bits,
            nonce: params.genesis.nonce,
        }
    }
}
