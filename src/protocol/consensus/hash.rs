use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use sha3::Digest;
use sha3::Keccak256;
use sha3::Keccak512;

/// A 32-byte digest: seal hashes, seed hashes, mix digests and PoW results.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const LEN: usize = 32;

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Keccak-256 of `data`
    pub fn keccak(data: &[u8]) -> Self {
        Self(Keccak256::digest(data).into())
    }

    /// Build a digest from a short hex string, left-padding with zeros.
    ///
    /// Handy for reporter ids, which remote miners pick freely.
    pub fn from_hex_padded(s: &str) -> Result<Self, ParseHashError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() > 2 * Self::LEN {
            return Err(ParseHashError::Length(s.len() / 2));
        }
        let padded = format!("{:0>64}", s);
        padded.parse()
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseHashError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("expected {} bytes, got {0}", Hash256::LEN)]
    Length(usize),
}

impl FromStr for Hash256 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseHashError::Length(bytes.len()))?;
        Ok(Self(array))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

/// 64-bit nonce, carried big-endian in headers and on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockNonce(pub u64);

impl BlockNonce {
    pub fn to_hex(self) -> String {
        format!("0x{}", hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Display for BlockNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlockNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockNonce({})", self.0)
    }
}

impl FromStr for BlockNonce {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        let array: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseHashError::Length(bytes.len()))?;
        Ok(Self(u64::from_be_bytes(array)))
    }
}

impl From<u64> for BlockNonce {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

pub(crate) fn keccak512(data: &[u8]) -> [u8; 64] {
    Keccak512::digest(data).into()
}
