use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use std::{
    fmt,
    str::FromStr,
};
use thiserror::Error;

/// Amounts of the ledger's native asset, in its smallest unit.
///
/// The ledger speaks `uint256`; every amount this game can hold fits in 128 bits, and
/// decoding saturates rather than failing when a word does not.
pub type Wei = u128;

pub const WEI_PER_ETHER: Wei = 1_000_000_000_000_000_000;

/// A 20-byte ledger account address.
///
/// Parsing accepts any hex case, so two addresses compare equal regardless of how
/// their textual forms were capitalised.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexParseError {
    #[error("expected {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("not valid hex: {0}")]
    InvalidHex(String),
}

impl Address {
    /// Empty queue slot marker.
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Reads the address out of a right-aligned 32-byte ABI word.
    pub fn from_word(word: &[u8; 32]) -> Self {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&word[12..]);
        Self(bytes)
    }
}

impl FromStr for Address {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 40 {
            return Err(HexParseError::InvalidLength {
                expected: 40,
                actual: digits.len(),
            });
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| HexParseError::InvalidHex(e.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// 32-byte transaction hash as returned by the relay and the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl FromStr for TxHash {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("0x");
        if digits.len() != 64 {
            return Err(HexParseError::InvalidLength {
                expected: 64,
                actual: digits.len(),
            });
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| HexParseError::InvalidHex(e.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TxHash::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
