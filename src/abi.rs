//! Just enough of the contract ABI for the game's static views and no-argument writes.
//!
//! Decoders here are total: short return data reads as zero, oversized integers
//! saturate and a truncated address array is padded with the empty-slot marker.
use crate::address::{
    Address,
    Wei,
};
use sha3::{
    Digest,
    Keccak256,
};

pub const WORD: usize = 32;

pub const GET_TIME_REMAINING: &str = "getTimeRemaining()";
pub const GET_CURRENT_QUEUE_POSITIONS: &str = "getCurrentQueuePositions()";
pub const TOTAL_POT_VALUE: &str = "totalPotValue()";
pub const TOTAL_ENTRIES: &str = "totalEntries()";
pub const GET_ESTIMATED_PAYOUT: &str = "getEstimatedPayout()";
pub const CAN_END_GAME: &str = "canEndGame()";
pub const GAME_ENDED: &str = "gameEnded()";
pub const GAME_ACTIVE: &str = "gameActive()";

pub const SEND_ONE: &str = "sendOne()";
pub const END_GAME: &str = "endGame()";
pub const BATCH_PAYOUT: &str = "batchPayout()";

/// First four bytes of the Keccak-256 hash of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

/// Call data for a function without arguments.
pub fn encode_call(signature: &str) -> Vec<u8> {
    selector(signature).to_vec()
}

fn word_at(data: &[u8], index: usize) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    let start = index * WORD;
    if start < data.len() {
        let end = (start + WORD).min(data.len());
        word[..end - start].copy_from_slice(&data[start..end]);
    }
    word
}

/// `uint256` as [`Wei`], saturating at `u128::MAX`.
pub fn decode_uint(data: &[u8]) -> Wei {
    let word = word_at(data, 0);
    if word[..16].iter().any(|b| *b != 0) {
        return Wei::MAX;
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    u128::from_be_bytes(low)
}

/// `uint256` narrowed to `u64`, saturating.
pub fn decode_u64(data: &[u8]) -> u64 {
    u64::try_from(decode_uint(data)).unwrap_or(u64::MAX)
}

pub fn decode_bool(data: &[u8]) -> bool {
    word_at(data, 0).iter().any(|b| *b != 0)
}

/// `address[len]` static array. Missing trailing words become [`Address::ZERO`].
pub fn decode_address_array(data: &[u8], len: usize) -> Vec<Address> {
    (0..len)
        .map(|i| Address::from_word(&word_at(data, i)))
        .collect()
}

/// Whether return data has exactly the number of words a static return type needs.
pub fn has_words(data: &[u8], words: usize) -> bool {
    data.len() == words * WORD
}
