//! Time-sortable identifiers for sessions and batches.
//!
//! Identifiers are 26-character ULIDs: a 48-bit millisecond timestamp in the
//! first 10 characters followed by 80 bits of randomness, Crockford Base32
//! encoded. Lexicographic order equals timestamp order for identifiers minted
//! in distinct milliseconds.

use ulid::Ulid;

use crate::unix_millis;

/// Crockford Base32 alphabet (no I, L, O, U).
pub const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub const ID_LEN: usize = 26;

const TIMESTAMP_LEN: usize = 10;

/// Mint a fresh identifier for the current millisecond.
pub fn new_id() -> String {
    Ulid::from_parts(unix_millis(), fastrand::u128(..)).to_string()
}

/// Mint an identifier carrying an explicit millisecond timestamp.
pub fn id_with_timestamp(timestamp_ms: u64) -> String {
    Ulid::from_parts(timestamp_ms, fastrand::u128(..)).to_string()
}

/// An identifier is valid iff it is exactly 26 characters, all from the
/// Crockford alphabet.
pub fn is_valid(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| ALPHABET.contains(&b))
}

/// Extract the millisecond timestamp encoded in the first 10 characters.
/// Returns 0 for anything that fails validation.
pub fn timestamp_ms(id: &str) -> u64 {
    if !is_valid(id) {
        return 0;
    }
    id.bytes()
        .take(TIMESTAMP_LEN)
        .fold(0u64, |acc, b| (acc << 5) | decode_char(b))
}

fn decode_char(b: u8) -> u64 {
    // is_valid guarantees membership
    ALPHABET.iter().position(|&c| c == b).unwrap_or(0) as u64
}
