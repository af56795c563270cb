/// Chain parameters and consensus constants.
///
/// Delay, expiration and reorg rules are consensus-critical: the controlling
/// claim for a name must resolve identically on every node.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::{IndexerError, Result};
use crate::types::{Hash32, Height};

/// Serialized block header size.
pub const HEADER_SIZE: usize = 112;

/// How many blocks back a reorg may reach; also bounds undo retention.
pub const REORG_LIMIT: u32 = 200;

/// Upper bound on the activation delay for challengers.
pub const MAX_TAKEOVER_DELAY: u32 = 4032;

/// Claim lifetime before the expiration fork.
pub const ORIGINAL_CLAIM_EXPIRATION_TIME: u32 = 262_974;

/// Claim lifetime after the expiration fork.
pub const EXTENDED_CLAIM_EXPIRATION_TIME: u32 = 2_102_400;

/// Height at which the extended expiration schedule takes effect.
pub const EXTENDED_CLAIM_EXPIRATION_FORK_HEIGHT: u32 = 400_155;

/// Genesis block hash, wire byte order.
pub const GENESIS_HASH: [u8; 32] = [
    0x9c, 0x89, 0x28, 0x3b, 0xa0, 0xf3, 0x22, 0x7f, 0x6c, 0x03, 0xb7, 0x02, 0x16, 0xb9, 0xf6,
    0x65, 0xf0, 0x11, 0x8d, 0x5e, 0x0f, 0xa7, 0x29, 0xce, 0xdf, 0x4f, 0xb3, 0x4d, 0x6a, 0x34,
    0xf4, 0x63,
];

/// Double sha256, the hash used for block headers and transactions.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    second.into()
}

pub fn header_hash(header: &[u8]) -> Hash32 {
    Hash32(double_sha256(header))
}

/// Previous block hash field of a serialized header.
pub fn header_prev_hash(header: &[u8]) -> Hash32 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&header[4..36]);
    Hash32(out)
}

/// Activation delay for a challenger against a controlling claim that has
/// held the name for `age` blocks.
pub fn delay_for_name(age: u32) -> u32 {
    (age / 32).min(MAX_TAKEOVER_DELAY)
}

/// Height at which a claim accepted at `accepted_height` expires, given the
/// schedule in force at `at_height`.
pub fn expiration_height(accepted_height: Height, at_height: Height) -> Height {
    if at_height >= EXTENDED_CLAIM_EXPIRATION_FORK_HEIGHT {
        accepted_height + EXTENDED_CLAIM_EXPIRATION_TIME
    } else {
        accepted_height + ORIGINAL_CLAIM_EXPIRATION_TIME
    }
}

/// Canonical form of a claim name. Two claims compete for a name iff their
/// normalized names are equal.
pub fn normalize_name(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.nfd().collect::<String>().to_lowercase(),
        // Non-UTF8 names never normalize; they only compete with themselves.
        Err(_) => raw.iter().map(|b| *b as char).collect(),
    }
}

/// Display form of a raw claim name: UTF-8 when valid, otherwise a
/// byte-per-char fallback so no name is ever dropped.
pub fn name_string(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|b| *b as char).collect(),
    }
}

/// Names beginning with '@' are channels.
pub fn is_channel_name(normalized: &str) -> bool {
    normalized.starts_with('@')
}

/// Validate daemon-supplied genesis bytes. The daemon serves the genesis
/// block like any other; we refuse to index a chain with the wrong root.
pub fn genesis_block(raw: Vec<u8>) -> Result<Vec<u8>> {
    if raw.len() < HEADER_SIZE {
        return Err(IndexerError::chain("genesis block shorter than a header"));
    }
    let hash = header_hash(&raw[..HEADER_SIZE]);
    if hash.0 != GENESIS_HASH {
        return Err(IndexerError::chain(format!(
            "genesis block hash mismatch: {}",
            hash
        )));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_scales_with_age_and_caps() {
        assert_eq!(delay_for_name(0), 0);
        assert_eq!(delay_for_name(31), 0);
        assert_eq!(delay_for_name(32), 1);
        assert_eq!(delay_for_name(320), 10);
        assert_eq!(delay_for_name(u32::MAX), MAX_TAKEOVER_DELAY);
    }

    #[test]
    fn expiration_schedule_switches_at_fork() {
        assert_eq!(
            expiration_height(100, EXTENDED_CLAIM_EXPIRATION_FORK_HEIGHT - 1),
            100 + ORIGINAL_CLAIM_EXPIRATION_TIME
        );
        assert_eq!(
            expiration_height(100, EXTENDED_CLAIM_EXPIRATION_FORK_HEIGHT),
            100 + EXTENDED_CLAIM_EXPIRATION_TIME
        );
    }

    #[test]
    fn names_normalize_case_insensitively() {
        assert_eq!(normalize_name(b"Hello"), "hello");
        assert_eq!(normalize_name(b"hello"), normalize_name(b"HELLO"));
        assert!(is_channel_name(&normalize_name(b"@Channel")));
    }

    #[test]
    fn prev_hash_is_bytes_4_to_36() {
        let mut header = [0u8; HEADER_SIZE];
        header[4] = 0xaa;
        header[35] = 0xbb;
        let prev = header_prev_hash(&header);
        assert_eq!(prev.0[0], 0xaa);
        assert_eq!(prev.0[31], 0xbb);
    }
}
