//! SHA-256 tree hashes.
//!
//! Glacier checksums parts and archives with a binary tree of SHA-256
//! hashes over 1 MiB leaves. Parts are always a whole number of leaves, so
//! the archive hash can be computed from the leaves of all parts.

use sha2::{Digest, Sha256};

/// Leaf size of the hash tree.
pub const LEAF_SIZE: usize = 1024 * 1024;

/// Hash of one tree node.
pub type Digest256 = [u8; 32];

/// SHA-256 of every 1 MiB leaf of `data`.
///
/// Empty data has a single leaf, the hash of nothing.
pub fn leaf_hashes(data: &[u8]) -> Vec<Digest256> {
    if data.is_empty() {
        return vec![Sha256::digest(b"").into()];
    }
    data.chunks(LEAF_SIZE)
        .map(|leaf| Sha256::digest(leaf).into())
        .collect()
}

/// Reduce leaf hashes to the root hash.
///
/// Adjacent pairs are concatenated and hashed; an odd hash at the end of a
/// level is promoted unchanged.
pub fn combine(leaves: &[Digest256]) -> Digest256 {
    let mut level: Vec<Digest256> = leaves.to_vec();
    if level.is_empty() {
        return Sha256::digest(b"").into();
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    hasher.finalize().into()
                }
                _ => pair[0],
            })
            .collect();
    }
    level[0]
}

/// Tree hash of `data` as lowercase hex.
pub fn tree_hash_hex(data: &[u8]) -> String {
    hex::encode(combine(&leaf_hashes(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_is_plain_sha256() {
        let data = b"hello glacier";
        assert_eq!(tree_hash_hex(data), hex::encode(Sha256::digest(data)));
    }

    #[test]
    fn test_three_leaves() {
        let data: Vec<u8> = (0..(2 * LEAF_SIZE + 10)).map(|i| (i % 251) as u8).collect();
        let h0: Digest256 = Sha256::digest(&data[..LEAF_SIZE]).into();
        let h1: Digest256 = Sha256::digest(&data[LEAF_SIZE..2 * LEAF_SIZE]).into();
        let h2: Digest256 = Sha256::digest(&data[2 * LEAF_SIZE..]).into();

        let mut hasher = Sha256::new();
        hasher.update(h0);
        hasher.update(h1);
        let h01: Digest256 = hasher.finalize().into();

        let mut hasher = Sha256::new();
        hasher.update(h01);
        hasher.update(h2);
        let expected: Digest256 = hasher.finalize().into();

        assert_eq!(combine(&leaf_hashes(&data)), expected);
    }

    #[test]
    fn test_parts_combine_to_archive_hash() {
        let data: Vec<u8> = (0..(3 * LEAF_SIZE)).map(|i| (i % 13) as u8).collect();
        let mut leaves = leaf_hashes(&data[..2 * LEAF_SIZE]);
        leaves.extend(leaf_hashes(&data[2 * LEAF_SIZE..]));
        assert_eq!(hex::encode(combine(&leaves)), tree_hash_hex(&data));
    }
}
