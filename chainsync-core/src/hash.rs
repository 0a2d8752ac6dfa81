//! Hash utilities for the chain types

use sha2::{Digest, Sha256};

/// 256-bit hash value
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the parent of genesis
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Compute SHA256(data)
pub fn hash256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);

    let mut result = [0u8; 32];
    result.copy_from_slice(&digest);
    result
}

/// Hash the concatenation of a list of hashes.
///
/// An empty list hashes the empty byte string.
pub fn hash_list<'a, I>(hashes: I) -> Hash256
where
    I: IntoIterator<Item = &'a Hash256>,
{
    let mut hasher = Sha256::new();
    for hash in hashes {
        hasher.update(hash);
    }
    let mut result = [0u8; 32];
    result.copy_from_slice(&hasher.finalize());
    result
}

/// Abbreviated hex form used in log lines
pub fn short_hex(hash: &Hash256) -> String {
    hex::encode(&hash[..4])
}

/// Converts a hexadecimal string to a 32-byte hash
pub fn hex_to_hash(hex_str: &str) -> Result<Hash256, hex::FromHexError> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut result = [0u8; 32];
    result.copy_from_slice(&bytes);
    Ok(result)
}
