//! Salted hashing primitives used for percentage rollout and sensitive comparators.
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Number of percentage buckets.
pub const TOTAL_BUCKETS: u32 = 100;

/// Compute the percentage bucket (`0..100`) for `attribute` under the setting `key`.
///
/// The bucket is the SHA-1 digest of `key || attribute`, truncated to its first 28 bits and
/// reduced modulo 100. This is the same as parsing the first 7 hex digits of the digest, and must
/// stay bit-for-bit stable: every client of the protocol has to place a user into the same bucket.
pub fn bucket(key: impl AsRef<[u8]>, attribute: impl AsRef<[u8]>) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(key.as_ref());
    hasher.update(attribute.as_ref());
    let hash = hasher.finalize();

    let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    (value >> 4) % TOTAL_BUCKETS
}

/// Hash a comparison input for the "hashed" comparators.
///
/// `config_salt` is the per-configuration salt. `context_salt` is the setting key or, inside a
/// segment, the segment name.
pub fn sensitive_hash(
    value: impl AsRef<[u8]>,
    config_salt: impl AsRef<[u8]>,
    context_salt: impl AsRef<[u8]>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_ref());
    hasher.update(config_salt.as_ref());
    hasher.update(context_salt.as_ref());
    hex::encode(hasher.finalize())
}
