//! Default key hashing for callers that do not bring their own.
//!
//! The bucket protocol treats hashes as caller-supplied opaque 32-bit
//! values; FNV-1a is used here because it is stable across processes
//! (a seeded hasher would break banish fingerprints shared over a
//! replication boundary).

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the key bytes.
pub fn fnv1a(key: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in key {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
