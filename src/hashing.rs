//! Structural hashing of IR values.
//!
//! Hashes identify values by the way they were computed (operation kind plus input hashes), not by
//! where they are stored, so they must be stable across runs. That rules out
//! `std::collections::hash_map::DefaultHasher` (randomly keyed in spirit, unspecified in
//! practice); instead, integers hash to themselves and are mixed with [`hash_combine`].

pub type Hash = u64;

/// Mix `value` into `seed`.
pub fn hash_combine(seed: &mut Hash, value: u64) {
    *seed ^= value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

/// Start from `seed`, mixing in each of `values` in order.
pub fn hash_all(seed: Hash, values: &[u64]) -> Hash {
    let mut res = seed;
    for v in values {
        hash_combine(&mut res, *v);
    }
    res
}

/// Hash a string (names of things), FNV-1a.
pub fn hash_str(s: &str) -> Hash {
    let mut res: Hash = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        res ^= b as u64;
        res = res.wrapping_mul(0x100_0000_01b3);
    }
    res
}
