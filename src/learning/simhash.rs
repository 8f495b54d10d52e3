//! 64-bit SimHash over tokenized text (§4.4.3), used to detect near-duplicate
//! learning candidates before an expensive merge decision.
//!
//! Grounded in the teacher crate's hashing conventions (`sha2`/`hex` for
//! content ids; FNV-style mixing in `utilities/string_utils.rs`'s simpler
//! hash helpers), generalized here to the bit-majority SimHash accumulator
//! the spec calls for.

const FNV_OFFSET: u64 = 1469598103934665603;
const FNV_PRIME: u64 = 1099511628211;

fn fnv1a(token: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Tokens considered: runs of alphanumerics, `_`, `-`, lowercased, length
/// >= 2 (single characters are too noisy to vote on a bit).
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            if current.len() >= 2 {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 2 {
        tokens.push(current);
    }
    tokens
}

/// Compute the 64-bit SimHash fingerprint of `text`. Each token votes +1/-1
/// on each of the 64 bit positions of its hash; the final bit is 1 wherever
/// the vote total is positive.
pub fn simhash64(text: &str) -> u64 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0;
    }
    let mut weights = [0i64; 64];
    for token in &tokens {
        let hash = fnv1a(token);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }
    let mut result: u64 = 0;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            result |= 1 << bit;
        }
    }
    result
}

/// Hamming distance between two 64-bit fingerprints.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Default near-duplicate threshold: fingerprints within this Hamming
/// distance are considered a near-match candidate for merge (§4.4.4).
pub const NEAR_DUPLICATE_THRESHOLD: u32 = 5;
