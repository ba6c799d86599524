//! Variant hashing.
//!
//! A 64-bit, well-mixed non-cryptographic hash of the serialized Vary map.
//! Collisions silently deduplicate distinct variants (see `identifier.rs`),
//! so xxh3 is used for its low collision rate at realistic cardinalities.

use xxhash_rust::xxh3::xxh3_64;

pub fn hash_vary_json(vary_json: &str) -> String {
    format!("{:016x}", xxh3_64(vary_json.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        let a = hash_vary_json(r#"{"accept-language":"en"}"#);
        let b = hash_vary_json(r#"{"accept-language":"en"}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_on_different_input() {
        let a = hash_vary_json(r#"{"accept-language":"en"}"#);
        let b = hash_vary_json(r#"{"accept-language":"fr"}"#);
        assert_ne!(a, b);
    }
}
