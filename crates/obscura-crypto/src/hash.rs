use serde::Serialize;

/// Compute BLAKE3 hash of arbitrary bytes → 32-byte array.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash a value's canonical bincode serialization. This is the committed
/// hash for the audit chain: `prev_hash = canonical_hash(previous event)`.
pub fn canonical_hash<T: Serialize>(value: &T) -> [u8; 32] {
    let bytes = bincode::serialize(value).expect("canonical serialization is infallible");
    blake3_hash(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_hash_is_stable() {
        let a = canonical_hash(&("stream", 42u64));
        let b = canonical_hash(&("stream", 42u64));
        let c = canonical_hash(&("stream", 43u64));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
