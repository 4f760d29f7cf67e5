//! Key hashing shared by channel routing and inline segment payloads.
use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine};

/// Hash functions used to address a subscriber key on the wire.
pub trait KeyHasher {
    /// Hash embedded in per-subscriber channel names.
    fn channel_hash(&self, key: &str) -> String;

    /// 64-bit hash used by key lists and bitmaps.
    fn key_hash64(&self, key: &str) -> u64;

    /// Seeded 32-bit hash, used to spread fetches over an update interval.
    fn seeded_hash32(&self, key: &str, seed: u32) -> u32;
}

/// The default (and only) hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Hasher;

impl KeyHasher for Murmur3Hasher {
    fn channel_hash(&self, key: &str) -> String {
        STANDARD.encode(self.seeded_hash32(key, 0).to_string())
    }

    fn key_hash64(&self, key: &str) -> u64 {
        // Reading from an in-memory cursor cannot fail.
        let hash = murmur3::murmur3_x64_128(&mut Cursor::new(key.as_bytes()), 0).unwrap_or(0);
        // Lower half is h1.
        hash as u64
    }

    fn seeded_hash32(&self, key: &str, seed: u32) -> u32 {
        murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), seed).unwrap_or(0)
    }
}

/// Delay in milliseconds before a subscriber refetches, spreading a broadcast update over
/// `interval_ms`. Returns 0 when no interval is given.
pub fn spread_delay_ms(hasher: &impl KeyHasher, key: &str, seed: u32, interval_ms: u64) -> u64 {
    if interval_ms == 0 {
        return 0;
    }
    u64::from(hasher.seeded_hash32(key, seed)) % interval_ms
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::{spread_delay_ms, KeyHasher, Murmur3Hasher};

    #[test]
    fn channel_hash_is_base64_of_decimal_hash() {
        let hasher = Murmur3Hasher;

        let encoded = hasher.channel_hash("user-1");
        let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();

        assert_eq!(decoded, hasher.seeded_hash32("user-1", 0).to_string());
    }

    #[test]
    fn empty_key_with_zero_seed_hashes_to_zero() {
        assert_eq!(Murmur3Hasher.seeded_hash32("", 0), 0);
        assert_eq!(Murmur3Hasher.key_hash64(""), 0);
    }

    #[test]
    fn hashes_are_stable_and_key_sensitive() {
        let hasher = Murmur3Hasher;

        assert_eq!(hasher.key_hash64("alice"), hasher.key_hash64("alice"));
        assert_ne!(hasher.key_hash64("alice"), hasher.key_hash64("bob"));
        assert_ne!(hasher.seeded_hash32("alice", 1), hasher.seeded_hash32("alice", 2));
    }

    #[test]
    fn spread_delay_stays_within_interval() {
        for key in ["a", "b", "some-longer-key", "🚀"] {
            assert!(spread_delay_ms(&Murmur3Hasher, key, 1234, 60_000) < 60_000);
        }
        assert_eq!(spread_delay_ms(&Murmur3Hasher, "a", 1234, 0), 0);
    }
}
