use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};
use siphasher::sip::SipHasher13;

pub fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn format_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// SipHash-1-3 with fixed keys. Stable across runs and platforms, so a
/// client maps to the same node on every proxy instance.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(STABLE_HASH_KEYS.0, STABLE_HASH_KEYS.1);
    hasher.write(bytes);
    hasher.finish()
}

const STABLE_HASH_KEYS: (u64, u64) = (0x0706_0504_0302_0100, 0x0f0e_0d0c_0b0a_0908);
