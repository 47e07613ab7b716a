//! Deduplication key and lock token derivation.

use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum fingerprint length in bytes.
pub const MAX_FINGERPRINT_BYTES: usize = 256;

/// Identity of a deduplication lineage: `(fingerprint, severity)`.
///
/// The key maps deterministically to a 64-bit signed lock token, the first
/// eight bytes of `SHA256("{fingerprint}:{severity}")` read big-endian. Two
/// distinct keys may share a token; that only causes spurious lock contention,
/// because rows are always addressed by the full pair.
///
/// # Example
///
/// ```rust
/// use alertgate::DedupKey;
///
/// let key = DedupKey::new("svc-cpu-high", "critical");
/// assert_eq!(key.to_string(), "svc-cpu-high:critical");
/// assert_eq!(key.lock_token(), DedupKey::new("svc-cpu-high", "critical").lock_token());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    fingerprint: String,
    severity: String,
}

impl DedupKey {
    /// Creates a key without validation.
    ///
    /// Use [`crate::DedupConfig::validate_key`] for caller-supplied input.
    #[must_use]
    pub fn new(fingerprint: impl Into<String>, severity: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            severity: severity.into(),
        }
    }

    /// Returns the key of the per-severity rate-limit bucket.
    ///
    /// Bucket rows use an empty fingerprint, which validation never admits for
    /// a real alert.
    #[must_use]
    pub fn rate_bucket(severity: impl Into<String>) -> Self {
        Self::new(String::new(), severity)
    }

    /// Returns true if this is a rate-limit bucket key.
    #[must_use]
    pub fn is_rate_bucket(&self) -> bool {
        self.fingerprint.is_empty()
    }

    /// Returns the fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Returns the severity.
    #[must_use]
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// Returns the 64-bit lock token for this key.
    #[must_use]
    pub fn lock_token(&self) -> i64 {
        let mut hasher = Sha256::new();
        hasher.update(self.fingerprint.as_bytes());
        hasher.update(b":");
        hasher.update(self.severity.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(prefix)
    }

    /// Returns the lock token reinterpreted as unsigned, for map keys and logs.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn cache_hash(&self) -> u64 {
        self.lock_token() as u64
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fingerprint, self.severity)
    }
}
