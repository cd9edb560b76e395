//! Content fingerprints of the logical state being mirrored.
//!
//! A fingerprint identifies the state a batch represents. When the state
//! returns to exactly what was last delivered (a row added then removed
//! inside one debounce window, say) the engine skips the transport call.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;

use offsync_common::ChangeRecord;

type Blake2b256 = Blake2b<U32>;

/// Domain separator mixed into every fingerprint.
const DOMAIN: &[u8] = b"offsync.fingerprint.v1";

/// 256-bit BLAKE2b digest of a logical state.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", &self.to_hex()[..12])
    }
}

/// Incremental hasher for building a fingerprint from named parts.
///
/// Every part is length-prefixed, so `("ab", "c")` and `("a", "bc")` hash
/// differently. JSON values are hashed in their compact serialized form;
/// object keys are sorted by `serde_json`, making equal values hash equal.
pub struct FingerprintBuilder {
    hasher: Blake2b256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(DOMAIN);
        Self { hasher }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    /// Hash a named byte field.
    pub fn field(&mut self, name: &str, bytes: &[u8]) -> &mut Self {
        self.write_bytes(name.as_bytes());
        self.write_bytes(bytes);
        self
    }

    /// Hash a named JSON value.
    pub fn value(&mut self, name: &str, value: &serde_json::Value) -> &mut Self {
        self.field(name, value.to_string().as_bytes())
    }

    /// Hash a named ordered collection of JSON values.
    pub fn collection<'a, I>(&mut self, name: &str, items: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a serde_json::Value>,
    {
        self.write_bytes(name.as_bytes());
        let mut count: u64 = 0;
        for item in items {
            self.write_bytes(item.to_string().as_bytes());
            count += 1;
        }
        self.hasher.update(count.to_le_bytes());
        self
    }

    pub fn finish(self) -> Fingerprint {
        let digest = self.hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Fingerprint(out)
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Application hook describing the current logical state.
///
/// Called on the coordinator task right before each sync attempt, so the
/// implementation should read whatever it mirrors without blocking for long.
pub trait SnapshotSource: Send + Sync {
    fn write_snapshot(&self, builder: &mut FingerprintBuilder);
}

/// Fingerprint derived from the pending records themselves.
///
/// Used when the application provides no `SnapshotSource`. Record ids are
/// unique, so two different pending snapshots never collide.
pub fn fingerprint_records(records: &[ChangeRecord]) -> Fingerprint {
    let mut builder = FingerprintBuilder::new();
    for record in records {
        builder
            .field("id", record.id.as_bytes())
            .value("payload", &record.payload);
    }
    builder.finish()
}
