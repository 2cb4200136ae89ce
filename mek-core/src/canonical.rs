//! Canonical serialization and hashing discipline.
//!
//! Every byte that enters an evidence hash goes through this module. The
//! canonical form is deterministic by construction: UTF-8 strings (quoted),
//! maps in sorted-key order, integers in decimal, timestamps as monotonic
//! integers, booleans as `true`/`false`, null as `null`. The hash algorithm
//! is SHA-256 and nothing else. Verification accepts no other format.
//!
//! Primitives never hand-roll their own encodings; they produce a
//! [`serde_json::Value`] through [`CanonicalEncode`] and this module turns it
//! into bytes. `serde_json`'s map type is ordered (BTree-backed), so a `Value`
//! built from our `BTreeMap`-based structs serializes with sorted keys
//! without any extra pass.

use serde::Serialize;
use sha2::{Digest as Sha2Digest, Sha256};
use subtle::ConstantTimeEq;
use unicode_normalization::UnicodeNormalization;

/// A SHA-256 digest.
///
/// Serialized as lowercase hex so digests are stable, readable fields inside
/// canonical JSON. Equality of two digests is constant-time.
#[derive(Debug, Clone, Copy, Hash)]
pub struct Digest32(pub [u8; 32]);

impl Digest32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let arr: [u8; 32] = raw.try_into().ok()?;
        Some(Digest32(arr))
    }
}

impl PartialEq for Digest32 {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Digest32 {}

impl std::fmt::Display for Digest32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Digest32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest32::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("expected 64 lowercase hex characters"))
    }
}

/// Hash raw bytes with SHA-256.
pub fn hash_bytes(data: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest32(hasher.finalize().into())
}

/// Hash the concatenation of two byte slices. Used by the evidence chain,
/// which folds `H_i = hash(H_{i-1} || element_i)`.
pub fn hash_concat(prefix: &[u8], data: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    hasher.update(data);
    Digest32(hasher.finalize().into())
}

/// Canonical form of a string entering the kernel.
///
/// NFC normalization plus null-byte removal, so that two encodings of the
/// same text cannot hash differently between snapshot capture and
/// re-validation. Applied once, at construction; canonical strings are stored
/// and compared as-is afterwards.
pub fn canonical_string(raw: &str) -> String {
    let stripped = raw.replace('\0', "");
    stripped.nfc().collect::<String>().trim().to_string()
}

/// Types that have a canonical serialization.
///
/// `canonical_value` must be a pure function of the value's frozen fields.
/// The default `canonical_bytes`/`digest` are the only encoders; implementors
/// never override them.
pub trait CanonicalEncode {
    fn canonical_value(&self) -> serde_json::Value;

    fn canonical_bytes(&self) -> Vec<u8> {
        // Infallible: canonical_value never contains non-string map keys or
        // non-finite floats (confidence is bounded to [0,1]).
        serde_json::to_vec(&self.canonical_value()).expect("canonical value must serialize")
    }

    fn digest(&self) -> Digest32 {
        hash_bytes(&self.canonical_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_deterministic() {
        let a = hash_bytes(b"mek");
        let b = hash_bytes(b"mek");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_concat_matches_manual() {
        let joined = hash_bytes(b"abcdef");
        let folded = hash_concat(b"abc", b"def");
        assert_eq!(joined, folded);
    }

    #[test]
    fn test_digest_hex_round_trip() {
        let d = hash_bytes(b"round trip");
        let restored = Digest32::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, restored);
    }

    #[test]
    fn test_digest_rejects_bad_hex() {
        assert!(Digest32::from_hex("zz").is_none());
        assert!(Digest32::from_hex("abcd").is_none());
    }

    #[test]
    fn test_canonical_string_nfc() {
        // é composed vs decomposed must canonicalize identically
        let composed = "café";
        let decomposed = "cafe\u{0301}";
        assert_eq!(canonical_string(composed), canonical_string(decomposed));
    }

    #[test]
    fn test_canonical_string_strips_nulls() {
        assert_eq!(canonical_string("a\0b"), "ab");
    }

    #[test]
    fn test_canonical_string_trims() {
        assert_eq!(canonical_string("  alice  "), "alice");
    }

    #[test]
    fn test_sorted_map_encoding() {
        struct Probe;
        impl CanonicalEncode for Probe {
            fn canonical_value(&self) -> serde_json::Value {
                json!({"b": 1, "a": 2})
            }
        }
        let bytes = Probe.canonical_bytes();
        let text = String::from_utf8(bytes).unwrap();
        // serde_json's default map is BTree-backed: keys come out sorted
        assert_eq!(text, r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_digest_differs_on_single_byte() {
        let a = hash_bytes(b"bundle-0");
        let b = hash_bytes(b"bundle-1");
        assert_ne!(a, b);
    }
}
