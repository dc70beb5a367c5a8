//! Mutex Name Derivation
//!
//! Pool identifiers are untrusted, unbounded and may contain any
//! character, so they cannot be used as object names directly. Instead
//! the identifier is NFC-normalized and hashed behind a versioned label,
//! giving a fixed-length name:
//!
//! ```text
//! <namespace>\<prefix> + hex(sha256(utf16le(LABEL) 00 00 || utf16le(nfc(pool)) 00 00))
//! ```
//!
//! Both strings are hashed as UTF-16LE including their two-byte
//! terminator. Existing holders of the protocol derive names exactly this
//! way, so any change here splits the lock domain.

use crate::error::{NamespaceError, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::error;
use unicode_normalization::UnicodeNormalization;

/// Domain-separating label hashed ahead of every pool name.
pub const MUTEX_LABEL: &str = "Wintun Adapter Name Mutex Stable Suffix v1 jason@zx2c4.com";

/// Size of the derived digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Separator between a namespace and an object name.
pub const NAMESPACE_SEPARATOR: char = '\\';

/// A fully qualified object name: `<namespace>\<object>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName {
    namespace: String,
    object: String,
}

impl ObjectName {
    /// Create a name for `object` inside `namespace`.
    pub fn new(namespace: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            object: object.into(),
        }
    }

    /// The namespace part.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The object part, without the namespace.
    pub fn object(&self) -> &str {
        &self.object
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, NAMESPACE_SEPARATOR, self.object)
    }
}

/// An opened SHA-256 context already fed with [`MUTEX_LABEL`].
///
/// Each derivation clones the seeded state, so one provider serves any
/// number of threads.
#[derive(Clone)]
pub struct HashProvider {
    seeded: Sha256,
}

impl HashProvider {
    /// Open the provider and absorb the label.
    pub fn open() -> Self {
        let mut seeded = Sha256::new();
        seeded.update(utf16z_bytes(MUTEX_LABEL));
        Self { seeded }
    }

    /// Digest of an already-normalized pool name.
    pub fn digest(&self, normalized_pool: &str) -> [u8; DIGEST_LEN] {
        let mut hasher = self.seeded.clone();
        hasher.update(utf16z_bytes(normalized_pool));
        hasher.finalize().into()
    }
}

impl fmt::Debug for HashProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashProvider").field("algorithm", &"SHA256").finish()
    }
}

/// UTF-16LE bytes of `s` followed by a two-byte NUL terminator.
fn utf16z_bytes(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((s.len() + 1) * 2);
    for unit in s.encode_utf16().chain(std::iter::once(0)) {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// NFC-normalize a pool name. No case folding is applied.
pub fn normalize_pool(pool: &str) -> String {
    pool.nfc().collect()
}

/// NFC-normalize a UTF-16 pool name.
///
/// Fails on unpaired surrogates, which have no normalized form.
pub fn normalize_pool_utf16(pool: &[u16]) -> Result<String> {
    let decoded: std::result::Result<String, _> = char::decode_utf16(pool.iter().copied()).collect();
    match decoded {
        Ok(s) => Ok(normalize_pool(&s)),
        Err(e) => {
            error!(unpaired = e.unpaired_surrogate(), "NormalizePoolName: Failed");
            Err(NamespaceError::Normalization(e.to_string()))
        }
    }
}

/// Lowercase hexadecimal rendering of a digest.
pub fn to_hex(digest: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to String cannot fail.
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Derives pool mutex names for one namespace and prefix.
#[derive(Debug, Clone)]
pub struct MutexNamer {
    hasher: HashProvider,
    namespace: String,
    prefix: String,
}

impl MutexNamer {
    /// Bind a hash provider to a namespace and object prefix.
    pub fn new(hasher: HashProvider, namespace: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            hasher,
            namespace: namespace.into(),
            prefix: prefix.into(),
        }
    }

    /// Derive the object name guarding `pool`.
    pub fn derive(&self, pool: &str) -> ObjectName {
        let normalized = normalize_pool(pool);
        let digest = self.hasher.digest(&normalized);
        ObjectName::new(
            self.namespace.clone(),
            format!("{}{}", self.prefix, to_hex(&digest)),
        )
    }

    /// Derive the object name guarding a UTF-16 `pool`.
    pub fn derive_utf16(&self, pool: &[u16]) -> Result<ObjectName> {
        let normalized = normalize_pool_utf16(pool)?;
        let digest = self.hasher.digest(&normalized);
        Ok(ObjectName::new(
            self.namespace.clone(),
            format!("{}{}", self.prefix, to_hex(&digest)),
        ))
    }
}

impl Default for MutexNamer {
    fn default() -> Self {
        Self::new(HashProvider::open(), "Wintun", "Wintun-Name-Mutex-")
    }
}

/// Derive a pool mutex name with the default namespace and prefix.
pub fn derive_mutex_name(pool: &str) -> ObjectName {
    MutexNamer::default().derive(pool)
}

/// UTF-16 variant of [`derive_mutex_name`].
pub fn derive_mutex_name_utf16(pool: &[u16]) -> Result<ObjectName> {
    MutexNamer::default().derive_utf16(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const PREFIX: &str = "Wintun\\Wintun-Name-Mutex-";

    fn reference_digest(pool: &str) -> String {
        let mut hasher = Sha256::new();
        for s in [MUTEX_LABEL, pool] {
            for unit in s.encode_utf16() {
                hasher.update(unit.to_le_bytes());
            }
            hasher.update([0u8, 0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    #[test]
    fn test_name_layout() {
        let name = derive_mutex_name("Wintun").to_string();
        assert!(name.starts_with(PREFIX));
        assert_eq!(name.len(), PREFIX.len() + 64);
        assert!(name[PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_matches_reference_hash() {
        for pool in ["Wintun", "", "WireGuard", "Ω pool"] {
            let name = derive_mutex_name(pool);
            assert_eq!(name.object(), format!("Wintun-Name-Mutex-{}", reference_digest(pool)));
        }
    }

    #[test]
    fn test_terminator_is_hashed() {
        // Same input hashed without terminators must not match.
        let mut hasher = Sha256::new();
        for unit in MUTEX_LABEL.encode_utf16().chain("x".encode_utf16()) {
            hasher.update(unit.to_le_bytes());
        }
        let unterminated = format!("{:x}", hasher.finalize());
        assert_ne!(derive_mutex_name("x").object(), format!("Wintun-Name-Mutex-{unterminated}"));
    }

    #[test]
    fn test_nfc_equivalence() {
        // "é" precomposed vs. "e" + COMBINING ACUTE ACCENT
        let composed = "caf\u{00e9}";
        let decomposed = "cafe\u{0301}";
        assert_ne!(composed, decomposed);
        assert_eq!(derive_mutex_name(composed), derive_mutex_name(decomposed));

        // Hangul syllable vs. conjoining jamo
        assert_eq!(
            derive_mutex_name("\u{d55c}"),
            derive_mutex_name("\u{1112}\u{1161}\u{11ab}")
        );
    }

    #[test]
    fn test_no_case_folding() {
        assert_ne!(derive_mutex_name("Local"), derive_mutex_name("local"));
    }

    #[test]
    fn test_deterministic() {
        let namer = MutexNamer::default();
        let first = namer.derive("pool");
        for _ in 0..16 {
            assert_eq!(namer.derive("pool"), first);
        }
        assert_eq!(derive_mutex_name("pool"), first);
    }

    #[test]
    fn test_empty_pool() {
        let name = derive_mutex_name("");
        assert_eq!(name.object().len(), "Wintun-Name-Mutex-".len() + 64);
        assert_ne!(name, derive_mutex_name("\0"));
    }

    #[test]
    fn test_long_pool_fixed_length() {
        let long = "x".repeat(1 << 16);
        let name = derive_mutex_name(&long).to_string();
        assert_eq!(name.len(), PREFIX.len() + 64);
    }

    #[test]
    fn test_no_collisions_in_sample() {
        let names: HashSet<String> = (0..10_000)
            .map(|i| derive_mutex_name(&format!("pool-{i}")).to_string())
            .collect();
        assert_eq!(names.len(), 10_000);
    }

    #[test]
    fn test_utf16_matches_str() {
        let pool = "cafe\u{0301} \u{1f600}";
        let wide: Vec<u16> = pool.encode_utf16().collect();
        assert_eq!(derive_mutex_name_utf16(&wide).unwrap(), derive_mutex_name(pool));
    }

    #[test]
    fn test_utf16_unpaired_surrogate() {
        let wide = [0x0061, 0xd800, 0x0062];
        assert!(matches!(
            derive_mutex_name_utf16(&wide),
            Err(NamespaceError::Normalization(_))
        ));
    }

    #[test]
    fn test_custom_namespace_and_prefix() {
        let namer = MutexNamer::new(HashProvider::open(), "Other", "Pool-");
        let name = namer.derive("a");
        assert_eq!(name.namespace(), "Other");
        assert!(name.to_string().starts_with("Other\\Pool-"));
        assert_eq!(
            &name.object()["Pool-".len()..],
            &derive_mutex_name("a").object()["Wintun-Name-Mutex-".len()..]
        );
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0x0f, 0xa0, 0xff]), "000fa0ff");
    }
}
