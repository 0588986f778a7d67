//! Item identity and key derivation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::utils::url::canonicalize;

/// Deterministic identity of a crawled item: the SHA-256 of its canonical form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemKey([u8; 32]);

impl ItemKey {
    /// Hash an already-canonical identity string.
    pub fn derive(identity: &str) -> Self {
        let digest = Sha256::digest(identity.as_bytes());
        Self(digest.into())
    }

    /// Canonicalise a URL and hash it.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::derive(&canonicalize(url)?))
    }

    /// Fingerprint a parameter map.
    ///
    /// Keys are sorted and every value is compared by its string form, so
    /// `{"page": 2}` and `{"page": "2"}` collide on purpose.
    pub fn from_params<K, V, I>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let sorted: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        // BTreeMap serializes in key order and string maps cannot fail
        let canonical = serde_json::to_string(&sorted).unwrap_or_default();
        Self::derive(&canonical)
    }

    /// Parse the lowercase hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| AppError::validation(format!("invalid item key '{s}': {e}")))?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The two 64-bit halves used for double hashing in the filter.
    pub(crate) fn hash_pair(&self) -> (u64, u64) {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&self.0[0..8]);
        b.copy_from_slice(&self.0[8..16]);
        (u64::from_le_bytes(a), u64::from_le_bytes(b))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemKey({})", &hex::encode(self.0)[..12])
    }
}

impl TryFrom<String> for ItemKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<ItemKey> for String {
    fn from(key: ItemKey) -> Self {
        key.to_string()
    }
}

/// How an identity string is normalised before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// Canonicalise as a URL
    #[default]
    Url,
    /// Trim whitespace only
    Raw,
}

/// The single key-derivation function shared by live processing, the
/// collection scanner and the self-check.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDeriver {
    kind: IdentityKind,
}

impl KeyDeriver {
    pub fn new(kind: IdentityKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    /// Derive the key for an identity string.
    pub fn derive(&self, identity: &str) -> Result<ItemKey> {
        match self.kind {
            IdentityKind::Url => ItemKey::from_url(identity),
            IdentityKind::Raw => {
                let trimmed = identity.trim();
                if trimmed.is_empty() {
                    return Err(AppError::validation("empty item identity"));
                }
                Ok(ItemKey::derive(trimmed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_identity_same_key() {
        let a = ItemKey::from_url("https://example.com/p?id=1&x=2").unwrap();
        let b = ItemKey::from_url("https://EXAMPLE.com/p?x=2&id=1#frag").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, ItemKey::from_url("https://example.com/p?id=2&x=2").unwrap());
    }

    #[test]
    fn test_hex_roundtrip_through_serde() {
        let key = ItemKey::derive("item-1");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json.len(), 64 + 2);
        let back: ItemKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<ItemKey>("\"zz\"").is_err());
    }

    #[test]
    fn test_params_fingerprint_ignores_order_and_value_type() {
        let a = ItemKey::from_params([("spider", "books".to_string()), ("page", 2.to_string())]);
        let b = ItemKey::from_params(vec![("page", "2"), ("spider", "books")]);
        assert_eq!(a, b);
        let c = ItemKey::from_params([("spider", "books"), ("page", "3")]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_deriver_modes() {
        let raw = KeyDeriver::new(IdentityKind::Raw);
        assert_eq!(raw.derive("  sku-9 ").unwrap(), ItemKey::derive("sku-9"));
        assert!(raw.derive("   ").is_err());

        let url = KeyDeriver::new(IdentityKind::Url);
        assert!(url.derive("sku-9").is_err());
        assert_eq!(
            url.derive("https://example.com/a/").unwrap(),
            ItemKey::derive("https://example.com/a")
        );
    }
}
