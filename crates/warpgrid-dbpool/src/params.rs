//! Connect parameters and their fingerprint.
//!
//! A [`ConnectParams`] bag is an ordered string map handed verbatim to the
//! [`ConnectionFactory`](crate::ConnectionFactory). Only the fields listed in
//! [`FINGERPRINT_KEYS`] identify the target; any other key (timeouts, TLS
//! flags, application name) is passed through but does not make two
//! connections non-interchangeable.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Keys that determine whether two connections are interchangeable, in
/// the order they are fed into the digest.
pub const FINGERPRINT_KEYS: [&str; 7] =
    ["type", "host", "port", "user", "password", "dbname", "charset"];

/// String-keyed connect parameters for one logical database target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectParams(BTreeMap<String, String>);

impl ConnectParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set a single parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Compute the fingerprint over [`FINGERPRINT_KEYS`].
    ///
    /// Each field is length-prefixed and an absent key is encoded
    /// differently from an empty value, so no two distinct bags collide
    /// by concatenation.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for key in FINGERPRINT_KEYS {
            match self.get(key) {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        Fingerprint(hasher.finalize().into())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for ConnectParams {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// SHA-256 digest of the identifying connect parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Twelve hex digits are plenty to tell pools apart in logs.
        f.write_str(&self.to_hex()[..12])
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ConnectParams {
        ConnectParams::new()
            .with("type", "postgres")
            .with("host", "db.warp.local")
            .with("port", "5432")
            .with("user", "app")
            .with("password", "s3cret")
            .with("dbname", "orders")
            .with("charset", "utf8")
    }

    #[test]
    fn identical_bags_share_a_fingerprint() {
        assert_eq!(base().fingerprint(), base().fingerprint());
    }

    #[test]
    fn every_identifying_field_changes_the_fingerprint() {
        let original = base().fingerprint();
        for key in FINGERPRINT_KEYS {
            let changed = base().with(key, "other");
            assert_ne!(changed.fingerprint(), original, "changing `{key}` must change the hash");
        }
    }

    #[test]
    fn passthrough_keys_do_not_affect_fingerprint() {
        let with_extra = base().with("connect_timeout", "5").with("application_name", "api");
        assert_eq!(with_extra.fingerprint(), base().fingerprint());
    }

    #[test]
    fn absent_and_empty_values_differ() {
        let empty_charset = base().with("charset", "");
        let mut no_charset = base();
        no_charset.0.remove("charset");
        assert_ne!(empty_charset.fingerprint(), no_charset.fingerprint());
    }

    #[test]
    fn shifted_boundaries_do_not_collide() {
        let a = ConnectParams::new().with("host", "ab").with("port", "c");
        let b = ConnectParams::new().with("host", "a").with("port", "bc");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_hex_is_64_chars_and_display_is_short() {
        let fp = base().fingerprint();
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(fp.to_string().len(), 12);
        assert!(fp.to_hex().starts_with(&fp.to_string()));
    }

    #[test]
    fn params_deserialize_from_toml_table() {
        let params: ConnectParams = toml::from_str("host = \"h\"\nport = \"1\"").unwrap();
        assert_eq!(params.get("host"), Some("h"));
        assert_eq!(params.len(), 2);
    }
}
