mod config;
mod id;
mod key;

pub use config::*;
pub use id::*;
pub use key::*;

use std::fmt::Display;
use std::ops::Deref;
use uuid::Uuid;

/// Opaque document identifier minted by an [`IdProvider`].
///
/// Uniqueness is provider-defined: a `DocId` is just a string the rest of
/// the runtime treats as opaque.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DocId(String);

impl DocId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for DocId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for DocId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DocId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// The field name under which a feature is registered on a model.
pub type FeatureName = String;

/// A short string derived from an extractor's type and configuration,
/// stable across runs so that cache hits survive restart but invalidation
/// is just a version bump.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FeatureVersion(String);

impl FeatureVersion {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Derives a version deterministically from an extractor's type name and
    /// its construction arguments, the same way a content id is derived from
    /// blake3 over a chunk's bytes. Hashing both type and args makes this a
    /// pure function of the pair, so any change to either changes the version.
    pub fn derive(extractor_type: &str, extractor_args: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(extractor_type.as_bytes());
        hasher.update(extractor_args);
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FeatureVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
