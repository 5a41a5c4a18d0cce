use thiserror::Error;

use crate::{DocId, FeatureVersion};

/// Composes and decomposes the `(DocId, FeatureName, FeatureVersion)` tuple
/// into the single opaque byte string a [`store::Database`](../store/trait.Database.html)
/// is keyed by.
///
/// Implementations must be a bijection: `decompose(build(a, b, c)) == (a, b, c)`
/// for every legal triple.
pub trait KeyBuilder: Send + Sync {
    fn build(&self, doc_id: &DocId, feature_name: &str, version: &FeatureVersion) -> Result<String, KeyError>;

    fn decompose(&self, key: &str) -> Result<(DocId, String, FeatureVersion), KeyError>;
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key part {0:?} contains the reserved separator")]
    IllegalPart(String),
    #[error("composed key {0:?} does not have exactly three parts")]
    Malformed(String),
}

/// Joins parts with a single reserved separator (`:` by default). Parts
/// containing the separator are rejected at `build` time rather than
/// silently mangled.
pub struct StringDelimitedKeyBuilder {
    separator: char,
}

impl Default for StringDelimitedKeyBuilder {
    fn default() -> Self {
        Self { separator: ':' }
    }
}

impl StringDelimitedKeyBuilder {
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    fn check(&self, part: &str) -> Result<(), KeyError> {
        if part.contains(self.separator) {
            Err(KeyError::IllegalPart(part.to_owned()))
        } else {
            Ok(())
        }
    }
}

impl KeyBuilder for StringDelimitedKeyBuilder {
    fn build(&self, doc_id: &DocId, feature_name: &str, version: &FeatureVersion) -> Result<String, KeyError> {
        self.check(doc_id.as_str())?;
        self.check(feature_name)?;
        self.check(version.as_str())?;
        Ok(format!(
            "{doc}{sep}{name}{sep}{version}",
            doc = doc_id.as_str(),
            name = feature_name,
            version = version.as_str(),
            sep = self.separator
        ))
    }

    fn decompose(&self, key: &str) -> Result<(DocId, String, FeatureVersion), KeyError> {
        let mut parts = key.splitn(3, self.separator);
        let (Some(doc), Some(name), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(KeyError::Malformed(key.to_owned()));
        };
        if parts.next().is_some() {
            return Err(KeyError::Malformed(key.to_owned()));
        }
        Ok((
            DocId::new(doc),
            name.to_owned(),
            FeatureVersion::new(version),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_decompose_is_identity() {
        let kb = StringDelimitedKeyBuilder::default();
        let doc = DocId::new("doc-1");
        let version = FeatureVersion::new("v1");
        let key = kb.build(&doc, "wordcount", &version).unwrap();
        let (d, n, v) = kb.decompose(&key).unwrap();
        assert_eq!(d, doc);
        assert_eq!(n, "wordcount");
        assert_eq!(v, version);
    }

    #[test]
    fn rejects_parts_containing_separator() {
        let kb = StringDelimitedKeyBuilder::default();
        assert!(kb.check("a:b").is_err());
        assert!(kb.check("plain").is_ok());
    }

    #[test]
    fn build_rejects_part_containing_separator() {
        let kb = StringDelimitedKeyBuilder::default();
        let doc = DocId::new("doc:1");
        let version = FeatureVersion::new("v1");
        assert!(matches!(
            kb.build(&doc, "wordcount", &version),
            Err(KeyError::IllegalPart(_))
        ));
    }

    #[test]
    fn malformed_key_fails_to_decompose() {
        let kb = StringDelimitedKeyBuilder::default();
        assert!(matches!(
            kb.decompose("only-one-part"),
            Err(KeyError::Malformed(_))
        ));
    }
}
