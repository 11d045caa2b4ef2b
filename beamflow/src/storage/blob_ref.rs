//! Parsing of `gs://bucket/key` style blob references.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::StorageError;

/// A reference to a blob, optionally qualified by bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    /// Bucket name when the reference was a `gs://` url.
    pub bucket: Option<String>,
    /// Path-like key inside the bucket.
    pub key: String,
}

impl BlobRef {
    /// Parses `gs://bucket/key` or a bare `key`.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StorageError::invalid_ref(raw, "empty reference"));
        }

        let (bucket, key) = match raw.split_once("://") {
            Some(("gs", rest)) => {
                let (bucket, key) = rest
                    .split_once('/')
                    .ok_or_else(|| StorageError::invalid_ref(raw, "missing object key"))?;
                if bucket.is_empty() {
                    return Err(StorageError::invalid_ref(raw, "missing bucket"));
                }
                (Some(bucket.to_string()), key)
            }
            Some((scheme, _)) => {
                return Err(StorageError::invalid_ref(
                    raw,
                    format!("unsupported scheme '{scheme}'"),
                ));
            }
            None => (None, raw),
        };

        let key = key.trim_start_matches('/');
        if key.is_empty() || key.ends_with('/') {
            return Err(StorageError::invalid_ref(raw, "missing object key"));
        }
        if key.split('/').any(|segment| segment == "..") {
            return Err(StorageError::invalid_ref(raw, "key must not contain '..'"));
        }

        Ok(Self {
            bucket,
            key: key.to_string(),
        })
    }

    /// The last path segment of the key.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "gs://{bucket}/{}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gs_url() {
        let blob = BlobRef::parse("gs://b/fullbodyimages/a.png").unwrap();
        assert_eq!(blob.bucket.as_deref(), Some("b"));
        assert_eq!(blob.key, "fullbodyimages/a.png");
        assert_eq!(blob.file_name(), "a.png");
        assert_eq!(blob.to_string(), "gs://b/fullbodyimages/a.png");
    }

    #[test]
    fn test_parse_bare_key() {
        let blob = BlobRef::parse("fullbodyimages/a.png").unwrap();
        assert!(blob.bucket.is_none());
        assert_eq!(blob.key, "fullbodyimages/a.png");
    }

    #[test]
    fn test_parse_rejects_bad_refs() {
        assert!(BlobRef::parse("").is_err());
        assert!(BlobRef::parse("gs://bucket").is_err());
        assert!(BlobRef::parse("gs:///key").is_err());
        assert!(BlobRef::parse("s3://bucket/key").is_err());
        assert!(BlobRef::parse("gs://bucket/dir/").is_err());
        assert!(BlobRef::parse("gs://bucket/../secret").is_err());
    }
}
