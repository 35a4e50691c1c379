use std::path::{Component, Path};

/// Raised when a request value violates a constraint at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{field} exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },

    #[error("invalid bucket name: {0}")]
    InvalidBucket(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Longest object key S3-compatible services accept, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// A validated `(bucket, key)` pair in the storage namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    bucket: String,
    key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self, ValidationError> {
        let bucket = bucket.into();
        let key = key.into();
        validate_bucket(&bucket)?;
        validate_key(&key)?;
        Ok(Self { bucket, key })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Checks DNS-style bucket naming: 3..=63 characters of lowercase
/// letters, digits, `.` and `-`, starting and ending alphanumeric.
pub fn validate_bucket(bucket: &str) -> Result<(), ValidationError> {
    if bucket.is_empty() {
        return Err(ValidationError::MissingField("bucket"));
    }
    if !(3..=63).contains(&bucket.len()) {
        return Err(ValidationError::InvalidBucket(format!(
            "{bucket}: length must be between 3 and 63"
        )));
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-';
    if !bucket.chars().all(allowed) {
        return Err(ValidationError::InvalidBucket(format!(
            "{bucket}: only lowercase letters, digits, '.' and '-' are allowed"
        )));
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(bucket.chars().next()) || !edge_ok(bucket.chars().last()) {
        return Err(ValidationError::InvalidBucket(format!(
            "{bucket}: must start and end with a letter or digit"
        )));
    }
    Ok(())
}

pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::MissingField("key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "key",
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

/// Validates that a key used as a relative file path does not escape
/// its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(file_path: &str) -> Result<(), ValidationError> {
    if file_path.is_empty() {
        return Err(ValidationError::InvalidKey("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(ValidationError::InvalidKey(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(ValidationError::InvalidKey(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(ValidationError::InvalidKey(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_location() {
        let loc = ObjectLocation::new("my-bucket.logs", "2024/01/app.log").unwrap();
        assert_eq!(loc.bucket(), "my-bucket.logs");
        assert_eq!(loc.key(), "2024/01/app.log");
    }

    #[test]
    fn rejects_missing_bucket() {
        assert_eq!(
            ObjectLocation::new("", "k").unwrap_err(),
            ValidationError::MissingField("bucket")
        );
    }

    #[test]
    fn rejects_bad_bucket_names() {
        assert!(validate_bucket("ab").is_err());
        assert!(validate_bucket(&"a".repeat(64)).is_err());
        assert!(validate_bucket("Upper").is_err());
        assert!(validate_bucket("-leading").is_err());
        assert!(validate_bucket("trailing.").is_err());
        assert!(validate_bucket("under_score").is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_keys() {
        assert_eq!(validate_key(""), Err(ValidationError::MissingField("key")));
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
        assert_eq!(
            validate_key(&"k".repeat(MAX_KEY_LEN + 1)),
            Err(ValidationError::TooLong {
                field: "key",
                max: MAX_KEY_LEN
            })
        );
    }

    #[test]
    fn rejects_empty_path() {
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_relative_path("../../../etc/passwd").is_err());
        assert!(validate_relative_path("sub/../../../escape").is_err());
        assert!(validate_relative_path("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_relative_path("/tmp/malicious").is_err());
    }

    #[test]
    fn accepts_nested_keys() {
        assert!(validate_relative_path("photos/2024/cat.jpg").is_ok());
        assert!(validate_relative_path(".config/settings.json").is_ok());
        assert!(validate_relative_path("./report.pdf").is_ok());
    }
}
