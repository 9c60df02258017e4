use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

pub const POINTER_VERSION_LINE: &str = "version https://git-lfs.github.com/spec/v1";
const OID_PREFIX: &str = "oid sha256:";
const SIZE_PREFIX: &str = "size ";

static OID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("valid oid pattern"));

/// Reference to a large object stored outside the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pointer {
    pub oid: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointerError {
    #[error("content does not start with the LFS version line")]
    MissingPrefix,
    #[error("pointer has fewer than three lines")]
    InvalidStructure,
    #[error("invalid oid: {0}")]
    InvalidOid(String),
    #[error("invalid size: {0}")]
    InvalidSize(String),
}

impl Pointer {
    /// Canonical pointer file text.
    pub fn to_text(&self) -> String {
        format!("{POINTER_VERSION_LINE}\n{OID_PREFIX}{}\n{SIZE_PREFIX}{}\n", self.oid, self.size)
    }

    pub fn parse(content: &[u8]) -> Result<Self, PointerError> {
        let text = String::from_utf8_lossy(content);
        if !text.starts_with(POINTER_VERSION_LINE) {
            return Err(PointerError::MissingPrefix);
        }

        let lines: Vec<&str> = text.split('\n').collect();
        if lines.len() < 3 {
            return Err(PointerError::InvalidStructure);
        }

        let oid = lines[1].strip_prefix(OID_PREFIX).unwrap_or(lines[1]);
        if !OID_PATTERN.is_match(oid) {
            return Err(PointerError::InvalidOid(oid.to_string()));
        }

        let size = lines[2].strip_prefix(SIZE_PREFIX).unwrap_or(lines[2]);
        let size = size
            .parse::<u64>()
            .map_err(|_| PointerError::InvalidSize(size.to_string()))?;

        Ok(Pointer {
            oid: oid.to_string(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID: &str = "4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393";

    #[test]
    fn test_parse_valid_pointer() {
        let text = format!("{POINTER_VERSION_LINE}\noid sha256:{OID}\nsize 12345\n");
        let pointer = Pointer::parse(text.as_bytes()).unwrap();
        assert_eq!(pointer.oid, OID);
        assert_eq!(pointer.size, 12345);
        assert_eq!(pointer.to_text(), text);
    }

    #[test]
    fn test_parse_rejects_ordinary_files() {
        assert_eq!(Pointer::parse(b"fn main() {}\n"), Err(PointerError::MissingPrefix));
        assert_eq!(
            Pointer::parse(POINTER_VERSION_LINE.as_bytes()),
            Err(PointerError::InvalidStructure)
        );
    }

    #[test]
    fn test_parse_rejects_bad_fields() {
        let short = format!("{POINTER_VERSION_LINE}\noid sha256:abc\nsize 1\n");
        assert!(matches!(Pointer::parse(short.as_bytes()), Err(PointerError::InvalidOid(_))));

        let upper = format!("{POINTER_VERSION_LINE}\noid sha256:{}\nsize 1\n", OID.to_uppercase());
        assert!(matches!(Pointer::parse(upper.as_bytes()), Err(PointerError::InvalidOid(_))));

        let negative = format!("{POINTER_VERSION_LINE}\noid sha256:{OID}\nsize -5\n");
        assert!(matches!(Pointer::parse(negative.as_bytes()), Err(PointerError::InvalidSize(_))));
    }
}
