// ABOUTME: Bundle identifier type with validation
// ABOUTME: Keeps identifiers URL-safe so they can double as directory and container names

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_BUNDLE_ID_LEN: usize = 128;

/// Opaque, URL-safe identifier of an uploaded bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BundleId(String);

impl BundleId {
    /// Validate and wrap a bundle identifier
    ///
    /// Identifiers must:
    /// - Not be empty or longer than 128 characters
    /// - Contain only ASCII alphanumerics, hyphens and underscores
    ///
    /// This rules out path traversal sequences, separators, null bytes and
    /// control characters.
    ///
    /// # Examples
    ///
    /// ```
    /// use botyard_sandbox::BundleId;
    ///
    /// assert!(BundleId::new("bot-123").is_ok());
    /// assert!(BundleId::new("").is_err());
    /// assert!(BundleId::new("../etc/passwd").is_err());
    /// ```
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(invalid(&id, "Bundle ID cannot be empty"));
        }

        if id.len() > MAX_BUNDLE_ID_LEN {
            return Err(invalid(
                &id,
                &format!("Bundle ID cannot exceed {} characters", MAX_BUNDLE_ID_LEN),
            ));
        }

        if id.contains("..") || id.contains('/') || id.contains('\\') {
            return Err(invalid(
                &id,
                "Bundle ID cannot contain path traversal sequences (.. / \\)",
            ));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(
                &id,
                "Bundle ID can only contain alphanumeric characters, hyphens, and underscores",
            ));
        }

        Ok(Self(id))
    }

    /// Generate a fresh identifier for a newly uploaded bundle
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn invalid(id: &str, reason: &str) -> EngineError {
    EngineError::InvalidBundleId {
        // Control characters would otherwise end up in log lines verbatim
        id: id.escape_debug().to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BundleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for BundleId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for BundleId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<BundleId> for String {
    fn from(id: BundleId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bundle_ids() {
        assert!(BundleId::new("bot-123").is_ok());
        assert!(BundleId::new("bundle_name").is_ok());
        assert!(BundleId::new("abc123").is_ok());
        assert!(BundleId::new("my-bot-2024").is_ok());
    }

    #[test]
    fn test_empty_bundle_id() {
        assert!(BundleId::new("").is_err());
    }

    #[test]
    fn test_path_traversal() {
        assert!(BundleId::new("..").is_err());
        assert!(BundleId::new("../etc").is_err());
        assert!(BundleId::new("a/../b").is_err());
        assert!(BundleId::new("C:\\Windows").is_err());
    }

    #[test]
    fn test_control_characters_and_null_bytes() {
        assert!(BundleId::new("test\0null").is_err());
        assert!(BundleId::new("test\nline").is_err());
        assert!(BundleId::new("bot id").is_err());
        assert!(BundleId::new("bot.js").is_err());
    }

    #[test]
    fn test_length_limit() {
        assert!(BundleId::new("a".repeat(MAX_BUNDLE_ID_LEN)).is_ok());
        assert!(BundleId::new("a".repeat(MAX_BUNDLE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = BundleId::generate();
        let b = BundleId::generate();
        assert_ne!(a, b);
        assert!(BundleId::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_serde_round_trip_rejects_invalid() {
        let id: BundleId = serde_json::from_str("\"bot-1\"").unwrap();
        assert_eq!(id.as_str(), "bot-1");
        assert!(serde_json::from_str::<BundleId>("\"../x\"").is_err());
    }
}
