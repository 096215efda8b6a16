//! Input validation for collection and database names
//!
//! Names are checked before any driver call so a malformed name fails fast
//! with a `Validation` error instead of a round trip to the server.

use crate::Result;
use docbridge_common::DocBridgeError;
use tracing::warn;

/// Maximum allowed length for collection names (MongoDB limit is 255, we're more conservative)
const MAX_COLLECTION_NAME_LENGTH: usize = 120;

/// MongoDB limit for database names, in bytes
const MAX_DATABASE_NAME_LENGTH: usize = 64;

/// Characters MongoDB rejects in database names
const DATABASE_NAME_FORBIDDEN: &[char] = &['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?'];

/// Validated collection name
///
/// # Guarantees
/// - Not empty
/// - Maximum 120 characters
/// - No null bytes
/// - No "system." prefix (system collections)
/// - No $ characters (special operators)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCollectionName {
    name: String,
}

impl ValidatedCollectionName {
    /// Creates a new validated collection name
    ///
    /// # Errors
    /// Returns `DocBridgeError::Validation` if any guarantee is violated.
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(DocBridgeError::Validation(
                "Collection name cannot be empty".to_string(),
            ));
        }

        if name.len() > MAX_COLLECTION_NAME_LENGTH {
            return Err(DocBridgeError::Validation(format!(
                "Collection name exceeds maximum length of {} characters: '{}'",
                MAX_COLLECTION_NAME_LENGTH, name
            )));
        }

        if name.contains('\0') {
            return Err(DocBridgeError::Validation(
                "Collection name cannot contain null bytes".to_string(),
            ));
        }

        if name.starts_with("system.") {
            return Err(DocBridgeError::Validation(format!(
                "Collection name cannot start with 'system.' (reserved): '{}'",
                name
            )));
        }

        if name.contains('$') {
            return Err(DocBridgeError::Validation(format!(
                "Collection name cannot contain '$' character: '{}'",
                name
            )));
        }

        // Suspicious but legal
        if name.contains("..") || name.contains("//") {
            warn!(collection = name, "Collection name contains suspicious pattern");
        }

        Ok(ValidatedCollectionName {
            name: name.to_string(),
        })
    }

    /// Returns the validated collection name as a string slice
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Consumes the ValidatedCollectionName and returns the inner String
    pub fn into_string(self) -> String {
        self.name
    }
}

impl AsRef<str> for ValidatedCollectionName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ValidatedCollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Validates a target database name.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DocBridgeError::Validation(
            "Database name cannot be empty".to_string(),
        ));
    }

    if name.len() >= MAX_DATABASE_NAME_LENGTH {
        return Err(DocBridgeError::Validation(format!(
            "Database name must be shorter than {} bytes: '{}'",
            MAX_DATABASE_NAME_LENGTH, name
        )));
    }

    if let Some(c) = name
        .chars()
        .find(|c| *c == '\0' || DATABASE_NAME_FORBIDDEN.contains(c))
    {
        return Err(DocBridgeError::Validation(format!(
            "Database name contains forbidden character {:?}: '{}'",
            c, name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_collection_names() {
        for name in ["users", "user_events", "logs.2024", "a"] {
            let validated = ValidatedCollectionName::new(name).unwrap();
            assert_eq!(validated.as_str(), name);
        }
    }

    #[test]
    fn test_collection_name_empty() {
        let err = ValidatedCollectionName::new("").unwrap_err();
        assert_eq!(
            err,
            DocBridgeError::Validation("Collection name cannot be empty".to_string())
        );
    }

    #[test]
    fn test_collection_name_too_long() {
        let name = "a".repeat(MAX_COLLECTION_NAME_LENGTH + 1);
        assert!(ValidatedCollectionName::new(&name).is_err());

        let name = "a".repeat(MAX_COLLECTION_NAME_LENGTH);
        assert!(ValidatedCollectionName::new(&name).is_ok());
    }

    #[test]
    fn test_collection_name_rejects_system_prefix() {
        assert!(ValidatedCollectionName::new("system.users").is_err());
        assert!(ValidatedCollectionName::new("my.system.users").is_ok());
    }

    #[test]
    fn test_collection_name_rejects_dollar_and_null() {
        assert!(ValidatedCollectionName::new("users$cmd").is_err());
        assert!(ValidatedCollectionName::new("users\0").is_err());
    }

    #[test]
    fn test_collection_name_suspicious_pattern_allowed() {
        assert!(ValidatedCollectionName::new("a..b").is_ok());
        assert!(ValidatedCollectionName::new("logs//2024").is_ok());
    }

    #[test]
    fn test_collection_name_display_and_into_string() {
        let validated = ValidatedCollectionName::new("orders").unwrap();
        assert_eq!(validated.to_string(), "orders");
        assert_eq!(validated.as_ref(), "orders");
        assert_eq!(validated.into_string(), "orders".to_string());
    }

    #[test]
    fn test_database_name() {
        assert!(validate_database_name("app").is_ok());
        assert!(validate_database_name("app_prod-1").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("app.prod").is_err());
        assert!(validate_database_name("app prod").is_err());
        assert!(validate_database_name("app/prod").is_err());
        assert!(validate_database_name(&"d".repeat(64)).is_err());
        assert!(validate_database_name(&"d".repeat(63)).is_ok());
    }
}
