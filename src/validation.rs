// Validation utilities module
// Provides custom validation functions for domain-specific rules

use std::sync::OnceLock;

use regex::Regex;
use validator::ValidationError;

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("username pattern is valid"))
}

/// Validates that a username only uses letters, digits, '_', '.' and '-'
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username_pattern().is_match(username) {
        Ok(())
    } else {
        let mut err = ValidationError::new("invalid_username");
        err.message = Some("Username may only contain letters, digits, '_', '.' and '-'".into());
        Err(err)
    }
}
